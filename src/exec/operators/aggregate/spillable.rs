// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Spillable aggregation builder.
//!
//! Responsibilities:
//! - Wraps the in-memory builder and, at the spill threshold, snapshots its
//!   state as hash-ordered runs written to disk through the spill I/O pool,
//!   then resumes on an empty table with the same hash seed.
//! - Surfaces the in-flight write as a blocked dependency; when the I/O
//!   queue rejects a submission the snapshot is held until a capacity waiter
//!   fires.
//! - Merges the runs (and, when small enough, the last in-memory state)
//!   back into complete groups one hash frontier at a time, finalizing each
//!   window as soon as every cursor has moved past it.
//!
//! The merge window is deliberately left out of the memory tracker: it holds
//! at most one frontier beyond `page_row_count` groups, already bounded by
//! the merge-with-memory limit.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use arrow::array::{Array, ArrayRef, UInt64Array};
use arrow::datatypes::SchemaRef;

use crate::quartzite_logging::warn;
use crate::exec::agg::GroupedAccumulator;
use crate::exec::hash_table::GroupKeyTable;
use crate::exec::operators::aggregate::HashAggregationConfig;
use crate::exec::operators::aggregate::builder::{AggregatedPageStream, HashAggregationBuilder};
use crate::exec::operators::aggregate::in_memory::InMemoryHashAggregationBuilder;
use crate::exec::page::{Page, record_batch_bytes};
use crate::exec::pipeline::dependency::{Dependency, DependencyHandle};
use crate::exec::spill::{
    SpillChannelHandle, SpillFile, SpillProfile, SpillStream, SpillTask, Spiller, SpillerHandle,
};
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::runtime_state::RuntimeState;

/// State shared between the builder and its asynchronous write tasks.
struct SharedSpillState {
    runs: Mutex<Vec<SpillFile>>,
    error: Mutex<Option<String>>,
    cancelled: AtomicBool,
}

pub struct SpillableHashAggregationBuilder {
    config: Arc<HashAggregationConfig>,
    inner: InMemoryHashAggregationBuilder,
    spiller: SpillerHandle,
    channel: SpillChannelHandle,
    spill_profile: Option<SpillProfile>,
    shared: Arc<SharedSpillState>,
    /// Ready once the in-flight write, or the wait for queue capacity,
    /// completes.
    write_dep: Option<DependencyHandle>,
    /// Snapshot that could not be submitted because the I/O queue was full.
    pending_pages: Option<Vec<Page>>,
    mem_tracker: Arc<MemTracker>,
    page_row_count: usize,
    hash_seed: u64,
}

impl SpillableHashAggregationBuilder {
    pub fn new(
        config: Arc<HashAggregationConfig>,
        mem_tracker: Arc<MemTracker>,
        state: &RuntimeState,
    ) -> Result<Self, String> {
        let manager = state
            .spill_manager()
            .ok_or_else(|| "spill is enabled but the query has no spill manager".to_string())?;
        if !manager.config().enable_spill {
            return Err("spill is enabled for aggregation but disabled for the query".to_string());
        }
        let spiller = Arc::new(Spiller::new_from_config(
            manager.config().spill_encode_level,
        )?);
        Self::with_spiller(
            config,
            mem_tracker,
            state.page_row_count(),
            spiller,
            manager.channel(),
            manager.profile(),
        )
    }

    /// Builder over an explicit spiller and channel, for embedders that
    /// manage spill storage themselves.
    pub fn with_spiller(
        config: Arc<HashAggregationConfig>,
        mem_tracker: Arc<MemTracker>,
        page_row_count: usize,
        spiller: SpillerHandle,
        channel: SpillChannelHandle,
        spill_profile: Option<SpillProfile>,
    ) -> Result<Self, String> {
        let inner = InMemoryHashAggregationBuilder::new(
            Arc::clone(&config),
            Arc::clone(&mem_tracker),
            page_row_count,
        )?;
        let hash_seed = inner.hash_seed();
        Ok(Self {
            config,
            inner,
            spiller,
            channel,
            spill_profile,
            shared: Arc::new(SharedSpillState {
                runs: Mutex::new(Vec::new()),
                error: Mutex::new(None),
                cancelled: AtomicBool::new(false),
            }),
            write_dep: None,
            pending_pages: None,
            mem_tracker,
            page_row_count,
            hash_seed,
        })
    }

    fn take_async_error(&self) -> Option<String> {
        self.shared
            .error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Surface asynchronous write failures and resubmit a snapshot that was
    /// waiting for queue capacity. Leaves `write_dep` set only when a write
    /// is genuinely outstanding.
    fn poll_async(&mut self) -> Result<(), String> {
        if let Some(err) = self.take_async_error() {
            return Err(err);
        }
        if let Some(dep) = self.write_dep.as_ref() {
            if !dep.is_ready() {
                return Ok(());
            }
            self.write_dep = None;
            if let Some(pages) = self.pending_pages.take() {
                self.submit_run(pages)?;
            }
        }
        Ok(())
    }

    fn write_in_flight(&self) -> bool {
        self.write_dep.as_ref().is_some_and(|dep| !dep.is_ready())
    }

    /// Snapshot the in-memory state into a run, hand it to the I/O pool, and
    /// resume on an empty table hashing with the same seed.
    fn start_spill(&mut self) -> Result<(), String> {
        let pages = self.inner.hash_ordered_intermediate_pages()?;
        if pages.is_empty() {
            return Ok(());
        }
        self.inner = InMemoryHashAggregationBuilder::with_seed(
            Arc::clone(&self.config),
            Arc::clone(&self.mem_tracker),
            self.page_row_count,
            self.hash_seed,
        )?;
        self.submit_run(pages)
    }

    fn submit_run(&mut self, pages: Vec<Page>) -> Result<(), String> {
        let write_dep = Dependency::create("aggregation spill write");
        let retry_pages = pages.clone();
        let task = spill_write_task(
            Arc::clone(&self.spiller),
            self.config.spill_schema(),
            pages,
            Arc::clone(&self.shared),
            self.spill_profile.clone(),
            Arc::clone(&write_dep),
        );
        match self.channel.submit(task) {
            Ok(()) => {
                self.write_dep = Some(write_dep);
                Ok(())
            }
            Err(_) => {
                // Queue full. Hold the snapshot, arm a fresh dependency and
                // wake it once a slot frees; poll_async resubmits then.
                warn!(
                    "spill io queue is full; holding an aggregation run of {} pages",
                    retry_pages.len()
                );
                let capacity_dep = Dependency::create("spill io queue capacity");
                let waiter = Arc::clone(&capacity_dep);
                self.channel
                    .capacity_observable()
                    .add_observer(Arc::new(move || waiter.set_ready()));
                self.channel.register_capacity_waiter();
                self.pending_pages = Some(retry_pages);
                self.write_dep = Some(capacity_dep);
                Ok(())
            }
        }
    }

    /// Synchronously write a run, used at result-build time when the state
    /// cannot ride along with the merge.
    fn write_run_now(&self, pages: &[Page]) -> Result<SpillFile, String> {
        let started = Instant::now();
        let file = self.spiller.write_run(self.config.spill_schema(), pages)?;
        if let Some(profile) = self.spill_profile.as_ref() {
            profile.spill_rows.add(file.num_rows as i64);
            profile.spill_bytes.add(file.bytes as i64);
            profile.spill_file_count.add(1);
            profile.spill_time.add(started.elapsed().as_nanos() as i64);
        }
        Ok(file)
    }
}

impl HashAggregationBuilder for SpillableHashAggregationBuilder {
    fn process_page(&mut self, page: Page) -> Result<(), String> {
        if self.write_in_flight() {
            return Err("aggregate received input while a spill write is in flight".to_string());
        }
        self.poll_async()?;
        self.inner.process_page(page)
    }

    fn update_memory(&mut self) -> Result<(), String> {
        self.poll_async()?;
        let footprint = self.inner.settle_memory() as i64;
        if self.write_dep.is_none() && footprint >= self.config.memory_limit_before_spill() {
            self.start_spill()?;
        }
        self.inner.check_limit()
    }

    /// Never full: memory pressure is shed to disk instead.
    fn is_full(&self) -> bool {
        false
    }

    fn blocked_dependency(&self) -> Option<DependencyHandle> {
        self.write_dep.clone()
    }

    fn build_result(&mut self) -> Result<Box<dyn AggregatedPageStream>, String> {
        if self.write_in_flight() {
            return Err(
                "aggregate builder cannot build results while a spill write is in flight"
                    .to_string(),
            );
        }
        if let Some(err) = self.take_async_error() {
            return Err(err);
        }
        self.write_dep = None;
        if let Some(pages) = self.pending_pages.take() {
            // The queue never freed up; write the held run on this thread.
            let file = self.write_run_now(&pages)?;
            self.shared
                .runs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(file);
        }
        let has_runs = !self
            .shared
            .runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty();
        if !has_runs {
            return self.inner.build_result();
        }

        let footprint = self.inner.estimated_bytes() as i64;
        let mut memory_pages = self.inner.hash_ordered_intermediate_pages()?;
        self.inner.close();
        if footprint > self.config.memory_limit_for_merge_with_memory() {
            // Too large to merge in place; push the last state out as one
            // more run and merge purely from disk.
            if !memory_pages.is_empty() {
                let file = self.write_run_now(&memory_pages)?;
                self.shared
                    .runs
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(file);
            }
            memory_pages = Vec::new();
        }
        let files = std::mem::take(
            &mut *self.shared.runs.lock().unwrap_or_else(|e| e.into_inner()),
        );
        let stream = MergingAggregatedPageStream::new(
            Arc::clone(&self.config),
            Arc::clone(&self.spiller),
            files,
            memory_pages,
            self.hash_seed,
            self.page_row_count,
            self.spill_profile.clone(),
        )?;
        Ok(Box::new(stream))
    }

    fn close(&mut self) {
        self.shared.cancelled.store(true, Ordering::Release);
        let files = std::mem::take(
            &mut *self.shared.runs.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for file in &files {
            self.spiller.remove_file(file);
        }
        self.pending_pages = None;
        self.inner.close();
    }
}

/// Task body for one asynchronous run write. Publishes the finished file (or
/// the failure) to the shared state and always signals the dependency.
fn spill_write_task(
    spiller: SpillerHandle,
    schema: SchemaRef,
    pages: Vec<Page>,
    shared: Arc<SharedSpillState>,
    profile: Option<SpillProfile>,
    write_dep: DependencyHandle,
) -> SpillTask {
    Box::new(move || {
        let result = write_run_task(&spiller, schema, &pages, &shared, profile.as_ref());
        write_dep.set_ready();
        result
    })
}

fn write_run_task(
    spiller: &Spiller,
    schema: SchemaRef,
    pages: &[Page],
    shared: &SharedSpillState,
    profile: Option<&SpillProfile>,
) -> Result<(), String> {
    let started = Instant::now();
    match spiller.write_run(schema, pages) {
        Ok(file) => {
            if let Some(profile) = profile {
                profile.spill_rows.add(file.num_rows as i64);
                profile.spill_bytes.add(file.bytes as i64);
                profile.spill_file_count.add(1);
                profile.spill_time.add(started.elapsed().as_nanos() as i64);
            }
            let mut runs = shared.runs.lock().unwrap_or_else(|e| e.into_inner());
            if shared.cancelled.load(Ordering::Acquire) {
                // The builder closed while this write ran; it will not see
                // this file, so delete it here.
                drop(runs);
                spiller.remove_file(&file);
                return Ok(());
            }
            runs.push(file);
            Ok(())
        }
        Err(err) => {
            *shared.error.lock().unwrap_or_else(|e| e.into_inner()) = Some(err.clone());
            Err(err)
        }
    }
}

/// Merges hash-ordered runs back into complete groups. All rows sharing a
/// hash sit contiguously in every run, so once each cursor has moved past a
/// hash value the groups under it are complete and can be finalized.
struct MergingAggregatedPageStream {
    config: Arc<HashAggregationConfig>,
    spiller: SpillerHandle,
    files: Vec<SpillFile>,
    cursors: Vec<RunCursor>,
    table: GroupKeyTable,
    accumulators: Vec<Box<dyn GroupedAccumulator>>,
    hash_seed: u64,
    page_row_count: usize,
    queue: VecDeque<Page>,
    done: bool,
    group_ids: Vec<usize>,
    hash_buf: Vec<u64>,
}

impl MergingAggregatedPageStream {
    fn new(
        config: Arc<HashAggregationConfig>,
        spiller: SpillerHandle,
        files: Vec<SpillFile>,
        memory_pages: Vec<Page>,
        hash_seed: u64,
        page_row_count: usize,
        profile: Option<SpillProfile>,
    ) -> Result<Self, String> {
        let table = GroupKeyTable::with_seed(
            config.group_by_types().to_vec(),
            page_row_count,
            hash_seed,
        )?;
        let accumulators = config
            .aggregators()
            .iter()
            .map(|spec| spec.create_grouped_accumulator())
            .collect::<Result<Vec<_>, String>>()?;
        let hash_column = config.group_by_types().len();
        let mut cursors = Vec::with_capacity(files.len() + 1);
        for file in &files {
            match spiller.open_stream(config.spill_schema(), file) {
                Ok(stream) => {
                    cursors.push(RunCursor::from_disk(stream, hash_column, profile.clone()));
                }
                Err(err) => {
                    for file in &files {
                        spiller.remove_file(file);
                    }
                    return Err(err);
                }
            }
        }
        if !memory_pages.is_empty() {
            cursors.push(RunCursor::from_pages(memory_pages, hash_column));
        }
        Ok(Self {
            config,
            spiller,
            files,
            cursors,
            table,
            accumulators,
            hash_seed,
            page_row_count,
            queue: VecDeque::new(),
            done: false,
            group_ids: Vec::new(),
            hash_buf: Vec::new(),
        })
    }

    /// Absorb every row of the lowest pending hash across all cursors, then
    /// flush once enough complete groups have accumulated. Sets `done` when
    /// every cursor is drained.
    fn advance(&mut self) -> Result<(), String> {
        let mut frontier: Option<u64> = None;
        for cursor in &mut self.cursors {
            if let Some(hash) = cursor.peek_hash()? {
                frontier = Some(match frontier {
                    Some(min) => min.min(hash),
                    None => hash,
                });
            }
        }
        let Some(frontier) = frontier else {
            self.flush_groups()?;
            self.done = true;
            return Ok(());
        };
        for i in 0..self.cursors.len() {
            loop {
                if self.cursors[i].peek_hash()? != Some(frontier) {
                    break;
                }
                let Some(slice) = self.cursors[i].take_run(frontier) else {
                    break;
                };
                self.absorb(&slice, frontier)?;
            }
        }
        if self.table.num_groups() >= self.page_row_count {
            self.flush_groups()?;
        }
        Ok(())
    }

    fn absorb(&mut self, slice: &Page, hash: u64) -> Result<(), String> {
        let rows = slice.num_rows();
        if rows == 0 {
            return Ok(());
        }
        let n_keys = self.config.group_by_types().len();
        let key_columns = (0..n_keys)
            .map(|i| slice.column(i).map(Arc::clone))
            .collect::<Result<Vec<_>, String>>()?;
        self.hash_buf.clear();
        self.hash_buf.resize(rows, hash);
        self.table
            .assign_group_ids(&key_columns, Some(&self.hash_buf), &mut self.group_ids)?;
        let num_groups = self.table.num_groups();
        for (idx, accumulator) in self.accumulators.iter_mut().enumerate() {
            let column = slice.column(n_keys + 1 + idx)?;
            accumulator.merge_batch(num_groups, &self.group_ids, column)?;
        }
        Ok(())
    }

    /// Final-evaluate every completed group into output pages and reset the
    /// merge table for the next window.
    fn flush_groups(&mut self) -> Result<(), String> {
        let num_groups = self.table.num_groups();
        if num_groups == 0 {
            return Ok(());
        }
        let schema = self.config.output_schema();
        let with_hash = self.config.hash_channel().is_some();
        for start in (0..num_groups).step_by(self.page_row_count) {
            let end = num_groups.min(start + self.page_row_count);
            let ids: Vec<usize> = (start..end).collect();
            let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());
            columns.extend(self.table.key_arrays_for(&ids)?);
            if with_hash {
                let hashes = self.table.group_hashes();
                columns.push(Arc::new(UInt64Array::from(
                    ids.iter().map(|&g| hashes[g]).collect::<Vec<_>>(),
                )));
            }
            for accumulator in &self.accumulators {
                columns.push(accumulator.evaluate_final(&ids)?);
            }
            self.queue
                .push_back(Page::try_from_arrays(Arc::clone(&schema), columns)?);
        }
        self.table = GroupKeyTable::with_seed(
            self.config.group_by_types().to_vec(),
            self.page_row_count,
            self.hash_seed,
        )?;
        for (spec, accumulator) in self
            .config
            .aggregators()
            .iter()
            .zip(self.accumulators.iter_mut())
        {
            *accumulator = spec.create_grouped_accumulator()?;
        }
        Ok(())
    }
}

impl AggregatedPageStream for MergingAggregatedPageStream {
    fn next_page(&mut self) -> Result<Option<Page>, String> {
        loop {
            if let Some(page) = self.queue.pop_front() {
                return Ok(Some(page));
            }
            if self.done {
                return Ok(None);
            }
            self.advance()?;
        }
    }

    fn is_exhausted(&self) -> bool {
        self.done && self.queue.is_empty()
    }
}

impl Drop for MergingAggregatedPageStream {
    fn drop(&mut self) {
        for file in &self.files {
            self.spiller.remove_file(file);
        }
    }
}

enum RunSource {
    Disk {
        stream: SpillStream,
        profile: Option<SpillProfile>,
    },
    Memory(std::vec::IntoIter<Page>),
}

/// Forward reader over one hash-ordered run: peek the hash of the current
/// row, then slice off the contiguous rows sharing it.
struct RunCursor {
    source: RunSource,
    hash_column: usize,
    page: Option<Page>,
    hashes: Vec<u64>,
    pos: usize,
}

impl RunCursor {
    fn from_disk(stream: SpillStream, hash_column: usize, profile: Option<SpillProfile>) -> Self {
        Self {
            source: RunSource::Disk { stream, profile },
            hash_column,
            page: None,
            hashes: Vec::new(),
            pos: 0,
        }
    }

    fn from_pages(pages: Vec<Page>, hash_column: usize) -> Self {
        Self {
            source: RunSource::Memory(pages.into_iter()),
            hash_column,
            page: None,
            hashes: Vec::new(),
            pos: 0,
        }
    }

    /// Hash of the next unconsumed row, loading pages as needed. `Ok(None)`
    /// once the run is exhausted.
    fn peek_hash(&mut self) -> Result<Option<u64>, String> {
        loop {
            if let Some(page) = self.page.as_ref() {
                if self.pos < page.num_rows() {
                    return Ok(Some(self.hashes[self.pos]));
                }
            }
            if !self.load_next_page()? {
                return Ok(None);
            }
        }
    }

    fn load_next_page(&mut self) -> Result<bool, String> {
        let next = match &mut self.source {
            RunSource::Disk { stream, profile } => {
                let started = Instant::now();
                let batch = stream.next_batch()?;
                if let (Some(batch), Some(profile)) = (batch.as_ref(), profile.as_ref()) {
                    profile.restore_rows.add(batch.num_rows() as i64);
                    profile
                        .restore_bytes
                        .add(record_batch_bytes(batch) as i64);
                    profile
                        .restore_time
                        .add(started.elapsed().as_nanos() as i64);
                }
                batch.map(Page::new)
            }
            RunSource::Memory(pages) => pages.next(),
        };
        let Some(page) = next else {
            self.page = None;
            return Ok(false);
        };
        let column = page.column(self.hash_column)?;
        let hashes = column
            .as_any()
            .downcast_ref::<UInt64Array>()
            .ok_or_else(|| {
                format!(
                    "spill run hash column expects UInt64, got {:?}",
                    column.data_type()
                )
            })?;
        self.hashes.clear();
        self.hashes.extend_from_slice(hashes.values());
        self.pos = 0;
        self.page = Some(page);
        Ok(true)
    }

    /// Contiguous rows at the cursor sharing `hash`, within the current
    /// page. `None` when the cursor stands on a different hash; the caller
    /// peeks again to cross page boundaries.
    fn take_run(&mut self, hash: u64) -> Option<Page> {
        let page = self.page.as_ref()?;
        if self.pos >= page.num_rows() || self.hashes[self.pos] != hash {
            return None;
        }
        let start = self.pos;
        while self.pos < page.num_rows() && self.hashes[self.pos] == hash {
            self.pos += 1;
        }
        Some(page.slice(start, self.pos - start))
    }
}
