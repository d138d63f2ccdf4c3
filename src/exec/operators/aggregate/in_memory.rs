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
//! In-memory aggregation builder.
//!
//! Responsibilities:
//! - Interns group keys into a `GroupKeyTable` and feeds per-group
//!   accumulators, with raw input going through `update_batch` and
//!   intermediate state through `merge_batch`.
//! - Tracks its footprint against the operator's memory tracker; partial
//!   steps flip to full at the soft cap, final steps enforce the tracker
//!   limit.
//! - Snapshots its state as hash-ordered intermediate pages, the unit the
//!   spillable builder writes to disk.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, UInt64Array};

use crate::exec::agg::GroupedAccumulator;
use crate::exec::hash_table::GroupKeyTable;
use crate::exec::operators::aggregate::builder::{AggregatedPageStream, HashAggregationBuilder};
use crate::exec::operators::aggregate::{HashAggregationConfig, NULL_GROUP_HASH};
use crate::exec::page::Page;
use crate::exec::pipeline::dependency::DependencyHandle;
use crate::runtime::mem_tracker::{MemTracker, TrackedBytes};

/// Group table plus accumulator state; moves as one unit into the result
/// stream when the builder is drained.
struct GroupedState {
    table: GroupKeyTable,
    accumulators: Vec<Box<dyn GroupedAccumulator>>,
}

impl GroupedState {
    fn estimated_bytes(&self) -> usize {
        self.table.estimated_bytes()
            + self
                .accumulators
                .iter()
                .map(|a| a.estimated_bytes())
                .sum::<usize>()
    }
}

pub struct InMemoryHashAggregationBuilder {
    config: Arc<HashAggregationConfig>,
    state: Option<GroupedState>,
    tracked: Option<TrackedBytes>,
    mem_tracker: Arc<MemTracker>,
    page_row_count: usize,
    hash_seed: u64,
    full: bool,
    group_ids: Vec<usize>,
    hashes: Vec<u64>,
}

impl InMemoryHashAggregationBuilder {
    pub fn new(
        config: Arc<HashAggregationConfig>,
        mem_tracker: Arc<MemTracker>,
        page_row_count: usize,
    ) -> Result<Self, String> {
        let table = GroupKeyTable::new(
            config.group_by_types().to_vec(),
            config.expected_groups(),
        )?;
        Self::with_table(config, mem_tracker, page_row_count, table)
    }

    /// Builder whose group table hashes with a caller-chosen seed, so a
    /// spill-and-reset cycle keeps assigning identical hashes to identical
    /// keys.
    pub fn with_seed(
        config: Arc<HashAggregationConfig>,
        mem_tracker: Arc<MemTracker>,
        page_row_count: usize,
        hash_seed: u64,
    ) -> Result<Self, String> {
        let table = GroupKeyTable::with_seed(
            config.group_by_types().to_vec(),
            config.expected_groups(),
            hash_seed,
        )?;
        Self::with_table(config, mem_tracker, page_row_count, table)
    }

    fn with_table(
        config: Arc<HashAggregationConfig>,
        mem_tracker: Arc<MemTracker>,
        page_row_count: usize,
        table: GroupKeyTable,
    ) -> Result<Self, String> {
        let accumulators = config
            .aggregators()
            .iter()
            .map(|spec| spec.create_grouped_accumulator())
            .collect::<Result<Vec<_>, String>>()?;
        let tracked = TrackedBytes::new(0, Arc::clone(&mem_tracker));
        let hash_seed = table.hash_seed();
        Ok(Self {
            config,
            state: Some(GroupedState {
                table,
                accumulators,
            }),
            tracked: Some(tracked),
            mem_tracker,
            page_row_count,
            hash_seed,
            full: false,
            group_ids: Vec::new(),
            hashes: Vec::new(),
        })
    }

    pub fn hash_seed(&self) -> u64 {
        self.hash_seed
    }

    pub fn num_groups(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.table.num_groups())
    }

    pub fn estimated_bytes(&self) -> usize {
        self.state.as_ref().map_or(0, GroupedState::estimated_bytes)
    }

    /// Settle the current footprint into the memory tracker and return it.
    pub fn settle_memory(&mut self) -> usize {
        let footprint = self.estimated_bytes();
        if let Some(tracked) = self.tracked.as_mut() {
            tracked.resize(footprint);
        }
        footprint
    }

    pub(crate) fn check_limit(&self) -> Result<(), String> {
        self.mem_tracker.check_limit()
    }

    fn drained_error() -> String {
        "aggregation state was already drained".to_string()
    }

    fn absorb_page(&mut self, page: &Page) -> Result<(), String> {
        if page.num_rows() == 0 {
            return Ok(());
        }
        let key_columns = self
            .config
            .group_by_channels()
            .iter()
            .map(|&channel| page.column(channel).map(Arc::clone))
            .collect::<Result<Vec<_>, String>>()?;
        self.hashes.clear();
        let provided = match self.config.hash_channel() {
            Some(channel) => {
                let column = page.column(channel)?;
                let hashes = column
                    .as_any()
                    .downcast_ref::<UInt64Array>()
                    .ok_or_else(|| {
                        format!(
                            "hash channel {} expects UInt64, got {:?}",
                            channel,
                            column.data_type()
                        )
                    })?;
                self.hashes
                    .extend(hashes.iter().map(|h| h.unwrap_or(NULL_GROUP_HASH)));
                true
            }
            None => false,
        };
        let state = self.state.as_mut().ok_or_else(Self::drained_error)?;
        let provided_hashes = provided.then_some(self.hashes.as_slice());
        state
            .table
            .assign_group_ids(&key_columns, provided_hashes, &mut self.group_ids)?;

        let num_groups = state.table.num_groups();
        let raw_input = self.config.step().is_input_raw();
        for (spec, accumulator) in self
            .config
            .aggregators()
            .iter()
            .zip(state.accumulators.iter_mut())
        {
            if raw_input {
                let input = match spec.input_channel() {
                    Some(channel) => Some(page.column(channel)?),
                    None => None,
                };
                accumulator.update_batch(num_groups, &self.group_ids, input)?;
            } else {
                let channel = spec.input_channel().ok_or_else(|| {
                    format!(
                        "{} merge input channel is not bound",
                        spec.function().as_str()
                    )
                })?;
                accumulator.merge_batch(num_groups, &self.group_ids, page.column(channel)?)?;
            }
        }
        Ok(())
    }

    /// Intermediate state as pages ordered by ascending group hash, in the
    /// spill-run schema. The builder keeps its state; the caller resets it
    /// separately.
    pub(crate) fn hash_ordered_intermediate_pages(&self) -> Result<Vec<Page>, String> {
        let state = self.state.as_ref().ok_or_else(Self::drained_error)?;
        let num_groups = state.table.num_groups();
        if num_groups == 0 {
            return Ok(Vec::new());
        }
        let hashes = state.table.group_hashes();
        let mut order: Vec<usize> = (0..num_groups).collect();
        order.sort_unstable_by_key(|&group| hashes[group]);

        let schema = self.config.spill_schema();
        let mut pages = Vec::with_capacity(num_groups.div_ceil(self.page_row_count));
        for ids in order.chunks(self.page_row_count) {
            let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());
            columns.extend(state.table.key_arrays_for(ids)?);
            columns.push(Arc::new(UInt64Array::from(
                ids.iter().map(|&g| hashes[g]).collect::<Vec<_>>(),
            )));
            for accumulator in &state.accumulators {
                columns.push(accumulator.evaluate_intermediate(ids)?);
            }
            pages.push(Page::try_from_arrays(Arc::clone(&schema), columns)?);
        }
        Ok(pages)
    }
}

impl HashAggregationBuilder for InMemoryHashAggregationBuilder {
    fn process_page(&mut self, page: Page) -> Result<(), String> {
        self.absorb_page(&page)
    }

    fn update_memory(&mut self) -> Result<(), String> {
        let footprint = self.settle_memory();
        if self.config.step().is_output_partial() {
            let cap = self.config.max_partial_memory_bytes();
            if cap > 0 && footprint as i64 >= cap {
                self.full = true;
            }
            Ok(())
        } else {
            self.check_limit()
        }
    }

    fn is_full(&self) -> bool {
        self.full
    }

    fn blocked_dependency(&self) -> Option<DependencyHandle> {
        None
    }

    fn build_result(&mut self) -> Result<Box<dyn AggregatedPageStream>, String> {
        let state = self.state.take().ok_or_else(Self::drained_error)?;
        let tracked = self.tracked.take();
        Ok(Box::new(InMemoryResultStream {
            config: Arc::clone(&self.config),
            state,
            _tracked: tracked,
            page_row_count: self.page_row_count,
            next_group: 0,
        }))
    }

    fn close(&mut self) {
        self.state = None;
        self.tracked = None;
        self.full = false;
    }
}

/// Streams the grouped results in group-id order, one page of at most
/// `page_row_count` rows at a time.
struct InMemoryResultStream {
    config: Arc<HashAggregationConfig>,
    state: GroupedState,
    // Keeps the footprint accounted until the stream is dropped.
    _tracked: Option<TrackedBytes>,
    page_row_count: usize,
    next_group: usize,
}

impl AggregatedPageStream for InMemoryResultStream {
    fn next_page(&mut self) -> Result<Option<Page>, String> {
        let num_groups = self.state.table.num_groups();
        if self.next_group >= num_groups {
            return Ok(None);
        }
        let end = num_groups.min(self.next_group + self.page_row_count);
        let ids: Vec<usize> = (self.next_group..end).collect();
        self.next_group = end;

        let schema = self.config.output_schema();
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());
        columns.extend(self.state.table.key_arrays_for(&ids)?);
        if self.config.hash_channel().is_some() {
            let hashes = self.state.table.group_hashes();
            columns.push(Arc::new(UInt64Array::from(
                ids.iter().map(|&g| hashes[g]).collect::<Vec<_>>(),
            )));
        }
        let partial = self.config.step().is_output_partial();
        for accumulator in &self.state.accumulators {
            columns.push(if partial {
                accumulator.evaluate_intermediate(&ids)?
            } else {
                accumulator.evaluate_final(&ids)?
            });
        }
        Page::try_from_arrays(schema, columns).map(Some)
    }

    fn is_exhausted(&self) -> bool {
        self.next_group >= self.state.table.num_groups()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::agg::{AggFunction, AggregatorSpec};
    use crate::exec::operators::aggregate::{AggregationStep, HashAggregationParams};
    use arrow::array::{Array, Float64Array, Int64Array, StructArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;

    fn config(step: AggregationStep, hash_channel: Option<usize>) -> Arc<HashAggregationConfig> {
        let params = HashAggregationParams {
            group_by_types: vec![DataType::Int64],
            group_by_channels: vec![0],
            hash_channel,
            aggregators: vec![
                AggregatorSpec::count(),
                AggregatorSpec::new(AggFunction::Sum, Some(1), Some(DataType::Int64))
                    .expect("sum spec"),
            ],
            step,
            global_aggregation_group_ids: Vec::new(),
            group_id_channel: None,
            expected_groups: 8,
            max_partial_memory_bytes: 0,
        };
        Arc::new(HashAggregationConfig::try_new(params, 0, 0).expect("config"))
    }

    fn input_page(keys: Vec<Option<i64>>, values: Vec<Option<i64>>) -> Page {
        let schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int64, true),
            Field::new("v", DataType::Int64, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(keys)),
                Arc::new(Int64Array::from(values)),
            ],
        )
        .expect("batch");
        Page::new(batch)
    }

    fn drain(stream: &mut dyn AggregatedPageStream) -> Vec<Page> {
        let mut pages = Vec::new();
        while let Some(page) = stream.next_page().expect("next page") {
            pages.push(page);
        }
        pages
    }

    #[test]
    fn groups_across_pages_and_finalizes_in_first_seen_order() {
        let config = config(AggregationStep::Single, None);
        let tracker = MemTracker::new_root("test");
        let mut builder =
            InMemoryHashAggregationBuilder::new(config, Arc::clone(&tracker), 1024)
                .expect("builder");

        builder
            .process_page(input_page(
                vec![Some(1), Some(2), Some(1), None],
                vec![Some(10), Some(20), Some(30), None],
            ))
            .expect("page 1");
        builder
            .process_page(input_page(
                vec![None, Some(2)],
                vec![None, Some(2)],
            ))
            .expect("page 2");
        builder.update_memory().expect("memory");
        assert!(tracker.current() > 0);
        assert_eq!(builder.num_groups(), 3);

        let mut stream = builder.build_result().expect("stream");
        assert!(!stream.is_exhausted());
        let pages = drain(stream.as_mut());
        assert_eq!(pages.len(), 1);
        let page = &pages[0];
        assert_eq!(page.num_rows(), 3);

        let keys = page.column(0).expect("keys");
        let keys = keys.as_any().downcast_ref::<Int64Array>().expect("int64");
        assert_eq!(keys.value(0), 1);
        assert_eq!(keys.value(1), 2);
        assert!(keys.is_null(2));

        let counts = page.column(1).expect("counts");
        let counts = counts.as_any().downcast_ref::<Int64Array>().expect("int64");
        assert_eq!(counts.values(), &[2, 2, 2]);

        let sums = page.column(2).expect("sums");
        let sums = sums.as_any().downcast_ref::<Int64Array>().expect("int64");
        assert_eq!(sums.value(0), 40);
        assert_eq!(sums.value(1), 22);
        // The null-key group never saw a non-null sum input.
        assert!(sums.is_null(2));

        // Dropping the stream releases the tracked footprint.
        drop(stream);
        assert_eq!(tracker.current(), 0);
    }

    #[test]
    fn output_pages_respect_the_row_limit() {
        let config = config(AggregationStep::Single, None);
        let tracker = MemTracker::new_root("test");
        let mut builder =
            InMemoryHashAggregationBuilder::new(config, tracker, 2).expect("builder");
        builder
            .process_page(input_page(
                vec![Some(1), Some(2), Some(3), Some(4), Some(5)],
                vec![Some(1), Some(1), Some(1), Some(1), Some(1)],
            ))
            .expect("page");
        let mut stream = builder.build_result().expect("stream");
        let pages = drain(stream.as_mut());
        assert_eq!(
            pages.iter().map(Page::num_rows).collect::<Vec<_>>(),
            vec![2, 2, 1]
        );
        assert!(stream.is_exhausted());
    }

    #[test]
    fn partial_step_trips_the_soft_cap_and_emits_intermediate_state() {
        let params = HashAggregationParams {
            group_by_types: vec![DataType::Int64],
            group_by_channels: vec![0],
            hash_channel: None,
            aggregators: vec![
                AggregatorSpec::new(AggFunction::Avg, Some(1), Some(DataType::Int64))
                    .expect("avg spec"),
            ],
            step: AggregationStep::Partial,
            global_aggregation_group_ids: Vec::new(),
            group_id_channel: None,
            expected_groups: 8,
            max_partial_memory_bytes: 1,
        };
        let config = Arc::new(HashAggregationConfig::try_new(params, 0, 0).expect("config"));
        let tracker = MemTracker::new_root("test");
        let mut builder =
            InMemoryHashAggregationBuilder::new(config, tracker, 1024).expect("builder");

        builder
            .process_page(input_page(vec![Some(1), Some(1)], vec![Some(4), Some(8)]))
            .expect("page");
        assert!(!builder.is_full());
        builder.update_memory().expect("memory");
        assert!(builder.is_full());

        let mut stream = builder.build_result().expect("stream");
        let pages = drain(stream.as_mut());
        assert_eq!(pages.len(), 1);
        let states = pages[0].column(1).expect("avg state");
        let states = states
            .as_any()
            .downcast_ref::<StructArray>()
            .expect("struct");
        let sums = states
            .column_by_name("sum")
            .expect("sum field")
            .as_any()
            .downcast_ref::<Float64Array>()
            .expect("f64");
        assert_eq!(sums.value(0), 12.0);
    }

    #[test]
    fn final_step_merges_intermediate_input() {
        let params = HashAggregationParams {
            group_by_types: vec![DataType::Int64],
            group_by_channels: vec![0],
            hash_channel: None,
            // Final stage reads partial counts from channel 1.
            aggregators: vec![
                AggregatorSpec::new(AggFunction::Count, Some(1), Some(DataType::Int64))
                    .expect("count spec"),
            ],
            step: AggregationStep::Final,
            global_aggregation_group_ids: Vec::new(),
            group_id_channel: None,
            expected_groups: 8,
            max_partial_memory_bytes: 0,
        };
        let config = Arc::new(HashAggregationConfig::try_new(params, 0, 0).expect("config"));
        let tracker = MemTracker::new_root("test");
        let mut builder =
            InMemoryHashAggregationBuilder::new(config, tracker, 1024).expect("builder");

        builder
            .process_page(input_page(vec![Some(7), Some(8)], vec![Some(3), Some(4)]))
            .expect("page 1");
        builder
            .process_page(input_page(vec![Some(7)], vec![Some(5)]))
            .expect("page 2");

        let mut stream = builder.build_result().expect("stream");
        let pages = drain(stream.as_mut());
        let counts = pages[0].column(1).expect("counts");
        let counts = counts.as_any().downcast_ref::<Int64Array>().expect("int64");
        assert_eq!(counts.values(), &[8, 4]);
    }

    #[test]
    fn hash_channel_is_reused_and_reemitted() {
        let config = config(AggregationStep::Single, Some(2));
        let schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int64, true),
            Field::new("v", DataType::Int64, true),
            Field::new("h", DataType::UInt64, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![Some(1), Some(2), Some(1)])),
                Arc::new(Int64Array::from(vec![Some(1), Some(1), Some(1)])),
                Arc::new(UInt64Array::from(vec![Some(101), Some(202), Some(101)])),
            ],
        )
        .expect("batch");
        let tracker = MemTracker::new_root("test");
        let mut builder =
            InMemoryHashAggregationBuilder::new(config, tracker, 1024).expect("builder");
        builder.process_page(Page::new(batch)).expect("page");

        let mut stream = builder.build_result().expect("stream");
        let pages = drain(stream.as_mut());
        let hashes = pages[0].column(1).expect("hash column");
        let hashes = hashes
            .as_any()
            .downcast_ref::<UInt64Array>()
            .expect("uint64");
        assert_eq!(hashes.values(), &[101, 202]);
    }

    #[test]
    fn snapshot_orders_groups_by_hash_in_the_spill_schema() {
        let config = config(AggregationStep::Single, None);
        let tracker = MemTracker::new_root("test");
        let builder = {
            let mut builder =
                InMemoryHashAggregationBuilder::new(config, tracker, 2).expect("builder");
            builder
                .process_page(input_page(
                    vec![Some(1), Some(2), Some(3), Some(4), Some(5)],
                    vec![Some(1), Some(2), Some(3), Some(4), Some(5)],
                ))
                .expect("page");
            builder
        };
        let pages = builder
            .hash_ordered_intermediate_pages()
            .expect("snapshot");
        assert_eq!(
            pages.iter().map(Page::num_rows).sum::<usize>(),
            builder.num_groups()
        );
        // Keys, hash, then the two intermediate columns.
        assert_eq!(pages[0].schema().fields().len(), 4);
        let mut last = 0u64;
        for page in &pages {
            let hashes = page.column(1).expect("hash column");
            let hashes = hashes
                .as_any()
                .downcast_ref::<UInt64Array>()
                .expect("uint64");
            for i in 0..hashes.len() {
                assert!(hashes.value(i) >= last, "hash order violated");
                last = hashes.value(i);
            }
        }
    }

    #[test]
    fn drained_builder_rejects_further_use() {
        let config = config(AggregationStep::Single, None);
        let tracker = MemTracker::new_root("test");
        let mut builder =
            InMemoryHashAggregationBuilder::new(config, tracker, 1024).expect("builder");
        builder
            .process_page(input_page(vec![Some(1)], vec![Some(1)]))
            .expect("page");
        let _stream = builder.build_result().expect("stream");
        let err = builder
            .process_page(input_page(vec![Some(2)], vec![Some(2)]))
            .expect_err("drained");
        assert!(err.contains("already drained"), "err={}", err);
    }
}
