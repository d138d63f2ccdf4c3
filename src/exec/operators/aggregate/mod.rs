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
//! Hash aggregation operator: configuration, factory, and the push/pull
//! state machine.
//!
//! Responsibilities:
//! - `HashAggregationOperatorFactory` creates one operator per driver from a
//!   shared, validated `HashAggregationConfig`.
//! - `HashAggregationOperator` feeds input pages to an aggregation builder,
//!   drains the builder's result stream once finishing (or earlier, when a
//!   partial-output builder hits its memory cap and must flush), and emits
//!   the default rows grouping-set queries expect from an empty input.
//! - Picks the builder at first input: partial-output steps and
//!   spill-disabled configurations aggregate purely in memory, final-output
//!   steps with a spill threshold use the spillable builder.
//!
//! Key exported interfaces:
//! - Types: `AggregationStep`, `HashAggregationParams`, `HashAggregationConfig`,
//!   `HashAggregationOperatorFactory`.

mod builder;
mod global_output;
mod in_memory;
mod spillable;

pub use builder::{AggregatedPageStream, HashAggregationBuilder};
pub use in_memory::InMemoryHashAggregationBuilder;
pub use spillable::SpillableHashAggregationBuilder;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arrow::datatypes::{DataType, Field, Schema, SchemaRef};

use crate::exec::agg::AggregatorSpec;
use crate::exec::page::Page;
use crate::exec::pipeline::dependency::DependencyHandle;
use crate::exec::pipeline::operator::{Operator, ProcessorOperator};
use crate::exec::pipeline::operator_factory::OperatorFactory;
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::profile::{CounterUnit, OperatorProfiles};
use crate::runtime::runtime_state::RuntimeState;

use global_output::build_global_aggregation_output;

/// Hash written to the hash channel of global default rows, whose group keys
/// are all null.
pub const NULL_GROUP_HASH: u64 = 0;

/// Share of the spill threshold under which the last in-memory state is
/// merged directly with the spilled runs instead of being written out first.
const MERGE_WITH_MEMORY_RATIO: f64 = 0.9;

/// Position of an aggregation in a multi-stage plan. The step decides whether
/// the operator consumes raw input or intermediate state, and which of the
/// two it emits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggregationStep {
    /// One-stage plan: raw input in, final values out.
    Single,
    /// First stage: raw input in, intermediate state out.
    Partial,
    /// Last stage: intermediate state in, final values out.
    Final,
    /// Middle stage: intermediate state in and out.
    Intermediate,
}

impl AggregationStep {
    /// Whether this stage emits intermediate accumulator state rather than
    /// final values.
    pub fn is_output_partial(&self) -> bool {
        matches!(
            self,
            AggregationStep::Partial | AggregationStep::Intermediate
        )
    }

    /// Whether this stage consumes raw input rather than intermediate state.
    pub fn is_input_raw(&self) -> bool {
        matches!(self, AggregationStep::Single | AggregationStep::Partial)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationStep::Single => "SINGLE",
            AggregationStep::Partial => "PARTIAL",
            AggregationStep::Final => "FINAL",
            AggregationStep::Intermediate => "INTERMEDIATE",
        }
    }
}

/// Plan-time inputs of one hash aggregation, before validation.
#[derive(Clone, Debug)]
pub struct HashAggregationParams {
    pub group_by_types: Vec<DataType>,
    pub group_by_channels: Vec<usize>,
    /// Input channel carrying a precomputed group hash. When set, the hash is
    /// also re-emitted as an output column right after the keys.
    pub hash_channel: Option<usize>,
    pub aggregators: Vec<AggregatorSpec>,
    pub step: AggregationStep,
    /// Group ids that must each produce one default row when a final-output
    /// aggregation finishes without ever seeing input. Non-empty only for
    /// grouping-set queries whose sets include the empty set.
    pub global_aggregation_group_ids: Vec<i64>,
    /// Index into the group-by columns that receives the synthetic group id
    /// in default rows.
    pub group_id_channel: Option<usize>,
    /// Capacity hint for the group table.
    pub expected_groups: usize,
    /// Soft memory cap for partial-output steps; reaching it makes the
    /// builder report full so the operator flushes and starts over.
    pub max_partial_memory_bytes: i64,
}

/// Validated, immutable configuration shared by every operator a factory and
/// its duplicates create.
#[derive(Debug)]
pub struct HashAggregationConfig {
    params: HashAggregationParams,
    memory_limit_before_spill: i64,
    memory_limit_for_merge_with_memory: i64,
    output_schema: SchemaRef,
    spill_schema: SchemaRef,
}

impl HashAggregationConfig {
    /// Validate `params` and derive the output and spill-run schemas.
    ///
    /// `memory_limit_before_spill <= 0` disables spilling. Otherwise reaching
    /// it makes a final-output builder write its accumulated state to disk,
    /// and `memory_limit_for_merge_with_memory` bounds how much of the last
    /// in-memory state may join the merge without being written out first.
    pub fn try_new(
        params: HashAggregationParams,
        memory_limit_before_spill: i64,
        memory_limit_for_merge_with_memory: i64,
    ) -> Result<Self, String> {
        if params.group_by_types.is_empty() {
            return Err("hash aggregation requires at least one group-by column".to_string());
        }
        if params.group_by_types.len() != params.group_by_channels.len() {
            return Err(format!(
                "group-by channel count {} does not match type count {}",
                params.group_by_channels.len(),
                params.group_by_types.len()
            ));
        }
        if let Some(idx) = params.group_id_channel {
            match params.group_by_types.get(idx) {
                None => {
                    return Err(format!(
                        "group id channel {} out of range for {} group-by columns",
                        idx,
                        params.group_by_types.len()
                    ));
                }
                Some(DataType::Int64) => {}
                Some(other) => {
                    return Err(format!("group id channel must be Int64, got {:?}", other));
                }
            }
        }
        let memory_limit_before_spill = memory_limit_before_spill.max(0);
        let memory_limit_for_merge_with_memory = memory_limit_for_merge_with_memory.max(0);
        if memory_limit_before_spill > 0
            && memory_limit_for_merge_with_memory > memory_limit_before_spill
        {
            return Err(format!(
                "memory limit for merge with memory ({}) exceeds the spill threshold ({})",
                memory_limit_for_merge_with_memory, memory_limit_before_spill
            ));
        }
        let output_schema = Self::build_schema(&params, false)?;
        let spill_schema = Self::build_schema(&params, true)?;
        Ok(Self {
            params,
            memory_limit_before_spill,
            memory_limit_for_merge_with_memory,
            output_schema,
            spill_schema,
        })
    }

    fn build_schema(params: &HashAggregationParams, for_spill: bool) -> Result<SchemaRef, String> {
        let mut fields =
            Vec::with_capacity(params.group_by_types.len() + 1 + params.aggregators.len());
        for (i, data_type) in params.group_by_types.iter().enumerate() {
            fields.push(Field::new(format!("group_{i}"), data_type.clone(), true));
        }
        if for_spill || params.hash_channel.is_some() {
            fields.push(Field::new("group_hash", DataType::UInt64, true));
        }
        for (i, spec) in params.aggregators.iter().enumerate() {
            let data_type = if for_spill || params.step.is_output_partial() {
                spec.intermediate_type()?
            } else {
                spec.final_type()?
            };
            fields.push(Field::new(
                format!("{}_{i}", spec.function().as_str()),
                data_type,
                true,
            ));
        }
        Ok(Arc::new(Schema::new(fields)))
    }

    pub fn step(&self) -> AggregationStep {
        self.params.step
    }

    pub fn group_by_types(&self) -> &[DataType] {
        &self.params.group_by_types
    }

    pub fn group_by_channels(&self) -> &[usize] {
        &self.params.group_by_channels
    }

    pub fn hash_channel(&self) -> Option<usize> {
        self.params.hash_channel
    }

    pub fn aggregators(&self) -> &[AggregatorSpec] {
        &self.params.aggregators
    }

    pub fn global_aggregation_group_ids(&self) -> &[i64] {
        &self.params.global_aggregation_group_ids
    }

    pub fn group_id_channel(&self) -> Option<usize> {
        self.params.group_id_channel
    }

    pub fn expected_groups(&self) -> usize {
        self.params.expected_groups
    }

    pub fn max_partial_memory_bytes(&self) -> i64 {
        self.params.max_partial_memory_bytes
    }

    pub fn memory_limit_before_spill(&self) -> i64 {
        self.memory_limit_before_spill
    }

    pub fn memory_limit_for_merge_with_memory(&self) -> i64 {
        self.memory_limit_for_merge_with_memory
    }

    pub fn spill_enabled(&self) -> bool {
        self.memory_limit_before_spill > 0
    }

    /// Schema of the pages this aggregation emits: group keys, the hash
    /// column when a hash channel is configured, then one column per
    /// aggregation (intermediate state for partial-output steps, final
    /// values otherwise). All fields are nullable.
    pub fn output_schema(&self) -> SchemaRef {
        Arc::clone(&self.output_schema)
    }

    /// Schema of spill-run pages: group keys, the group hash, then one
    /// intermediate state column per aggregation. The hash column is always
    /// present so merge cursors never re-hash restored rows.
    pub fn spill_schema(&self) -> SchemaRef {
        Arc::clone(&self.spill_schema)
    }
}

/// Creates one `HashAggregationOperator` per pipeline driver.
pub struct HashAggregationOperatorFactory {
    name: String,
    config: Arc<HashAggregationConfig>,
    closed: AtomicBool,
}

impl HashAggregationOperatorFactory {
    /// Factory for an aggregation that never spills.
    pub fn new(node_id: i32, params: HashAggregationParams) -> Result<Self, String> {
        Ok(Self::with_config(
            node_id,
            HashAggregationConfig::try_new(params, 0, 0)?,
        ))
    }

    /// Spill-capable factory. The merge-with-memory limit defaults to 90% of
    /// the spill threshold.
    pub fn with_spill(
        node_id: i32,
        params: HashAggregationParams,
        memory_limit_before_spill: i64,
    ) -> Result<Self, String> {
        let merge_limit = (memory_limit_before_spill as f64 * MERGE_WITH_MEMORY_RATIO) as i64;
        Self::with_spill_thresholds(node_id, params, memory_limit_before_spill, merge_limit)
    }

    /// Spill-capable factory with both thresholds supplied explicitly.
    pub fn with_spill_thresholds(
        node_id: i32,
        params: HashAggregationParams,
        memory_limit_before_spill: i64,
        memory_limit_for_merge_with_memory: i64,
    ) -> Result<Self, String> {
        Ok(Self::with_config(
            node_id,
            HashAggregationConfig::try_new(
                params,
                memory_limit_before_spill,
                memory_limit_for_merge_with_memory,
            )?,
        ))
    }

    fn with_config(node_id: i32, config: HashAggregationConfig) -> Self {
        Self {
            name: format!("HASH_AGGREGATION (id={node_id})"),
            config: Arc::new(config),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> Arc<HashAggregationConfig> {
        Arc::clone(&self.config)
    }
}

impl OperatorFactory for HashAggregationOperatorFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, _dop: i32, _driver_id: i32) -> Result<Box<dyn Operator>, String> {
        if self.closed.load(Ordering::Acquire) {
            return Err(format!("operator factory {} is already closed", self.name));
        }
        Ok(Box::new(HashAggregationOperator::new(
            self.name.clone(),
            Arc::clone(&self.config),
        )))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn duplicate(&self) -> Box<dyn OperatorFactory> {
        Box::new(Self {
            name: self.name.clone(),
            config: Arc::clone(&self.config),
            closed: AtomicBool::new(false),
        })
    }
}

/// Grouped aggregation processor. Accumulates input pages into a builder and
/// streams grouped results out once finishing, or earlier when a
/// partial-output builder reports full and has to flush.
pub struct HashAggregationOperator {
    name: String,
    config: Arc<HashAggregationConfig>,
    builder: Option<Box<dyn HashAggregationBuilder>>,
    output: Option<Box<dyn AggregatedPageStream>>,
    input_processed: bool,
    finishing: bool,
    finished: bool,
    closed: bool,
    mem_tracker: Option<Arc<MemTracker>>,
    profiles: Option<OperatorProfiles>,
    profile_initialized: bool,
}

impl HashAggregationOperator {
    fn new(name: String, config: Arc<HashAggregationConfig>) -> Self {
        Self {
            name,
            config,
            builder: None,
            output: None,
            input_processed: false,
            finishing: false,
            finished: false,
            closed: false,
            mem_tracker: None,
            profiles: None,
            profile_initialized: false,
        }
    }

    fn init_profile_if_needed(&mut self) {
        if self.profile_initialized {
            return;
        }
        self.profile_initialized = true;
        let Some(profiles) = self.profiles.as_ref() else {
            return;
        };
        profiles.common.add_info_string(
            "GroupingKeys",
            format!("{}", self.config.group_by_channels().len()),
        );
        let funcs = self
            .config
            .aggregators()
            .iter()
            .map(|a| a.function().as_str())
            .collect::<Vec<_>>()
            .join(", ");
        profiles.common.add_info_string("AggregateFunctions", funcs);
        profiles
            .common
            .add_info_string("Step", self.config.step().as_str());
    }

    fn count_output_rows(&self, page: Option<&Page>) {
        if let (Some(page), Some(profiles)) = (page, self.profiles.as_ref()) {
            profiles.common.counter_add(
                "OutputRowCount",
                CounterUnit::Rows,
                page.num_rows() as i64,
            );
        }
    }

    fn create_builder(
        &self,
        state: &RuntimeState,
    ) -> Result<Box<dyn HashAggregationBuilder>, String> {
        let tracker = match self.mem_tracker.as_ref() {
            Some(tracker) => Arc::clone(tracker),
            None => state.mem_tracker(),
        };
        let in_memory = self.config.step().is_output_partial() || !self.config.spill_enabled();
        if in_memory {
            Ok(Box::new(InMemoryHashAggregationBuilder::new(
                Arc::clone(&self.config),
                tracker,
                state.page_row_count(),
            )?))
        } else {
            Ok(Box::new(SpillableHashAggregationBuilder::new(
                Arc::clone(&self.config),
                tracker,
                state,
            )?))
        }
    }

    /// Drop the result stream and close the builder. Stream resources (run
    /// files, tracked memory) are released by the stream's own drop.
    fn release_builder(&mut self) {
        self.output = None;
        if let Some(mut builder) = self.builder.take() {
            builder.close();
        }
    }
}

impl Operator for HashAggregationOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_mem_tracker(&mut self, tracker: Arc<MemTracker>) {
        self.mem_tracker = Some(MemTracker::new_child("AggregationState", &tracker));
    }

    fn set_profiles(&mut self, profiles: OperatorProfiles) {
        self.profiles = Some(profiles);
    }

    fn close(&mut self) -> Result<(), String> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.release_builder();
        self.finished = true;
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn as_processor_mut(&mut self) -> Option<&mut dyn ProcessorOperator> {
        Some(self)
    }

    fn as_processor_ref(&self) -> Option<&dyn ProcessorOperator> {
        Some(self)
    }
}

impl ProcessorOperator for HashAggregationOperator {
    fn need_input(&self) -> bool {
        !self.finishing
            && self.output.is_none()
            && self.builder.as_ref().is_none_or(|b| !b.is_full())
    }

    fn push_chunk(&mut self, state: &RuntimeState, page: Page) -> Result<(), String> {
        if self.finishing {
            return Err("aggregate received input after set_finishing".to_string());
        }
        self.init_profile_if_needed();
        if self.builder.is_none() {
            self.builder = Some(self.create_builder(state)?);
        }
        let builder = self
            .builder
            .as_mut()
            .ok_or_else(|| "aggregate builder missing".to_string())?;
        if builder.is_full() {
            return Err("aggregate received input while the builder is full".to_string());
        }
        if let Some(profiles) = self.profiles.as_ref() {
            profiles
                .common
                .counter_add("InputRowCount", CounterUnit::Rows, page.num_rows() as i64);
        }
        builder.process_page(page)?;
        builder.update_memory()?;
        self.input_processed = true;
        Ok(())
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> Result<Option<Page>, String> {
        if self.finished {
            return Ok(None);
        }
        self.init_profile_if_needed();
        if self.output.is_none() {
            if self.finishing
                && !self.input_processed
                && !self.config.step().is_output_partial()
            {
                // Grouping-set queries aggregate the empty input into one
                // default row per global group id.
                self.finished = true;
                let page = build_global_aggregation_output(&self.config)?;
                self.count_output_rows(page.as_ref());
                return Ok(page);
            }
            if self.finishing && self.builder.is_none() {
                self.finished = true;
                return Ok(None);
            }
            if !self.finishing && self.builder.as_ref().is_none_or(|b| !b.is_full()) {
                return Ok(None);
            }
            let _build_timer = self
                .profiles
                .as_ref()
                .map(|p| p.common.scoped_timer("ResultBuildTime"));
            let builder = self
                .builder
                .as_mut()
                .ok_or_else(|| "aggregate builder missing".to_string())?;
            let stream = builder.build_result()?;
            if stream.is_exhausted() {
                self.release_builder();
                return Ok(None);
            }
            self.output = Some(stream);
        }
        let page = match self.output.as_mut() {
            Some(stream) => stream.next_page()?,
            None => None,
        };
        if self.output.as_ref().is_none_or(|s| s.is_exhausted()) {
            self.release_builder();
        }
        self.count_output_rows(page.as_ref());
        Ok(page)
    }

    fn set_finishing(&mut self, _state: &RuntimeState) -> Result<(), String> {
        self.finishing = true;
        Ok(())
    }

    fn blocked_dependency(&self) -> Option<DependencyHandle> {
        self.builder.as_ref().and_then(|b| b.blocked_dependency())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::agg::AggFunction;

    fn count_params() -> HashAggregationParams {
        HashAggregationParams {
            group_by_types: vec![DataType::Int64],
            group_by_channels: vec![0],
            hash_channel: None,
            aggregators: vec![AggregatorSpec::count()],
            step: AggregationStep::Single,
            global_aggregation_group_ids: Vec::new(),
            group_id_channel: None,
            expected_groups: 16,
            max_partial_memory_bytes: 0,
        }
    }

    #[test]
    fn step_classifies_input_and_output() {
        assert!(AggregationStep::Single.is_input_raw());
        assert!(!AggregationStep::Single.is_output_partial());
        assert!(AggregationStep::Partial.is_input_raw());
        assert!(AggregationStep::Partial.is_output_partial());
        assert!(!AggregationStep::Final.is_input_raw());
        assert!(!AggregationStep::Final.is_output_partial());
        assert!(!AggregationStep::Intermediate.is_input_raw());
        assert!(AggregationStep::Intermediate.is_output_partial());
    }

    #[test]
    fn config_validates_channels_and_thresholds() {
        let mut params = count_params();
        params.group_by_channels = vec![0, 1];
        let err = HashAggregationConfig::try_new(params, 0, 0).expect_err("count mismatch");
        assert!(err.contains("does not match"), "err={}", err);

        let mut params = count_params();
        params.group_id_channel = Some(3);
        let err = HashAggregationConfig::try_new(params, 0, 0).expect_err("out of range");
        assert!(err.contains("out of range"), "err={}", err);

        let mut params = count_params();
        params.group_by_types = vec![DataType::Utf8];
        params.group_id_channel = Some(0);
        let err = HashAggregationConfig::try_new(params, 0, 0).expect_err("wrong type");
        assert!(err.contains("must be Int64"), "err={}", err);

        let err = HashAggregationConfig::try_new(count_params(), 1000, 1001)
            .expect_err("merge above spill");
        assert!(err.contains("exceeds the spill threshold"), "err={}", err);
    }

    #[test]
    fn merge_limit_defaults_to_ninety_percent_of_spill_limit() {
        let factory =
            HashAggregationOperatorFactory::with_spill(1, count_params(), 1000).expect("factory");
        let config = factory.config();
        assert_eq!(config.memory_limit_before_spill(), 1000);
        assert_eq!(config.memory_limit_for_merge_with_memory(), 900);
        assert!(config.spill_enabled());
    }

    #[test]
    fn schemas_follow_step_and_hash_channel() {
        let mut params = count_params();
        params.hash_channel = Some(1);
        params.aggregators = vec![
            AggregatorSpec::count(),
            AggregatorSpec::new(AggFunction::Avg, Some(2), Some(DataType::Int64)).expect("avg"),
        ];
        params.step = AggregationStep::Partial;
        let config = HashAggregationConfig::try_new(params, 0, 0).expect("config");

        let output = config.output_schema();
        assert_eq!(output.fields().len(), 4);
        assert_eq!(output.field(0).name(), "group_0");
        assert_eq!(output.field(1).name(), "group_hash");
        assert_eq!(output.field(1).data_type(), &DataType::UInt64);
        assert_eq!(output.field(2).data_type(), &DataType::Int64);
        // Partial output carries the avg intermediate struct.
        assert!(matches!(
            output.field(3).data_type(),
            DataType::Struct(_)
        ));

        let mut params = count_params();
        params.aggregators = vec![
            AggregatorSpec::new(AggFunction::Avg, Some(1), Some(DataType::Int64)).expect("avg"),
        ];
        params.step = AggregationStep::Single;
        let config = HashAggregationConfig::try_new(params, 0, 0).expect("config");
        let output = config.output_schema();
        // No hash channel: keys then final values.
        assert_eq!(output.fields().len(), 2);
        assert_eq!(output.field(1).data_type(), &DataType::Float64);
        assert_eq!(output.field(1).name(), "avg_0");

        // Spill runs always carry the hash and intermediate state.
        let spill = config.spill_schema();
        assert_eq!(spill.fields().len(), 3);
        assert_eq!(spill.field(1).name(), "group_hash");
        assert!(matches!(spill.field(2).data_type(), DataType::Struct(_)));
    }

    #[test]
    fn closed_factory_rejects_create_but_duplicate_starts_fresh() {
        let factory = HashAggregationOperatorFactory::new(7, count_params()).expect("factory");
        assert!(factory.create(1, 0).is_ok());
        factory.close();
        let err = factory.create(1, 0).err().expect("closed factory");
        assert!(err.contains("already closed"), "err={}", err);
        assert!(err.contains("HASH_AGGREGATION (id=7)"), "err={}", err);

        let duplicate = factory.duplicate();
        assert!(duplicate.create(1, 1).is_ok());
        // The duplicate closes independently of the original.
        duplicate.close();
        assert!(duplicate.create(1, 2).is_err());
    }
}
