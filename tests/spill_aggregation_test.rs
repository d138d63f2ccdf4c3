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
//! Integration tests for hash aggregation under forced spilling.

mod common;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use arrow::array::{Array, ArrayRef, Float64Array, Int64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use tempfile::TempDir;

use quartzite::exec::agg::{AggFunction, AggregatorSpec};
use quartzite::exec::operators::aggregate::{
    AggregationStep, HashAggregationOperatorFactory, HashAggregationParams,
};
use quartzite::exec::page::Page;
use quartzite::exec::pipeline::operator_factory::OperatorFactory;
use quartzite::exec::spill::{QuerySpillManager, SpillConfig};
use quartzite::quartzite_config;
use quartzite::runtime::profile::RuntimeProfile;
use quartzite::runtime::runtime_state::RuntimeState;

use crate::common::{drive_operator, int64_column, key_value_page};

static SPILL_DIR: OnceLock<TempDir> = OnceLock::new();

/// Point the process config at a test-owned spill directory. Runs once per
/// test binary; the directory lives until the process exits.
fn init_test_config() {
    SPILL_DIR.get_or_init(|| {
        let dir = TempDir::new().expect("spill tempdir");
        let config_path = dir.path().join("quartzite.toml");
        let contents = format!(
            "[spill]\nlocal_dirs = [{:?}]\n",
            dir.path().join("runs").display().to_string()
        );
        std::fs::write(&config_path, contents).expect("write test config");
        quartzite_config::init_from_path(&config_path).expect("init config");
        dir
    });
}

fn spill_state(label: &str, profile: Option<&RuntimeProfile>) -> RuntimeState {
    init_test_config();
    let mut state = RuntimeState::new(label);
    state.set_page_row_count(3);
    let config = SpillConfig::new(true);
    let manager = Arc::new(QuerySpillManager::new(config.clone(), profile));
    state.set_spill(config, manager);
    state
}

fn count_sum_avg_params() -> HashAggregationParams {
    HashAggregationParams {
        group_by_types: vec![DataType::Int64],
        group_by_channels: vec![0],
        hash_channel: None,
        aggregators: vec![
            AggregatorSpec::count(),
            AggregatorSpec::new(AggFunction::Sum, Some(1), Some(DataType::Int64))
                .expect("sum spec"),
            AggregatorSpec::new(AggFunction::Avg, Some(1), Some(DataType::Int64))
                .expect("avg spec"),
        ],
        step: AggregationStep::Single,
        global_aggregation_group_ids: Vec::new(),
        group_id_channel: None,
        expected_groups: 16,
        max_partial_memory_bytes: 0,
    }
}

fn input_pages() -> Vec<Page> {
    let mut pages = Vec::new();
    for chunk in 0..4 {
        let mut keys = Vec::new();
        let mut values = Vec::new();
        for i in 0..6 {
            let n = chunk * 6 + i;
            keys.push(if n % 11 == 0 { None } else { Some(n % 7) });
            values.push(if n % 5 == 0 { None } else { Some(n * 10) });
        }
        pages.push(key_value_page(keys, values));
    }
    pages
}

/// Per-key rows of (count, sum, avg); asserts each key appears exactly once
/// across the output pages.
fn grouped_rows(pages: &[Page]) -> HashMap<Option<i64>, (i64, Option<i64>, Option<f64>)> {
    let mut rows = HashMap::new();
    for page in pages {
        let keys = int64_column(page, 0);
        let counts = int64_column(page, 1);
        let sums = int64_column(page, 2);
        let avgs = page
            .column(3)
            .expect("avg column")
            .as_any()
            .downcast_ref::<Float64Array>()
            .expect("Float64 avg");
        for row in 0..page.num_rows() {
            let key = if keys.is_null(row) {
                None
            } else {
                Some(keys.value(row))
            };
            let sum = (!sums.is_null(row)).then(|| sums.value(row));
            let avg = (!avgs.is_null(row)).then(|| avgs.value(row));
            let previous = rows.insert(key, (counts.value(row), sum, avg));
            assert!(previous.is_none(), "group {key:?} emitted twice");
        }
    }
    rows
}

#[test]
fn spilled_single_step_matches_in_memory_reference() {
    let params = count_sum_avg_params();

    // One byte of headroom forces a run to disk after every input page.
    let profile = RuntimeProfile::new("query");
    let spill_factory =
        HashAggregationOperatorFactory::with_spill_thresholds(1, params.clone(), 1, 0)
            .expect("factory");
    let mut spill_op = spill_factory.create(1, 0).expect("operator");
    let state = spill_state("spill_query", Some(&profile));
    let spilled = drive_operator(
        spill_op.as_processor_mut().expect("processor"),
        &state,
        input_pages(),
    )
    .expect("spilling drive");

    let manager = state.spill_manager().expect("manager");
    let spill_profile = manager.profile().expect("spill profile");
    assert!(spill_profile.spill_file_count.value() >= 4);
    assert!(spill_profile.restore_rows.value() > 0);

    let reference_factory =
        HashAggregationOperatorFactory::new(2, params).expect("factory");
    let mut reference_op = reference_factory.create(1, 0).expect("operator");
    let reference_state = {
        let mut state = RuntimeState::new("reference_query");
        state.set_page_row_count(3);
        state
    };
    let expected = drive_operator(
        reference_op.as_processor_mut().expect("processor"),
        &reference_state,
        input_pages(),
    )
    .expect("reference drive");

    assert_eq!(grouped_rows(&spilled), grouped_rows(&expected));
}

fn intermediate_page(keys: Vec<i64>, counts: Vec<i64>, sums: Vec<i64>) -> Page {
    let schema = Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64, true),
        Field::new("c", DataType::Int64, true),
        Field::new("s", DataType::Int64, true),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(keys)) as ArrayRef,
            Arc::new(Int64Array::from(counts)) as ArrayRef,
            Arc::new(Int64Array::from(sums)) as ArrayRef,
        ],
    )
    .expect("intermediate batch");
    Page::new(batch)
}

#[test]
fn spilled_final_step_merges_intermediate_input() {
    let params = HashAggregationParams {
        group_by_types: vec![DataType::Int64],
        group_by_channels: vec![0],
        hash_channel: None,
        aggregators: vec![
            AggregatorSpec::count().with_input_channel(1),
            AggregatorSpec::new(AggFunction::Sum, Some(1), Some(DataType::Int64))
                .expect("sum spec")
                .with_input_channel(2),
        ],
        step: AggregationStep::Final,
        global_aggregation_group_ids: Vec::new(),
        group_id_channel: None,
        expected_groups: 16,
        max_partial_memory_bytes: 0,
    };
    let factory =
        HashAggregationOperatorFactory::with_spill_thresholds(3, params, 1, 0).expect("factory");
    let mut operator = factory.create(1, 0).expect("operator");
    let state = spill_state("final_spill_query", None);

    let inputs = vec![
        intermediate_page(vec![1, 2], vec![3, 5], vec![30, 50]),
        intermediate_page(vec![2, 3], vec![7, 11], vec![70, 110]),
    ];
    let outputs = drive_operator(
        operator.as_processor_mut().expect("processor"),
        &state,
        inputs,
    )
    .expect("drive");

    let mut totals: HashMap<i64, (i64, i64)> = HashMap::new();
    for page in &outputs {
        let keys = int64_column(page, 0);
        let counts = int64_column(page, 1);
        let sums = int64_column(page, 2);
        for row in 0..page.num_rows() {
            let previous =
                totals.insert(keys.value(row), (counts.value(row), sums.value(row)));
            assert!(previous.is_none(), "group {} emitted twice", keys.value(row));
        }
    }
    assert_eq!(totals.len(), 3);
    assert_eq!(totals[&1], (3, 30));
    assert_eq!(totals[&2], (12, 120));
    assert_eq!(totals[&3], (11, 110));
}

#[test]
fn spill_requires_a_manager_on_the_state() {
    init_test_config();
    let factory =
        HashAggregationOperatorFactory::with_spill_thresholds(4, count_sum_avg_params(), 1, 0)
            .expect("factory");
    let mut operator = factory.create(1, 0).expect("operator");
    let processor = operator.as_processor_mut().expect("processor");
    // A state without spill wiring cannot host a spillable aggregation.
    let state = RuntimeState::new("no_spill_manager");
    let err = processor
        .push_chunk(&state, key_value_page(vec![Some(1)], vec![Some(1)]))
        .expect_err("missing spill manager");
    assert!(err.contains("no spill manager"), "err={err}");
}
