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
//! Common utilities and helpers for integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use arrow::array::{Array, ArrayRef, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;

use quartzite::exec::page::Page;
use quartzite::exec::pipeline::operator::ProcessorOperator;
use quartzite::runtime::runtime_state::RuntimeState;

/// Two-column Int64 page (key, value), both nullable.
pub fn key_value_page(keys: Vec<Option<i64>>, values: Vec<Option<i64>>) -> Page {
    let schema = Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64, true),
        Field::new("v", DataType::Int64, true),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(keys)) as ArrayRef,
            Arc::new(Int64Array::from(values)) as ArrayRef,
        ],
    )
    .expect("key/value batch");
    Page::new(batch)
}

/// Two-column (Utf8 key, Int64 value) page, both nullable.
pub fn string_key_page(keys: Vec<Option<&str>>, values: Vec<Option<i64>>) -> Page {
    let schema = Arc::new(Schema::new(vec![
        Field::new("k", DataType::Utf8, true),
        Field::new("v", DataType::Int64, true),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(keys)) as ArrayRef,
            Arc::new(Int64Array::from(values)) as ArrayRef,
        ],
    )
    .expect("string key/value batch");
    Page::new(batch)
}

/// Block until the operator's dependency, if any, reports ready. Waits the
/// way a pipeline driver would: by registering an observer on the
/// dependency rather than polling.
pub fn wait_until_ready(operator: &dyn ProcessorOperator) {
    loop {
        let Some(dep) = operator.blocked_dependency() else {
            return;
        };
        if dep.is_ready() {
            return;
        }
        let (tx, rx) = mpsc::channel();
        dep.add_waiter(Arc::new(move || {
            let _ = tx.send(());
        }));
        rx.recv_timeout(Duration::from_secs(10))
            .expect("blocked operator dependency never became ready");
    }
}

/// Minimal driver loop: push every input page, finish, and drain all
/// output, honoring `need_input` and blocked dependencies throughout.
pub fn drive_operator(
    operator: &mut dyn ProcessorOperator,
    state: &RuntimeState,
    inputs: Vec<Page>,
) -> Result<Vec<Page>, String> {
    let mut outputs = Vec::new();
    for page in inputs {
        let mut spins = 0;
        loop {
            wait_until_ready(operator);
            if operator.need_input() {
                break;
            }
            if let Some(out) = operator.pull_chunk(state)? {
                outputs.push(out);
            }
            spins += 1;
            assert!(spins < 10_000, "operator never accepted input");
        }
        operator.push_chunk(state, page)?;
    }
    operator.set_finishing(state)?;
    let mut spins = 0;
    loop {
        wait_until_ready(operator);
        match operator.pull_chunk(state)? {
            Some(page) => outputs.push(page),
            None => {
                if operator.is_finished() {
                    break;
                }
                spins += 1;
                assert!(spins < 10_000, "operator never finished after finishing");
            }
        }
    }
    Ok(outputs)
}

/// Sum (count, sum) output pages into per-key totals. Expects columns in
/// the order key, count, sum; the same key may appear in several pages
/// (partial flushes), so rows accumulate.
pub fn count_sum_totals(pages: &[Page]) -> HashMap<Option<i64>, (i64, Option<i64>)> {
    let mut totals: HashMap<Option<i64>, (i64, Option<i64>)> = HashMap::new();
    for page in pages {
        let keys = int64_column(page, 0);
        let counts = int64_column(page, 1);
        let sums = int64_column(page, 2);
        for row in 0..page.num_rows() {
            let key = if keys.is_null(row) {
                None
            } else {
                Some(keys.value(row))
            };
            let entry = totals.entry(key).or_insert((0, None));
            entry.0 += counts.value(row);
            if !sums.is_null(row) {
                entry.1 = Some(entry.1.unwrap_or(0) + sums.value(row));
            }
        }
    }
    totals
}

pub fn int64_column(page: &Page, index: usize) -> &Int64Array {
    page.column(index)
        .expect("column")
        .as_any()
        .downcast_ref::<Int64Array>()
        .expect("Int64 column")
}
