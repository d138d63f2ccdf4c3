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
//! Default output rows for grouping-set aggregations over an empty input.

use std::sync::Arc;

use arrow::array::{ArrayRef, Int64Array, UInt64Array, new_null_array};

use crate::exec::operators::aggregate::{HashAggregationConfig, NULL_GROUP_HASH};
use crate::exec::page::Page;

/// One default row per global aggregation group id: null group keys except
/// the group-id channel, the null-hash sentinel in the hash channel, and each
/// aggregate's empty-input result. `Ok(None)` when the id set is empty.
pub(crate) fn build_global_aggregation_output(
    config: &HashAggregationConfig,
) -> Result<Option<Page>, String> {
    let ids = config.global_aggregation_group_ids();
    if ids.is_empty() {
        return Ok(None);
    }
    let rows = ids.len();
    let schema = config.output_schema();
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());
    for (i, data_type) in config.group_by_types().iter().enumerate() {
        if config.group_id_channel() == Some(i) {
            columns.push(Arc::new(Int64Array::from(ids.to_vec())));
        } else {
            columns.push(new_null_array(data_type, rows));
        }
    }
    if config.hash_channel().is_some() {
        columns.push(Arc::new(UInt64Array::from(vec![NULL_GROUP_HASH; rows])));
    }
    // Group id 0 of a fresh accumulator has seen no input, which is exactly
    // the value every default row carries.
    let zero_rows = vec![0usize; rows];
    for spec in config.aggregators() {
        let accumulator = spec.create_grouped_accumulator()?;
        columns.push(accumulator.evaluate_final(&zero_rows)?);
    }
    Page::try_from_arrays(schema, columns).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::agg::{AggFunction, AggregatorSpec};
    use crate::exec::operators::aggregate::{AggregationStep, HashAggregationParams};
    use arrow::array::{Array, StringArray};
    use arrow::datatypes::DataType;

    fn config(global_ids: Vec<i64>, group_id_channel: Option<usize>) -> HashAggregationConfig {
        let params = HashAggregationParams {
            group_by_types: vec![DataType::Utf8, DataType::Int64],
            group_by_channels: vec![0, 1],
            hash_channel: Some(2),
            aggregators: vec![
                AggregatorSpec::count(),
                AggregatorSpec::new(AggFunction::Sum, Some(3), Some(DataType::Int64))
                    .expect("sum spec"),
            ],
            step: AggregationStep::Final,
            global_aggregation_group_ids: global_ids,
            group_id_channel,
            expected_groups: 4,
            max_partial_memory_bytes: 0,
        };
        HashAggregationConfig::try_new(params, 0, 0).expect("config")
    }

    #[test]
    fn empty_id_set_produces_nothing() {
        let config = config(Vec::new(), None);
        assert!(
            build_global_aggregation_output(&config)
                .expect("build")
                .is_none()
        );
    }

    #[test]
    fn one_default_row_per_group_id() {
        let config = config(vec![0, 3], Some(1));
        let page = build_global_aggregation_output(&config)
            .expect("build")
            .expect("page");
        assert_eq!(page.num_rows(), 2);
        assert_eq!(page.schema(), config.output_schema());

        let names = page.column(0).expect("names");
        let names = names.as_any().downcast_ref::<StringArray>().expect("utf8");
        assert!(names.is_null(0) && names.is_null(1));

        let group_ids = page.column(1).expect("group ids");
        let group_ids = group_ids
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("int64");
        assert_eq!(group_ids.values(), &[0, 3]);

        let hashes = page.column(2).expect("hashes");
        let hashes = hashes
            .as_any()
            .downcast_ref::<UInt64Array>()
            .expect("uint64");
        assert_eq!(hashes.values(), &[NULL_GROUP_HASH, NULL_GROUP_HASH]);

        let counts = page.column(3).expect("counts");
        let counts = counts.as_any().downcast_ref::<Int64Array>().expect("int64");
        assert_eq!(counts.values(), &[0, 0]);

        let sums = page.column(4).expect("sums");
        assert!(sums.is_null(0) && sums.is_null(1));
    }

    #[test]
    fn without_a_group_id_channel_every_key_is_null() {
        let config = config(vec![7], None);
        let page = build_global_aggregation_output(&config)
            .expect("build")
            .expect("page");
        assert_eq!(page.num_rows(), 1);
        assert!(page.column(0).expect("col 0").is_null(0));
        assert!(page.column(1).expect("col 1").is_null(0));
    }
}
