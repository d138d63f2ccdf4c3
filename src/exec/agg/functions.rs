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
//! Grouped accumulator implementations for the built-in aggregate functions.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, Float64Array, Int64Array, StringArray, StructArray,
};

use crate::exec::agg::{GroupedAccumulator, avg_intermediate_fields};

fn as_int64<'a>(array: &'a ArrayRef, ctx: &str) -> Result<&'a Int64Array, String> {
    array
        .as_any()
        .downcast_ref::<Int64Array>()
        .ok_or_else(|| format!("{ctx} expects Int64 input, got {:?}", array.data_type()))
}

fn as_float64<'a>(array: &'a ArrayRef, ctx: &str) -> Result<&'a Float64Array, String> {
    array
        .as_any()
        .downcast_ref::<Float64Array>()
        .ok_or_else(|| format!("{ctx} expects Float64 input, got {:?}", array.data_type()))
}

fn as_utf8<'a>(array: &'a ArrayRef, ctx: &str) -> Result<&'a StringArray, String> {
    array
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| format!("{ctx} expects Utf8 input, got {:?}", array.data_type()))
}

fn as_struct<'a>(array: &'a ArrayRef, ctx: &str) -> Result<&'a StructArray, String> {
    array
        .as_any()
        .downcast_ref::<StructArray>()
        .ok_or_else(|| format!("{ctx} expects Struct input, got {:?}", array.data_type()))
}

fn check_rows(ctx: &str, group_ids: &[usize], input: &ArrayRef) -> Result<(), String> {
    if input.len() != group_ids.len() {
        return Err(format!(
            "{ctx} input row count mismatch: group_ids={} input_rows={}",
            group_ids.len(),
            input.len()
        ));
    }
    Ok(())
}

pub struct CountAccumulator {
    counts: Vec<i64>,
}

impl CountAccumulator {
    pub fn new() -> Self {
        Self { counts: Vec::new() }
    }

    fn ensure_size(&mut self, num_groups: usize) {
        if self.counts.len() < num_groups {
            self.counts.resize(num_groups, 0);
        }
    }
}

impl GroupedAccumulator for CountAccumulator {
    fn estimated_bytes(&self) -> usize {
        self.counts.capacity() * std::mem::size_of::<i64>()
    }

    fn update_batch(
        &mut self,
        num_groups: usize,
        group_ids: &[usize],
        input: Option<&ArrayRef>,
    ) -> Result<(), String> {
        self.ensure_size(num_groups);
        match input {
            None => {
                for &g in group_ids {
                    self.counts[g] += 1;
                }
            }
            Some(array) => {
                check_rows("count", group_ids, array)?;
                for (row, &g) in group_ids.iter().enumerate() {
                    if array.is_valid(row) {
                        self.counts[g] += 1;
                    }
                }
            }
        }
        Ok(())
    }

    fn merge_batch(
        &mut self,
        num_groups: usize,
        group_ids: &[usize],
        input: &ArrayRef,
    ) -> Result<(), String> {
        self.ensure_size(num_groups);
        check_rows("count merge", group_ids, input)?;
        let partial = as_int64(input, "count merge")?;
        for (row, &g) in group_ids.iter().enumerate() {
            if partial.is_valid(row) {
                self.counts[g] += partial.value(row);
            }
        }
        Ok(())
    }

    fn evaluate_intermediate(&self, group_ids: &[usize]) -> Result<ArrayRef, String> {
        self.evaluate_final(group_ids)
    }

    fn evaluate_final(&self, group_ids: &[usize]) -> Result<ArrayRef, String> {
        let values = group_ids
            .iter()
            .map(|&g| Some(self.counts.get(g).copied().unwrap_or(0)))
            .collect::<Int64Array>();
        Ok(Arc::new(values))
    }
}

pub struct SumInt64Accumulator {
    sums: Vec<i64>,
    seen: Vec<bool>,
}

impl SumInt64Accumulator {
    pub fn new() -> Self {
        Self {
            sums: Vec::new(),
            seen: Vec::new(),
        }
    }

    fn ensure_size(&mut self, num_groups: usize) {
        if self.sums.len() < num_groups {
            self.sums.resize(num_groups, 0);
            self.seen.resize(num_groups, false);
        }
    }

    fn add(&mut self, g: usize, value: i64) -> Result<(), String> {
        self.sums[g] = self.sums[g]
            .checked_add(value)
            .ok_or_else(|| "integer overflow in sum aggregation".to_string())?;
        self.seen[g] = true;
        Ok(())
    }
}

impl GroupedAccumulator for SumInt64Accumulator {
    fn estimated_bytes(&self) -> usize {
        self.sums.capacity() * std::mem::size_of::<i64>() + self.seen.capacity()
    }

    fn update_batch(
        &mut self,
        num_groups: usize,
        group_ids: &[usize],
        input: Option<&ArrayRef>,
    ) -> Result<(), String> {
        let array = input.ok_or_else(|| "sum requires an input column".to_string())?;
        self.ensure_size(num_groups);
        check_rows("sum", group_ids, array)?;
        let values = as_int64(array, "sum")?;
        for (row, &g) in group_ids.iter().enumerate() {
            if values.is_valid(row) {
                self.add(g, values.value(row))?;
            }
        }
        Ok(())
    }

    fn merge_batch(
        &mut self,
        num_groups: usize,
        group_ids: &[usize],
        input: &ArrayRef,
    ) -> Result<(), String> {
        self.update_batch(num_groups, group_ids, Some(input))
    }

    fn evaluate_intermediate(&self, group_ids: &[usize]) -> Result<ArrayRef, String> {
        self.evaluate_final(group_ids)
    }

    fn evaluate_final(&self, group_ids: &[usize]) -> Result<ArrayRef, String> {
        let values = group_ids
            .iter()
            .map(|&g| {
                self.seen
                    .get(g)
                    .copied()
                    .unwrap_or(false)
                    .then(|| self.sums[g])
            })
            .collect::<Int64Array>();
        Ok(Arc::new(values))
    }
}

pub struct SumFloat64Accumulator {
    sums: Vec<f64>,
    seen: Vec<bool>,
}

impl SumFloat64Accumulator {
    pub fn new() -> Self {
        Self {
            sums: Vec::new(),
            seen: Vec::new(),
        }
    }

    fn ensure_size(&mut self, num_groups: usize) {
        if self.sums.len() < num_groups {
            self.sums.resize(num_groups, 0.0);
            self.seen.resize(num_groups, false);
        }
    }
}

impl GroupedAccumulator for SumFloat64Accumulator {
    fn estimated_bytes(&self) -> usize {
        self.sums.capacity() * std::mem::size_of::<f64>() + self.seen.capacity()
    }

    fn update_batch(
        &mut self,
        num_groups: usize,
        group_ids: &[usize],
        input: Option<&ArrayRef>,
    ) -> Result<(), String> {
        let array = input.ok_or_else(|| "sum requires an input column".to_string())?;
        self.ensure_size(num_groups);
        check_rows("sum", group_ids, array)?;
        let values = as_float64(array, "sum")?;
        for (row, &g) in group_ids.iter().enumerate() {
            if values.is_valid(row) {
                self.sums[g] += values.value(row);
                self.seen[g] = true;
            }
        }
        Ok(())
    }

    fn merge_batch(
        &mut self,
        num_groups: usize,
        group_ids: &[usize],
        input: &ArrayRef,
    ) -> Result<(), String> {
        self.update_batch(num_groups, group_ids, Some(input))
    }

    fn evaluate_intermediate(&self, group_ids: &[usize]) -> Result<ArrayRef, String> {
        self.evaluate_final(group_ids)
    }

    fn evaluate_final(&self, group_ids: &[usize]) -> Result<ArrayRef, String> {
        let values = group_ids
            .iter()
            .map(|&g| {
                self.seen
                    .get(g)
                    .copied()
                    .unwrap_or(false)
                    .then(|| self.sums[g])
            })
            .collect::<Float64Array>();
        Ok(Arc::new(values))
    }
}

pub struct MinMaxInt64Accumulator {
    values: Vec<i64>,
    seen: Vec<bool>,
    prefer_min: bool,
}

impl MinMaxInt64Accumulator {
    pub fn new(prefer_min: bool) -> Self {
        Self {
            values: Vec::new(),
            seen: Vec::new(),
            prefer_min,
        }
    }

    fn ensure_size(&mut self, num_groups: usize) {
        if self.values.len() < num_groups {
            self.values.resize(num_groups, 0);
            self.seen.resize(num_groups, false);
        }
    }

    fn ctx(&self) -> &'static str {
        if self.prefer_min { "min" } else { "max" }
    }
}

impl GroupedAccumulator for MinMaxInt64Accumulator {
    fn estimated_bytes(&self) -> usize {
        self.values.capacity() * std::mem::size_of::<i64>() + self.seen.capacity()
    }

    fn update_batch(
        &mut self,
        num_groups: usize,
        group_ids: &[usize],
        input: Option<&ArrayRef>,
    ) -> Result<(), String> {
        let array = input.ok_or_else(|| format!("{} requires an input column", self.ctx()))?;
        self.ensure_size(num_groups);
        check_rows(self.ctx(), group_ids, array)?;
        let values = as_int64(array, self.ctx())?;
        for (row, &g) in group_ids.iter().enumerate() {
            if !values.is_valid(row) {
                continue;
            }
            let v = values.value(row);
            let better = !self.seen[g]
                || if self.prefer_min {
                    v < self.values[g]
                } else {
                    v > self.values[g]
                };
            if better {
                self.values[g] = v;
                self.seen[g] = true;
            }
        }
        Ok(())
    }

    fn merge_batch(
        &mut self,
        num_groups: usize,
        group_ids: &[usize],
        input: &ArrayRef,
    ) -> Result<(), String> {
        self.update_batch(num_groups, group_ids, Some(input))
    }

    fn evaluate_intermediate(&self, group_ids: &[usize]) -> Result<ArrayRef, String> {
        self.evaluate_final(group_ids)
    }

    fn evaluate_final(&self, group_ids: &[usize]) -> Result<ArrayRef, String> {
        let values = group_ids
            .iter()
            .map(|&g| {
                self.seen
                    .get(g)
                    .copied()
                    .unwrap_or(false)
                    .then(|| self.values[g])
            })
            .collect::<Int64Array>();
        Ok(Arc::new(values))
    }
}

pub struct MinMaxFloat64Accumulator {
    values: Vec<f64>,
    seen: Vec<bool>,
    prefer_min: bool,
}

impl MinMaxFloat64Accumulator {
    pub fn new(prefer_min: bool) -> Self {
        Self {
            values: Vec::new(),
            seen: Vec::new(),
            prefer_min,
        }
    }

    fn ensure_size(&mut self, num_groups: usize) {
        if self.values.len() < num_groups {
            self.values.resize(num_groups, 0.0);
            self.seen.resize(num_groups, false);
        }
    }

    fn ctx(&self) -> &'static str {
        if self.prefer_min { "min" } else { "max" }
    }
}

impl GroupedAccumulator for MinMaxFloat64Accumulator {
    fn estimated_bytes(&self) -> usize {
        self.values.capacity() * std::mem::size_of::<f64>() + self.seen.capacity()
    }

    fn update_batch(
        &mut self,
        num_groups: usize,
        group_ids: &[usize],
        input: Option<&ArrayRef>,
    ) -> Result<(), String> {
        let array = input.ok_or_else(|| format!("{} requires an input column", self.ctx()))?;
        self.ensure_size(num_groups);
        check_rows(self.ctx(), group_ids, array)?;
        let values = as_float64(array, self.ctx())?;
        for (row, &g) in group_ids.iter().enumerate() {
            if !values.is_valid(row) {
                continue;
            }
            let v = values.value(row);
            let better = !self.seen[g]
                || if self.prefer_min {
                    v < self.values[g]
                } else {
                    v > self.values[g]
                };
            if better {
                self.values[g] = v;
                self.seen[g] = true;
            }
        }
        Ok(())
    }

    fn merge_batch(
        &mut self,
        num_groups: usize,
        group_ids: &[usize],
        input: &ArrayRef,
    ) -> Result<(), String> {
        self.update_batch(num_groups, group_ids, Some(input))
    }

    fn evaluate_intermediate(&self, group_ids: &[usize]) -> Result<ArrayRef, String> {
        self.evaluate_final(group_ids)
    }

    fn evaluate_final(&self, group_ids: &[usize]) -> Result<ArrayRef, String> {
        let values = group_ids
            .iter()
            .map(|&g| {
                self.seen
                    .get(g)
                    .copied()
                    .unwrap_or(false)
                    .then(|| self.values[g])
            })
            .collect::<Float64Array>();
        Ok(Arc::new(values))
    }
}

pub struct MinMaxUtf8Accumulator {
    values: Vec<Option<String>>,
    prefer_min: bool,
}

impl MinMaxUtf8Accumulator {
    pub fn new(prefer_min: bool) -> Self {
        Self {
            values: Vec::new(),
            prefer_min,
        }
    }

    fn ensure_size(&mut self, num_groups: usize) {
        if self.values.len() < num_groups {
            self.values.resize(num_groups, None);
        }
    }

    fn ctx(&self) -> &'static str {
        if self.prefer_min { "min" } else { "max" }
    }
}

impl GroupedAccumulator for MinMaxUtf8Accumulator {
    fn estimated_bytes(&self) -> usize {
        let heap = self
            .values
            .iter()
            .map(|v| v.as_ref().map_or(0, |s| s.capacity()))
            .sum::<usize>();
        self.values.capacity() * std::mem::size_of::<Option<String>>() + heap
    }

    fn update_batch(
        &mut self,
        num_groups: usize,
        group_ids: &[usize],
        input: Option<&ArrayRef>,
    ) -> Result<(), String> {
        let array = input.ok_or_else(|| format!("{} requires an input column", self.ctx()))?;
        self.ensure_size(num_groups);
        check_rows(self.ctx(), group_ids, array)?;
        let values = as_utf8(array, self.ctx())?;
        for (row, &g) in group_ids.iter().enumerate() {
            if !values.is_valid(row) {
                continue;
            }
            let v = values.value(row);
            let better = match self.values[g].as_deref() {
                None => true,
                Some(cur) => {
                    if self.prefer_min {
                        v < cur
                    } else {
                        v > cur
                    }
                }
            };
            if better {
                self.values[g] = Some(v.to_string());
            }
        }
        Ok(())
    }

    fn merge_batch(
        &mut self,
        num_groups: usize,
        group_ids: &[usize],
        input: &ArrayRef,
    ) -> Result<(), String> {
        self.update_batch(num_groups, group_ids, Some(input))
    }

    fn evaluate_intermediate(&self, group_ids: &[usize]) -> Result<ArrayRef, String> {
        self.evaluate_final(group_ids)
    }

    fn evaluate_final(&self, group_ids: &[usize]) -> Result<ArrayRef, String> {
        let values = group_ids
            .iter()
            .map(|&g| self.values.get(g).and_then(|v| v.as_deref()))
            .collect::<StringArray>();
        Ok(Arc::new(values))
    }
}

#[derive(Clone, Copy, Debug)]
pub enum AvgInput {
    Int64,
    Float64,
}

pub struct AvgAccumulator {
    sums: Vec<f64>,
    counts: Vec<i64>,
    input: AvgInput,
}

impl AvgAccumulator {
    pub fn new(input: AvgInput) -> Self {
        Self {
            sums: Vec::new(),
            counts: Vec::new(),
            input,
        }
    }

    fn ensure_size(&mut self, num_groups: usize) {
        if self.sums.len() < num_groups {
            self.sums.resize(num_groups, 0.0);
            self.counts.resize(num_groups, 0);
        }
    }
}

impl GroupedAccumulator for AvgAccumulator {
    fn estimated_bytes(&self) -> usize {
        self.sums.capacity() * std::mem::size_of::<f64>()
            + self.counts.capacity() * std::mem::size_of::<i64>()
    }

    fn update_batch(
        &mut self,
        num_groups: usize,
        group_ids: &[usize],
        input: Option<&ArrayRef>,
    ) -> Result<(), String> {
        let array = input.ok_or_else(|| "avg requires an input column".to_string())?;
        self.ensure_size(num_groups);
        check_rows("avg", group_ids, array)?;
        match self.input {
            AvgInput::Int64 => {
                let values = as_int64(array, "avg")?;
                for (row, &g) in group_ids.iter().enumerate() {
                    if values.is_valid(row) {
                        self.sums[g] += values.value(row) as f64;
                        self.counts[g] += 1;
                    }
                }
            }
            AvgInput::Float64 => {
                let values = as_float64(array, "avg")?;
                for (row, &g) in group_ids.iter().enumerate() {
                    if values.is_valid(row) {
                        self.sums[g] += values.value(row);
                        self.counts[g] += 1;
                    }
                }
            }
        }
        Ok(())
    }

    fn merge_batch(
        &mut self,
        num_groups: usize,
        group_ids: &[usize],
        input: &ArrayRef,
    ) -> Result<(), String> {
        self.ensure_size(num_groups);
        check_rows("avg merge", group_ids, input)?;
        let states = as_struct(input, "avg merge")?;
        let sums = states
            .column_by_name("sum")
            .ok_or_else(|| "avg intermediate struct is missing the sum field".to_string())?;
        let counts = states
            .column_by_name("count")
            .ok_or_else(|| "avg intermediate struct is missing the count field".to_string())?;
        let sums = as_float64(sums, "avg merge sum")?;
        let counts = as_int64(counts, "avg merge count")?;
        for (row, &g) in group_ids.iter().enumerate() {
            if states.is_null(row) {
                continue;
            }
            if sums.is_valid(row) {
                self.sums[g] += sums.value(row);
            }
            if counts.is_valid(row) {
                self.counts[g] += counts.value(row);
            }
        }
        Ok(())
    }

    fn evaluate_intermediate(&self, group_ids: &[usize]) -> Result<ArrayRef, String> {
        let sums = group_ids
            .iter()
            .map(|&g| Some(self.sums.get(g).copied().unwrap_or(0.0)))
            .collect::<Float64Array>();
        let counts = group_ids
            .iter()
            .map(|&g| Some(self.counts.get(g).copied().unwrap_or(0)))
            .collect::<Int64Array>();
        let states = StructArray::try_new(
            avg_intermediate_fields(),
            vec![Arc::new(sums) as ArrayRef, Arc::new(counts) as ArrayRef],
            None,
        )
        .map_err(|e| format!("build avg intermediate struct failed: {e}"))?;
        Ok(Arc::new(states))
    }

    fn evaluate_final(&self, group_ids: &[usize]) -> Result<ArrayRef, String> {
        let values = group_ids
            .iter()
            .map(|&g| {
                let count = self.counts.get(g).copied().unwrap_or(0);
                (count > 0).then(|| self.sums[g] / count as f64)
            })
            .collect::<Float64Array>();
        Ok(Arc::new(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_input(values: Vec<Option<i64>>) -> ArrayRef {
        Arc::new(Int64Array::from(values))
    }

    fn float_input(values: Vec<Option<f64>>) -> ArrayRef {
        Arc::new(Float64Array::from(values))
    }

    #[test]
    fn count_star_counts_rows_and_count_column_skips_nulls() {
        let mut star = CountAccumulator::new();
        star.update_batch(2, &[0, 1, 0], None).expect("update");
        let out = star.evaluate_final(&[0, 1]).expect("final");
        let out = out.as_any().downcast_ref::<Int64Array>().expect("int64");
        assert_eq!(out.values(), &[2, 1]);

        let mut column = CountAccumulator::new();
        let input = int_input(vec![Some(1), None, Some(3)]);
        column
            .update_batch(2, &[0, 0, 1], Some(&input))
            .expect("update");
        let out = column.evaluate_final(&[0, 1]).expect("final");
        let out = out.as_any().downcast_ref::<Int64Array>().expect("int64");
        assert_eq!(out.values(), &[1, 1]);
    }

    #[test]
    fn count_merge_adds_partial_counts() {
        let mut acc = CountAccumulator::new();
        let partial = int_input(vec![Some(4), Some(2)]);
        acc.merge_batch(2, &[0, 1], &partial).expect("merge");
        acc.merge_batch(2, &[1, 0], &partial).expect("merge");
        let out = acc.evaluate_final(&[0, 1]).expect("final");
        let out = out.as_any().downcast_ref::<Int64Array>().expect("int64");
        assert_eq!(out.values(), &[6, 6]);
    }

    #[test]
    fn sum_int_is_null_until_a_value_arrives_and_checks_overflow() {
        let mut acc = SumInt64Accumulator::new();
        let input = int_input(vec![None, Some(5)]);
        acc.update_batch(2, &[0, 1], Some(&input)).expect("update");
        let out = acc.evaluate_final(&[0, 1]).expect("final");
        let out = out.as_any().downcast_ref::<Int64Array>().expect("int64");
        assert!(out.is_null(0));
        assert_eq!(out.value(1), 5);

        let big = int_input(vec![Some(i64::MAX), Some(1)]);
        let err = acc
            .update_batch(2, &[0, 0], Some(&big))
            .expect_err("overflow");
        assert!(err.contains("overflow"), "err={}", err);
    }

    #[test]
    fn min_max_pick_extremes_and_ignore_nulls() {
        let mut min = MinMaxInt64Accumulator::new(true);
        let mut max = MinMaxInt64Accumulator::new(false);
        let input = int_input(vec![Some(3), None, Some(-1), Some(7)]);
        min.update_batch(1, &[0, 0, 0, 0], Some(&input)).expect("min");
        max.update_batch(1, &[0, 0, 0, 0], Some(&input)).expect("max");
        let lo = min.evaluate_final(&[0]).expect("final");
        let hi = max.evaluate_final(&[0]).expect("final");
        assert_eq!(
            lo.as_any().downcast_ref::<Int64Array>().expect("i").value(0),
            -1
        );
        assert_eq!(
            hi.as_any().downcast_ref::<Int64Array>().expect("i").value(0),
            7
        );
    }

    #[test]
    fn utf8_min_max_compare_lexicographically() {
        let mut min = MinMaxUtf8Accumulator::new(true);
        let input: ArrayRef = Arc::new(StringArray::from(vec![
            Some("pear"),
            Some("apple"),
            None,
            Some("fig"),
        ]));
        min.update_batch(2, &[0, 0, 1, 1], Some(&input)).expect("min");
        let out = min.evaluate_final(&[0, 1]).expect("final");
        let out = out.as_any().downcast_ref::<StringArray>().expect("utf8");
        assert_eq!(out.value(0), "apple");
        assert_eq!(out.value(1), "fig");
    }

    #[test]
    fn avg_round_trips_through_intermediate_state() {
        let mut partial = AvgAccumulator::new(AvgInput::Float64);
        let input = float_input(vec![Some(1.0), Some(2.0), Some(6.0), None]);
        partial
            .update_batch(2, &[0, 0, 1, 1], Some(&input))
            .expect("update");
        let state = partial.evaluate_intermediate(&[0, 1]).expect("state");

        let mut merged = AvgAccumulator::new(AvgInput::Float64);
        merged.merge_batch(2, &[0, 1], &state).expect("merge");
        merged.merge_batch(2, &[0, 1], &state).expect("merge");
        let out = merged.evaluate_final(&[0, 1]).expect("final");
        let out = out.as_any().downcast_ref::<Float64Array>().expect("f64");
        assert_eq!(out.value(0), 1.5);
        assert_eq!(out.value(1), 6.0);
    }

    #[test]
    fn unseen_groups_evaluate_to_empty_input_results() {
        let count = CountAccumulator::new();
        let sum = SumInt64Accumulator::new();
        let avg = AvgAccumulator::new(AvgInput::Int64);

        let c = count.evaluate_final(&[0]).expect("count");
        assert_eq!(
            c.as_any().downcast_ref::<Int64Array>().expect("i").value(0),
            0
        );
        let s = sum.evaluate_final(&[0]).expect("sum");
        assert!(s.is_null(0));
        let a = avg.evaluate_final(&[0]).expect("avg");
        assert!(a.is_null(0));
    }
}
