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
//! Aggregate function specs and grouped accumulator contracts.
//!
//! Responsibilities:
//! - Declares the supported aggregate functions with their intermediate and
//!   final output types.
//! - Defines the per-group accumulator contract aggregation builders drive;
//!   state lives in dense vectors indexed by group id.
//!
//! Key exported interfaces:
//! - Types: `AggFunction`, `AggregatorSpec`, `GroupedAccumulator`.
//!
//! Current limitations:
//! - Raw input types are limited to Int64, Float64 and Utf8; unsupported
//!   combinations are rejected when an `AggregatorSpec` is constructed.

pub mod functions;

use arrow::array::ArrayRef;
use arrow::datatypes::{DataType, Field, Fields};

use crate::exec::agg::functions::{
    AvgAccumulator, AvgInput, CountAccumulator, MinMaxFloat64Accumulator, MinMaxInt64Accumulator,
    MinMaxUtf8Accumulator, SumFloat64Accumulator, SumInt64Accumulator,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggFunction {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

impl AggFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggFunction::Count => "count",
            AggFunction::Sum => "sum",
            AggFunction::Min => "min",
            AggFunction::Max => "max",
            AggFunction::Avg => "avg",
        }
    }
}

/// Fields of the avg intermediate struct: running sum and row count.
pub fn avg_intermediate_fields() -> Fields {
    Fields::from(vec![
        Field::new("sum", DataType::Float64, true),
        Field::new("count", DataType::Int64, true),
    ])
}

/// Plan-time description of one aggregation: the function, the channel it
/// reads in the operator's input pages, and the raw input type.
///
/// For a stage consuming intermediate state the channel points at the
/// intermediate column while `input_type` still names the raw type, which
/// determines the accumulator variant.
#[derive(Clone, Debug)]
pub struct AggregatorSpec {
    function: AggFunction,
    input_channel: Option<usize>,
    input_type: Option<DataType>,
}

impl AggregatorSpec {
    pub fn new(
        function: AggFunction,
        input_channel: Option<usize>,
        input_type: Option<DataType>,
    ) -> Result<Self, String> {
        match function {
            AggFunction::Count => {
                if input_channel.is_some() != input_type.is_some() {
                    return Err(
                        "count requires an input type exactly when it has an input column"
                            .to_string(),
                    );
                }
            }
            _ => {
                if input_channel.is_none() || input_type.is_none() {
                    return Err(format!(
                        "{} requires an input column and type",
                        function.as_str()
                    ));
                }
            }
        }
        let spec = Self {
            function,
            input_channel,
            input_type,
        };
        // Reject unsupported type combinations up front.
        spec.intermediate_type()?;
        Ok(spec)
    }

    /// `count(*)`: counts rows, reads no input column.
    pub fn count() -> Self {
        Self {
            function: AggFunction::Count,
            input_channel: None,
            input_type: None,
        }
    }

    pub fn function(&self) -> AggFunction {
        self.function
    }

    pub fn input_channel(&self) -> Option<usize> {
        self.input_channel
    }

    pub fn input_type(&self) -> Option<&DataType> {
        self.input_type.as_ref()
    }

    /// Spec with the same function and raw type but reading a different
    /// channel, e.g. when replaying spilled intermediate pages.
    pub fn with_input_channel(&self, channel: usize) -> Self {
        Self {
            function: self.function,
            input_channel: Some(channel),
            input_type: self.input_type.clone(),
        }
    }

    pub fn intermediate_type(&self) -> Result<DataType, String> {
        match (self.function, self.input_type.as_ref()) {
            (AggFunction::Count, _) => Ok(DataType::Int64),
            (AggFunction::Sum, Some(DataType::Int64)) => Ok(DataType::Int64),
            (AggFunction::Sum, Some(DataType::Float64)) => Ok(DataType::Float64),
            (AggFunction::Min | AggFunction::Max, Some(t))
                if matches!(t, DataType::Int64 | DataType::Float64 | DataType::Utf8) =>
            {
                Ok(t.clone())
            }
            (AggFunction::Avg, Some(DataType::Int64 | DataType::Float64)) => {
                Ok(DataType::Struct(avg_intermediate_fields()))
            }
            (function, input_type) => Err(format!(
                "{} is not supported for input type {:?}",
                function.as_str(),
                input_type
            )),
        }
    }

    pub fn final_type(&self) -> Result<DataType, String> {
        match self.function {
            AggFunction::Avg => {
                // Validate the input combination even though the result type
                // does not depend on it.
                self.intermediate_type()?;
                Ok(DataType::Float64)
            }
            _ => self.intermediate_type(),
        }
    }

    pub fn create_grouped_accumulator(&self) -> Result<Box<dyn GroupedAccumulator>, String> {
        match (self.function, self.input_type.as_ref()) {
            (AggFunction::Count, _) => Ok(Box::new(CountAccumulator::new())),
            (AggFunction::Sum, Some(DataType::Int64)) => Ok(Box::new(SumInt64Accumulator::new())),
            (AggFunction::Sum, Some(DataType::Float64)) => {
                Ok(Box::new(SumFloat64Accumulator::new()))
            }
            (AggFunction::Min, Some(DataType::Int64)) => {
                Ok(Box::new(MinMaxInt64Accumulator::new(true)))
            }
            (AggFunction::Max, Some(DataType::Int64)) => {
                Ok(Box::new(MinMaxInt64Accumulator::new(false)))
            }
            (AggFunction::Min, Some(DataType::Float64)) => {
                Ok(Box::new(MinMaxFloat64Accumulator::new(true)))
            }
            (AggFunction::Max, Some(DataType::Float64)) => {
                Ok(Box::new(MinMaxFloat64Accumulator::new(false)))
            }
            (AggFunction::Min, Some(DataType::Utf8)) => {
                Ok(Box::new(MinMaxUtf8Accumulator::new(true)))
            }
            (AggFunction::Max, Some(DataType::Utf8)) => {
                Ok(Box::new(MinMaxUtf8Accumulator::new(false)))
            }
            (AggFunction::Avg, Some(DataType::Int64)) => {
                Ok(Box::new(AvgAccumulator::new(AvgInput::Int64)))
            }
            (AggFunction::Avg, Some(DataType::Float64)) => {
                Ok(Box::new(AvgAccumulator::new(AvgInput::Float64)))
            }
            (function, input_type) => Err(format!(
                "{} is not supported for input type {:?}",
                function.as_str(),
                input_type
            )),
        }
    }
}

/// Per-group aggregate state addressed by dense group ids.
///
/// `update_batch` consumes raw input values, `merge_batch` consumes
/// intermediate state from an earlier aggregation stage. Group ids never seen
/// by either call evaluate to the function's empty-input result (0 for count,
/// null otherwise).
pub trait GroupedAccumulator: Send {
    fn estimated_bytes(&self) -> usize;

    fn update_batch(
        &mut self,
        num_groups: usize,
        group_ids: &[usize],
        input: Option<&ArrayRef>,
    ) -> Result<(), String>;

    fn merge_batch(
        &mut self,
        num_groups: usize,
        group_ids: &[usize],
        input: &ArrayRef,
    ) -> Result<(), String>;

    /// Intermediate state column for the given group ids, in the given order.
    fn evaluate_intermediate(&self, group_ids: &[usize]) -> Result<ArrayRef, String>;

    /// Final value column for the given group ids, in the given order.
    fn evaluate_final(&self, group_ids: &[usize]) -> Result<ArrayRef, String>;
}
