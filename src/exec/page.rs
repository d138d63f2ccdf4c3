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
//! Column-oriented data pages flowing between operators.
//!
//! Responsibilities:
//! - Wraps Arrow `RecordBatch` with positional column access and a memory
//!   estimate that de-duplicates shared buffers.
//!
//! Key exported interfaces:
//! - Types: `Page`.
//! - Functions: `record_batch_bytes`.

use std::collections::HashSet;

use arrow::array::{Array, ArrayRef, RecordBatch};
use arrow::buffer::Buffer;
use arrow::datatypes::SchemaRef;

/// A page of data, consisting of multiple rows in columnar layout.
#[derive(Debug, Clone)]
pub struct Page {
    pub batch: RecordBatch,
}

impl Page {
    pub fn new(batch: RecordBatch) -> Self {
        Self { batch }
    }

    pub fn try_from_arrays(schema: SchemaRef, columns: Vec<ArrayRef>) -> Result<Self, String> {
        let batch = RecordBatch::try_new(schema, columns)
            .map_err(|e| format!("build page from arrays failed: {e}"))?;
        Ok(Self { batch })
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.num_rows() == 0
    }

    pub fn columns(&self) -> &[ArrayRef] {
        self.batch.columns()
    }

    pub fn column(&self, index: usize) -> Result<&ArrayRef, String> {
        self.batch.columns().get(index).ok_or_else(|| {
            format!(
                "column index {} out of range for page with {} columns",
                index,
                self.batch.num_columns()
            )
        })
    }

    /// Zero-copy view of `length` rows starting at `offset`.
    pub fn slice(&self, offset: usize, length: usize) -> Page {
        Page {
            batch: self.batch.slice(offset, length),
        }
    }

    pub fn estimated_bytes(&self) -> usize {
        record_batch_bytes(&self.batch)
    }
}

/// Estimate RecordBatch size by summing unique buffers inside the batch.
///
/// Buffers are de-duplicated only within a single RecordBatch; buffers shared
/// across batches (e.g. slices or dictionaries) are double-counted.
pub fn record_batch_bytes(batch: &RecordBatch) -> usize {
    let mut seen = HashSet::new();
    let mut total = 0usize;
    for column in batch.columns() {
        total = total.saturating_add(array_data_bytes(&column.to_data(), &mut seen));
    }
    total
}

fn array_data_bytes(data: &arrow::array::ArrayData, seen: &mut HashSet<usize>) -> usize {
    let mut total = 0usize;
    for buffer in data.buffers() {
        total = total.saturating_add(buffer_bytes(buffer, seen));
    }
    if let Some(nulls) = data.nulls() {
        total = total.saturating_add(buffer_bytes(nulls.buffer(), seen));
    }
    for child in data.child_data() {
        total = total.saturating_add(array_data_bytes(child, seen));
    }
    total
}

fn buffer_bytes(buffer: &Buffer, seen: &mut HashSet<usize>) -> usize {
    let ptr = buffer.data_ptr().as_ptr() as usize;
    if !seen.insert(ptr) {
        return 0;
    }
    buffer.capacity().max(buffer.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    #[test]
    fn column_access_reports_out_of_range() {
        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int64, true)]));
        let batch = RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![1, 2]))])
            .expect("record batch");
        let page = Page::new(batch);
        assert_eq!(page.num_rows(), 2);
        assert!(page.column(0).is_ok());
        let err = page.column(1).expect_err("expected out of range");
        assert!(err.contains("out of range"), "err={}", err);
    }

    #[test]
    fn shared_buffers_are_counted_once() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int64, true),
            Field::new("b", DataType::Int64, true),
        ]));
        let column: ArrayRef = Arc::new(Int64Array::from(vec![1, 2, 3, 4]));
        let batch = RecordBatch::try_new(schema, vec![Arc::clone(&column), column])
            .expect("record batch");
        let single = {
            let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int64, true)]));
            let column: ArrayRef = Arc::new(Int64Array::from(vec![1, 2, 3, 4]));
            RecordBatch::try_new(schema, vec![column]).expect("record batch")
        };
        assert_eq!(record_batch_bytes(&batch), record_batch_bytes(&single));
    }
}
