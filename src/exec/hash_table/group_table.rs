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
//! Group-key hash table mapping serialized key rows to dense group ids.
//!
//! Responsibilities:
//! - Interns group keys in Arrow row format and assigns group ids in first-seen
//!   order, so accumulator state can live in plain per-group vectors.
//! - Remembers the hash of every group, either computed from the serialized row
//!   bytes or taken from a precomputed hash column.
//!
//! Key exported interfaces:
//! - Types: `GroupKeyTable`.
//!
//! Current limitations:
//! - Keys whose types Arrow `RowConverter` cannot serialize (nested types) are
//!   rejected at construction.

use arrow::array::ArrayRef;
use arrow::datatypes::DataType;
use arrow::row::{RowConverter, Rows, SortField};
use hashbrown::hash_map::DefaultHashBuilder;
use hashbrown::raw::RawTable;

use crate::exec::hash_table::hash::{hash_bytes_with_seed, seed_from_hasher};

#[derive(Clone, Copy, Debug)]
struct GroupEntry {
    group_id: usize,
    hash: u64,
}

pub struct GroupKeyTable {
    key_types: Vec<DataType>,
    converter: RowConverter,
    table: RawTable<GroupEntry>,
    group_rows: Rows,
    group_hashes: Vec<u64>,
    hash_seed: u64,
}

impl GroupKeyTable {
    /// `expected_groups` is a capacity hint; the table grows past it freely.
    pub fn new(key_types: Vec<DataType>, expected_groups: usize) -> Result<Self, String> {
        let seed = seed_from_hasher(&DefaultHashBuilder::default());
        Self::with_seed(key_types, expected_groups, seed)
    }

    /// Build a table with a fixed hash seed so separate tables assign the same
    /// hash to the same key, e.g. across spill-and-reset cycles of one builder.
    pub fn with_seed(
        key_types: Vec<DataType>,
        expected_groups: usize,
        hash_seed: u64,
    ) -> Result<Self, String> {
        let fields = key_types
            .iter()
            .cloned()
            .map(SortField::new)
            .collect::<Vec<_>>();
        let converter = RowConverter::new(fields)
            .map_err(|e| format!("unsupported group key types {:?}: {e}", key_types))?;
        let group_rows = converter.empty_rows(expected_groups, 0);
        Ok(Self {
            key_types,
            converter,
            table: RawTable::with_capacity(expected_groups),
            group_rows,
            group_hashes: Vec::with_capacity(expected_groups),
            hash_seed,
        })
    }

    pub fn key_types(&self) -> &[DataType] {
        &self.key_types
    }

    pub fn hash_seed(&self) -> u64 {
        self.hash_seed
    }

    pub fn num_groups(&self) -> usize {
        self.group_rows.num_rows()
    }

    pub fn group_hashes(&self) -> &[u64] {
        &self.group_hashes
    }

    /// Map each input row to its dense group id, interning unseen keys.
    ///
    /// `provided_hashes` carries precomputed group hashes (one per row) from an
    /// upstream stage; when absent, hashes are computed from the serialized row
    /// bytes with this table's seed.
    pub fn assign_group_ids(
        &mut self,
        key_columns: &[ArrayRef],
        provided_hashes: Option<&[u64]>,
        out: &mut Vec<usize>,
    ) -> Result<(), String> {
        if key_columns.len() != self.key_types.len() {
            return Err(format!(
                "group key column count mismatch: expected {}, got {}",
                self.key_types.len(),
                key_columns.len()
            ));
        }
        let probe_rows = self
            .converter
            .convert_columns(key_columns)
            .map_err(|e| format!("serialize group keys failed: {e}"))?;
        let num_rows = probe_rows.num_rows();
        if let Some(hashes) = provided_hashes {
            if hashes.len() != num_rows {
                return Err(format!(
                    "precomputed hash count mismatch: expected {}, got {}",
                    num_rows,
                    hashes.len()
                ));
            }
        }

        out.clear();
        out.reserve(num_rows);
        for row in 0..num_rows {
            let row_bytes = probe_rows.row(row).data();
            let hash = match provided_hashes {
                Some(hashes) => hashes[row],
                None => hash_bytes_with_seed(self.hash_seed, row_bytes),
            };
            let result = {
                let group_rows = &self.group_rows;
                self.table.find_or_find_insert_slot(
                    hash,
                    |entry| {
                        entry.hash == hash && group_rows.row(entry.group_id).data() == row_bytes
                    },
                    |entry| entry.hash,
                )
            };
            let group_id = match result {
                Ok(bucket) => unsafe { bucket.as_ref().group_id },
                Err(slot) => {
                    let group_id = self.group_rows.num_rows();
                    self.group_rows.push(probe_rows.row(row));
                    self.group_hashes.push(hash);
                    let entry = GroupEntry { group_id, hash };
                    unsafe {
                        self.table.insert_in_slot(hash, slot, entry);
                    }
                    group_id
                }
            };
            out.push(group_id);
        }
        Ok(())
    }

    /// Materialize key columns for the given group ids, in the given order.
    pub fn key_arrays_for(&self, group_ids: &[usize]) -> Result<Vec<ArrayRef>, String> {
        let num_groups = self.num_groups();
        for &id in group_ids {
            if id >= num_groups {
                return Err(format!(
                    "group id {} out of bounds (num_groups={})",
                    id, num_groups
                ));
            }
        }
        self.converter
            .convert_rows(group_ids.iter().map(|&id| self.group_rows.row(id)))
            .map_err(|e| format!("rebuild group key columns failed: {e}"))
    }

    pub fn estimated_bytes(&self) -> usize {
        self.group_rows
            .size()
            .saturating_add(self.converter.size())
            .saturating_add(self.table.capacity() * std::mem::size_of::<GroupEntry>())
            .saturating_add(self.group_hashes.capacity() * std::mem::size_of::<u64>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, Int64Array, StringArray};
    use std::sync::Arc;

    fn int_keys(values: Vec<Option<i64>>) -> Vec<ArrayRef> {
        vec![Arc::new(Int64Array::from(values)) as ArrayRef]
    }

    #[test]
    fn group_ids_are_dense_and_first_seen_ordered() {
        let mut table = GroupKeyTable::new(vec![DataType::Int64], 0).expect("table");
        let mut ids = Vec::new();
        table
            .assign_group_ids(
                &int_keys(vec![Some(7), Some(3), Some(7), None, Some(3), None]),
                None,
                &mut ids,
            )
            .expect("assign");
        assert_eq!(ids, vec![0, 1, 0, 2, 1, 2]);
        assert_eq!(table.num_groups(), 3);

        // Same keys on a later page resolve to the same ids.
        table
            .assign_group_ids(&int_keys(vec![None, Some(9), Some(7)]), None, &mut ids)
            .expect("assign");
        assert_eq!(ids, vec![2, 3, 0]);
        assert_eq!(table.num_groups(), 4);
    }

    #[test]
    fn multi_column_keys_distinguish_null_from_value() {
        let mut table =
            GroupKeyTable::new(vec![DataType::Utf8, DataType::Int64], 4).expect("table");
        let keys: Vec<ArrayRef> = vec![
            Arc::new(StringArray::from(vec![Some("a"), Some("a"), None])),
            Arc::new(Int64Array::from(vec![Some(1), None, Some(1)])),
        ];
        let mut ids = Vec::new();
        table.assign_group_ids(&keys, None, &mut ids).expect("assign");
        assert_eq!(ids, vec![0, 1, 2]);

        let arrays = table.key_arrays_for(&[0, 1, 2]).expect("key arrays");
        let names = arrays[0]
            .as_any()
            .downcast_ref::<StringArray>()
            .expect("utf8");
        assert_eq!(names.value(0), "a");
        assert!(names.is_null(2));
        let nums = arrays[1]
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("int64");
        assert_eq!(nums.value(0), 1);
        assert!(nums.is_null(1));
    }

    #[test]
    fn provided_hashes_become_group_hashes() {
        let mut table = GroupKeyTable::new(vec![DataType::Int64], 0).expect("table");
        let mut ids = Vec::new();
        table
            .assign_group_ids(
                &int_keys(vec![Some(1), Some(2), Some(1)]),
                Some(&[11, 22, 11]),
                &mut ids,
            )
            .expect("assign");
        assert_eq!(ids, vec![0, 1, 0]);
        assert_eq!(table.group_hashes(), &[11, 22]);
    }

    #[test]
    fn fixed_seed_gives_identical_hashes_across_tables() {
        let mut a = GroupKeyTable::with_seed(vec![DataType::Int64], 0, 42).expect("table");
        let mut b = GroupKeyTable::with_seed(vec![DataType::Int64], 0, 42).expect("table");
        let mut ids = Vec::new();
        a.assign_group_ids(&int_keys(vec![Some(5), Some(6)]), None, &mut ids)
            .expect("assign");
        b.assign_group_ids(&int_keys(vec![Some(6), Some(5)]), None, &mut ids)
            .expect("assign");
        assert_eq!(a.group_hashes()[0], b.group_hashes()[1]);
        assert_eq!(a.group_hashes()[1], b.group_hashes()[0]);
    }

    #[test]
    fn key_arrays_for_rejects_out_of_bounds() {
        let mut table = GroupKeyTable::new(vec![DataType::Int64], 0).expect("table");
        let mut ids = Vec::new();
        table
            .assign_group_ids(&int_keys(vec![Some(1)]), None, &mut ids)
            .expect("assign");
        let err = table.key_arrays_for(&[1]).expect_err("out of bounds");
        assert!(err.contains("out of bounds"), "err={}", err);
    }
}
