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
//! Per-query execution context threaded through operator calls.
//!
//! Responsibilities:
//! - Carries the query memory tracker, spill wiring, and frequently used
//!   execution parameters (page row count).
//! - Passed by the driver into every push/pull/finish call so operators never
//!   cache ambient state behind the driver's back.
//!
//! Key exported interfaces:
//! - Types: `RuntimeState`.
//!
//! Current limitations:
//! - Holds only the parameters the aggregation pipeline consumes today; more
//!   execution-time state can migrate here over time.

use std::sync::Arc;

use crate::common::config;
use crate::exec::spill::{QuerySpillManager, SpillConfig};
use crate::runtime::mem_tracker::{self, MemTracker};

/// Per-query execution context shared by all operators of one pipeline.
#[derive(Clone)]
pub struct RuntimeState {
    page_row_count: Option<usize>,
    mem_tracker: Arc<MemTracker>,
    spill_config: Option<SpillConfig>,
    spill_manager: Option<Arc<QuerySpillManager>>,
}

impl RuntimeState {
    /// Create a state whose memory tracker is a child of the process tracker.
    pub fn new(query_label: impl Into<String>) -> Self {
        let process = mem_tracker::process_mem_tracker();
        Self::with_mem_tracker(MemTracker::new_child(query_label, &process))
    }

    /// Create a state around an externally owned memory tracker, e.g. one with
    /// a query-level limit.
    pub fn with_mem_tracker(mem_tracker: Arc<MemTracker>) -> Self {
        Self {
            page_row_count: None,
            mem_tracker,
            spill_config: None,
            spill_manager: None,
        }
    }

    pub fn set_page_row_count(&mut self, rows: usize) {
        self.page_row_count = Some(rows.max(1));
    }

    pub fn set_spill(&mut self, config: SpillConfig, manager: Arc<QuerySpillManager>) {
        self.spill_config = Some(config);
        self.spill_manager = Some(manager);
    }

    /// Maximum row count per produced output page.
    pub fn page_row_count(&self) -> usize {
        self.page_row_count
            .unwrap_or_else(config::page_row_count)
            .max(1)
    }

    pub fn mem_tracker(&self) -> Arc<MemTracker> {
        Arc::clone(&self.mem_tracker)
    }

    pub fn spill_config(&self) -> Option<&SpillConfig> {
        self.spill_config.as_ref()
    }

    pub fn spill_manager(&self) -> Option<Arc<QuerySpillManager>> {
        self.spill_manager.clone()
    }
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self::new("query_unknown")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_row_count_defaults_and_overrides() {
        let mut state = RuntimeState::new("test_query");
        assert_eq!(state.page_row_count(), 4096);
        state.set_page_row_count(7);
        assert_eq!(state.page_row_count(), 7);
        state.set_page_row_count(0);
        assert_eq!(state.page_row_count(), 1);
    }

    #[test]
    fn mem_tracker_is_child_of_process_tracker() {
        let state = RuntimeState::new("tracked_query");
        state.mem_tracker().consume(128);
        assert!(mem_tracker::process_mem_tracker().current() >= 128);
        state.mem_tracker().release(128);
    }
}
