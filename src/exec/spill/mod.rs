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
//! Spill storage and I/O.
//!
//! Responsibilities:
//! - Writes hash-ordered aggregation runs to local run files as arrow IPC
//!   messages and streams them back for merging.
//! - Runs spill writes on a shared I/O thread pool so the driver thread can
//!   park on a dependency instead of blocking on disk.
//! - Carries per-query spill configuration and profile counters.
//!
//! Key exported interfaces:
//! - Types: `SpillConfig`, `QuerySpillManager`, `SpillProfile`,
//!   `Spiller`, `SpillerHandle`, `SpillFile`, `SpillStream`,
//!   `SpillChannelHandle`, `SpillIoExecutor`, `SpillTask`, `SpillCodec`.

pub mod dir_manager;
pub mod ipc_serde;
pub mod spill_channel;
pub mod spill_stream;
pub mod spiller;

use crate::runtime::profile::{CounterRef, CounterUnit, RuntimeProfile};

pub use ipc_serde::SpillCodec;
pub use spill_channel::{SpillChannelHandle, SpillIoExecutor, SpillTask};
pub use spill_stream::SpillStream;
pub use spiller::{SpillFile, SpillStorageConfig, Spiller, SpillerHandle};

/// Per-query spill settings resolved by the embedder.
#[derive(Clone, Debug)]
pub struct SpillConfig {
    pub enable_spill: bool,
    /// Encode level <= 0 disables IPC compression regardless of the
    /// configured codec; positive levels use the configured codec.
    pub spill_encode_level: Option<i32>,
}

impl SpillConfig {
    pub fn new(enable_spill: bool) -> Self {
        Self {
            enable_spill,
            spill_encode_level: None,
        }
    }

    pub fn with_encode_level(mut self, level: i32) -> Self {
        self.spill_encode_level = Some(level);
        self
    }
}

/// Shared per-query spill state: the submit channel and profile counters.
#[derive(Clone)]
pub struct QuerySpillManager {
    config: SpillConfig,
    channel: SpillChannelHandle,
    profile: Option<SpillProfile>,
}

impl QuerySpillManager {
    pub fn new(config: SpillConfig, profile: Option<&RuntimeProfile>) -> Self {
        let profile = profile.map(SpillProfile::new);
        Self {
            config,
            channel: SpillChannelHandle::new(),
            profile,
        }
    }

    pub fn config(&self) -> &SpillConfig {
        &self.config
    }

    pub fn channel(&self) -> SpillChannelHandle {
        self.channel.clone()
    }

    pub fn profile(&self) -> Option<SpillProfile> {
        self.profile.clone()
    }
}

#[derive(Clone, Debug)]
pub struct SpillProfile {
    pub spill_rows: CounterRef,
    pub spill_bytes: CounterRef,
    pub spill_time: CounterRef,
    pub restore_rows: CounterRef,
    pub restore_bytes: CounterRef,
    pub restore_time: CounterRef,
    pub spill_file_count: CounterRef,
}

impl SpillProfile {
    pub fn new(profile: &RuntimeProfile) -> Self {
        let profile = profile.child("Spill");
        Self {
            spill_rows: profile.add_counter("SpillRows", CounterUnit::Rows),
            spill_bytes: profile.add_counter("SpillBytes", CounterUnit::Bytes),
            spill_time: profile.add_timer("SpillTime"),
            restore_rows: profile.add_counter("RestoreRows", CounterUnit::Rows),
            restore_bytes: profile.add_counter("RestoreBytes", CounterUnit::Bytes),
            restore_time: profile.add_timer("RestoreTime"),
            spill_file_count: profile.add_counter("SpillFileCount", CounterUnit::Unit),
        }
    }
}
