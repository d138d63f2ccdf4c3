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

//! Typed accessors over the app config.
//!
//! Every accessor falls back to a safe default when no config file was
//! loaded, so library embedders and tests work without one.

use crate::common::app_config;

pub fn log_level() -> String {
    app_config::config()
        .map(|c| c.log_level.clone())
        .unwrap_or_else(|_| "info".to_string())
}

pub fn log_filter() -> Option<String> {
    app_config::config().ok().and_then(|c| c.log_filter.clone())
}

pub fn page_row_count() -> usize {
    app_config::config()
        .map(|c| c.runtime.page_row_count)
        .unwrap_or(4096)
        .max(1)
}

pub fn spill_io_threads() -> usize {
    app_config::config()
        .map(|c| c.runtime.spill_io_threads)
        .unwrap_or(2)
        .max(1)
}

pub fn spill_io_queue_size() -> usize {
    app_config::config()
        .map(|c| c.runtime.spill_io_queue_size)
        .unwrap_or(64)
        .max(1)
}

pub fn spill_enable() -> bool {
    app_config::config().map(|c| c.spill.enable).unwrap_or(true)
}

pub fn spill_local_dirs() -> Vec<String> {
    let configured = app_config::config()
        .map(|c| c.spill.local_dirs.clone())
        .unwrap_or_default();
    if !configured.is_empty() {
        return configured;
    }
    let tmp = std::env::temp_dir().join("quartzite-spill");
    vec![tmp.to_string_lossy().to_string()]
}

pub fn spill_dir_max_bytes() -> u64 {
    app_config::config()
        .map(|c| c.spill.dir_max_bytes)
        .unwrap_or(17_179_869_184)
}

pub fn spill_run_max_bytes() -> u64 {
    app_config::config()
        .map(|c| c.spill.run_max_bytes)
        .unwrap_or(134_217_728)
}

pub fn spill_ipc_compression() -> String {
    app_config::config()
        .map(|c| c.spill.ipc_compression.clone())
        .unwrap_or_else(|_| "lz4".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_work_without_config_file() {
        assert!(page_row_count() >= 1);
        assert!(spill_io_threads() >= 1);
        assert!(!spill_local_dirs().is_empty());
        assert!(spill_run_max_bytes() > 0);
    }
}
