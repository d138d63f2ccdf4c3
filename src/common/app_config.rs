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
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<QuartziteConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static QuartziteConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = path.as_ref().to_path_buf();
    let cfg = QuartziteConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn init_from_env_or_default() -> Result<&'static QuartziteConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = config_path_from_env_or_default()?;
    let cfg = QuartziteConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn config() -> Result<&'static QuartziteConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("QUARTZITE_CONFIG") {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }

    let candidates = [PathBuf::from("quartzite.toml")];
    for p in candidates {
        if p.exists() {
            return Ok(p);
        }
    }

    Err(anyhow!(
        "missing config file: set $QUARTZITE_CONFIG or create ./quartzite.toml"
    ))
}

#[derive(Clone, Deserialize)]
pub struct QuartziteConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    /// Example: "quartzite=debug"
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub spill: SpillStorageSection,
}

impl QuartziteConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        let cfg: QuartziteConfig =
            toml::from_str(&s).with_context(|| format!("parse toml: {}", path.display()))?;
        Ok(cfg)
    }
}

impl Default for QuartziteConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            runtime: RuntimeConfig::default(),
            spill: SpillStorageSection::default(),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_page_row_count")]
    pub page_row_count: usize,
    #[serde(default = "default_spill_io_threads")]
    pub spill_io_threads: usize,
    #[serde(default = "default_spill_io_queue_size")]
    pub spill_io_queue_size: usize,
}

fn default_page_row_count() -> usize {
    4096
}
fn default_spill_io_threads() -> usize {
    2
}
fn default_spill_io_queue_size() -> usize {
    64
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            page_row_count: default_page_row_count(),
            spill_io_threads: default_spill_io_threads(),
            spill_io_queue_size: default_spill_io_queue_size(),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct SpillStorageSection {
    #[serde(default = "default_spill_enable")]
    pub enable: bool,
    #[serde(default)]
    pub local_dirs: Vec<String>,
    #[serde(default = "default_spill_dir_max_bytes")]
    pub dir_max_bytes: u64,
    #[serde(default = "default_spill_run_max_bytes")]
    pub run_max_bytes: u64,
    #[serde(default = "default_spill_ipc_compression")]
    pub ipc_compression: String,
}

fn default_spill_enable() -> bool {
    true
}
fn default_spill_dir_max_bytes() -> u64 {
    // 16 GiB per spill directory.
    17_179_869_184
}
fn default_spill_run_max_bytes() -> u64 {
    // 128 MiB per run file.
    134_217_728
}
fn default_spill_ipc_compression() -> String {
    "lz4".to_string()
}

impl Default for SpillStorageSection {
    fn default() -> Self {
        Self {
            enable: default_spill_enable(),
            local_dirs: Vec::new(),
            dir_max_bytes: default_spill_dir_max_bytes(),
            run_max_bytes: default_spill_run_max_bytes(),
            ipc_compression: default_spill_ipc_compression(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let cfg: QuartziteConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.runtime.page_row_count, 4096);
        assert!(cfg.spill.enable);
        assert_eq!(cfg.spill.ipc_compression, "lz4");
    }

    #[test]
    fn parse_spill_section() {
        let cfg: QuartziteConfig = toml::from_str(
            r#"
            log_level = "debug"

            [spill]
            enable = false
            local_dirs = ["/tmp/a", "/tmp/b"]
            run_max_bytes = 1048576
            ipc_compression = "zstd"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert!(!cfg.spill.enable);
        assert_eq!(cfg.spill.local_dirs.len(), 2);
        assert_eq!(cfg.spill.run_max_bytes, 1_048_576);
        assert_eq!(cfg.spill.ipc_compression, "zstd");
    }
}
