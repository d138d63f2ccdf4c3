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
//! Run-file writer for spilled aggregation state.
//!
//! A run file is a header followed by length-prefixed arrow IPC messages:
//!
//! ```text
//! magic "QZSP" | version u16 | header_len u16 | codec u8 | pad [u8;3]
//! num_messages u32 | num_rows u64 | schema_hash u64        (32 bytes total)
//! repeated: message_len u32 | ipc message bytes
//! ```
//!
//! The header is written twice: a placeholder up front, then the final
//! counts once every message has been appended. Files are written once and
//! read back sequentially.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arrow::datatypes::SchemaRef;

use crate::common::config;
use crate::exec::page::Page;
use crate::exec::spill::dir_manager::DirManager;
use crate::exec::spill::ipc_serde::{IpcSerde, SpillCodec, resolve_codec, schema_hash};
use crate::exec::spill::spill_stream::SpillStream;
use crate::quartzite_logging::warn;

const RUN_MAGIC: [u8; 4] = *b"QZSP";
const RUN_VERSION: u16 = 1;
pub(crate) const RUN_HEADER_LEN: u16 = 32;

#[derive(Debug, Clone)]
pub(crate) struct RunFileHeader {
    pub codec: SpillCodec,
    pub num_messages: u32,
    pub num_rows: u64,
    pub schema_hash: u64,
}

impl RunFileHeader {
    fn new(codec: SpillCodec, schema_hash: u64) -> Self {
        Self {
            codec,
            num_messages: 0,
            num_rows: 0,
            schema_hash,
        }
    }

    pub(crate) fn to_bytes(&self) -> [u8; RUN_HEADER_LEN as usize] {
        let mut buf = [0u8; RUN_HEADER_LEN as usize];
        buf[..4].copy_from_slice(&RUN_MAGIC);
        buf[4..6].copy_from_slice(&RUN_VERSION.to_le_bytes());
        buf[6..8].copy_from_slice(&RUN_HEADER_LEN.to_le_bytes());
        buf[8] = self.codec.as_u8();
        buf[12..16].copy_from_slice(&self.num_messages.to_le_bytes());
        buf[16..24].copy_from_slice(&self.num_rows.to_le_bytes());
        buf[24..32].copy_from_slice(&self.schema_hash.to_le_bytes());
        buf
    }

    pub(crate) fn from_bytes(buf: &[u8]) -> Result<Self, String> {
        if buf.len() < RUN_HEADER_LEN as usize {
            return Err("spill run header is too small".to_string());
        }
        if buf[..4] != RUN_MAGIC {
            return Err("spill run header magic mismatch".to_string());
        }
        let version = u16::from_le_bytes(buf[4..6].try_into().unwrap());
        if version != RUN_VERSION {
            return Err(format!("unsupported spill run version: {version}"));
        }
        let header_len = u16::from_le_bytes(buf[6..8].try_into().unwrap());
        if header_len != RUN_HEADER_LEN {
            return Err(format!("unsupported spill run header length: {header_len}"));
        }
        let codec = SpillCodec::try_from(buf[8])?;
        if buf[9..12] != [0, 0, 0] {
            return Err("spill run header padding must be zero".to_string());
        }
        Ok(Self {
            codec,
            num_messages: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            num_rows: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            schema_hash: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
        })
    }
}

/// Where run files may live and how they are encoded, resolved once from the
/// app config.
#[derive(Debug, Clone)]
pub struct SpillStorageConfig {
    pub local_dirs: Vec<PathBuf>,
    pub dir_max_bytes: u64,
    pub run_max_bytes: u64,
    pub ipc_compression: SpillCodec,
}

impl SpillStorageConfig {
    pub fn from_app_config() -> Result<Self, String> {
        if !config::spill_enable() {
            return Err("spill storage is disabled in config".to_string());
        }
        let local_dirs = config::spill_local_dirs()
            .into_iter()
            .map(PathBuf::from)
            .collect::<Vec<_>>();
        let ipc_compression = SpillCodec::from_str(&config::spill_ipc_compression())?;
        Ok(Self {
            local_dirs,
            dir_max_bytes: config::spill_dir_max_bytes(),
            run_max_bytes: config::spill_run_max_bytes(),
            ipc_compression,
        })
    }
}

/// A finished run file. `dir_index` and `bytes` feed the directory budget
/// release when the file is removed.
#[derive(Debug, Clone)]
pub struct SpillFile {
    pub path: PathBuf,
    pub dir_index: usize,
    pub bytes: u64,
    pub num_pages: u32,
    pub num_rows: u64,
}

/// Writes and removes run files; shared by the builder and its async write
/// tasks.
#[derive(Debug)]
pub struct Spiller {
    dir_manager: Arc<DirManager>,
    ipc: IpcSerde,
    run_max_bytes: u64,
    next_id: AtomicU64,
    pid: u32,
}

pub type SpillerHandle = Arc<Spiller>;

impl Spiller {
    pub fn new_with_storage(storage: SpillStorageConfig, codec: SpillCodec) -> Result<Self, String> {
        let dir_manager = Arc::new(DirManager::new(storage.local_dirs, storage.dir_max_bytes)?);
        Ok(Self {
            dir_manager,
            ipc: IpcSerde::new(codec)?,
            run_max_bytes: storage.run_max_bytes,
            next_id: AtomicU64::new(0),
            pid: std::process::id(),
        })
    }

    pub fn new_from_config(spill_encode_level: Option<i32>) -> Result<Self, String> {
        let storage = SpillStorageConfig::from_app_config()?;
        let codec = resolve_codec(storage.ipc_compression, spill_encode_level);
        Self::new_with_storage(storage, codec)
    }

    /// Write `pages` as one run file. Pages must already be in the run's
    /// hash order; the file preserves page order exactly.
    pub fn write_run(&self, schema: SchemaRef, pages: &[Page]) -> Result<SpillFile, String> {
        let (dir_index, path, mut file) = self.create_run_file()?;

        let mut header = RunFileHeader::new(self.ipc.codec(), schema_hash(schema.as_ref()));
        let mut total_bytes = RUN_HEADER_LEN as u64;
        let mut num_rows = 0u64;

        let result: Result<(), String> = (|| {
            file.write_all(&header.to_bytes())
                .map_err(|e| format!("write spill run header failed: {e}"))?;
            for page in pages {
                let encoded = self.ipc.encode_record_batch(&page.batch)?;
                total_bytes = total_bytes
                    .checked_add(4 + encoded.bytes.len() as u64)
                    .ok_or_else(|| "spill run size overflow".to_string())?;
                if self.run_max_bytes > 0 && total_bytes > self.run_max_bytes {
                    return Err(format!(
                        "spill run size exceeded configured limit of {} bytes",
                        self.run_max_bytes
                    ));
                }
                let message_len = u32::try_from(encoded.bytes.len())
                    .map_err(|_| "spill run message length overflows u32".to_string())?;
                file.write_all(&message_len.to_le_bytes())
                    .map_err(|e| format!("write spill message length failed: {e}"))?;
                file.write_all(&encoded.bytes)
                    .map_err(|e| format!("write spill message failed: {e}"))?;
                header.num_messages += 1;
                num_rows += encoded.num_rows as u64;
            }
            header.num_rows = num_rows;
            file.seek(SeekFrom::Start(0))
                .map_err(|e| format!("seek spill run header failed: {e}"))?;
            file.write_all(&header.to_bytes())
                .map_err(|e| format!("rewrite spill run header failed: {e}"))?;
            file.flush()
                .map_err(|e| format!("flush spill run file failed: {e}"))?;
            self.dir_manager.charge(dir_index, total_bytes)
        })();
        if let Err(err) = result {
            remove_run_file(&path);
            return Err(err);
        }

        Ok(SpillFile {
            path,
            dir_index,
            bytes: total_bytes,
            num_pages: header.num_messages,
            num_rows,
        })
    }

    pub fn open_stream(&self, schema: SchemaRef, file: &SpillFile) -> Result<SpillStream, String> {
        SpillStream::open(&file.path, schema)
    }

    /// Delete the run file and return its bytes to the directory budget.
    pub fn remove_file(&self, file: &SpillFile) {
        remove_run_file(&file.path);
        self.dir_manager.release(file.dir_index, file.bytes);
    }

    fn create_run_file(&self) -> Result<(usize, PathBuf, File), String> {
        let mut attempts = 0;
        loop {
            let (dir_index, dir) = self.dir_manager.pick_dir();
            let id = self.next_id.fetch_add(1, Ordering::AcqRel);
            let path = dir.join(format!("spill_{:x}_{:x}.ipc", self.pid, id));
            match OpenOptions::new()
                .create_new(true)
                .read(true)
                .write(true)
                .open(&path)
            {
                Ok(file) => return Ok((dir_index, path, file)),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists && attempts < 3 => {
                    attempts += 1;
                    continue;
                }
                Err(err) => {
                    return Err(format!("create spill run file {} failed: {err}", path.display()));
                }
            }
        }
    }
}

fn remove_run_file(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        warn!(
            "remove spill run file failed: path={} error={}",
            path.display(),
            err
        );
    }
}
