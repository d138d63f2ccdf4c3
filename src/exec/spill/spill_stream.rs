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
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;

use crate::exec::spill::ipc_serde::{IpcSerde, schema_hash};
use crate::exec::spill::spiller::{RUN_HEADER_LEN, RunFileHeader};

/// Sequential reader over one spill run file.
///
/// Run files are consumed start to finish exactly once during the merge;
/// there is no random access.
#[derive(Debug)]
pub struct SpillStream {
    reader: BufReader<File>,
    schema: SchemaRef,
    remaining_messages: u32,
    ipc: IpcSerde,
}

impl SpillStream {
    pub fn open(path: impl AsRef<Path>, schema: SchemaRef) -> Result<Self, String> {
        let file = File::open(path.as_ref())
            .map_err(|e| format!("open spill run file {} failed: {e}", path.as_ref().display()))?;
        let mut reader = BufReader::new(file);
        let mut buf = [0u8; RUN_HEADER_LEN as usize];
        reader
            .read_exact(&mut buf)
            .map_err(|e| format!("read spill run header failed: {e}"))?;
        let header = RunFileHeader::from_bytes(&buf)?;
        if header.schema_hash != schema_hash(schema.as_ref()) {
            return Err("spill run schema hash mismatch".to_string());
        }
        let ipc = IpcSerde::new(header.codec)?;
        Ok(Self {
            reader,
            schema,
            remaining_messages: header.num_messages,
            ipc,
        })
    }

    pub fn next_batch(&mut self) -> Result<Option<RecordBatch>, String> {
        if self.remaining_messages == 0 {
            return Ok(None);
        }
        self.remaining_messages -= 1;

        let mut len_buf = [0u8; 4];
        self.reader
            .read_exact(&mut len_buf)
            .map_err(|e| format!("read spill message length failed: {e}"))?;
        let message_len = u32::from_le_bytes(len_buf) as usize;
        if message_len == 0 {
            return Err("spill run message length is zero".to_string());
        }
        let mut message = vec![0u8; message_len];
        self.reader
            .read_exact(&mut message)
            .map_err(|e| format!("read spill message failed: {e}"))?;
        let batch = self.ipc.decode_record_batch(self.schema.clone(), &message)?;
        Ok(Some(batch))
    }
}
