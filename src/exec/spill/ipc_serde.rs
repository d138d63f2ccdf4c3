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
use std::fmt;

use arrow::array::RecordBatch;
use arrow::buffer::Buffer;
use arrow::datatypes::{Schema, SchemaRef};
use arrow::error::ArrowError;
use arrow::ipc::reader::FileDecoder;
use arrow::ipc::writer::{
    CompressionContext, DictionaryTracker, IpcDataGenerator, IpcWriteOptions, write_message,
};
use arrow::ipc::{Block, CompressionType, MetadataVersion};

const IPC_ALIGNMENT: usize = 64;
const CONTINUATION_MARKER: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpillCodec {
    None,
    Lz4,
    Zstd,
}

impl SpillCodec {
    pub fn as_u8(self) -> u8 {
        match self {
            SpillCodec::None => 0,
            SpillCodec::Lz4 => 1,
            SpillCodec::Zstd => 2,
        }
    }

    pub fn from_str(value: &str) -> Result<Self, String> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(SpillCodec::None),
            "lz4" => Ok(SpillCodec::Lz4),
            "zstd" => Ok(SpillCodec::Zstd),
            _ => Err(format!("unsupported spill ipc compression: {value}")),
        }
    }
}

impl TryFrom<u8> for SpillCodec {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SpillCodec::None),
            1 => Ok(SpillCodec::Lz4),
            2 => Ok(SpillCodec::Zstd),
            _ => Err(format!("unknown spill codec value: {value}")),
        }
    }
}

impl fmt::Display for SpillCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpillCodec::None => write!(f, "none"),
            SpillCodec::Lz4 => write!(f, "lz4"),
            SpillCodec::Zstd => write!(f, "zstd"),
        }
    }
}

/// Session encode level overrides the configured codec: non-positive levels
/// turn compression off, anything else keeps the configured default.
pub fn resolve_codec(default_codec: SpillCodec, spill_encode_level: Option<i32>) -> SpillCodec {
    match spill_encode_level {
        Some(level) if level <= 0 => SpillCodec::None,
        _ => default_codec,
    }
}

/// One encoded record-batch message ready to append to a run file.
#[derive(Debug, Clone)]
pub struct EncodedMessage {
    pub bytes: Vec<u8>,
    pub num_rows: u32,
}

/// Encodes and decodes single arrow IPC record-batch messages with the
/// run-file codec applied.
#[derive(Debug, Clone)]
pub struct IpcSerde {
    codec: SpillCodec,
    write_options: IpcWriteOptions,
}

impl IpcSerde {
    pub fn new(codec: SpillCodec) -> Result<Self, String> {
        let write_options = IpcWriteOptions::try_new(IPC_ALIGNMENT, false, MetadataVersion::V5)
            .map_err(map_arrow_err)?;
        let write_options = match codec {
            SpillCodec::None => write_options,
            SpillCodec::Lz4 => write_options
                .try_with_compression(Some(CompressionType::LZ4_FRAME))
                .map_err(map_arrow_err)?,
            SpillCodec::Zstd => write_options
                .try_with_compression(Some(CompressionType::ZSTD))
                .map_err(map_arrow_err)?,
        };
        Ok(Self {
            codec,
            write_options,
        })
    }

    pub fn codec(&self) -> SpillCodec {
        self.codec
    }

    pub fn encode_record_batch(&self, batch: &RecordBatch) -> Result<EncodedMessage, String> {
        let data_gen = IpcDataGenerator::default();
        let mut dictionary_tracker = DictionaryTracker::new(false);
        let mut compression_context = CompressionContext::default();
        let (encoded_dictionaries, encoded_batch) = data_gen
            .encode(
                batch,
                &mut dictionary_tracker,
                &self.write_options,
                &mut compression_context,
            )
            .map_err(map_arrow_err)?;
        if !encoded_dictionaries.is_empty() {
            return Err("dictionary-encoded columns are not supported in spill runs".to_string());
        }

        let mut bytes = Vec::new();
        let (meta_len, body_len) =
            write_message(&mut bytes, encoded_batch, &self.write_options).map_err(map_arrow_err)?;
        if bytes.len() != meta_len + body_len {
            return Err(format!(
                "ipc encoded message length mismatch: expected {} bytes, got {}",
                meta_len + body_len,
                bytes.len()
            ));
        }
        let num_rows = u32::try_from(batch.num_rows())
            .map_err(|_| "spill page row count overflows u32".to_string())?;
        Ok(EncodedMessage { bytes, num_rows })
    }

    pub fn decode_record_batch(
        &self,
        schema: SchemaRef,
        message: &[u8],
    ) -> Result<RecordBatch, String> {
        let metadata_len = ipc_metadata_len(message)?;
        if metadata_len > message.len() {
            return Err("ipc message metadata length exceeds message size".to_string());
        }
        let body_len = message.len() - metadata_len;
        let block = Block::new(0, metadata_len as i32, body_len as i64);
        let buffer = Buffer::from(message.to_vec());
        FileDecoder::new(schema, MetadataVersion::V5)
            .read_record_batch(&block, &buffer)
            .map_err(map_arrow_err)?
            .ok_or_else(|| "ipc message did not contain a record batch".to_string())
    }
}

/// Stable fingerprint of a schema, written into run-file headers so a reader
/// opened with the wrong schema fails loudly instead of misdecoding.
pub fn schema_hash(schema: &Schema) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;
    let mut hash = FNV_OFFSET;
    for byte in schema.to_string().as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Total prefix length (continuation marker + metadata length word + padded
/// flatbuffer metadata) of an encapsulated IPC message.
fn ipc_metadata_len(message: &[u8]) -> Result<usize, String> {
    if message.len() < 4 {
        return Err("ipc message is too small to contain a header".to_string());
    }
    let (prefix, meta_len) = if message.len() >= 8 && message[..4] == CONTINUATION_MARKER {
        (8usize, i32::from_le_bytes(message[4..8].try_into().unwrap()))
    } else {
        (4usize, i32::from_le_bytes(message[..4].try_into().unwrap()))
    };
    if meta_len < 0 {
        return Err("ipc message has negative metadata length".to_string());
    }
    let raw = prefix
        .checked_add(meta_len as usize)
        .ok_or_else(|| "ipc metadata length overflow".to_string())?;
    Ok(raw.next_multiple_of(IPC_ALIGNMENT))
}

fn map_arrow_err(err: ArrowError) -> String {
    format!("arrow ipc error: {err}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{ArrayRef, Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field};
    use std::sync::Arc;

    fn sample_batch() -> RecordBatch {
        let schema = SchemaRef::new(Schema::new(vec![
            Field::new("k", DataType::Utf8, true),
            Field::new("v", DataType::Int64, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec![Some("a"), None, Some("c")])) as ArrayRef,
                Arc::new(Int64Array::from(vec![Some(1), Some(2), None])) as ArrayRef,
            ],
        )
        .expect("batch")
    }

    #[test]
    fn encode_decode_round_trip_per_codec() {
        let batch = sample_batch();
        for codec in [SpillCodec::None, SpillCodec::Lz4, SpillCodec::Zstd] {
            let serde = IpcSerde::new(codec).expect("serde");
            let encoded = serde.encode_record_batch(&batch).expect("encode");
            assert_eq!(encoded.num_rows, 3);
            let decoded = serde
                .decode_record_batch(batch.schema(), &encoded.bytes)
                .expect("decode");
            assert_eq!(decoded.num_rows(), batch.num_rows());
            assert_eq!(decoded.schema(), batch.schema());
        }
    }

    #[test]
    fn schema_hash_distinguishes_schemas() {
        let a = Schema::new(vec![Field::new("k", DataType::Utf8, true)]);
        let b = Schema::new(vec![Field::new("k", DataType::Int64, true)]);
        assert_ne!(schema_hash(&a), schema_hash(&b));
        assert_eq!(schema_hash(&a), schema_hash(&a));
    }

    #[test]
    fn encode_level_zero_disables_compression() {
        assert_eq!(resolve_codec(SpillCodec::Lz4, Some(0)), SpillCodec::None);
        assert_eq!(resolve_codec(SpillCodec::Lz4, Some(-1)), SpillCodec::None);
        assert_eq!(resolve_codec(SpillCodec::Lz4, Some(3)), SpillCodec::Lz4);
        assert_eq!(resolve_codec(SpillCodec::Zstd, None), SpillCodec::Zstd);
    }
}
