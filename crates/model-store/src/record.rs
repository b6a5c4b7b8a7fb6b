//! Binary record of one published version
//!
//! All integers little-endian:
//!
//! ```text
//! magic "RGLM" (4) | format version u32 | model version u64 |
//! total sample size u64 | published_at millis i64 |
//! codec name len u16 | codec name | payload len u64 | payload
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};
use rulefed_core::{Error, ModelVersion, Result};

/// Record magic bytes
pub const RECORD_MAGIC: [u8; 4] = *b"RGLM";

/// Current record format version
pub const RECORD_FORMAT_VERSION: u32 = 1;

const FIXED_HEADER_LEN: usize = 4 + 4 + 8 + 8 + 8 + 2;

/// A published version as stored on disk
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRecord {
    pub version: ModelVersion,
    pub total_sample_size: u64,
    pub published_at: DateTime<Utc>,

    /// Name of the codec that produced `payload`
    pub codec: String,

    /// Encoded rule model
    pub payload: Bytes,
}

impl ModelRecord {
    pub fn encode(&self) -> Result<Bytes> {
        let codec = self.codec.as_bytes();
        let codec_len = u16::try_from(codec.len()).map_err(|_| {
            Error::Serialization(format!("codec name of {} bytes is too long", codec.len()))
        })?;

        let mut buf = BytesMut::with_capacity(FIXED_HEADER_LEN + codec.len() + 8 + self.payload.len());
        buf.put_slice(&RECORD_MAGIC);
        buf.put_u32_le(RECORD_FORMAT_VERSION);
        buf.put_u64_le(self.version);
        buf.put_u64_le(self.total_sample_size);
        buf.put_i64_le(self.published_at.timestamp_millis());
        buf.put_u16_le(codec_len);
        buf.put_slice(codec);
        buf.put_u64_le(self.payload.len() as u64);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Parse a record read from `path`
    pub fn decode(path: &str, mut data: Bytes) -> Result<Self> {
        let corrupted = |reason: String| Error::RecordCorrupted {
            path: path.to_string(),
            reason,
        };

        if data.len() < FIXED_HEADER_LEN {
            return Err(corrupted(format!("record too short: {} bytes", data.len())));
        }

        let mut magic = [0u8; 4];
        data.copy_to_slice(&mut magic);
        if magic != RECORD_MAGIC {
            return Err(corrupted("invalid record magic".to_string()));
        }

        let format = data.get_u32_le();
        if format != RECORD_FORMAT_VERSION {
            return Err(corrupted(format!("unsupported record format {}", format)));
        }

        let version = data.get_u64_le();
        let total_sample_size = data.get_u64_le();
        let millis = data.get_i64_le();
        let published_at = Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| corrupted(format!("invalid timestamp {}", millis)))?;

        let codec_len = data.get_u16_le() as usize;
        if data.remaining() < codec_len + 8 {
            return Err(corrupted("truncated codec name".to_string()));
        }
        let codec = String::from_utf8(data.split_to(codec_len).to_vec())
            .map_err(|e| corrupted(format!("codec name is not UTF-8: {}", e)))?;

        let payload_len = data.get_u64_le();
        if data.remaining() as u64 != payload_len {
            return Err(corrupted(format!(
                "payload length mismatch: header says {}, found {}",
                payload_len,
                data.remaining()
            )));
        }

        Ok(Self {
            version,
            total_sample_size,
            published_at,
            codec,
            payload: data,
        })
    }
}
