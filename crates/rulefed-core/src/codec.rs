//! Model codecs
//!
//! The wire and storage format of a [`RuleModel`] is a documented contract,
//! not an implicit serialization of internal objects. Coordinator and store
//! receive a codec handle and never look inside the payload bytes themselves.
//!
//! The binary codec frames every payload as:
//!
//! ```text
//! magic "RMC1" | body length (u32 LE) | bincode(RuleModel)
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;

use crate::{Error, Result, RuleModel};

/// Encodes and decodes rule models to and from opaque bytes
pub trait ModelCodec: Send + Sync {
    /// Short codec name, stored next to persisted payloads
    fn name(&self) -> &'static str;

    /// Serialize a model
    fn encode(&self, model: &RuleModel) -> Result<Bytes>;

    /// Deserialize and validate a model
    ///
    /// Any malformed or invariant-violating payload yields
    /// [`Error::DecodeFailure`].
    fn decode(&self, bytes: &[u8]) -> Result<RuleModel>;
}

/// Thread-safe handle to a codec
pub type ModelCodecHandle = Arc<dyn ModelCodec>;

/// Magic bytes of the binary codec frame
pub const BINCODE_MAGIC: [u8; 4] = *b"RMC1";

/// Length-prefixed bincode codec (default)
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl ModelCodec for BincodeCodec {
    fn name(&self) -> &'static str {
        "bincode-v1"
    }

    fn encode(&self, model: &RuleModel) -> Result<Bytes> {
        let body = bincode::serialize(model)?;
        let len = u32::try_from(body.len()).map_err(|_| Error::Serialization(format!(
            "model body of {} bytes exceeds frame limit",
            body.len()
        )))?;

        let mut buf = BytesMut::with_capacity(8 + body.len());
        buf.put_slice(&BINCODE_MAGIC);
        buf.put_u32_le(len);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    fn decode(&self, bytes: &[u8]) -> Result<RuleModel> {
        if bytes.len() < 8 {
            return Err(decode_failure(format!(
                "frame too short: {} bytes",
                bytes.len()
            )));
        }
        if bytes[..4] != BINCODE_MAGIC {
            return Err(decode_failure("invalid frame magic"));
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&bytes[4..8]);
        let len = u32::from_le_bytes(len_bytes) as usize;
        let body = &bytes[8..];
        if body.len() != len {
            return Err(decode_failure(format!(
                "frame length mismatch: header says {}, got {}",
                len,
                body.len()
            )));
        }

        let model: RuleModel =
            bincode::deserialize(body).map_err(|e| decode_failure(e.to_string()))?;
        model.validate().map_err(|e| decode_failure(e.to_string()))?;
        Ok(model)
    }
}

/// Human-readable JSON codec, handy for debugging and hand-written fixtures
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl ModelCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json-v1"
    }

    fn encode(&self, model: &RuleModel) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(model)?))
    }

    fn decode(&self, bytes: &[u8]) -> Result<RuleModel> {
        let model: RuleModel =
            serde_json::from_slice(bytes).map_err(|e| decode_failure(e.to_string()))?;
        model.validate().map_err(|e| decode_failure(e.to_string()))?;
        Ok(model)
    }
}

/// Look up a codec by its persisted name
pub fn codec_by_name(name: &str) -> Option<ModelCodecHandle> {
    match name {
        "bincode-v1" => Some(Arc::new(BincodeCodec)),
        "json-v1" => Some(Arc::new(JsonCodec)),
        _ => None,
    }
}

fn decode_failure(reason: impl Into<String>) -> Error {
    Error::DecodeFailure {
        client_id: None,
        reason: reason.into(),
    }
}
