//! JSON-based [`MessageCodec`] implementation.

use crate::application::ports::MessageCodec;
use crate::domain::messages::{ClientMsg, CodecError, ServerMsg};

/// Encodes / decodes the `{type, payload}` envelopes using `serde_json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonMessageCodec;

impl MessageCodec for JsonMessageCodec {
    fn encode(&self, msg: &ServerMsg) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(msg).map_err(|source| CodecError::Encode {
            kind: msg.kind(),
            source,
        })
    }

    fn decode(&self, data: &[u8]) -> Result<ClientMsg, CodecError> {
        serde_json::from_slice(data).map_err(CodecError::Malformed)
    }
}

/// The display side of the same envelopes.
impl JsonMessageCodec {
    pub fn encode_client(&self, msg: &ClientMsg) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(msg).map_err(|source| CodecError::Encode {
            kind: msg.kind(),
            source,
        })
    }

    pub fn decode_server(&self, data: &[u8]) -> Result<ServerMsg, CodecError> {
        serde_json::from_slice(data).map_err(CodecError::Malformed)
    }
}
