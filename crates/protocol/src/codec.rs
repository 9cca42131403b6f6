//! Frame encoding
//!
//! MessagePack for binary transports, JSON for text ones. Structs are
//! encoded as maps so both formats carry the same field names.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    #[default]
    MessagePack,
    Json,
}

impl WireFormat {
    pub fn encode<T: Serialize>(self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Self::MessagePack => rmp_serde::to_vec_named(value)
                .map_err(|e| ProtocolError::malformed(format!("msgpack encode: {e}"))),
            Self::Json => serde_json::to_vec(value)
                .map_err(|e| ProtocolError::malformed(format!("json encode: {e}"))),
        }
    }

    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, ProtocolError> {
        match self {
            Self::MessagePack => rmp_serde::from_slice(bytes)
                .map_err(|e| ProtocolError::malformed(format!("msgpack decode: {e}"))),
            Self::Json => serde_json::from_slice(bytes)
                .map_err(|e| ProtocolError::malformed(format!("json decode: {e}"))),
        }
    }
}
