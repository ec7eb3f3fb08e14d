//
// Copyright 2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! The serializer registry.
//!
//! Each wire frame advertises a four-bit serializer id in its header. This
//! module maps the id to an encode/decode pair:
//!
//! | id | codec | backend |
//! |---|---|---|
//! | 0 | [`ByteCodec`] | raw byte passthrough |
//! | 1 | [`JsonCodec`] | `serde_json` |
//! | 2 | [`ProtobufCodec`] | `prost` |
//! | 3 | [`MsgpackCodec`] | `rmp-serde` (named fields) |
//!
//! The typed call path is serde-bound; Protocol Buffers payloads travel
//! through the raw path using [`ProtobufCodec::encode_message`] and
//! [`ProtobufCodec::decode_message`].

mod bytes;
mod json;
mod msgpack;
mod protobuf;

pub use bytes::ByteCodec;
pub use json::JsonCodec;
pub use msgpack::MsgpackCodec;
pub use protobuf::ProtobufCodec;

use crate::protocol::SerializeType;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Errors produced while encoding or decoding a payload.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The value could not be serialized.
    #[error("serialize: {0}")]
    Serialize(String),

    /// The bytes could not be deserialized.
    #[error("deserialize: {0}")]
    Deserialize(String),

    /// The codec cannot carry this payload type.
    #[error("{codec} codec does not support this payload: {reason}")]
    Unsupported {
        /// Codec name.
        codec: &'static str,
        /// Why the payload was rejected.
        reason: String,
    },
}

impl CodecError {
    pub(crate) fn unsupported(codec: &'static str, reason: impl Into<String>) -> Self {
        Self::Unsupported {
            codec,
            reason: reason.into(),
        }
    }
}

impl serde::ser::Error for CodecError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        Self::Serialize(msg.to_string())
    }
}

impl serde::de::Error for CodecError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        Self::Deserialize(msg.to_string())
    }
}

/// An encode/decode pair for argument and reply payloads.
///
/// The trait is serde-bound; dispatch over the wire id happens through
/// [`CodecKind`], which implements `Codec` by delegating to the selected
/// backend.
pub trait Codec: Send + Sync {
    /// Serializes a value to payload bytes.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] if the value cannot be represented in this
    /// codec's format.
    fn encode<T>(&self, value: &T) -> Result<Vec<u8>, CodecError>
    where
        T: Serialize + ?Sized;

    /// Deserializes payload bytes into a value.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] if the bytes are not a valid encoding of
    /// `T` in this codec's format.
    fn decode<T>(&self, data: &[u8]) -> Result<T, CodecError>
    where
        T: DeserializeOwned;

    /// Stable name of the codec.
    fn name(&self) -> &'static str;
}

/// Runtime-selected codec, keyed by the wire serializer id.
#[derive(Debug, Clone, Copy, Default)]
pub enum CodecKind {
    /// Raw byte passthrough (wire id 0).
    Bytes,
    /// JSON (wire id 1).
    Json,
    /// Protocol Buffers (wire id 2).
    Protobuf,
    /// MessagePack (wire id 3).
    #[default]
    Msgpack,
}

/// Returns the codec registered for `st`.
#[must_use]
pub fn codec_for(st: SerializeType) -> CodecKind {
    match st {
        SerializeType::Raw => CodecKind::Bytes,
        SerializeType::Json => CodecKind::Json,
        SerializeType::Protobuf => CodecKind::Protobuf,
        SerializeType::MsgPack => CodecKind::Msgpack,
    }
}

impl Codec for CodecKind {
    fn encode<T>(&self, value: &T) -> Result<Vec<u8>, CodecError>
    where
        T: Serialize + ?Sized,
    {
        match self {
            Self::Bytes => ByteCodec.encode(value),
            Self::Json => JsonCodec.encode(value),
            Self::Protobuf => ProtobufCodec.encode(value),
            Self::Msgpack => MsgpackCodec.encode(value),
        }
    }

    fn decode<T>(&self, data: &[u8]) -> Result<T, CodecError>
    where
        T: DeserializeOwned,
    {
        match self {
            Self::Bytes => ByteCodec.decode(data),
            Self::Json => JsonCodec.decode(data),
            Self::Protobuf => ProtobufCodec.decode(data),
            Self::Msgpack => MsgpackCodec.decode(data),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Bytes => ByteCodec.name(),
            Self::Json => JsonCodec.name(),
            Self::Protobuf => ProtobufCodec.name(),
            Self::Msgpack => MsgpackCodec.name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_mapping() {
        assert_eq!(codec_for(SerializeType::Raw).name(), "raw");
        assert_eq!(codec_for(SerializeType::Json).name(), "json");
        assert_eq!(codec_for(SerializeType::Protobuf).name(), "protobuf");
        assert_eq!(codec_for(SerializeType::MsgPack).name(), "msgpack");
    }

    #[test]
    fn test_reserved_ids_have_no_registrant() {
        for bits in 4..=0x0F {
            assert!(SerializeType::from_bits(bits).is_none());
        }
    }
}
