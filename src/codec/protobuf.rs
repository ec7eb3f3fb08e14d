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

//! Protocol Buffers codec backed by `prost`.
//!
//! Protobuf messages do not pass through serde, so the serde-typed entry
//! points of this codec reject their input; prost-generated types travel
//! through [`ProtobufCodec::encode_message`] and
//! [`ProtobufCodec::decode_message`] instead, typically over the raw call
//! path used by gateway integrators.

use super::{Codec, CodecError};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Protocol Buffers payload codec (wire id 2).
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtobufCodec;

impl ProtobufCodec {
    /// Encodes a prost message to payload bytes.
    #[must_use]
    pub fn encode_message<M>(&self, message: &M) -> Vec<u8>
    where
        M: prost::Message,
    {
        message.encode_to_vec()
    }

    /// Decodes payload bytes into a prost message.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] if the bytes are not a valid encoding of
    /// `M`.
    pub fn decode_message<M>(&self, data: &[u8]) -> Result<M, CodecError>
    where
        M: prost::Message + Default,
    {
        M::decode(data).map_err(|e| CodecError::Deserialize(e.to_string()))
    }
}

impl Codec for ProtobufCodec {
    fn encode<T>(&self, _value: &T) -> Result<Vec<u8>, CodecError>
    where
        T: Serialize + ?Sized,
    {
        Err(CodecError::unsupported(
            "protobuf",
            "protobuf payloads require prost message types; use encode_message",
        ))
    }

    fn decode<T>(&self, _data: &[u8]) -> Result<T, CodecError>
    where
        T: DeserializeOwned,
    {
        Err(CodecError::unsupported(
            "protobuf",
            "protobuf payloads require prost message types; use decode_message",
        ))
    }

    fn name(&self) -> &'static str {
        "protobuf"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, PartialEq, prost::Message)]
    struct Ping {
        #[prost(uint64, tag = "1")]
        seq: u64,
        #[prost(string, tag = "2")]
        node: String,
    }

    #[test]
    fn test_prost_round_trip() {
        let ping = Ping {
            seq: 9,
            node: "edge-1".to_string(),
        };
        let data = ProtobufCodec.encode_message(&ping);
        let decoded: Ping = ProtobufCodec.decode_message(&data).expect("decode");
        assert_eq!(decoded, ping);
    }

    #[test]
    fn test_serde_entry_points_reject() {
        assert!(ProtobufCodec.encode(&1u8).is_err());
        assert!(ProtobufCodec.decode::<u8>(&[]).is_err());
    }

    #[test]
    fn test_decode_garbage_fails() {
        let result: Result<Ping, _> = ProtobufCodec.decode_message(&[0xFF, 0xFF, 0xFF]);
        assert!(result.is_err());
    }
}
