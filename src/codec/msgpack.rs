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

//! MessagePack codec backed by `rmp-serde`.

use super::{Codec, CodecError};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// MessagePack payload codec (wire id 3). The default serializer.
///
/// Structs are encoded with named fields so peers can evolve their types
/// independently of field order.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgpackCodec;

impl Codec for MsgpackCodec {
    fn encode<T>(&self, value: &T) -> Result<Vec<u8>, CodecError>
    where
        T: Serialize + ?Sized,
    {
        rmp_serde::encode::to_vec_named(value).map_err(|e| CodecError::Serialize(e.to_string()))
    }

    fn decode<T>(&self, data: &[u8]) -> Result<T, CodecError>
    where
        T: DeserializeOwned,
    {
        rmp_serde::decode::from_slice(data).map_err(|e| CodecError::Deserialize(e.to_string()))
    }

    fn name(&self) -> &'static str {
        "msgpack"
    }
}
