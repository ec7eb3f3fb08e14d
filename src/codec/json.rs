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

//! JSON codec backed by `serde_json`.

use super::{Codec, CodecError};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// JSON payload codec (wire id 1).
///
/// Useful for debugging and cross-language interoperability; larger and
/// slower than the binary formats.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T>(&self, value: &T) -> Result<Vec<u8>, CodecError>
    where
        T: Serialize + ?Sized,
    {
        serde_json::to_vec(value).map_err(|e| CodecError::Serialize(e.to_string()))
    }

    fn decode<T>(&self, data: &[u8]) -> Result<T, CodecError>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(data).map_err(|e| CodecError::Deserialize(e.to_string()))
    }

    fn name(&self) -> &'static str {
        "json"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Point {
        x: i32,
        y: i32,
    }

    #[test]
    fn test_round_trip() {
        let point = Point { x: 10, y: -3 };
        let data = JsonCodec.encode(&point).expect("encode");
        let decoded: Point = JsonCodec.decode(&data).expect("decode");
        assert_eq!(decoded, point);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let result: Result<Point, _> = JsonCodec.decode(b"not json");
        assert!(result.is_err());
    }
}
