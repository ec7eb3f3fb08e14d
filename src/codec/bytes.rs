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

//! Raw byte passthrough codec.
//!
//! The "format" is the identity function: only values that are byte
//! buffers (`Vec<u8>`, `&[u8]`, or anything that serializes through
//! `serialize_bytes`) can cross this codec. Anything else is rejected,
//! which keeps raw-mode payloads honest.

use super::{Codec, CodecError};
use serde::de::value::U8Deserializer;
use serde::de::{DeserializeOwned, DeserializeSeed, IntoDeserializer, SeqAccess, Visitor};
use serde::ser::Impossible;
use serde::{Deserializer, Serialize, Serializer};

/// Raw byte passthrough codec (wire id 0).
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteCodec;

impl Codec for ByteCodec {
    fn encode<T>(&self, value: &T) -> Result<Vec<u8>, CodecError>
    where
        T: Serialize + ?Sized,
    {
        let mut out = Vec::new();
        value.serialize(ByteSink { out: &mut out })?;
        Ok(out)
    }

    fn decode<T>(&self, data: &[u8]) -> Result<T, CodecError>
    where
        T: DeserializeOwned,
    {
        T::deserialize(ByteSource { data })
    }

    fn name(&self) -> &'static str {
        "raw"
    }
}

fn not_bytes(what: &str) -> CodecError {
    CodecError::unsupported("raw", format!("{what} is not a byte buffer"))
}

/// Serializer that only accepts byte buffers and sequences of `u8`.
struct ByteSink<'a> {
    out: &'a mut Vec<u8>,
}

macro_rules! reject_scalar {
    ($($method:ident: $ty:ty,)*) => {
        $(fn $method(self, _v: $ty) -> Result<(), CodecError> {
            Err(not_bytes(stringify!($ty)))
        })*
    };
}

impl<'a> Serializer for ByteSink<'a> {
    type Ok = ();
    type Error = CodecError;
    type SerializeSeq = ByteSeq<'a>;
    type SerializeTuple = Impossible<(), CodecError>;
    type SerializeTupleStruct = Impossible<(), CodecError>;
    type SerializeTupleVariant = Impossible<(), CodecError>;
    type SerializeMap = Impossible<(), CodecError>;
    type SerializeStruct = Impossible<(), CodecError>;
    type SerializeStructVariant = Impossible<(), CodecError>;

    reject_scalar! {
        serialize_bool: bool,
        serialize_i8: i8,
        serialize_i16: i16,
        serialize_i32: i32,
        serialize_i64: i64,
        serialize_u16: u16,
        serialize_u32: u32,
        serialize_u64: u64,
        serialize_f32: f32,
        serialize_f64: f64,
        serialize_char: char,
    }

    fn serialize_u8(self, v: u8) -> Result<(), CodecError> {
        self.out.push(v);
        Ok(())
    }

    fn serialize_str(self, _v: &str) -> Result<(), CodecError> {
        Err(not_bytes("str"))
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<(), CodecError> {
        self.out.extend_from_slice(v);
        Ok(())
    }

    fn serialize_none(self) -> Result<(), CodecError> {
        Err(not_bytes("Option"))
    }

    fn serialize_some<T>(self, value: &T) -> Result<(), CodecError>
    where
        T: Serialize + ?Sized,
    {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<(), CodecError> {
        Err(not_bytes("unit"))
    }

    fn serialize_unit_struct(self, name: &'static str) -> Result<(), CodecError> {
        Err(not_bytes(name))
    }

    fn serialize_unit_variant(
        self,
        name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
    ) -> Result<(), CodecError> {
        Err(not_bytes(name))
    }

    fn serialize_newtype_struct<T>(self, _name: &'static str, value: &T) -> Result<(), CodecError>
    where
        T: Serialize + ?Sized,
    {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T>(
        self,
        name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<(), CodecError>
    where
        T: Serialize + ?Sized,
    {
        Err(not_bytes(name))
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq, CodecError> {
        Ok(ByteSeq { out: self.out })
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple, CodecError> {
        Err(not_bytes("tuple"))
    }

    fn serialize_tuple_struct(
        self,
        name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct, CodecError> {
        Err(not_bytes(name))
    }

    fn serialize_tuple_variant(
        self,
        name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant, CodecError> {
        Err(not_bytes(name))
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap, CodecError> {
        Err(not_bytes("map"))
    }

    fn serialize_struct(
        self,
        name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStruct, CodecError> {
        Err(not_bytes(name))
    }

    fn serialize_struct_variant(
        self,
        name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant, CodecError> {
        Err(not_bytes(name))
    }
}

struct ByteSeq<'a> {
    out: &'a mut Vec<u8>,
}

impl serde::ser::SerializeSeq for ByteSeq<'_> {
    type Ok = ();
    type Error = CodecError;

    fn serialize_element<T>(&mut self, value: &T) -> Result<(), CodecError>
    where
        T: Serialize + ?Sized,
    {
        value.serialize(ByteSink { out: &mut *self.out })
    }

    fn end(self) -> Result<(), CodecError> {
        Ok(())
    }
}

/// Deserializer that hands the input back as a byte sequence.
struct ByteSource<'de> {
    data: &'de [u8],
}

impl<'de> Deserializer<'de> for ByteSource<'de> {
    type Error = CodecError;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        visitor.visit_seq(ByteSeqAccess {
            iter: self.data.iter(),
        })
    }

    fn deserialize_bytes<V>(self, visitor: V) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        visitor.visit_borrowed_bytes(self.data)
    }

    fn deserialize_byte_buf<V>(self, visitor: V) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        visitor.visit_byte_buf(self.data.to_vec())
    }

    serde::forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        option unit unit_struct newtype_struct seq tuple tuple_struct map
        struct enum identifier ignored_any
    }
}

struct ByteSeqAccess<'de> {
    iter: std::slice::Iter<'de, u8>,
}

impl<'de> SeqAccess<'de> for ByteSeqAccess<'de> {
    type Error = CodecError;

    fn next_element_seed<T>(&mut self, seed: T) -> Result<Option<T::Value>, CodecError>
    where
        T: DeserializeSeed<'de>,
    {
        match self.iter.next() {
            Some(byte) => {
                let de: U8Deserializer<CodecError> = (*byte).into_deserializer();
                seed.deserialize(de).map(Some)
            }
            None => Ok(None),
        }
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.iter.len())
    }
}
