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

use super::{HEADER_LEN, MAGIC};
use std::collections::HashMap;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Errors produced while encoding or decoding a frame.
///
/// Any framing error invalidates the stream position, so the connection
/// that produced it must be torn down.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The first byte of the frame was not the magic constant.
    #[error("invalid magic number {0:#04x}")]
    BadMagic(u8),

    /// The advertised body length exceeds the configured maximum.
    #[error("message is too long: {length} exceeds limit {limit}")]
    MessageTooLong {
        /// The length the frame advertised.
        length: usize,
        /// The configured maximum body length.
        limit: usize,
    },

    /// A metadata entry ran past the end of the metadata section.
    #[error("wrong metadata lines: some keys or values are missing")]
    MetaKvMissing,

    /// A section length ran past the end of the frame body.
    #[error("truncated message body")]
    Truncated,

    /// A service path or method was not valid UTF-8.
    #[error("service path or method is not valid UTF-8")]
    InvalidString,

    /// The underlying reader failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Distinguishes requests from responses (header flag bit 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// A client-originated request.
    Request,
    /// A server-originated response.
    Response,
}

/// Outcome carried by a response (header flag bits 1-0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    /// The call completed normally.
    Normal,
    /// The call failed; the error string is in metadata under the
    /// service-error key.
    Error,
}

/// Payload compression algorithm (header flag bits 4-2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressType {
    /// No compression.
    #[default]
    None,
    /// RFC 1952 gzip.
    Gzip,
}

impl CompressType {
    /// Decodes the three-bit wire value. Reserved values yield `None`.
    #[must_use]
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::None),
            1 => Some(Self::Gzip),
            _ => None,
        }
    }

    const fn bits(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Gzip => 1,
        }
    }
}

/// Payload serializer id (high nibble of header byte 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SerializeType {
    /// Raw byte passthrough.
    Raw,
    /// JSON.
    Json,
    /// Protocol Buffers.
    Protobuf,
    /// MessagePack.
    #[default]
    MsgPack,
}

impl SerializeType {
    /// Decodes the four-bit wire value.
    #[must_use]
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::Raw),
            1 => Some(Self::Json),
            2 => Some(Self::Protobuf),
            3 => Some(Self::MsgPack),
            _ => None,
        }
    }

    /// Returns the four-bit wire value.
    #[must_use]
    pub const fn bits(self) -> u8 {
        match self {
            Self::Raw => 0,
            Self::Json => 1,
            Self::Protobuf => 2,
            Self::MsgPack => 3,
        }
    }
}

/// The fixed 12-byte frame header.
///
/// Layout:
///
/// - byte 0: magic (`0x42`)
/// - byte 1: protocol version
/// - byte 2: bit 7 message kind, bit 6 heartbeat, bit 5 oneway,
///   bits 4-2 compression, bits 1-0 status
/// - byte 3: bits 7-4 serializer id, bits 3-0 reserved
/// - bytes 4-11: big-endian sequence number
///
/// Every setter masks its field before writing so a pooled header can be
/// repacked without leaking stale bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header(pub(crate) [u8; HEADER_LEN]);

impl Default for Header {
    fn default() -> Self {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0] = MAGIC;
        Self(bytes)
    }
}

impl Header {
    /// Returns `true` if the first byte is the magic constant.
    #[must_use]
    pub const fn check_magic(&self) -> bool {
        self.0[0] == MAGIC
    }

    /// Returns the protocol version byte.
    #[must_use]
    pub const fn version(&self) -> u8 {
        self.0[1]
    }

    /// Sets the protocol version byte.
    pub fn set_version(&mut self, version: u8) {
        self.0[1] = version;
    }

    /// Returns the message kind.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        if self.0[2] & 0x80 == 0x80 {
            MessageType::Response
        } else {
            MessageType::Request
        }
    }

    /// Sets the message kind.
    pub fn set_message_type(&mut self, mt: MessageType) {
        match mt {
            MessageType::Request => self.0[2] &= !0x80,
            MessageType::Response => self.0[2] |= 0x80,
        }
    }

    /// Returns `true` if the heartbeat flag is set.
    #[must_use]
    pub const fn is_heartbeat(&self) -> bool {
        self.0[2] & 0x40 == 0x40
    }

    /// Sets or clears the heartbeat flag.
    pub fn set_heartbeat(&mut self, heartbeat: bool) {
        if heartbeat {
            self.0[2] |= 0x40;
        } else {
            self.0[2] &= !0x40;
        }
    }

    /// Returns `true` if the oneway flag is set.
    #[must_use]
    pub const fn is_oneway(&self) -> bool {
        self.0[2] & 0x20 == 0x20
    }

    /// Sets or clears the oneway flag.
    pub fn set_oneway(&mut self, oneway: bool) {
        if oneway {
            self.0[2] |= 0x20;
        } else {
            self.0[2] &= !0x20;
        }
    }

    /// Returns the compression type, or `None` for reserved wire values.
    #[must_use]
    pub fn compress_type(&self) -> Option<CompressType> {
        CompressType::from_bits((self.0[2] & 0x1C) >> 2)
    }

    /// Sets the compression type.
    pub fn set_compress_type(&mut self, ct: CompressType) {
        self.0[2] = (self.0[2] & !0x1C) | ((ct.bits() << 2) & 0x1C);
    }

    /// Returns the message status.
    #[must_use]
    pub const fn message_status(&self) -> MessageStatus {
        if self.0[2] & 0x03 == 0 {
            MessageStatus::Normal
        } else {
            MessageStatus::Error
        }
    }

    /// Sets the message status.
    pub fn set_message_status(&mut self, status: MessageStatus) {
        let bits = match status {
            MessageStatus::Normal => 0,
            MessageStatus::Error => 1,
        };
        self.0[2] = (self.0[2] & !0x03) | bits;
    }

    /// Returns the serializer id, or `None` for reserved wire values.
    #[must_use]
    pub fn serialize_type(&self) -> Option<SerializeType> {
        SerializeType::from_bits((self.0[3] & 0xF0) >> 4)
    }

    /// Returns the raw serializer id nibble as carried on the wire.
    #[must_use]
    pub const fn serialize_type_bits(&self) -> u8 {
        (self.0[3] & 0xF0) >> 4
    }

    /// Sets the serializer id.
    pub fn set_serialize_type(&mut self, st: SerializeType) {
        self.0[3] = (self.0[3] & 0x0F) | (st.bits() << 4);
    }

    /// Returns the sequence number.
    #[must_use]
    pub fn seq(&self) -> u64 {
        u64::from_be_bytes(self.0[4..12].try_into().expect("header is 12 bytes"))
    }

    /// Sets the sequence number.
    pub fn set_seq(&mut self, seq: u64) {
        self.0[4..12].copy_from_slice(&seq.to_be_bytes());
    }

    /// Zeroes everything past the magic byte.
    fn reset(&mut self) {
        self.0[1..].fill(0);
    }
}

/// A full RPC frame.
///
/// Messages are pooled; obtain them through [`pool::get`] and return them
/// with [`pool::put`] once the terminal handler is done with them. A pooled
/// message must not be touched after it is returned.
///
/// [`pool::get`]: super::pool::get
/// [`pool::put`]: super::pool::put
#[derive(Debug, Default, Clone)]
pub struct Message {
    /// The fixed bit-packed header.
    pub header: Header,
    /// Identifies the target service (receiver).
    pub service_path: String,
    /// Identifies the method of that service.
    pub service_method: String,
    /// Key/value metadata. Duplicate keys on the wire decode
    /// last-write-wins.
    pub metadata: HashMap<String, String>,
    /// Serialized arguments (request) or reply (response), possibly
    /// gzip-compressed.
    pub payload: Vec<u8>,
    /// Scratch buffer the decoder reads the frame body into; retained
    /// across pool round-trips to keep its capacity.
    body: Vec<u8>,
}

impl Message {
    /// Creates an empty request message with a valid magic byte.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies the header and routing fields into a fresh message, as the
    /// starting point of a response.
    ///
    /// Metadata and payload are not carried over.
    #[must_use]
    pub fn clone_routing(&self) -> Self {
        let mut msg = super::pool::get();
        msg.header = self.header;
        msg.service_path.clone_from(&self.service_path);
        msg.service_method.clone_from(&self.service_method);
        msg
    }

    /// Encodes the whole frame into one contiguous buffer.
    ///
    /// The dispatch engines rely on the frame being fully materialized
    /// before any write occurs, so one frame is always one write call.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let meta = encode_metadata(&self.metadata);

        let path_len = self.service_path.len();
        let method_len = self.service_method.len();
        let total = (4 + path_len) + (4 + method_len) + (4 + meta.len()) + (4 + self.payload.len());

        let mut data = Vec::with_capacity(HEADER_LEN + 4 + total);
        data.extend_from_slice(&self.header.0);
        data.extend_from_slice(&(total as u32).to_be_bytes());

        data.extend_from_slice(&(path_len as u32).to_be_bytes());
        data.extend_from_slice(self.service_path.as_bytes());

        data.extend_from_slice(&(method_len as u32).to_be_bytes());
        data.extend_from_slice(self.service_method.as_bytes());

        data.extend_from_slice(&(meta.len() as u32).to_be_bytes());
        data.extend_from_slice(&meta);

        data.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        data.extend_from_slice(&self.payload);

        data
    }

    /// Reads and decodes one frame from `reader`, replacing this message's
    /// contents.
    ///
    /// Reads exactly the advertised lengths. A body length above
    /// `max_message_length` (when non-zero) fails with
    /// [`ProtocolError::MessageTooLong`] before the body is read.
    ///
    /// # Errors
    ///
    /// Any [`ProtocolError`] leaves the reader mid-frame; the connection
    /// must be torn down.
    pub async fn decode<R>(
        &mut self,
        reader: &mut R,
        max_message_length: usize,
    ) -> Result<(), ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        reader.read_exact(&mut self.header.0).await?;
        if !self.header.check_magic() {
            return Err(ProtocolError::BadMagic(self.header.0[0]));
        }

        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes).await?;
        let total = u32::from_be_bytes(len_bytes) as usize;

        if max_message_length > 0 && total > max_message_length {
            return Err(ProtocolError::MessageTooLong {
                length: total,
                limit: max_message_length,
            });
        }

        self.body.resize(total, 0);
        reader.read_exact(&mut self.body).await?;

        let body = std::mem::take(&mut self.body);
        let result = self.parse_body(&body);
        self.body = body;
        result
    }

    fn parse_body(&mut self, body: &[u8]) -> Result<(), ProtocolError> {
        let mut n = 0usize;

        let path = read_section(body, &mut n)?;
        self.service_path =
            String::from_utf8(path.to_vec()).map_err(|_| ProtocolError::InvalidString)?;

        let method = read_section(body, &mut n)?;
        self.service_method =
            String::from_utf8(method.to_vec()).map_err(|_| ProtocolError::InvalidString)?;

        let meta = read_section(body, &mut n)?;
        self.metadata.clear();
        if !meta.is_empty() {
            decode_metadata(meta, &mut self.metadata)?;
        }

        let payload = read_section(body, &mut n)?;
        self.payload.clear();
        self.payload.extend_from_slice(payload);

        Ok(())
    }

    /// Restores the message to its pristine state for pool reuse: the
    /// header keeps its magic byte and loses everything else, metadata is
    /// emptied, and the payload and body buffers are truncated in place.
    pub fn reset(&mut self) {
        self.header.reset();
        self.service_path.clear();
        self.service_method.clear();
        self.metadata.clear();
        self.payload.clear();
        self.body.clear();
    }
}

fn read_section<'a>(body: &'a [u8], n: &mut usize) -> Result<&'a [u8], ProtocolError> {
    let len_end = n.checked_add(4).ok_or(ProtocolError::Truncated)?;
    if len_end > body.len() {
        return Err(ProtocolError::Truncated);
    }
    let len = u32::from_be_bytes(body[*n..len_end].try_into().expect("4-byte slice")) as usize;
    let end = len_end.checked_add(len).ok_or(ProtocolError::Truncated)?;
    if end > body.len() {
        return Err(ProtocolError::Truncated);
    }
    *n = end;
    Ok(&body[len_end..end])
}

fn encode_metadata(metadata: &HashMap<String, String>) -> Vec<u8> {
    if metadata.is_empty() {
        return Vec::new();
    }

    let mut buf = Vec::new();
    for (key, value) in metadata {
        buf.extend_from_slice(&(key.len() as u32).to_be_bytes());
        buf.extend_from_slice(key.as_bytes());
        buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
        buf.extend_from_slice(value.as_bytes());
    }
    buf
}

fn decode_metadata(data: &[u8], out: &mut HashMap<String, String>) -> Result<(), ProtocolError> {
    let mut n = 0usize;
    while n < data.len() {
        let key = read_kv_part(data, &mut n)?;
        let value = read_kv_part(data, &mut n)?;
        out.insert(key, value);
    }
    Ok(())
}

fn read_kv_part(data: &[u8], n: &mut usize) -> Result<String, ProtocolError> {
    if *n + 4 > data.len() {
        return Err(ProtocolError::MetaKvMissing);
    }
    let len = u32::from_be_bytes(data[*n..*n + 4].try_into().expect("4-byte slice")) as usize;
    *n += 4;
    let end = n.checked_add(len).ok_or(ProtocolError::MetaKvMissing)?;
    if end > data.len() {
        return Err(ProtocolError::MetaKvMissing);
    }
    let part =
        String::from_utf8(data[*n..end].to_vec()).map_err(|_| ProtocolError::InvalidString)?;
    *n = end;
    Ok(part)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::pool;

    fn sample_message() -> Message {
        let mut msg = Message::new();
        msg.header.set_version(0);
        msg.header.set_message_type(MessageType::Request);
        msg.header.set_serialize_type(SerializeType::Json);
        msg.header.set_seq(1234567890);
        msg.service_path = "Arith".to_string();
        msg.service_method = "Mul".to_string();
        msg.metadata
            .insert("__ID".to_string(), "6ba7b810-9dad-11d1-80b4-00c04fd430c8".to_string());
        msg.payload = br#"{"A":10,"B":20}"#.to_vec();
        msg
    }

    #[tokio::test]
    async fn test_encode_decode_round_trip() {
        let msg = sample_message();
        let data = msg.encode();

        let mut decoded = Message::new();
        decoded
            .decode(&mut data.as_slice(), 0)
            .await
            .expect("decode");

        assert_eq!(decoded.header, msg.header);
        assert_eq!(decoded.service_path, msg.service_path);
        assert_eq!(decoded.service_method, msg.service_method);
        assert_eq!(decoded.metadata, msg.metadata);
        assert_eq!(decoded.payload, msg.payload);
    }

    #[test]
    fn test_encoded_size_invariant() {
        let msg = sample_message();
        let meta = encode_metadata(&msg.metadata);
        let sections = msg.service_path.len() + msg.service_method.len() + meta.len() + msg.payload.len();
        assert_eq!(msg.encode().len(), 12 + 4 + 4 * 4 + sections);
    }

    #[test]
    fn test_first_byte_is_magic() {
        let msg = sample_message();
        assert_eq!(msg.encode()[0], MAGIC);
    }

    #[tokio::test]
    async fn test_heartbeat_round_trip() {
        let mut msg = Message::new();
        msg.header.set_heartbeat(true);
        msg.header.set_seq(7);

        let data = msg.encode();
        let mut decoded = Message::new();
        decoded
            .decode(&mut data.as_slice(), 0)
            .await
            .expect("decode");

        assert!(decoded.header.is_heartbeat());
        assert_eq!(decoded.header.seq(), 7);
        assert!(decoded.service_path.is_empty());
        assert!(decoded.service_method.is_empty());
        assert!(decoded.payload.is_empty());
    }

    #[tokio::test]
    async fn test_empty_metadata_decodes() {
        let mut msg = Message::new();
        msg.service_path = "Echo".to_string();
        msg.service_method = "Say".to_string();

        let data = msg.encode();
        let mut decoded = Message::new();
        decoded
            .decode(&mut data.as_slice(), 0)
            .await
            .expect("decode");
        assert!(decoded.metadata.is_empty());
    }

    #[tokio::test]
    async fn test_message_too_long() {
        let mut msg = Message::new();
        msg.payload = vec![0u8; 2048];
        let data = msg.encode();

        let mut decoded = Message::new();
        let err = decoded.decode(&mut data.as_slice(), 1024).await.unwrap_err();
        assert!(matches!(err, ProtocolError::MessageTooLong { .. }));
    }

    #[tokio::test]
    async fn test_bad_magic() {
        let mut data = sample_message().encode();
        data[0] = 0x13;

        let mut decoded = Message::new();
        let err = decoded.decode(&mut data.as_slice(), 0).await.unwrap_err();
        assert!(matches!(err, ProtocolError::BadMagic(0x13)));
    }

    #[test]
    fn test_truncated_metadata_entry() {
        // keyLen claims four bytes but only two follow.
        let mut meta = Vec::new();
        meta.extend_from_slice(&4u32.to_be_bytes());
        meta.extend_from_slice(b"ab");

        let mut out = HashMap::new();
        let err = decode_metadata(&meta, &mut out).unwrap_err();
        assert!(matches!(err, ProtocolError::MetaKvMissing));
    }

    #[test]
    fn test_duplicate_metadata_keys_last_write_wins() {
        let mut meta = Vec::new();
        for value in ["one", "two"] {
            meta.extend_from_slice(&1u32.to_be_bytes());
            meta.extend_from_slice(b"k");
            meta.extend_from_slice(&(value.len() as u32).to_be_bytes());
            meta.extend_from_slice(value.as_bytes());
        }

        let mut out = HashMap::new();
        decode_metadata(&meta, &mut out).expect("decode");
        assert_eq!(out.get("k").map(String::as_str), Some("two"));
    }

    #[test]
    fn test_header_bit_packing_masks_previous_values() {
        let mut header = Header::default();
        header.set_message_type(MessageType::Response);
        header.set_heartbeat(true);
        header.set_oneway(true);
        header.set_compress_type(CompressType::Gzip);
        header.set_message_status(MessageStatus::Error);
        header.set_serialize_type(SerializeType::MsgPack);

        // Repacking over a dirty header must not leak stale bits.
        header.set_message_type(MessageType::Request);
        header.set_compress_type(CompressType::None);
        header.set_message_status(MessageStatus::Normal);
        header.set_serialize_type(SerializeType::Raw);

        assert_eq!(header.message_type(), MessageType::Request);
        assert!(header.is_heartbeat());
        assert!(header.is_oneway());
        assert_eq!(header.compress_type(), Some(CompressType::None));
        assert_eq!(header.message_status(), MessageStatus::Normal);
        assert_eq!(header.serialize_type(), Some(SerializeType::Raw));
    }

    #[test]
    fn test_seq_round_trip() {
        let mut header = Header::default();
        header.set_seq(u64::MAX - 3);
        assert_eq!(header.seq(), u64::MAX - 3);
    }

    #[tokio::test]
    async fn test_gzip_payload_section_layout() {
        let args = br#"{"blob":"0123456789"}"#.repeat(100);
        let zipped = crate::compress::zip(&args).expect("zip");

        let mut msg = Message::new();
        msg.header.set_serialize_type(SerializeType::Json);
        msg.header.set_compress_type(CompressType::Gzip);
        msg.service_path = "Blob".to_string();
        msg.service_method = "Store".to_string();
        msg.payload = zipped;

        let data = msg.encode();
        // flags byte advertises gzip in bits 4-2.
        assert_eq!((data[2] & 0x1C) >> 2, 1);

        // The payload section is the last one; its bytes are a gzip
        // stream.
        let payload_start = data.len() - msg.payload.len();
        assert_eq!(&data[payload_start..payload_start + 2], &[0x1F, 0x8B]);

        let mut decoded = Message::new();
        decoded
            .decode(&mut data.as_slice(), 0)
            .await
            .expect("decode");
        assert_eq!(decoded.header.compress_type(), Some(CompressType::Gzip));
        let unzipped = crate::compress::unzip(&decoded.payload).expect("unzip");
        assert_eq!(unzipped, args);
    }

    #[test]
    fn test_reset_preserves_magic() {
        let mut msg = sample_message();
        msg.reset();
        assert!(msg.header.check_magic());
        assert_eq!(msg.header.seq(), 0);
        assert!(msg.service_path.is_empty());
        assert!(msg.metadata.is_empty());
        assert!(msg.payload.is_empty());
    }

    #[test]
    fn test_pool_round_trip_yields_clean_message() {
        let mut msg = pool::get();
        msg.service_path = "Dirty".to_string();
        msg.header.set_seq(99);
        pool::put(msg);

        let msg = pool::get();
        assert!(msg.header.check_magic());
        assert_eq!(msg.header.seq(), 0);
        assert!(msg.service_path.is_empty());
        pool::put(msg);
    }
}
