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

//! The binary wire protocol.
//!
//! Every RPC frame consists of a fixed 12-byte bit-packed [`Header`]
//! followed by a 4-byte total length and four length-prefixed sections:
//! service path, service method, metadata, and payload.
//!
//! ```text
//! +-------+---------+-------+------------+----------+
//! | magic | version | flags | serializer | seq (8B) |
//! +-------+---------+-------+------------+----------+
//! | totalLen (4B)                                   |
//! +-------------------------------------------------+
//! | len | servicePath | len | serviceMethod         |
//! +-------------------------------------------------+
//! | len | metadata entries | len | payload          |
//! +-------------------------------------------------+
//! ```
//!
//! All integers are big-endian. Metadata entries are a flat sequence of
//! `keyLen || key || valLen || val`. The first byte of every frame is the
//! magic constant [`MAGIC`].

mod message;
pub mod pool;

pub use message::{
    CompressType, Header, Message, MessageStatus, MessageType, ProtocolError, SerializeType,
};

/// First byte of every frame.
pub const MAGIC: u8 = 0x42;

/// Size of the fixed header in bytes.
pub const HEADER_LEN: usize = 12;

/// Metadata key under which server-side errors travel back to the client.
pub const SERVICE_ERROR_KEY: &str = "__mrpc_error__";

/// Metadata key under which authentication tokens travel to the server.
pub const AUTH_KEY: &str = "__AUTH";
