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

//! HTTP gateway header convention.
//!
//! When the framework sits behind an HTTP gateway, wire header fields
//! travel as `X-Gateway-*` request and response headers and the payload
//! rides in the body. The gateway server itself is out of scope; this
//! module is the single definition of the header names plus the
//! response-to-header-map conversion used by the raw call path.

use crate::protocol::{CompressType, Message, MessageStatus};
use std::collections::HashMap;

/// Protocol version header.
pub const VERSION: &str = "X-Gateway-Version";
/// Message kind header.
pub const MESSAGE_TYPE: &str = "X-Gateway-MessageType";
/// Heartbeat flag header.
pub const HEARTBEAT: &str = "X-Gateway-Heartbeat";
/// Oneway flag header.
pub const ONEWAY: &str = "X-Gateway-Oneway";
/// Message status header.
pub const MESSAGE_STATUS_TYPE: &str = "X-Gateway-MessageStatusType";
/// Serializer id header.
pub const SERIALIZE_TYPE: &str = "X-Gateway-SerializeType";
/// Sequence number header.
pub const MESSAGE_ID: &str = "X-Gateway-MessageID";
/// Service path header.
pub const SERVICE_PATH: &str = "X-Gateway-ServicePath";
/// Service method header.
pub const SERVICE_METHOD: &str = "X-Gateway-ServiceMethod";
/// URL-encoded metadata header.
pub const META: &str = "X-Gateway-Meta";
/// Error message header.
pub const ERROR_MESSAGE: &str = "X-Gateway-ErrorMessage";

/// Converts a response message into gateway headers plus the undecoded
/// payload.
#[must_use]
pub fn convert_response(res: &Message) -> (HashMap<String, String>, Vec<u8>) {
    let mut headers = HashMap::new();

    headers.insert(VERSION.to_string(), res.header.version().to_string());
    if res.header.is_heartbeat() {
        headers.insert(HEARTBEAT.to_string(), "true".to_string());
    }
    if res.header.is_oneway() {
        headers.insert(ONEWAY.to_string(), "true".to_string());
    }
    let status = match res.header.message_status() {
        MessageStatus::Error => "Error",
        MessageStatus::Normal => "Normal",
    };
    headers.insert(MESSAGE_STATUS_TYPE.to_string(), status.to_string());
    if res.header.compress_type() == Some(CompressType::Gzip) {
        headers.insert("Content-Encoding".to_string(), "gzip".to_string());
    }

    headers.insert(META.to_string(), urlencode(&res.metadata));
    headers.insert(
        SERIALIZE_TYPE.to_string(),
        res.header.serialize_type_bits().to_string(),
    );
    headers.insert(MESSAGE_ID.to_string(), res.header.seq().to_string());
    headers.insert(SERVICE_PATH.to_string(), res.service_path.clone());
    headers.insert(SERVICE_METHOD.to_string(), res.service_method.clone());

    (headers, res.payload.clone())
}

/// Encodes metadata as an `application/x-www-form-urlencoded` query
/// string.
#[must_use]
pub fn urlencode(metadata: &HashMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in metadata {
        if !out.is_empty() {
            out.push('&');
        }
        percent_encode_into(&mut out, key);
        out.push('=');
        percent_encode_into(&mut out, value);
    }
    out
}

fn percent_encode_into(out: &mut String, text: &str) {
    for byte in text.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            other => {
                out.push('%');
                out.push_str(&format!("{other:02X}"));
            }
        }
    }
}
