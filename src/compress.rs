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

//! Payload compression.
//!
//! Compression applies to whole payload sections, never to the stream:
//! a sender gzips the serialized payload when gzip is selected and the
//! payload exceeds [`COMPRESSION_THRESHOLD`]; a receiver decompresses
//! based solely on the header's compression field.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io;
use std::io::{Read, Write};

/// Serialized payloads at or below this size are sent uncompressed.
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// Gzip-compresses `data`.
///
/// # Errors
///
/// Returns the underlying I/O error if the encoder fails.
pub fn zip(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Decompresses gzip `data`.
///
/// # Errors
///
/// Returns the underlying I/O error if `data` is not a valid gzip stream.
pub fn unzip(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(64);
        let zipped = zip(&data).expect("zip");
        assert!(zipped.len() < data.len());
        let unzipped = unzip(&zipped).expect("unzip");
        assert_eq!(unzipped, data);
    }

    #[test]
    fn test_gzip_magic_bytes() {
        let zipped = zip(b"payload").expect("zip");
        assert_eq!(&zipped[..2], &[0x1F, 0x8B]);
    }

    #[test]
    fn test_unzip_rejects_garbage() {
        assert!(unzip(b"definitely not gzip").is_err());
    }
}
