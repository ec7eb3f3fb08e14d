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

//! Transport abstraction shared by the client and the server.
//!
//! Connections are plain bi-directional byte streams behind the
//! [`AsyncStream`] seam; the framing layer neither knows nor cares whether
//! bytes travel over TCP, TLS, a Unix socket, or an HTTP-upgraded
//! connection.

use crate::error::Error;
use rustls::pki_types::ServerName;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Default path used by the HTTP `CONNECT` upgrade.
pub const DEFAULT_RPC_PATH: &str = "/_mrpc_";

/// Status line body exchanged during the HTTP upgrade.
pub(crate) const CONNECTED: &str = "200 Connected to mrpc";

/// Idle time before TCP keepalive probes start.
const KEEPALIVE_TIME: Duration = Duration::from_secs(180);

/// Upper bound on the HTTP upgrade preamble.
const MAX_HANDSHAKE_LEN: usize = 4096;

/// A bi-directional async byte stream usable as an RPC connection.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

impl std::fmt::Debug for dyn AsyncStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn AsyncStream").finish_non_exhaustive()
    }
}

/// An owned, type-erased connection.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Client-side TLS parameters.
///
/// Certificate and root-store loading stay with the caller; the framework
/// only consumes a ready-made config.
#[derive(Clone)]
pub struct TlsConnect {
    /// The rustls client configuration.
    pub config: Arc<rustls::ClientConfig>,
    /// Server name presented for SNI and certificate validation.
    pub server_name: ServerName<'static>,
}

impl std::fmt::Debug for TlsConnect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnect")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

/// Enables keepalive probing on an idle TCP connection.
pub(crate) fn set_keepalive(stream: &TcpStream) -> io::Result<()> {
    let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE_TIME);
    socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Performs the client half of the HTTP `CONNECT` upgrade.
///
/// Writes `CONNECT <path> HTTP/1.0` and requires the `200 Connected`
/// status in return; after that the stream carries the binary protocol.
pub(crate) async fn http_connect<S>(stream: &mut S, path: &str) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(format!("CONNECT {path} HTTP/1.0\n\n").as_bytes())
        .await?;
    stream.flush().await?;

    let head = read_preamble(stream).await?;
    let status_line = head.lines().next().unwrap_or_default();
    let status = status_line
        .strip_prefix("HTTP/1.0 ")
        .or_else(|| status_line.strip_prefix("HTTP/1.1 "))
        .unwrap_or(status_line);

    if status.trim() == CONNECTED {
        Ok(())
    } else {
        Err(Error::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected HTTP response: {status_line}"),
        )))
    }
}

/// Performs the server half of the HTTP `CONNECT` upgrade.
///
/// Non-`CONNECT` requests receive `405 Method Not Allowed` and fail the
/// handshake.
pub(crate) async fn http_accept<S>(stream: &mut S) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let head = read_preamble(stream).await?;
    let request_line = head.lines().next().unwrap_or_default();

    if !request_line.starts_with("CONNECT ") {
        stream
            .write_all(b"HTTP/1.0 405 Method Not Allowed\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n405 must CONNECT\n")
            .await?;
        stream.flush().await?;
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("rejected non-CONNECT request: {request_line}"),
        )));
    }

    stream
        .write_all(format!("HTTP/1.0 {CONNECTED}\n\n").as_bytes())
        .await?;
    stream.flush().await?;
    Ok(())
}

/// Reads the HTTP preamble up to and including the blank line.
///
/// Reads one byte at a time so no protocol bytes past the preamble are
/// consumed.
async fn read_preamble<S>(stream: &mut S) -> Result<String, Error>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        stream.read_exact(&mut byte).await.map_err(Error::Io)?;
        head.push(byte[0]);

        if head.ends_with(b"\n\n") || head.ends_with(b"\r\n\r\n") {
            break;
        }
        if head.len() > MAX_HANDSHAKE_LEN {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "HTTP preamble too long",
            )));
        }
    }

    String::from_utf8(head).map_err(|_| {
        Error::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            "HTTP preamble is not valid UTF-8",
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_http_upgrade_handshake() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let server_side = tokio::spawn(async move {
            http_accept(&mut server).await.expect("accept upgrade");
            server
        });

        http_connect(&mut client, DEFAULT_RPC_PATH)
            .await
            .expect("connect upgrade");

        // The stream must be clean after the handshake: bytes written now
        // arrive unmangled.
        let mut server = server_side.await.unwrap();
        client.write_all(b"binary follows").await.unwrap();
        let mut buf = [0u8; 14];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"binary follows");
    }

    #[tokio::test]
    async fn test_http_upgrade_rejects_get() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let server_side = tokio::spawn(async move { http_accept(&mut server).await });

        client
            .write_all(b"GET /_mrpc_ HTTP/1.0\n\n")
            .await
            .unwrap();
        assert!(server_side.await.unwrap().is_err());

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.contains("405"));
    }

    #[tokio::test]
    async fn test_http_connect_rejects_bad_status() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        tokio::spawn(async move {
            let mut head = Vec::new();
            let mut byte = [0u8; 1];
            loop {
                server.read_exact(&mut byte).await.unwrap();
                head.push(byte[0]);
                if head.ends_with(b"\n\n") {
                    break;
                }
            }
            server
                .write_all(b"HTTP/1.0 503 Service Unavailable\n\n")
                .await
                .unwrap();
        });

        let err = http_connect(&mut client, DEFAULT_RPC_PATH)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unexpected HTTP response"));
    }
}
