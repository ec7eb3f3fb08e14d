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

//! Listener factory.
//!
//! Supported networks: `tcp`, `tcp4`, `tcp6`, `unix`, `http` (TCP with a
//! per-connection `CONNECT` upgrade), and `reuseport` (TCP with
//! `SO_REUSEPORT`, letting several processes share one port). When a TLS
//! config is present, accepted connections are wrapped after accept; the
//! handshake runs on the connection task so a slow peer cannot stall the
//! accept loop.

use crate::error::Error;
use crate::transport::{self, BoxedStream};
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio_rustls::TlsAcceptor;

pub(crate) enum RawConn {
    Tcp(TcpStream, SocketAddr),
    Unix(UnixStream),
}

#[derive(Debug)]
enum ListenerKind {
    Tcp(TcpListener),
    Unix(UnixListener),
}

pub(crate) struct BoundListener {
    kind: ListenerKind,
    pub(crate) tls: Option<TlsAcceptor>,
    pub(crate) http_upgrade: bool,
}

impl fmt::Debug for BoundListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundListener")
            .field("kind", &self.kind)
            .field("tls", &self.tls.is_some())
            .field("http_upgrade", &self.http_upgrade)
            .finish()
    }
}

impl BoundListener {
    pub(crate) async fn bind(
        network: &str,
        address: &str,
        tls: Option<TlsAcceptor>,
    ) -> Result<Self, Error> {
        let (kind, http_upgrade) = match network {
            "tcp" | "tcp4" | "tcp6" => (ListenerKind::Tcp(TcpListener::bind(address).await?), false),
            "http" => (ListenerKind::Tcp(TcpListener::bind(address).await?), true),
            "reuseport" => (ListenerKind::Tcp(bind_reuseport(address)?), false),
            "unix" => (ListenerKind::Unix(UnixListener::bind(address)?), false),
            other => return Err(Error::UnsupportedNetwork(other.to_string())),
        };

        Ok(Self {
            kind,
            tls,
            http_upgrade,
        })
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        match &self.kind {
            ListenerKind::Tcp(listener) => listener.local_addr().ok(),
            ListenerKind::Unix(_) => None,
        }
    }

    pub(crate) async fn accept(&self) -> io::Result<RawConn> {
        match &self.kind {
            ListenerKind::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok(RawConn::Tcp(stream, peer))
            }
            ListenerKind::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(RawConn::Unix(stream))
            }
        }
    }
}

/// Upgrades a raw connection into a framed-protocol-ready stream: TCP
/// keepalive, optional TLS handshake, optional HTTP `CONNECT` upgrade.
pub(crate) async fn prepare_conn(
    raw: RawConn,
    tls: Option<TlsAcceptor>,
    http_upgrade: bool,
) -> Result<(BoxedStream, Option<SocketAddr>), Error> {
    let (mut stream, peer): (BoxedStream, Option<SocketAddr>) = match raw {
        RawConn::Tcp(tcp, peer) => {
            if let Err(err) = transport::set_keepalive(&tcp) {
                tracing::debug!(error = %err, "failed to enable TCP keepalive");
            }
            match tls {
                Some(acceptor) => (Box::new(acceptor.accept(tcp).await?), Some(peer)),
                None => (Box::new(tcp), Some(peer)),
            }
        }
        RawConn::Unix(unix) => (Box::new(unix), None),
    };

    if http_upgrade {
        transport::http_accept(&mut stream).await?;
    }

    Ok((stream, peer))
}

fn bind_reuseport(address: &str) -> Result<TcpListener, Error> {
    let addr: SocketAddr = address
        .parse()
        .map_err(|_| Error::UnsupportedNetwork(format!("reuseport requires a socket address, got {address}")))?;

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    TcpListener::from_std(socket.into()).map_err(Error::Io)
}
