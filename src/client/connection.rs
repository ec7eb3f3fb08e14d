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

//! Client-side dialing.
//!
//! Establishes the transport for a client connection: plain TCP, TLS over
//! TCP, Unix-domain sockets, or the HTTP `CONNECT` upgrade. All dials are
//! bounded by the configured connect timeout.

use super::client::ClientOptions;
use crate::error::Error;
use crate::transport::{self, BoxedStream};
use std::io;
use tokio::net::{TcpStream, UnixStream};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::error;

pub(crate) async fn dial(
    network: &str,
    address: &str,
    opts: &ClientOptions,
) -> Result<BoxedStream, Error> {
    match network {
        "tcp" | "tcp4" | "tcp6" => dial_tcp(address, opts, false).await,
        "http" => dial_tcp(address, opts, true).await,
        "unix" => dial_unix(address, opts).await,
        other => Err(Error::UnsupportedNetwork(other.to_string())),
    }
    .inspect_err(|err| error!(network, address, error = %err, "failed to dial server"))
}

async fn dial_tcp(
    address: &str,
    opts: &ClientOptions,
    http_upgrade: bool,
) -> Result<BoxedStream, Error> {
    let tcp = with_connect_timeout(opts, TcpStream::connect(address)).await?;
    if let Err(err) = transport::set_keepalive(&tcp) {
        tracing::debug!(error = %err, "failed to enable TCP keepalive");
    }

    let mut stream: BoxedStream = match &opts.tls {
        Some(tls) => {
            let connector = TlsConnector::from(tls.config.clone());
            let connected = with_connect_timeout(
                opts,
                connector.connect(tls.server_name.clone(), tcp),
            )
            .await?;
            Box::new(connected)
        }
        None => Box::new(tcp),
    };

    if http_upgrade {
        transport::http_connect(&mut stream, &opts.rpc_path).await?;
    }

    Ok(stream)
}

async fn dial_unix(address: &str, opts: &ClientOptions) -> Result<BoxedStream, Error> {
    let stream = with_connect_timeout(opts, UnixStream::connect(address)).await?;
    Ok(Box::new(stream))
}

async fn with_connect_timeout<T>(
    opts: &ClientOptions,
    fut: impl std::future::Future<Output = io::Result<T>>,
) -> Result<T, Error> {
    if opts.connect_timeout.is_zero() {
        return fut.await.map_err(Error::Io);
    }
    match timeout(opts.connect_timeout, fut).await {
        Ok(result) => result.map_err(Error::Io),
        Err(_) => Err(Error::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            "connect timed out",
        ))),
    }
}
