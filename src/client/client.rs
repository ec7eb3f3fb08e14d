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

//! A connection to one RPC server.
//!
//! Each [`Client`] owns one transport connection. Outstanding calls live
//! in a pending table keyed by the connection's monotone sequence number;
//! a dedicated task runs the receive loop, matching response frames to
//! pending calls and failing all of them when the connection dies. A
//! request frame is always encoded in full and written in a single call
//! under the writer lock, so concurrent callers never interleave bytes.

use super::connection;
use super::plugin::ClientPluginContainer;
use crate::breaker::CircuitBreaker;
use crate::codec::{codec_for, Codec};
use crate::compress::{self, COMPRESSION_THRESHOLD};
use crate::context::Context;
use crate::error::Error;
use crate::gateway;
use crate::protocol::{
    pool, CompressType, Message, MessageStatus, MessageType, ProtocolError, SerializeType,
    SERVICE_ERROR_KEY,
};
use crate::transport::{BoxedStream, TlsConnect, DEFAULT_RPC_PATH};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Read buffer size for client-side connections.
const READER_BUFFER_SIZE: usize = 16 * 1024;

/// How long an unsolicited server message waits for the push channel.
const SERVER_PUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Client configuration.
///
/// The defaults follow the framework conventions: three retries,
/// a 10-second connect timeout, MessagePack payloads, no compression, and
/// a shared circuit breaker that admits five half-open probes, rolls its
/// window every 10 seconds, and stays open for 30 seconds.
#[derive(Clone)]
pub struct ClientOptions {
    /// Attempts made by fail-try and fail-over policies.
    pub retries: usize,
    /// Path used by the HTTP `CONNECT` upgrade.
    pub rpc_path: String,
    /// Bound on dial time. Zero disables the bound.
    pub connect_timeout: Duration,
    /// Per-frame receive deadline; firing tears the connection down.
    pub read_timeout: Option<Duration>,
    /// Per-frame send deadline.
    pub write_timeout: Option<Duration>,
    /// Breaker wrapped around every call. `None` disables breaking.
    pub breaker: Option<Arc<CircuitBreaker>>,
    /// Serializer for argument and reply payloads.
    pub serialize_type: SerializeType,
    /// Compression applied to payloads above the threshold.
    pub compress_type: CompressType,
    /// Enables the heartbeat task.
    pub heartbeat: bool,
    /// Interval between heartbeats.
    pub heartbeat_interval: Duration,
    /// Cap on accepted frame body length. Zero means unlimited.
    pub max_message_length: usize,
    /// TLS parameters for TCP-family dials.
    pub tls: Option<TlsConnect>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            retries: 3,
            rpc_path: DEFAULT_RPC_PATH.to_string(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: None,
            write_timeout: None,
            breaker: Some(Arc::new(default_client_breaker())),
            serialize_type: SerializeType::MsgPack,
            compress_type: CompressType::None,
            heartbeat: false,
            heartbeat_interval: Duration::from_secs(3),
            max_message_length: 0,
            tls: None,
        }
    }
}

/// The breaker installed by [`ClientOptions::default`].
#[must_use]
pub fn default_client_breaker() -> CircuitBreaker {
    CircuitBreaker::builder()
        .name("client-default")
        .max_requests(5)
        .interval(Duration::from_secs(10))
        .timeout(Duration::from_secs(30))
        .build()
}

#[derive(Default)]
struct Shared {
    seq: u64,
    pending: HashMap<u64, PendingCall>,
    closing: bool,
    shutdown: bool,
}

struct PendingCall {
    tx: oneshot::Sender<Result<Message, Error>>,
}

struct ClientInner {
    opts: ClientOptions,
    shared: Mutex<Shared>,
    writer: tokio::sync::Mutex<WriteHalf<BoxedStream>>,
    server_push: Mutex<Option<mpsc::Sender<Message>>>,
    plugins: Arc<ClientPluginContainer>,
}

/// A connection-scoped RPC client.
///
/// Cheaply cloneable; all clones share the connection, the pending table,
/// and the sequence counter.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct CallHandle {
    seq: u64,
    rx: oneshot::Receiver<Result<Message, Error>>,
}

impl Client {
    /// Dials `address` over `network` and spawns the receive loop.
    ///
    /// `network` is one of `tcp`, `tcp4`, `tcp6`, `unix`, or `http`.
    ///
    /// # Errors
    ///
    /// Returns the dial or handshake error.
    pub async fn connect(
        network: &str,
        address: &str,
        opts: ClientOptions,
    ) -> Result<Self, Error> {
        Self::connect_with_plugins(network, address, opts, Arc::default()).await
    }

    pub(crate) async fn connect_with_plugins(
        network: &str,
        address: &str,
        opts: ClientOptions,
        plugins: Arc<ClientPluginContainer>,
    ) -> Result<Self, Error> {
        let stream = connection::dial(network, address, &opts).await?;
        let (read_half, write_half) = tokio::io::split(stream);
        let reader = BufReader::with_capacity(READER_BUFFER_SIZE, read_half);

        let heartbeat = opts.heartbeat && !opts.heartbeat_interval.is_zero();
        let inner = Arc::new(ClientInner {
            opts,
            shared: Mutex::new(Shared::default()),
            writer: tokio::sync::Mutex::new(write_half),
            server_push: Mutex::new(None),
            plugins,
        });

        tokio::spawn(receive_loop(Arc::clone(&inner), reader));

        let client = Self { inner };
        if heartbeat {
            tokio::spawn(heartbeat_loop(client.clone()));
        }
        Ok(client)
    }

    /// Returns `true` after a local [`close`](Self::close).
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.inner.shared.lock().closing
    }

    /// Returns `true` once the receive loop has terminated.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.shared.lock().shutdown
    }

    /// Registers the channel that receives unsolicited server-to-client
    /// requests (oneway frames with the request kind).
    pub fn register_server_message_channel(&self, sender: mpsc::Sender<Message>) {
        *self.inner.server_push.lock() = Some(sender);
    }

    /// Removes the server message channel.
    pub fn unregister_server_message_channel(&self) {
        *self.inner.server_push.lock() = None;
    }

    /// Invokes `service_path.service_method` and decodes the reply.
    ///
    /// Request metadata is taken from `ctx`; response metadata is merged
    /// back into it. `ctx`'s deadline bounds the wait, and dropping the
    /// returned future removes the pending entry so a late response is
    /// discarded.
    ///
    /// # Errors
    ///
    /// [`Error::Service`] for failures raised by the remote handler,
    /// breaker rejections when the target is unhealthy, and transport or
    /// codec errors otherwise.
    pub async fn call<A, R>(
        &self,
        ctx: &Context,
        service_path: &str,
        service_method: &str,
        args: &A,
    ) -> Result<R, Error>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        match self.inner.opts.breaker.clone() {
            Some(breaker) => {
                breaker
                    .execute(|| self.call_inner(ctx, service_path, service_method, args))
                    .await
            }
            None => self.call_inner(ctx, service_path, service_method, args).await,
        }
    }

    /// Sends a oneway request: no response is expected or delivered.
    ///
    /// # Errors
    ///
    /// Encode and transport errors; remote failures are invisible.
    pub async fn notify<A>(
        &self,
        ctx: &Context,
        service_path: &str,
        service_method: &str,
        args: &A,
    ) -> Result<(), Error>
    where
        A: Serialize + ?Sized,
    {
        let payload = self.encode_args(args)?;
        self.send_request(ctx, service_path, service_method, Some(payload), true)
            .await?;
        Ok(())
    }

    /// Sends one heartbeat and waits for its echo.
    ///
    /// # Errors
    ///
    /// Transport errors, breaker rejections, or the context deadline.
    pub async fn heartbeat(&self) -> Result<(), Error> {
        match self.inner.opts.breaker.clone() {
            Some(breaker) => breaker.execute(|| self.heartbeat_inner()).await,
            None => self.heartbeat_inner().await,
        }
    }

    /// Sends a pre-encoded message and returns the raw response: a map
    /// of header-derived gateway fields plus the undecoded payload.
    ///
    /// The message's own sequence number keys the pending table, so the
    /// caller must keep it unique per connection. When the response
    /// carries an error status, its text is placed under the
    /// [`gateway::ERROR_MESSAGE`] key instead of failing the call, which
    /// is the contract gateway integrators expect.
    ///
    /// # Errors
    ///
    /// Transport errors and the context deadline.
    pub async fn send_raw(
        &self,
        ctx: &Context,
        req: &Message,
    ) -> Result<(HashMap<String, String>, Vec<u8>), Error> {
        let seq = req.header.seq();
        let rx = {
            let mut shared = self.inner.shared.lock();
            if shared.closing || shared.shutdown {
                return Err(Error::Shutdown);
            }
            let (tx, rx) = oneshot::channel();
            shared.pending.insert(seq, PendingCall { tx });
            rx
        };

        if let Err(err) = self.inner.plugins.do_pre_write_request(req) {
            self.remove_pending(seq);
            return Err(err);
        }
        match self.write_frame(&req.encode()).await {
            Ok(()) => self.inner.plugins.do_post_write_request(req, None),
            Err(err) => {
                self.inner.plugins.do_post_write_request(req, Some(&err));
                self.remove_pending(seq);
                return Err(err);
            }
        }

        if req.header.is_oneway() {
            self.remove_pending(seq);
            return Ok((HashMap::new(), Vec::new()));
        }

        let res = self.wait_reply(ctx, CallHandle { seq, rx }).await?;
        let error_text = (res.header.message_status() == MessageStatus::Error).then(|| {
            res.metadata
                .get(SERVICE_ERROR_KEY)
                .cloned()
                .unwrap_or_default()
        });
        let (mut headers, payload) = gateway::convert_response(&res);
        pool::put(res);
        if let Some(text) = error_text {
            headers.insert(gateway::ERROR_MESSAGE.to_string(), text);
        }
        Ok((headers, payload))
    }

    /// Closes the connection: fails every pending call with
    /// [`Error::Shutdown`] and shuts the write half down.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`] if the client was already closed.
    pub async fn close(&self) -> Result<(), Error> {
        let (already_closed, pending) = {
            let mut shared = self.inner.shared.lock();
            let pending: Vec<PendingCall> = shared.pending.drain().map(|(_, call)| call).collect();
            let already_closed = shared.closing || shared.shutdown;
            shared.closing = true;
            (already_closed, pending)
        };

        for call in pending {
            let _ = call.tx.send(Err(Error::Shutdown));
        }

        if already_closed {
            return Err(Error::Shutdown);
        }

        let mut writer = self.inner.writer.lock().await;
        writer.shutdown().await.map_err(Error::Io)
    }

    async fn call_inner<A, R>(
        &self,
        ctx: &Context,
        service_path: &str,
        service_method: &str,
        args: &A,
    ) -> Result<R, Error>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let payload = self.encode_args(args)?;
        let handle = self
            .send_request(ctx, service_path, service_method, Some(payload), false)
            .await?
            .expect("two-way requests always register a pending call");
        let res = self.wait_reply(ctx, handle).await?;
        self.process_reply(ctx, res)
    }

    async fn heartbeat_inner(&self) -> Result<(), Error> {
        let ctx = Context::new();
        let handle = self
            .send_request(&ctx, "", "", None, false)
            .await?
            .expect("two-way requests always register a pending call");
        let res = self.wait_reply(&ctx, handle).await?;
        pool::put(res);
        Ok(())
    }

    fn encode_args<A>(&self, args: &A) -> Result<(Vec<u8>, CompressType), Error>
    where
        A: Serialize + ?Sized,
    {
        let codec = codec_for(self.inner.opts.serialize_type);
        let data = codec.encode(args)?;

        if self.inner.opts.compress_type == CompressType::Gzip
            && data.len() > COMPRESSION_THRESHOLD
        {
            let zipped = compress::zip(&data).map_err(Error::Io)?;
            Ok((zipped, CompressType::Gzip))
        } else {
            Ok((data, CompressType::None))
        }
    }

    /// Assigns the next sequence number, registers the pending call (for
    /// two-way requests), and writes the frame. `payload == None` sends a
    /// heartbeat.
    async fn send_request(
        &self,
        ctx: &Context,
        service_path: &str,
        service_method: &str,
        payload: Option<(Vec<u8>, CompressType)>,
        oneway: bool,
    ) -> Result<Option<CallHandle>, Error> {
        let (seq, rx) = {
            let mut shared = self.inner.shared.lock();
            if shared.closing || shared.shutdown {
                return Err(Error::Shutdown);
            }
            let seq = shared.seq;
            shared.seq += 1;
            if oneway {
                (seq, None)
            } else {
                let (tx, rx) = oneshot::channel();
                shared.pending.insert(seq, PendingCall { tx });
                (seq, Some(rx))
            }
        };

        let mut req = pool::get();
        req.header.set_message_type(MessageType::Request);
        req.header.set_seq(seq);
        req.header.set_oneway(oneway);
        match payload {
            None => req.header.set_heartbeat(true),
            Some((data, compress)) => {
                req.header
                    .set_serialize_type(self.inner.opts.serialize_type);
                req.header.set_compress_type(compress);
                req.service_path = service_path.to_string();
                req.service_method = service_method.to_string();
                if !ctx.metadata().is_empty() {
                    req.metadata = ctx.metadata().clone();
                }
                req.payload = data;
            }
        }

        if let Err(err) = self.inner.plugins.do_pre_write_request(&req) {
            pool::put(req);
            self.remove_pending(seq);
            return Err(err);
        }

        let frame = req.encode();
        match self.write_frame(&frame).await {
            Ok(()) => {
                self.inner.plugins.do_post_write_request(&req, None);
                pool::put(req);
            }
            Err(err) => {
                self.inner.plugins.do_post_write_request(&req, Some(&err));
                pool::put(req);
                self.remove_pending(seq);
                return Err(err);
            }
        }

        Ok(rx.map(|rx| CallHandle { seq, rx }))
    }

    /// Writes one full frame in a single call under the writer lock.
    async fn write_frame(&self, frame: &[u8]) -> Result<(), Error> {
        let mut writer = self.inner.writer.lock().await;
        let write = async {
            writer.write_all(frame).await?;
            writer.flush().await
        };
        let result = match self.inner.opts.write_timeout {
            Some(deadline) => timeout(deadline, write).await.unwrap_or_else(|_| {
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "write deadline exceeded",
                ))
            }),
            None => write.await,
        };
        result.map_err(Error::Io)
    }

    async fn wait_reply(&self, ctx: &Context, handle: CallHandle) -> Result<Message, Error> {
        let CallHandle { seq, mut rx } = handle;
        let mut guard = PendingGuard {
            inner: Arc::clone(&self.inner),
            seq,
            armed: true,
        };

        let outcome = match ctx.deadline() {
            Some(deadline) => tokio::select! {
                outcome = &mut rx => outcome,
                _ = tokio::time::sleep_until(deadline.into()) => {
                    // The guard removes the pending entry on drop, so a
                    // late response is discarded.
                    return Err(Error::DeadlineExceeded);
                }
            },
            None => rx.await,
        };
        guard.armed = false;

        match outcome {
            Ok(result) => result,
            Err(_) => Err(Error::Shutdown),
        }
    }

    fn process_reply<R>(&self, ctx: &Context, mut res: Message) -> Result<R, Error>
    where
        R: DeserializeOwned,
    {
        ctx.merge_response_metadata(&res.metadata);

        if res.header.message_status() == MessageStatus::Error {
            let reason = res
                .metadata
                .get(SERVICE_ERROR_KEY)
                .cloned()
                .unwrap_or_else(|| "unknown service error".to_string());
            pool::put(res);
            return Err(Error::Service(reason));
        }

        let mut payload = std::mem::take(&mut res.payload);
        let compress_type = res.header.compress_type();
        let serialize_bits = res.header.serialize_type_bits();
        let serialize_type = res.header.serialize_type();
        pool::put(res);

        match compress_type {
            Some(CompressType::None) => {}
            Some(CompressType::Gzip) => {
                payload = compress::unzip(&payload)
                    .map_err(|err| Error::Service(format!("unzip payload: {err}")))?;
            }
            None => {
                return Err(Error::Service("unsupported compression type".to_string()));
            }
        }

        let Some(st) = serialize_type else {
            return Err(Error::Service(
                Error::UnsupportedCodec(serialize_bits).to_string(),
            ));
        };
        codec_for(st)
            .decode(&payload)
            .map_err(|err| Error::Service(format!("decode payload: {err}")))
    }

    fn remove_pending(&self, seq: u64) {
        self.inner.shared.lock().pending.remove(&seq);
    }

    /// Returns `true` if both handles share one connection.
    pub(crate) fn ptr_eq(&self, other: &Client) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.inner.shared.lock().pending.len()
    }
}

struct PendingGuard {
    inner: Arc<ClientInner>,
    seq: u64,
    armed: bool,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.armed {
            self.inner.shared.lock().pending.remove(&self.seq);
        }
    }
}

enum TerminalError {
    Shutdown,
    UnexpectedEof,
    Io(io::ErrorKind, String),
    Protocol(String),
}

impl TerminalError {
    fn to_error(&self) -> Error {
        match self {
            Self::Shutdown => Error::Shutdown,
            Self::UnexpectedEof => Error::UnexpectedEof,
            Self::Io(kind, message) => Error::Io(io::Error::new(*kind, message.clone())),
            Self::Protocol(message) => Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                message.clone(),
            )),
        }
    }
}

async fn receive_loop(inner: Arc<ClientInner>, mut reader: BufReader<ReadHalf<BoxedStream>>) {
    let terminal = loop {
        let mut res = pool::get();
        let decoded = match inner.opts.read_timeout {
            Some(deadline) => {
                match timeout(deadline, res.decode(&mut reader, inner.opts.max_message_length))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ProtocolError::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "read deadline exceeded",
                    ))),
                }
            }
            None => res.decode(&mut reader, inner.opts.max_message_length).await,
        };

        if let Err(err) = decoded {
            pool::put(res);
            break classify_terminal(&inner, err);
        }

        // Unsolicited server-to-client request: forward, don't correlate.
        let is_server_message = res.header.message_type() == MessageType::Request
            && !res.header.is_heartbeat()
            && res.header.is_oneway();
        if is_server_message {
            forward_server_message(&inner, res);
            continue;
        }

        let seq = res.header.seq();
        let call = inner.shared.lock().pending.remove(&seq);
        match call {
            Some(call) => {
                let _ = call.tx.send(Ok(res));
            }
            None => pool::put(res),
        }
    };

    let pending: Vec<PendingCall> = {
        let mut shared = inner.shared.lock();
        shared.shutdown = true;
        shared.pending.drain().map(|(_, call)| call).collect()
    };
    for call in pending {
        let _ = call.tx.send(Err(terminal.to_error()));
    }

    match &terminal {
        TerminalError::Shutdown => debug!("client connection closed"),
        other => warn!(error = %other.to_error(), "client connection terminated"),
    }
}

fn classify_terminal(inner: &ClientInner, err: ProtocolError) -> TerminalError {
    if inner.shared.lock().closing {
        return TerminalError::Shutdown;
    }
    match err {
        ProtocolError::Io(io_err) if io_err.kind() == io::ErrorKind::UnexpectedEof => {
            TerminalError::UnexpectedEof
        }
        ProtocolError::Io(io_err) => TerminalError::Io(io_err.kind(), io_err.to_string()),
        other => TerminalError::Protocol(other.to_string()),
    }
}

fn forward_server_message(inner: &Arc<ClientInner>, msg: Message) {
    let Some(sender) = inner.server_push.lock().clone() else {
        pool::put(msg);
        return;
    };

    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        match sender.send_timeout(msg, SERVER_PUSH_TIMEOUT).await {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(msg)) => {
                warn!(
                    seq = msg.header.seq(),
                    "server message channel is full; request dropped"
                );
                pool::put(msg);
            }
            Err(SendTimeoutError::Closed(msg)) => {
                warn!("server message channel is closed; unregistering it");
                *inner.server_push.lock() = None;
                pool::put(msg);
            }
        }
    });
}

async fn heartbeat_loop(client: Client) {
    let interval = client.inner.opts.heartbeat_interval;
    loop {
        tokio::time::sleep(interval).await;
        if client.is_closing() || client.is_shutdown() {
            break;
        }
        if let Err(err) = client.heartbeat().await {
            warn!(error = %err, "client heartbeat failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Accepts one connection and reads forever without replying.
    async fn silent_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut sink = vec![0u8; 4096];
            while stream.read(&mut sink).await.is_ok_and(|n| n > 0) {}
        });
        addr
    }

    #[tokio::test]
    async fn test_deadline_removes_pending_entry() {
        let addr = silent_server().await;
        let client = Client::connect("tcp", &addr.to_string(), ClientOptions::default())
            .await
            .expect("connect");

        let ctx = Context::new().with_timeout(Duration::from_millis(50));
        let err = client
            .call::<_, String>(&ctx, "Echo", "Say", &"hi".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded));
        assert_eq!(client.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_sequence_numbers_are_monotone() {
        let addr = silent_server().await;
        let client = Client::connect("tcp", &addr.to_string(), ClientOptions::default())
            .await
            .expect("connect");

        for _ in 0..3 {
            let ctx = Context::new();
            client
                .notify(&ctx, "Log", "Append", &"entry".to_string())
                .await
                .expect("notify");
        }
        assert_eq!(client.inner.shared.lock().seq, 3);
        // Oneway requests never leave a pending entry behind.
        assert_eq!(client.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_is_sticky() {
        let addr = silent_server().await;
        let client = Client::connect("tcp", &addr.to_string(), ClientOptions::default())
            .await
            .expect("connect");

        let pending_call = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call::<_, String>(&Context::new(), "Echo", "Say", &"hi".to_string())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        client.close().await.expect("first close");
        let err = pending_call.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Shutdown));
        assert!(client.is_closing());

        let err = client.close().await.unwrap_err();
        assert!(matches!(err, Error::Shutdown));
    }

    #[tokio::test]
    async fn test_calls_after_close_are_rejected() {
        let addr = silent_server().await;
        let client = Client::connect("tcp", &addr.to_string(), ClientOptions::default())
            .await
            .expect("connect");
        client.close().await.expect("close");

        let err = client
            .call::<_, String>(&Context::new(), "Echo", "Say", &"hi".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Shutdown));
    }

    #[tokio::test]
    async fn test_server_disconnect_fails_pending_with_unexpected_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(stream);
        });

        let mut opts = ClientOptions::default();
        opts.breaker = None;
        let client = Client::connect("tcp", &addr.to_string(), opts)
            .await
            .expect("connect");

        let err = client
            .call::<_, String>(&Context::new(), "Echo", "Say", &"hi".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnexpectedEof), "{err}");
        assert!(client.is_shutdown());
    }
}
