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

//! The request-dispatch engine.
//!
//! One task runs the accept loop per listener. Each accepted connection
//! gets its own task running the read loop, and every decoded request is
//! dispatched on its own task, so a slow handler never blocks the
//! connection. Handlers run under a panic guard; a panic becomes a
//! service error on the wire.
//!
//! Responses are encoded into one contiguous buffer and written in a
//! single call while holding the connection's writer lock, so concurrent
//! dispatch tasks never interleave frame bytes.

mod listener;
mod plugin;
mod service;

pub use plugin::{Accepted, PluginContainer, ServerPlugin};
pub use service::{HandlerError, Service};

use crate::compress::{self, COMPRESSION_THRESHOLD};
use crate::context::Context;
use crate::error::Error;
use crate::protocol::{
    pool, CompressType, Message, MessageStatus, MessageType, ProtocolError, AUTH_KEY,
    SERVICE_ERROR_KEY,
};
use crate::transport::BoxedStream;
use futures::FutureExt;
use listener::{BoundListener, RawConn};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use service::make_handler;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader, WriteHalf};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Read buffer size for server-side connections.
const READER_BUFFER_SIZE: usize = 1024;

/// First backoff delay after a transient accept failure.
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);

/// Backoff cap for transient accept failures.
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Authentication hook: receives the request context, the raw request,
/// and the value of the `__AUTH` metadata key.
pub type AuthFn = Arc<dyn Fn(&Context, &Message, Option<&str>) -> Result<(), Error> + Send + Sync>;

type WriterHandle = Arc<tokio::sync::Mutex<WriteHalf<BoxedStream>>>;

struct Inner {
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    max_message_length: usize,
    tls: Option<Arc<rustls::ServerConfig>>,
    services: RwLock<HashMap<String, Service>>,
    plugins: PluginContainer,
    auth: Option<AuthFn>,
    started: AtomicBool,
    closed: AtomicBool,
    done: watch::Sender<bool>,
    local_addr: Mutex<Option<SocketAddr>>,
    on_shutdown: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

/// The RPC server.
///
/// Cheaply cloneable; all clones share the same listener state, service
/// registry, and plugin pipeline.
///
/// # Examples
///
/// ```no_run
/// use mrpc::server::{Server, Service};
/// use mrpc::Context;
///
/// # async fn example() -> Result<(), mrpc::Error> {
/// let server = Server::builder().build();
/// server.register_fn("", "Echo", |_ctx: Context, text: String| async move {
///     Ok::<_, mrpc::Error>(text)
/// })?;
/// server.serve("tcp", "127.0.0.1:8972").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl Server {
    /// Creates a builder with default settings.
    #[must_use]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// Registers a service under its own name.
    ///
    /// # Errors
    ///
    /// Fails if serving has already begun, if the name is empty or
    /// duplicate, or if a registration hook rejects the service.
    pub fn register(&self, service: Service) -> Result<(), Error> {
        self.register_with_metadata(service, "")
    }

    /// Registers a service, passing `metadata` to registration hooks so
    /// discovery plugins can publish it (for example `weight=4`).
    ///
    /// # Errors
    ///
    /// Same conditions as [`register`](Self::register).
    pub fn register_with_metadata(&self, service: Service, metadata: &str) -> Result<(), Error> {
        self.ensure_not_started()?;
        if service.name().is_empty() {
            return Err(Error::Registration("service name is empty".to_string()));
        }

        let name = service.name().to_string();
        let mut services = self.inner.services.write();
        if services.contains_key(&name) {
            return Err(Error::Registration(format!(
                "service {name} is already registered"
            )));
        }
        self.inner.plugins.do_register(&name, metadata)?;
        services.insert(name, service);
        Ok(())
    }

    /// Registers a free function under `service_path`.
    ///
    /// An empty `service_path` attaches the function to the default
    /// service. The method name must be supplied explicitly.
    ///
    /// # Errors
    ///
    /// Fails if serving has already begun, if `name` is empty, or if a
    /// registration hook rejects it.
    pub fn register_fn<A, R, E, F, Fut>(
        &self,
        service_path: &str,
        name: &str,
        f: F,
    ) -> Result<(), Error>
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: Into<HandlerError> + 'static,
        F: Fn(Context, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        self.ensure_not_started()?;
        if name.is_empty() {
            return Err(Error::Registration("function name is empty".to_string()));
        }

        let mut services = self.inner.services.write();
        self.inner.plugins.do_register(name, "")?;
        services
            .entry(service_path.to_string())
            .or_insert_with(|| Service::new(service_path))
            .insert_function(name.to_string(), make_handler(f));
        Ok(())
    }

    /// Returns the plugin pipeline.
    #[must_use]
    pub fn plugins(&self) -> &PluginContainer {
        &self.inner.plugins
    }

    /// Returns the bound address once [`serve`](Self::serve) has bound a
    /// TCP-family listener.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    /// Registers a callback invoked during graceful shutdown, before the
    /// listener and connections are signalled to close.
    pub fn register_on_shutdown<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.on_shutdown.lock().push(Box::new(f));
    }

    /// Binds a listener and serves until [`close`](Self::close) is
    /// called.
    ///
    /// `network` is one of `tcp`, `tcp4`, `tcp6`, `unix`, `http`, or
    /// `reuseport`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServerClosed`] after a graceful close, or the
    /// bind/accept error that stopped the loop.
    pub async fn serve(&self, network: &str, address: &str) -> Result<(), Error> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::ServerClosed);
        }

        let tls = self.inner.tls.clone().map(TlsAcceptor::from);
        let listener = BoundListener::bind(network, address, tls).await?;
        *self.inner.local_addr.lock() = listener.local_addr();
        self.inner.started.store(true, Ordering::SeqCst);
        info!(network, address, "serving");

        let mut done = self.inner.done.subscribe();
        let mut backoff: Option<Duration> = None;

        loop {
            let accepted = tokio::select! {
                _ = done.changed() => return Err(Error::ServerClosed),
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok(raw) => {
                    backoff = None;
                    let inner = Arc::clone(&self.inner);
                    let tls = listener.tls.clone();
                    let http_upgrade = listener.http_upgrade;
                    tokio::spawn(serve_conn(inner, raw, tls, http_upgrade));
                }
                Err(err) => {
                    if self.inner.closed.load(Ordering::SeqCst) {
                        return Err(Error::ServerClosed);
                    }
                    if !is_transient_accept_error(&err) {
                        return Err(err.into());
                    }
                    let delay = backoff
                        .map_or(ACCEPT_BACKOFF_MIN, |d| (d * 2).min(ACCEPT_BACKOFF_MAX));
                    backoff = Some(delay);
                    error!(error = %err, ?delay, "accept failed; retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Initiates graceful shutdown: runs the shutdown callbacks, stops
    /// the accept loop, and signals every connection's read loop to
    /// exit. In-flight dispatch tasks run to completion and write their
    /// responses, which may fail silently.
    ///
    /// Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let callbacks: Vec<_> = {
            let mut on_shutdown = self.inner.on_shutdown.lock();
            on_shutdown.drain(..).collect()
        };
        for callback in callbacks {
            callback();
        }

        let _ = self.inner.done.send(true);
    }

    fn ensure_not_started(&self) -> Result<(), Error> {
        if self.inner.started.load(Ordering::SeqCst) {
            Err(Error::Registration(
                "cannot register after serving begins".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

/// Builder for [`Server`].
#[derive(Default)]
pub struct ServerBuilder {
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    max_message_length: usize,
    tls: Option<Arc<rustls::ServerConfig>>,
    auth: Option<AuthFn>,
}

impl ServerBuilder {
    /// Sets the per-frame read deadline. When it fires, the connection is
    /// torn down and the client's pending calls fail.
    #[must_use]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Sets the per-frame write deadline.
    #[must_use]
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    /// Caps the accepted frame body length. Zero means unlimited.
    #[must_use]
    pub fn max_message_length(mut self, limit: usize) -> Self {
        self.max_message_length = limit;
        self
    }

    /// Serves TLS with the given config on TCP-family listeners.
    #[must_use]
    pub fn tls_config(mut self, config: Arc<rustls::ServerConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    /// Installs the authentication hook, invoked with the `__AUTH`
    /// metadata value of every request.
    #[must_use]
    pub fn auth_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context, &Message, Option<&str>) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.auth = Some(Arc::new(f));
        self
    }

    /// Builds the server.
    #[must_use]
    pub fn build(self) -> Server {
        let (done, _) = watch::channel(false);
        Server {
            inner: Arc::new(Inner {
                read_timeout: self.read_timeout,
                write_timeout: self.write_timeout,
                max_message_length: self.max_message_length,
                tls: self.tls,
                services: RwLock::new(HashMap::new()),
                plugins: PluginContainer::default(),
                auth: self.auth,
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                done,
                local_addr: Mutex::new(None),
                on_shutdown: Mutex::new(Vec::new()),
            }),
        }
    }
}

async fn serve_conn(
    inner: Arc<Inner>,
    raw: RawConn,
    tls: Option<TlsAcceptor>,
    http_upgrade: bool,
) {
    let (stream, peer) = match listener::prepare_conn(raw, tls, http_upgrade).await {
        Ok(prepared) => prepared,
        Err(err) => {
            warn!(error = %err, "connection setup failed");
            return;
        }
    };

    let Some(Accepted { stream, peer_addr }) = inner.plugins.do_post_accept(Accepted {
        stream,
        peer_addr: peer,
    }) else {
        debug!(?peer, "connection rejected by plugin");
        return;
    };

    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = BufReader::with_capacity(READER_BUFFER_SIZE, read_half);
    let writer: WriterHandle = Arc::new(tokio::sync::Mutex::new(write_half));
    let conn_ctx = Context::for_request(peer_addr, HashMap::new());
    let mut done = inner.done.subscribe();

    loop {
        if let Err(err) = inner.plugins.do_pre_read_request(&conn_ctx) {
            inner.plugins.log_pre_hook_error("pre_read_request", &err);
            break;
        }

        let mut req = pool::get();
        let decoded = tokio::select! {
            _ = done.changed() => {
                pool::put(req);
                break;
            }
            decoded = read_request(&inner, &mut reader, &mut req) => decoded,
        };

        match decoded {
            Ok(()) => inner.plugins.do_post_read_request(&conn_ctx, &req, None),
            Err(err) => {
                let err = Error::from(err);
                inner.plugins.do_post_read_request(&conn_ctx, &req, Some(&err));
                match &err {
                    Error::Io(io_err) if io_err.kind() == io::ErrorKind::UnexpectedEof => {
                        debug!(?peer_addr, "client disconnected");
                    }
                    _ => warn!(?peer_addr, error = %err, "failed to read request"),
                }
                pool::put(req);
                break;
            }
        }

        if let Some(auth) = &inner.auth {
            let ctx = Context::for_request(peer_addr, req.metadata.clone());
            let token = req.metadata.get(AUTH_KEY).cloned();
            if let Err(err) = auth(&ctx, &req, token.as_deref()) {
                if !req.header.is_oneway() {
                    let mut res = req.clone_routing();
                    res.header.set_message_type(MessageType::Response);
                    error_response(&mut res, &err.to_string());
                    write_response(&inner, &writer, &ctx, &req, res).await;
                }
                pool::put(req);
                continue;
            }
        }

        let inner = Arc::clone(&inner);
        let writer = Arc::clone(&writer);
        tokio::spawn(dispatch(inner, writer, req, peer_addr));
    }
}

async fn read_request(
    inner: &Inner,
    reader: &mut BufReader<tokio::io::ReadHalf<BoxedStream>>,
    req: &mut Message,
) -> Result<(), ProtocolError> {
    match inner.read_timeout {
        Some(deadline) => {
            match timeout(deadline, req.decode(reader, inner.max_message_length)).await {
                Ok(result) => result,
                Err(_) => Err(ProtocolError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "read deadline exceeded",
                ))),
            }
        }
        None => req.decode(reader, inner.max_message_length).await,
    }
}

async fn dispatch(
    inner: Arc<Inner>,
    writer: WriterHandle,
    mut req: Message,
    peer_addr: Option<SocketAddr>,
) {
    if req.header.is_heartbeat() {
        req.header.set_message_type(MessageType::Response);
        if let Err(err) = write_frame(&inner, &writer, req.encode()).await {
            debug!(error = %err, "failed to echo heartbeat");
        }
        pool::put(req);
        return;
    }

    let ctx = Context::for_request(peer_addr, req.metadata.clone());
    let mut res = handle_request(&inner, &ctx, &req).await;

    // Metadata set by the handler is merged before any wire bytes exist.
    for (key, value) in ctx.response_metadata() {
        res.metadata.insert(key, value);
    }

    if !req.header.is_oneway() {
        write_response(&inner, &writer, &ctx, &req, res).await;
    } else {
        pool::put(res);
    }
    pool::put(req);
}

async fn handle_request(inner: &Inner, ctx: &Context, req: &Message) -> Message {
    let mut res = req.clone_routing();
    res.header.set_message_type(MessageType::Response);
    res.header.set_compress_type(CompressType::None);

    let Some(st) = req.header.serialize_type() else {
        error_response(
            &mut res,
            &Error::UnsupportedCodec(req.header.serialize_type_bits()).to_string(),
        );
        return res;
    };

    let handler = {
        let services = inner.services.read();
        let Some(service) = services.get(&req.service_path) else {
            error_response(&mut res, &format!("can't find service {}", req.service_path));
            return res;
        };
        match service.lookup(&req.service_method) {
            Some(handler) => handler,
            None => {
                error_response(
                    &mut res,
                    &format!("can't find method {}", req.service_method),
                );
                return res;
            }
        }
    };

    let payload = match req.header.compress_type() {
        Some(CompressType::None) => req.payload.clone(),
        Some(CompressType::Gzip) => match compress::unzip(&req.payload) {
            Ok(data) => data,
            Err(err) => {
                error_response(&mut res, &format!("unzip payload: {err}"));
                return res;
            }
        },
        None => {
            error_response(&mut res, "unsupported compression type");
            return res;
        }
    };

    match AssertUnwindSafe(handler(ctx.clone(), st, payload))
        .catch_unwind()
        .await
    {
        Err(panic) => {
            let reason = panic_message(panic.as_ref());
            warn!(service = %req.service_path, method = %req.service_method, %reason, "handler panicked");
            error_response(&mut res, &format!("service internal error: {reason}"));
        }
        Ok(Err(err)) => error_response(&mut res, &err.to_string()),
        Ok(Ok(reply)) => {
            if matches!(req.header.compress_type(), Some(CompressType::Gzip))
                && reply.len() > COMPRESSION_THRESHOLD
            {
                match compress::zip(&reply) {
                    Ok(zipped) => {
                        res.header.set_compress_type(CompressType::Gzip);
                        res.payload = zipped;
                    }
                    Err(_) => res.payload = reply,
                }
            } else {
                res.payload = reply;
            }
        }
    }

    res
}

async fn write_response(
    inner: &Inner,
    writer: &WriterHandle,
    ctx: &Context,
    req: &Message,
    res: Message,
) {
    match inner.plugins.do_pre_write_response(ctx, req) {
        Ok(()) => {
            let err = write_frame(inner, writer, res.encode())
                .await
                .err()
                .map(Error::Io);
            inner
                .plugins
                .do_post_write_response(ctx, req, &res, err.as_ref());
        }
        Err(err) => inner.plugins.log_pre_hook_error("pre_write_response", &err),
    }
    pool::put(res);
}

/// Writes one full frame in a single call under the writer lock.
async fn write_frame(inner: &Inner, writer: &WriterHandle, data: Vec<u8>) -> io::Result<()> {
    let mut guard = writer.lock().await;
    let write = async {
        guard.write_all(&data).await?;
        guard.flush().await
    };
    match inner.write_timeout {
        Some(deadline) => match timeout(deadline, write).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "write deadline exceeded",
            )),
        },
        None => write.await,
    }
}

fn error_response(res: &mut Message, reason: &str) {
    res.header.set_message_status(MessageStatus::Error);
    res.metadata
        .insert(SERVICE_ERROR_KEY.to_string(), reason.to_string());
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn is_transient_accept_error(err: &io::Error) -> bool {
    // Per-connection failures and descriptor exhaustion are worth
    // retrying; anything else kills the accept loop.
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    ) || matches!(err.raw_os_error(), Some(23) | Some(24))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Client, ClientOptions};
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Args {
        a: u64,
        b: u64,
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Reply {
        c: u64,
    }

    fn arith_service() -> Service {
        let mut service = Service::new("Arith");
        service.register_method("Mul", |_ctx: Context, args: Args| async move {
            Ok::<_, Error>(Reply { c: args.a * args.b })
        });
        service.register_method("Panic", |_ctx: Context, args: Args| async move {
            assert_eq!(args.a, u64::MAX, "numbers were harmed");
            Ok::<_, Error>(Reply { c: 0 })
        });
        service
    }

    async fn start_server(server: Server, network: &'static str) -> SocketAddr {
        let serving = server.clone();
        tokio::spawn(async move {
            let _ = serving.serve(network, "127.0.0.1:0").await;
        });
        loop {
            if let Some(addr) = server.local_addr() {
                return addr;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let server = Server::builder().build();
        server.register(arith_service()).expect("register");
        let addr = start_server(server.clone(), "tcp").await;

        let client = Client::connect("tcp", &addr.to_string(), ClientOptions::default())
            .await
            .expect("connect");
        let ctx = Context::new();
        let reply: Reply = client
            .call(&ctx, "Arith", "Mul", &Args { a: 10, b: 20 })
            .await
            .expect("call");
        assert_eq!(reply.c, 200);

        let _ = client.close().await;
        server.close();
    }

    #[tokio::test]
    async fn test_unknown_method_is_a_service_error() {
        let server = Server::builder().build();
        server.register(arith_service()).expect("register");
        let addr = start_server(server.clone(), "tcp").await;

        let client = Client::connect("tcp", &addr.to_string(), ClientOptions::default())
            .await
            .expect("connect");
        let err = client
            .call::<_, Reply>(&Context::new(), "Arith", "Add", &Args { a: 1, b: 2 })
            .await
            .unwrap_err();

        assert!(err.is_service_error());
        assert!(err.to_string().contains("can't find method Add"), "{err}");
        server.close();
    }

    #[tokio::test]
    async fn test_unknown_service_is_a_service_error() {
        let server = Server::builder().build();
        server.register(arith_service()).expect("register");
        let addr = start_server(server.clone(), "tcp").await;

        let client = Client::connect("tcp", &addr.to_string(), ClientOptions::default())
            .await
            .expect("connect");
        let err = client
            .call::<_, Reply>(&Context::new(), "Nope", "Mul", &Args { a: 1, b: 2 })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("can't find service Nope"), "{err}");
        server.close();
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_service_error() {
        let server = Server::builder().build();
        server.register(arith_service()).expect("register");
        let addr = start_server(server.clone(), "tcp").await;

        let client = Client::connect("tcp", &addr.to_string(), ClientOptions::default())
            .await
            .expect("connect");
        let err = client
            .call::<_, Reply>(&Context::new(), "Arith", "Panic", &Args { a: 1, b: 2 })
            .await
            .unwrap_err();
        assert!(err.is_service_error());
        assert!(err.to_string().contains("numbers were harmed"), "{err}");

        // The connection survives a handler panic.
        let reply: Reply = client
            .call(&Context::new(), "Arith", "Mul", &Args { a: 2, b: 3 })
            .await
            .expect("subsequent call");
        assert_eq!(reply.c, 6);
        server.close();
    }

    #[tokio::test]
    async fn test_heartbeat_echo() {
        let server = Server::builder().build();
        let addr = start_server(server.clone(), "tcp").await;

        let client = Client::connect("tcp", &addr.to_string(), ClientOptions::default())
            .await
            .expect("connect");
        client.heartbeat().await.expect("heartbeat echoed");
        server.close();
    }

    #[tokio::test]
    async fn test_register_after_serve_fails() {
        let server = Server::builder().build();
        server.register(arith_service()).expect("register");
        let _addr = start_server(server.clone(), "tcp").await;

        let err = server.register(Service::new("Late")).unwrap_err();
        assert!(matches!(err, Error::Registration(_)));
        server.close();
    }

    #[tokio::test]
    async fn test_duplicate_service_rejected() {
        let server = Server::builder().build();
        server.register(arith_service()).expect("first");
        let err = server.register(arith_service()).unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[tokio::test]
    async fn test_default_service_function() {
        let server = Server::builder().build();
        server
            .register_fn("", "Echo", |_ctx: Context, text: String| async move {
                Ok::<_, Error>(text)
            })
            .expect("register_fn");
        let addr = start_server(server.clone(), "tcp").await;

        let client = Client::connect("tcp", &addr.to_string(), ClientOptions::default())
            .await
            .expect("connect");
        let reply: String = client
            .call(&Context::new(), "", "Echo", &"hello".to_string())
            .await
            .expect("call");
        assert_eq!(reply, "hello");
        server.close();
    }

    #[tokio::test]
    async fn test_auth_rejects_bad_token() {
        let server = Server::builder()
            .auth_fn(|_ctx, _req, token| match token {
                Some("sesame") => Ok(()),
                _ => Err(Error::Service("authentication failed".to_string())),
            })
            .build();
        server.register(arith_service()).expect("register");
        let addr = start_server(server.clone(), "tcp").await;

        let client = Client::connect("tcp", &addr.to_string(), ClientOptions::default())
            .await
            .expect("connect");

        let err = client
            .call::<_, Reply>(&Context::new(), "Arith", "Mul", &Args { a: 1, b: 2 })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("authentication failed"), "{err}");

        let ctx = Context::new().with_metadata(AUTH_KEY, "sesame");
        let reply: Reply = client
            .call(&ctx, "Arith", "Mul", &Args { a: 3, b: 4 })
            .await
            .expect("authorized call");
        assert_eq!(reply.c, 12);
        server.close();
    }

    #[tokio::test]
    async fn test_response_metadata_reaches_client() {
        let server = Server::builder().build();
        let mut service = Service::new("Meta");
        service.register_method("Tag", |ctx: Context, _args: ()| async move {
            ctx.set_response_metadata("served-by", "unit-test");
            Ok::<_, Error>(())
        });
        server.register(service).expect("register");
        let addr = start_server(server.clone(), "tcp").await;

        let client = Client::connect("tcp", &addr.to_string(), ClientOptions::default())
            .await
            .expect("connect");
        let ctx = Context::new();
        client
            .call::<_, ()>(&ctx, "Meta", "Tag", &())
            .await
            .expect("call");
        assert_eq!(
            ctx.response_metadata().get("served-by").map(String::as_str),
            Some("unit-test")
        );
        server.close();
    }

    #[tokio::test]
    async fn test_gzip_round_trip_with_large_payload() {
        let server = Server::builder().build();
        let mut service = Service::new("Blob");
        service.register_method("Length", |_ctx: Context, blob: Vec<u32>| async move {
            Ok::<_, Error>(blob.len() as u64)
        });
        server.register(service).expect("register");
        let addr = start_server(server.clone(), "tcp").await;

        let opts = ClientOptions {
            serialize_type: crate::protocol::SerializeType::Json,
            compress_type: CompressType::Gzip,
            ..ClientOptions::default()
        };
        let client = Client::connect("tcp", &addr.to_string(), opts)
            .await
            .expect("connect");

        // Serializes to well over the 1024-byte threshold.
        let blob: Vec<u32> = (0..1000).collect();
        let length: u64 = client
            .call(&Context::new(), "Blob", "Length", &blob)
            .await
            .expect("call");
        assert_eq!(length, 1000);
        server.close();
    }

    #[tokio::test]
    async fn test_oneway_request_runs_without_response() {
        use std::sync::atomic::AtomicU64;

        let server = Server::builder().build();
        let hits = Arc::new(AtomicU64::new(0));
        let mut service = Service::new("Audit");
        service.register_method("Record", {
            let hits = Arc::clone(&hits);
            move |_ctx: Context, _entry: String| {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, Error>(())
                }
            }
        });
        server.register(service).expect("register");
        let addr = start_server(server.clone(), "tcp").await;

        let client = Client::connect("tcp", &addr.to_string(), ClientOptions::default())
            .await
            .expect("connect");
        client
            .notify(&Context::new(), "Audit", "Record", &"entry".to_string())
            .await
            .expect("notify");

        // The handler runs even though no response is written.
        for _ in 0..50 {
            if hits.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // The connection is still usable for two-way calls afterwards.
        client.heartbeat().await.expect("heartbeat");
        server.close();
    }

    #[tokio::test]
    async fn test_post_accept_rejection_drops_connection() {
        struct RejectAll;
        impl ServerPlugin for RejectAll {
            fn post_accept(&self, _conn: Accepted) -> Option<Accepted> {
                None
            }
        }

        let server = Server::builder().build();
        server.register(arith_service()).expect("register");
        server.plugins().add(Arc::new(RejectAll));
        let addr = start_server(server.clone(), "tcp").await;

        let client = Client::connect("tcp", &addr.to_string(), ClientOptions::default())
            .await
            .expect("tcp connect succeeds before rejection");
        let err = client
            .call::<_, Reply>(&Context::new(), "Arith", "Mul", &Args { a: 1, b: 2 })
            .await
            .unwrap_err();
        assert!(!err.is_service_error());
        server.close();
    }

    #[tokio::test]
    async fn test_http_upgrade_end_to_end() {
        let server = Server::builder().build();
        server.register(arith_service()).expect("register");
        let addr = start_server(server.clone(), "http").await;

        let client = Client::connect("http", &addr.to_string(), ClientOptions::default())
            .await
            .expect("connect via CONNECT upgrade");
        let reply: Reply = client
            .call(&Context::new(), "Arith", "Mul", &Args { a: 7, b: 6 })
            .await
            .expect("call");
        assert_eq!(reply.c, 42);
        server.close();
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_runs_callbacks() {
        let server = Server::builder().build();
        let ran = Arc::new(AtomicBool::new(false));
        server.register_on_shutdown({
            let ran = Arc::clone(&ran);
            move || ran.store(true, Ordering::SeqCst)
        });

        server.close();
        server.close();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_closed_server_fails_pending_client_calls() {
        let server = Server::builder().build();
        server.register(arith_service()).expect("register");
        let addr = start_server(server.clone(), "tcp").await;

        let client = Client::connect("tcp", &addr.to_string(), ClientOptions::default())
            .await
            .expect("connect");
        let reply: Reply = client
            .call(&Context::new(), "Arith", "Mul", &Args { a: 2, b: 2 })
            .await
            .expect("warm-up call");
        assert_eq!(reply.c, 4);

        server.close();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = client
            .call::<_, Reply>(&Context::new(), "Arith", "Mul", &Args { a: 1, b: 1 })
            .await
            .unwrap_err();
        assert!(!err.is_service_error());
    }
}
