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

//! The fault-tolerant invoker.
//!
//! `XClient` ties the pieces together: a discovery handle supplies the
//! live server set, a selector picks a target per call, per-target
//! clients are cached and evicted when their connection sours, and the
//! configured fail mode decides what happens when a call fails. Service
//! errors are definitive and never retried; transport errors are retried
//! according to the fail mode; context errors are returned as-is.

use super::client::{Client, ClientOptions};
use super::discovery::ServiceDiscovery;
use super::plugin::ClientPluginContainer;
use super::selector::{new_selector, GeoSelector, SelectMode, Selector};
use crate::context::Context;
use crate::error::{Error, MultiError};
use crate::protocol::AUTH_KEY;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Overall bound on broadcast and fork fan-outs.
const FANOUT_TIMEOUT: Duration = Duration::from_secs(60);

/// Failure-handling policy applied per invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailMode {
    /// Retry against a freshly selected target, up to the retry budget.
    #[default]
    Failover,
    /// One attempt; the error is returned immediately.
    Failfast,
    /// Retry against the same target, reconnecting between attempts.
    Failtry,
}

struct XInner {
    service_path: String,
    fail_mode: FailMode,
    opts: ClientOptions,
    servers: RwLock<HashMap<String, String>>,
    selector: RwLock<Box<dyn Selector>>,
    cached: tokio::sync::RwLock<HashMap<String, Client>>,
    discovery: Box<dyn ServiceDiscovery>,
    auth: Mutex<Option<String>>,
    shutdown: AtomicBool,
    plugins: Arc<ClientPluginContainer>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

/// A service-scoped client with discovery, load balancing, circuit
/// breaking, and failure-handling policies.
///
/// Cheaply cloneable; clones share the client cache and selector state.
#[derive(Clone)]
pub struct XClient {
    inner: Arc<XInner>,
}

impl XClient {
    /// Creates an `XClient` for `service_path`.
    ///
    /// The initial server set comes from `discovery.get_services()`; if
    /// the provider has a change stream, a background task keeps the set
    /// and the selector current.
    #[must_use]
    pub fn new(
        service_path: impl Into<String>,
        fail_mode: FailMode,
        select_mode: SelectMode,
        discovery: Box<dyn ServiceDiscovery>,
        opts: ClientOptions,
    ) -> Self {
        let servers: HashMap<String, String> = discovery
            .get_services()
            .into_iter()
            .map(|pair| (pair.key, pair.value))
            .collect();
        let selector = new_selector(select_mode, &servers);
        let watch_rx = discovery.watch();

        let inner = Arc::new(XInner {
            service_path: service_path.into(),
            fail_mode,
            opts,
            servers: RwLock::new(servers),
            selector: RwLock::new(selector),
            cached: tokio::sync::RwLock::new(HashMap::new()),
            discovery,
            auth: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            plugins: Arc::default(),
            watch_task: Mutex::new(None),
        });

        if let Some(mut rx) = watch_rx {
            let watched = Arc::clone(&inner);
            let task = tokio::spawn(async move {
                while let Some(pairs) = rx.recv().await {
                    let servers: HashMap<String, String> = pairs
                        .into_iter()
                        .map(|pair| (pair.key, pair.value))
                        .collect();
                    *watched.servers.write() = servers.clone();
                    watched.selector.read().update_server(&servers);
                }
            });
            *inner.watch_task.lock() = Some(task);
        }

        Self { inner }
    }

    /// Returns the plugin pipeline shared with every cached client.
    #[must_use]
    pub fn plugins(&self) -> &ClientPluginContainer {
        &self.inner.plugins
    }

    /// Installs a custom selector, seeded with the current server set.
    pub fn set_selector(&self, selector: Box<dyn Selector>) {
        selector.update_server(&self.inner.servers.read());
        *self.inner.selector.write() = selector;
    }

    /// Switches to geographic selection anchored at the client's
    /// coordinates.
    pub fn config_geo_selector(&self, latitude: f64, longitude: f64) {
        self.set_selector(Box::new(GeoSelector::new(latitude, longitude)));
    }

    /// Sets the token injected into every request's `__AUTH` metadata.
    pub fn auth(&self, token: impl Into<String>) {
        *self.inner.auth.lock() = Some(token.into());
    }

    /// Invokes `service_method` on one target chosen by the selector,
    /// applying the configured fail mode.
    ///
    /// # Errors
    ///
    /// [`Error::XClientShutdown`] after [`close`](Self::close),
    /// [`Error::NoServer`] when the selector has no target, service
    /// errors verbatim, and the last transport error once the retry
    /// budget is spent.
    pub async fn call<A, R>(
        &self,
        ctx: &mut Context,
        service_method: &str,
        args: &A,
    ) -> Result<R, Error>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.ensure_ready(ctx)?;
        let select_key = select_key(args);

        match self.inner.fail_mode {
            FailMode::Failfast => {
                let (key, client) = self.select_client(service_method, &select_key).await?;
                let result = self.wrap_call(ctx, &client, service_method, args).await;
                if let Err(err) = &result {
                    if !err.is_service_error() {
                        self.remove_client(&key, &client).await;
                    }
                }
                result
            }
            FailMode::Failtry => {
                let (key, mut client) = self.select_client(service_method, &select_key).await?;
                let mut last = Error::NoServer;
                for attempt in 0..self.inner.opts.retries {
                    if attempt > 0 {
                        match self.get_cached_client(&key).await {
                            Ok(fresh) => client = fresh,
                            Err(err) => {
                                last = err;
                                continue;
                            }
                        }
                    }
                    match self.wrap_call(ctx, &client, service_method, args).await {
                        Ok(reply) => return Ok(reply),
                        Err(err) if is_definitive(&err) => return Err(err),
                        Err(err) => {
                            self.remove_client(&key, &client).await;
                            last = err;
                        }
                    }
                }
                Err(last)
            }
            FailMode::Failover => {
                let mut last = Error::NoServer;
                for _ in 0..self.inner.opts.retries {
                    let (key, client) =
                        match self.select_client(service_method, &select_key).await {
                            Ok(selected) => selected,
                            Err(err) => {
                                last = err;
                                continue;
                            }
                        };
                    match self.wrap_call(ctx, &client, service_method, args).await {
                        Ok(reply) => return Ok(reply),
                        Err(err) if is_definitive(&err) => return Err(err),
                        Err(err) => {
                            self.remove_client(&key, &client).await;
                            last = err;
                        }
                    }
                }
                Err(last)
            }
        }
    }

    /// Invokes `service_method` on every current target in parallel.
    ///
    /// Succeeds only when every target succeeds; the returned reply comes
    /// from one of the targets, without defining which. The whole fan-out
    /// is bounded by a one-minute timeout.
    ///
    /// # Errors
    ///
    /// The first failure observed, [`Error::NoServer`] for an empty
    /// server set, or [`Error::DeadlineExceeded`] on timeout.
    pub async fn broadcast<A, R>(
        &self,
        ctx: &mut Context,
        service_method: &str,
        args: &A,
    ) -> Result<R, Error>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.ensure_ready(ctx)?;
        let clients = self.all_clients().await?;

        let ctx: &Context = ctx;
        let mut calls: FuturesUnordered<_> = clients
            .iter()
            .map(|(_, client)| self.wrap_call::<A, R>(ctx, client, service_method, args))
            .collect();

        let deadline = tokio::time::sleep(FANOUT_TIMEOUT);
        tokio::pin!(deadline);

        let mut reply = None;
        loop {
            tokio::select! {
                _ = &mut deadline => return Err(Error::DeadlineExceeded),
                next = calls.next() => match next {
                    None => break,
                    Some(Ok(result)) => reply = Some(result),
                    Some(Err(err)) => return Err(err),
                },
            }
        }
        reply.ok_or(Error::NoServer)
    }

    /// Invokes `service_method` on every current target in parallel and
    /// returns the first successful reply.
    ///
    /// # Errors
    ///
    /// The last failure when every target fails, [`Error::NoServer`] for
    /// an empty server set, or [`Error::DeadlineExceeded`] on timeout.
    pub async fn fork<A, R>(
        &self,
        ctx: &mut Context,
        service_method: &str,
        args: &A,
    ) -> Result<R, Error>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.ensure_ready(ctx)?;
        let clients = self.all_clients().await?;

        let ctx: &Context = ctx;
        let mut calls: FuturesUnordered<_> = clients
            .iter()
            .map(|(_, client)| self.wrap_call::<A, R>(ctx, client, service_method, args))
            .collect();

        let deadline = tokio::time::sleep(FANOUT_TIMEOUT);
        tokio::pin!(deadline);

        let mut last = Error::NoServer;
        loop {
            tokio::select! {
                _ = &mut deadline => return Err(Error::DeadlineExceeded),
                next = calls.next() => match next {
                    None => return Err(last),
                    Some(Ok(reply)) => return Ok(reply),
                    Some(Err(err)) => last = err,
                },
            }
        }
    }

    /// Closes every cached client, stops the discovery watch task, and
    /// releases the discovery handle.
    ///
    /// # Errors
    ///
    /// A [`MultiError`] aggregating individual close failures.
    pub async fn close(&self) -> Result<(), Error> {
        self.inner.shutdown.store(true, Ordering::SeqCst);

        if let Some(task) = self.inner.watch_task.lock().take() {
            task.abort();
        }

        let clients: Vec<Client> = {
            let mut cached = self.inner.cached.write().await;
            cached.drain().map(|(_, client)| client).collect()
        };

        let mut failures = MultiError::default();
        for client in clients {
            match client.close().await {
                Ok(()) | Err(Error::Shutdown) => {}
                Err(err) => failures.push(err),
            }
        }

        self.inner.discovery.close();

        if failures.has_errors() {
            Err(failures.into())
        } else {
            Ok(())
        }
    }

    fn ensure_ready(&self, ctx: &mut Context) -> Result<(), Error> {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(Error::XClientShutdown);
        }
        if let Some(token) = self.inner.auth.lock().clone() {
            ctx.set_metadata(AUTH_KEY, token);
        }
        Ok(())
    }

    async fn wrap_call<A, R>(
        &self,
        ctx: &Context,
        client: &Client,
        service_method: &str,
        args: &A,
    ) -> Result<R, Error>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let path = &self.inner.service_path;
        self.inner.plugins.do_pre_call(ctx, path, service_method)?;
        let result = client.call(ctx, path, service_method, args).await;
        self.inner
            .plugins
            .do_post_call(ctx, path, service_method, result.as_ref().err());
        result
    }

    async fn select_client(
        &self,
        service_method: &str,
        select_key: &str,
    ) -> Result<(String, Client), Error> {
        let key = self
            .inner
            .selector
            .read()
            .select(&self.inner.service_path, service_method, select_key)
            .ok_or(Error::NoServer)?;
        let client = self.get_cached_client(&key).await?;
        Ok((key, client))
    }

    async fn get_cached_client(&self, key: &str) -> Result<Client, Error> {
        {
            let cached = self.inner.cached.read().await;
            if let Some(client) = cached.get(key) {
                if !client.is_closing() && !client.is_shutdown() {
                    return Ok(client.clone());
                }
            }
        }

        let mut cached = self.inner.cached.write().await;
        // Re-check after acquiring the write lock; another task may have
        // reconnected in between.
        if let Some(client) = cached.get(key) {
            if !client.is_closing() && !client.is_shutdown() {
                return Ok(client.clone());
            }
            cached.remove(key);
        }

        let (network, address) = split_network_and_address(key);
        let client = Client::connect_with_plugins(
            network,
            address,
            self.inner.opts.clone(),
            Arc::clone(&self.inner.plugins),
        )
        .await?;
        cached.insert(key.to_string(), client.clone());
        Ok(client)
    }

    async fn remove_client(&self, key: &str, client: &Client) {
        {
            let mut cached = self.inner.cached.write().await;
            if cached.get(key).is_some_and(|current| current.ptr_eq(client)) {
                cached.remove(key);
            }
        }
        let _ = client.close().await;
    }

    async fn all_clients(&self) -> Result<Vec<(String, Client)>, Error> {
        let keys: Vec<String> = self.inner.servers.read().keys().cloned().collect();
        if keys.is_empty() {
            return Err(Error::NoServer);
        }

        let mut clients = Vec::with_capacity(keys.len());
        for key in keys {
            let client = self.get_cached_client(&key).await?;
            clients.push((key, client));
        }
        Ok(clients)
    }
}

/// Service errors and context errors are definitive: retrying cannot
/// change the outcome.
fn is_definitive(err: &Error) -> bool {
    err.is_service_error() || matches!(err, Error::DeadlineExceeded)
}

/// Splits a `<network>@<address>` server key; bare addresses default to
/// `tcp`.
fn split_network_and_address(server: &str) -> (&str, &str) {
    match server.split_once('@') {
        Some((network, address)) => (network, address),
        None => ("tcp", server),
    }
}

fn select_key<A: Serialize + ?Sized>(args: &A) -> String {
    serde_json::to_string(args).unwrap_or_default()
}
