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

//! Server-side plugin pipeline.
//!
//! Plugins implement any subset of the hook methods on [`ServerPlugin`];
//! the defaults are no-ops, so a plugin only overrides the points it cares
//! about. Hooks run in registration order. An error from a pre-hook aborts
//! the pipeline for that message; errors from post-hooks are logged and
//! swallowed. Errors raised by registration hooks are aggregated into a
//! multi-error.

use crate::context::Context;
use crate::error::{Error, MultiError};
use crate::protocol::Message;
use crate::transport::BoxedStream;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

/// A freshly accepted connection passing through the `post_accept` hook.
pub struct Accepted {
    /// The connection stream; a plugin may wrap it.
    pub stream: BoxedStream,
    /// Peer address, when the transport has one.
    pub peer_addr: Option<SocketAddr>,
}

/// Lifecycle hooks on the server request path.
///
/// All methods have no-op defaults.
#[allow(unused_variables)]
pub trait ServerPlugin: Send + Sync {
    /// Called when a service or function is registered, before it is
    /// inserted. Discovery plugins publish the service here.
    fn on_register(&self, name: &str, metadata: &str) -> Result<(), Error> {
        Ok(())
    }

    /// Called for every accepted connection. Return `None` to reject it,
    /// or return the (possibly wrapped) connection to keep it.
    fn post_accept(&self, conn: Accepted) -> Option<Accepted> {
        Some(conn)
    }

    /// Called before a request frame is read from the connection.
    fn pre_read_request(&self, ctx: &Context) -> Result<(), Error> {
        Ok(())
    }

    /// Called after a request frame was read (or failed to read).
    fn post_read_request(&self, ctx: &Context, req: &Message, err: Option<&Error>) {}

    /// Called before a response frame is written.
    fn pre_write_response(&self, ctx: &Context, req: &Message) -> Result<(), Error> {
        Ok(())
    }

    /// Called after a response frame was written (or failed to write).
    fn post_write_response(&self, ctx: &Context, req: &Message, res: &Message, err: Option<&Error>) {
    }
}

/// Ordered registry of server plugins.
#[derive(Default)]
pub struct PluginContainer {
    plugins: RwLock<Vec<Arc<dyn ServerPlugin>>>,
}

impl PluginContainer {
    /// Appends a plugin to the pipeline.
    pub fn add(&self, plugin: Arc<dyn ServerPlugin>) {
        self.plugins.write().push(plugin);
    }

    /// Removes a previously added plugin, matched by identity.
    pub fn remove(&self, plugin: &Arc<dyn ServerPlugin>) {
        self.plugins
            .write()
            .retain(|existing| !Arc::ptr_eq(existing, plugin));
    }

    /// Returns the registered plugins in pipeline order.
    pub fn all(&self) -> Vec<Arc<dyn ServerPlugin>> {
        self.plugins.read().clone()
    }

    pub(crate) fn do_register(&self, name: &str, metadata: &str) -> Result<(), Error> {
        let mut failures = MultiError::default();
        for plugin in self.all() {
            if let Err(err) = plugin.on_register(name, metadata) {
                failures.push(err);
            }
        }
        if failures.has_errors() {
            Err(failures.into())
        } else {
            Ok(())
        }
    }

    pub(crate) fn do_post_accept(&self, mut conn: Accepted) -> Option<Accepted> {
        for plugin in self.all() {
            conn = plugin.post_accept(conn)?;
        }
        Some(conn)
    }

    pub(crate) fn do_pre_read_request(&self, ctx: &Context) -> Result<(), Error> {
        for plugin in self.all() {
            plugin.pre_read_request(ctx)?;
        }
        Ok(())
    }

    pub(crate) fn do_post_read_request(&self, ctx: &Context, req: &Message, err: Option<&Error>) {
        for plugin in self.all() {
            plugin.post_read_request(ctx, req, err);
        }
    }

    pub(crate) fn do_pre_write_response(&self, ctx: &Context, req: &Message) -> Result<(), Error> {
        for plugin in self.all() {
            plugin.pre_write_response(ctx, req)?;
        }
        Ok(())
    }

    pub(crate) fn do_post_write_response(
        &self,
        ctx: &Context,
        req: &Message,
        res: &Message,
        err: Option<&Error>,
    ) {
        for plugin in self.all() {
            plugin.post_write_response(ctx, req, res, err);
        }
    }

    pub(crate) fn log_pre_hook_error(&self, hook: &str, err: &Error) {
        warn!(hook, error = %err, "plugin pre-hook aborted the pipeline");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        registers: AtomicUsize,
        reads: AtomicUsize,
    }

    impl ServerPlugin for Recorder {
        fn on_register(&self, _name: &str, _metadata: &str) -> Result<(), Error> {
            self.registers.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn pre_read_request(&self, _ctx: &Context) -> Result<(), Error> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Rejecting;

    impl ServerPlugin for Rejecting {
        fn on_register(&self, name: &str, _metadata: &str) -> Result<(), Error> {
            Err(Error::Registration(format!("{name} is not allowed")))
        }

        fn post_accept(&self, _conn: Accepted) -> Option<Accepted> {
            None
        }
    }

    #[test]
    fn test_hooks_run_in_order_and_aggregate_errors() {
        let container = PluginContainer::default();
        let recorder = Arc::new(Recorder::default());
        container.add(recorder.clone());
        container.add(Arc::new(Rejecting));

        let err = container.do_register("Svc", "").unwrap_err();
        assert_eq!(recorder.registers.load(Ordering::SeqCst), 1);
        match err {
            Error::Multi(multi) => assert_eq!(multi.errors.len(), 1),
            other => panic!("expected multi-error, got {other}"),
        }

        container
            .do_pre_read_request(&Context::new())
            .expect("recorder pre-read passes");
        assert_eq!(recorder.reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_by_identity() {
        let container = PluginContainer::default();
        let recorder: Arc<dyn ServerPlugin> = Arc::new(Recorder::default());
        container.add(recorder.clone());
        assert_eq!(container.all().len(), 1);

        container.remove(&recorder);
        assert!(container.all().is_empty());
    }
}
