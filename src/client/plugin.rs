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

//! Client-side plugin pipeline.
//!
//! Mirrors the server pipeline: plugins override the hooks they need,
//! hooks run in registration order, a pre-hook error aborts the call, and
//! post-hook errors are logged.

use crate::context::Context;
use crate::error::Error;
use crate::protocol::Message;
use parking_lot::RwLock;
use std::sync::Arc;

/// Lifecycle hooks on the client call path.
///
/// All methods have no-op defaults.
#[allow(unused_variables)]
pub trait ClientPlugin: Send + Sync {
    /// Called before a call is issued to the selected target.
    fn pre_call(&self, ctx: &Context, service_path: &str, service_method: &str) -> Result<(), Error> {
        Ok(())
    }

    /// Called after the call completed, with its outcome.
    fn post_call(
        &self,
        ctx: &Context,
        service_path: &str,
        service_method: &str,
        err: Option<&Error>,
    ) {
    }

    /// Called before an encoded request frame is written.
    fn pre_write_request(&self, req: &Message) -> Result<(), Error> {
        Ok(())
    }

    /// Called after a request frame was written (or failed to write).
    fn post_write_request(&self, req: &Message, err: Option<&Error>) {}
}

/// Ordered registry of client plugins.
#[derive(Default)]
pub struct ClientPluginContainer {
    plugins: RwLock<Vec<Arc<dyn ClientPlugin>>>,
}

impl ClientPluginContainer {
    /// Appends a plugin to the pipeline.
    pub fn add(&self, plugin: Arc<dyn ClientPlugin>) {
        self.plugins.write().push(plugin);
    }

    /// Removes a previously added plugin, matched by identity.
    pub fn remove(&self, plugin: &Arc<dyn ClientPlugin>) {
        self.plugins
            .write()
            .retain(|existing| !Arc::ptr_eq(existing, plugin));
    }

    /// Returns the registered plugins in pipeline order.
    pub fn all(&self) -> Vec<Arc<dyn ClientPlugin>> {
        self.plugins.read().clone()
    }

    pub(crate) fn do_pre_call(
        &self,
        ctx: &Context,
        service_path: &str,
        service_method: &str,
    ) -> Result<(), Error> {
        for plugin in self.all() {
            plugin.pre_call(ctx, service_path, service_method)?;
        }
        Ok(())
    }

    pub(crate) fn do_post_call(
        &self,
        ctx: &Context,
        service_path: &str,
        service_method: &str,
        err: Option<&Error>,
    ) {
        for plugin in self.all() {
            plugin.post_call(ctx, service_path, service_method, err);
        }
    }

    pub(crate) fn do_pre_write_request(&self, req: &Message) -> Result<(), Error> {
        for plugin in self.all() {
            plugin.pre_write_request(req)?;
        }
        Ok(())
    }

    pub(crate) fn do_post_write_request(&self, req: &Message, err: Option<&Error>) {
        for plugin in self.all() {
            plugin.post_write_request(req, err);
        }
    }
}
