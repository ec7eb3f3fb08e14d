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

//! Per-call context: metadata propagation and deadlines.
//!
//! A [`Context`] travels with every call. On the client it carries request
//! metadata toward the server and collects response metadata on the way
//! back; on the server it hands the handler the request metadata and a
//! shared map the handler may extend with response metadata. The optional
//! deadline bounds how long a client call may wait for its response.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Call-scoped metadata and deadline carrier.
#[derive(Debug, Clone, Default)]
pub struct Context {
    remote_addr: Option<SocketAddr>,
    metadata: HashMap<String, String>,
    response_metadata: Arc<Mutex<HashMap<String, String>>>,
    deadline: Option<Instant>,
}

impl Context {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the server-side context for one request.
    pub(crate) fn for_request(
        remote_addr: Option<SocketAddr>,
        metadata: HashMap<String, String>,
    ) -> Self {
        Self {
            remote_addr,
            metadata,
            response_metadata: Arc::new(Mutex::new(HashMap::new())),
            deadline: None,
        }
    }

    /// Adds a request metadata entry, builder style.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Sets a deadline `timeout` from now, builder style.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Adds a request metadata entry.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Returns the request metadata.
    #[must_use]
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Returns one request metadata value.
    #[must_use]
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Returns the deadline, if one was set.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the peer address. Set only on server-side contexts.
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Adds a response metadata entry.
    ///
    /// On the server, entries set here are merged onto the response
    /// message before any wire bytes are emitted.
    pub fn set_response_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        self.response_metadata
            .lock()
            .insert(key.into(), value.into());
    }

    /// Returns a snapshot of the response metadata.
    #[must_use]
    pub fn response_metadata(&self) -> HashMap<String, String> {
        self.response_metadata.lock().clone()
    }

    /// Merges `incoming` into the response metadata.
    pub(crate) fn merge_response_metadata(&self, incoming: &HashMap<String, String>) {
        if incoming.is_empty() {
            return;
        }
        let mut metadata = self.response_metadata.lock();
        for (key, value) in incoming {
            metadata.insert(key.clone(), value.clone());
        }
    }
}
