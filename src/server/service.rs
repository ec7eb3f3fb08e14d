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

//! The service registry.
//!
//! A [`Service`] groups named methods under one service path. Registration
//! captures each method's argument and reply types inside a type-erased
//! async invoker, so dispatch needs nothing but the method name and the
//! wire's serializer id: the invoker decodes the arguments, awaits the
//! handler, and encodes the reply.
//!
//! Methods registered through [`Service::register_method`] and free
//! functions attached with [`Server::register_fn`] live in separate maps;
//! lookup consults the method map first and falls back to the function
//! map, so a service built from a receiver can still be extended with
//! loose functions.
//!
//! [`Server::register_fn`]: super::Server::register_fn

use crate::codec::{codec_for, Codec};
use crate::context::Context;
use crate::protocol::SerializeType;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Error type handlers may return; anything convertible into a boxed
/// error works.
pub type HandlerError = Box<dyn StdError + Send + Sync>;

pub(crate) type HandlerFuture =
    Pin<Box<dyn Future<Output = Result<Vec<u8>, HandlerError>> + Send>>;

/// Type-erased method invoker: `(context, serializer id, raw args)` to
/// encoded reply bytes.
pub(crate) type MethodHandler =
    Arc<dyn Fn(Context, SerializeType, Vec<u8>) -> HandlerFuture + Send + Sync>;

/// A named collection of RPC methods.
///
/// # Examples
///
/// ```
/// use mrpc::server::Service;
/// use mrpc::Context;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Args { a: u64, b: u64 }
///
/// #[derive(Serialize, Deserialize)]
/// struct Reply { c: u64 }
///
/// let mut arith = Service::new("Arith");
/// arith.register_method("Mul", |_ctx: Context, args: Args| async move {
///     Ok::<_, mrpc::Error>(Reply { c: args.a * args.b })
/// });
/// ```
pub struct Service {
    name: String,
    methods: HashMap<String, MethodHandler>,
    functions: HashMap<String, MethodHandler>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Service {
    /// Creates an empty service. The empty name denotes the default
    /// service that hosts free functions.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
            functions: HashMap::new(),
        }
    }

    /// Returns the service path this service is registered under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers a method, replacing any previous method of the same
    /// name.
    ///
    /// The handler receives the request [`Context`] and the decoded
    /// arguments and resolves to the reply. The caller always owns the
    /// reply value; the framework encodes it with the serializer the
    /// request advertised.
    pub fn register_method<A, R, E, F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: Into<HandlerError> + 'static,
        F: Fn(Context, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        self.methods.insert(name.into(), make_handler(f));
        self
    }

    /// Returns `true` if no methods or functions are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty() && self.functions.is_empty()
    }

    pub(crate) fn insert_function(&mut self, name: String, handler: MethodHandler) {
        self.functions.insert(name, handler);
    }

    pub(crate) fn lookup(&self, method: &str) -> Option<MethodHandler> {
        self.methods
            .get(method)
            .or_else(|| self.functions.get(method))
            .cloned()
    }
}

/// Builds the type-erased invoker for a typed handler.
pub(crate) fn make_handler<A, R, E, F, Fut>(f: F) -> MethodHandler
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    E: Into<HandlerError> + 'static,
    F: Fn(Context, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |ctx: Context, st: SerializeType, payload: Vec<u8>| {
        let f = Arc::clone(&f);
        Box::pin(async move {
            let codec = codec_for(st);
            let args: A = codec.decode(&payload).map_err(HandlerError::from)?;
            let reply = f(ctx, args).await.map_err(Into::into)?;
            let encoded = codec.encode(&reply).map_err(HandlerError::from)?;
            Ok(encoded)
        }) as HandlerFuture
    })
}
