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

//! The client side of the framework.
//!
//! [`Client`] is one connection to one server: dialing, the pending-call
//! table, the receive loop, heartbeats, and the raw gateway path.
//! [`XClient`] layers fault tolerance on top: service discovery feeds a
//! [`Selector`], per-target clients are cached, and the chosen
//! [`FailMode`] governs retries, with [`broadcast`](XClient::broadcast)
//! and [`fork`](XClient::fork) for parallel fan-out.

#[allow(clippy::module_inception)]
mod client;
mod connection;
mod discovery;
mod plugin;
mod selector;
mod xclient;

pub use client::{default_client_breaker, Client, ClientOptions};
pub use discovery::{KVPair, MultipleServersDiscovery, PeerDiscovery, ServiceDiscovery};
pub use plugin::{ClientPlugin, ClientPluginContainer};
pub use selector::{
    ConsistentHashSelector, GeoSelector, RandomSelector, RoundRobinSelector, SelectMode, Selector,
    WeightedIcmpSelector, WeightedRoundRobinSelector,
};
pub use xclient::{FailMode, XClient};
