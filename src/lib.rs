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

#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod breaker;
pub mod client;
pub mod codec;
pub mod compress;
pub mod context;
pub mod error;
pub mod gateway;
pub mod protocol;
pub mod server;
pub mod transport;

pub use client::{Client, ClientOptions, XClient};
pub use context::Context;
pub use error::{Error, MultiError};
pub use protocol::{CompressType, Message, SerializeType};
pub use server::{Server, Service};
pub use transport::DEFAULT_RPC_PATH;
