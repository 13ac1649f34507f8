// Copyright 2026 Bluebridge Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Object Exchange protocol: codec, client and server state machines.

pub mod codec;

mod client;
mod handler;
mod server;

pub use client::ObexClient;
pub use codec::{ConnectInfo, Header, HeaderSet, Opcode, ResponseCode};
pub use handler::{simple_response, InboundObject, ObexHandler};
pub use server::{serve_session, ObexServer, SessionSlot, SlotGuard};
