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

//! Bluebridge: a Linux Bluetooth profile daemon.
//!
//! Speaks OBEX (object push and folder browsing) and the Hands-Free
//! Profile over RFCOMM, manages SCO voice links, and drives the BlueZ
//! adapter over the system bus.

pub mod bluez;
pub mod config;
pub mod events;
pub mod hfp;
pub mod obex;
pub mod profiles;
pub mod sco;
pub mod service;
pub mod state;
pub mod transport;

pub use config::Config;
pub use events::{EventProcessor, ServiceEvent};
pub use service::BluetoothService;
pub use state::{DaemonState, ProfileStatus};
