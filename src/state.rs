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

//! Daemon state snapshot shared between tasks.

use bluer::Address;
use parking_lot::RwLock;
use std::sync::Arc;

/// Status of one profile endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileStatus {
    Idle,
    Listening,
    Connected,
    Error,
}

impl ProfileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileStatus::Idle => "Idle",
            ProfileStatus::Listening => "Listening",
            ProfileStatus::Connected => "Connected",
            ProfileStatus::Error => "Error",
        }
    }
}

/// Shared daemon state.
#[derive(Debug)]
pub struct DaemonState {
    /// Whether the adapter is powered.
    pub powered: RwLock<bool>,

    /// Whether discovery is running.
    pub discovering: RwLock<bool>,

    /// Hands-free endpoint status.
    pub hfp_status: RwLock<ProfileStatus>,

    /// Object push endpoint status.
    pub opp_status: RwLock<ProfileStatus>,

    /// Peer of the active hands-free session.
    pub hfp_peer: RwLock<Option<Address>>,

    /// Name of the most recently received object.
    pub last_received: RwLock<Option<String>>,
}

impl Default for DaemonState {
    fn default() -> Self {
        Self {
            powered: RwLock::new(false),
            discovering: RwLock::new(false),
            hfp_status: RwLock::new(ProfileStatus::Idle),
            opp_status: RwLock::new(ProfileStatus::Idle),
            hfp_peer: RwLock::new(None),
            last_received: RwLock::new(None),
        }
    }
}

impl DaemonState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_powered(&self, powered: bool) {
        *self.powered.write() = powered;
    }

    pub fn is_powered(&self) -> bool {
        *self.powered.read()
    }

    pub fn set_discovering(&self, discovering: bool) {
        *self.discovering.write() = discovering;
    }

    pub fn is_discovering(&self) -> bool {
        *self.discovering.read()
    }

    pub fn set_hfp_status(&self, status: ProfileStatus) {
        *self.hfp_status.write() = status;
    }

    pub fn hfp_status(&self) -> ProfileStatus {
        *self.hfp_status.read()
    }

    pub fn set_opp_status(&self, status: ProfileStatus) {
        *self.opp_status.write() = status;
    }

    pub fn opp_status(&self) -> ProfileStatus {
        *self.opp_status.read()
    }

    pub fn set_hfp_peer(&self, peer: Option<Address>) {
        *self.hfp_peer.write() = peer;
    }

    pub fn hfp_peer(&self) -> Option<Address> {
        *self.hfp_peer.read()
    }

    pub fn set_last_received(&self, name: String) {
        *self.last_received.write() = Some(name);
    }

    pub fn last_received(&self) -> Option<String> {
        self.last_received.read().clone()
    }
}
