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

//! Event processing and state updates.

use anyhow::Result;
use bluer::AdapterProperty;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::bluez::BluezEvent;
use crate::hfp::HfpEvent;
use crate::profiles::OppEvent;
use crate::state::{DaemonState, ProfileStatus};

/// Everything the daemon core reports upward, in one stream.
#[derive(Debug)]
pub enum ServiceEvent {
    Bluez(BluezEvent),
    Hfp(HfpEvent),
    Opp(OppEvent),
}

impl From<BluezEvent> for ServiceEvent {
    fn from(event: BluezEvent) -> Self {
        Self::Bluez(event)
    }
}

impl From<HfpEvent> for ServiceEvent {
    fn from(event: HfpEvent) -> Self {
        Self::Hfp(event)
    }
}

impl From<OppEvent> for ServiceEvent {
    fn from(event: OppEvent) -> Self {
        Self::Opp(event)
    }
}

/// Folds service events into the shared state and the log.
pub struct EventProcessor {
    state: Arc<DaemonState>,
}

impl EventProcessor {
    pub fn new(state: Arc<DaemonState>) -> Self {
        Self { state }
    }

    /// Process a single event.
    pub fn process_event(&mut self, event: ServiceEvent) -> Result<()> {
        match event {
            ServiceEvent::Bluez(event) => self.handle_bluez(event),
            ServiceEvent::Hfp(event) => self.handle_hfp(event),
            ServiceEvent::Opp(event) => self.handle_opp(event),
        }
        Ok(())
    }

    fn handle_bluez(&self, event: BluezEvent) {
        match event {
            BluezEvent::DeviceFound(addr) => {
                info!("device found: {}", addr);
            }
            BluezEvent::DeviceRemoved(addr) => {
                info!("device removed: {}", addr);
            }
            BluezEvent::Discovering(active) => {
                info!("discovery {}", if active { "started" } else { "stopped" });
                self.state.set_discovering(active);
            }
            BluezEvent::AdapterChanged(property) => {
                debug!("adapter property changed: {:?}", property);
                if let AdapterProperty::Powered(powered) = property {
                    self.state.set_powered(powered);
                }
            }
            BluezEvent::DeviceChanged { address, property } => {
                debug!("device {} property changed: {:?}", address, property);
            }
        }
    }

    fn handle_hfp(&self, event: HfpEvent) {
        match event {
            HfpEvent::Connected { address } => {
                info!("hands-free unit connected: {}", address);
                self.state.set_hfp_status(ProfileStatus::Connected);
                self.state.set_hfp_peer(Some(address));
            }
            HfpEvent::Disconnected => {
                info!("hands-free unit disconnected");
                self.state.set_hfp_status(ProfileStatus::Listening);
                self.state.set_hfp_peer(None);
            }
            HfpEvent::Error(e) => {
                error!("hands-free session error: {}", e);
                self.state.set_hfp_status(ProfileStatus::Error);
            }
        }
    }

    fn handle_opp(&self, event: OppEvent) {
        match event {
            OppEvent::ObjectReceived { name, size, path } => {
                info!("received '{}' ({} bytes) at {}", name, size, path.display());
                self.state.set_last_received(name);
            }
            OppEvent::FileSent { peer, path } => {
                info!("sent {} to {}", path.display(), peer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bluer::Address;
    use std::path::PathBuf;

    #[test]
    fn test_hfp_events_update_state() {
        let state = DaemonState::new();
        let mut processor = EventProcessor::new(state.clone());
        let addr: Address = "AA:BB:CC:DD:EE:FF".parse().unwrap();

        processor
            .process_event(ServiceEvent::Hfp(HfpEvent::Connected { address: addr }))
            .unwrap();
        assert_eq!(state.hfp_status(), ProfileStatus::Connected);
        assert_eq!(state.hfp_peer(), Some(addr));

        processor.process_event(ServiceEvent::Hfp(HfpEvent::Disconnected)).unwrap();
        assert_eq!(state.hfp_status(), ProfileStatus::Listening);
        assert_eq!(state.hfp_peer(), None);
    }

    #[test]
    fn test_object_received_updates_state() {
        let state = DaemonState::new();
        let mut processor = EventProcessor::new(state.clone());

        processor
            .process_event(ServiceEvent::Opp(OppEvent::ObjectReceived {
                name: "card.vcf".into(),
                size: 128,
                path: PathBuf::from("/tmp/card.vcf"),
            }))
            .unwrap();
        assert_eq!(state.last_received(), Some("card.vcf".into()));
    }

    #[test]
    fn test_discovery_events_update_state() {
        let state = DaemonState::new();
        let mut processor = EventProcessor::new(state.clone());

        processor.process_event(ServiceEvent::Bluez(BluezEvent::Discovering(true))).unwrap();
        assert!(state.is_discovering());
        processor.process_event(ServiceEvent::Bluez(BluezEvent::Discovering(false))).unwrap();
        assert!(!state.is_discovering());
    }
}
