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

//! The daemon façade: owns every component and exposes the command
//! surface. All parts are constructed here and injected explicitly; there
//! are no process-wide singletons.

use anyhow::{Context, Result};
use bluer::Address;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bluez::{service_uuid, AdapterMonitor, AdapterService, AdapterSnapshot, DeviceSnapshot};
use crate::config::Config;
use crate::events::ServiceEvent;
use crate::hfp::{HfpService, Indicator};
use crate::obex::ObexServer;
use crate::profiles::{FtpService, OppService};
use crate::sco::{AudioRouter, ScoManager};
use crate::state::{DaemonState, ProfileStatus};

/// Orchestrates adapter control, the OBEX servers, hands-free and audio.
pub struct BluetoothService {
    config: Config,
    adapter: AdapterService,
    monitor: AdapterMonitor,
    opp: Arc<OppService>,
    opp_server: ObexServer,
    ftp_server: ObexServer,
    hfp: HfpService,
    sco: Arc<ScoManager>,
    state: Arc<DaemonState>,
}

impl BluetoothService {
    /// Brings the whole stack up: adapter, monitor, profile servers.
    pub async fn start(
        config: Config,
        router: Arc<dyn AudioRouter>,
        event_tx: mpsc::Sender<ServiceEvent>,
    ) -> Result<Self> {
        let state = DaemonState::new();

        let adapter = AdapterService::new(config.bluetooth.power_on)
            .await
            .context("bringing up the Bluetooth adapter")?;
        if !config.bluetooth.device_name.is_empty() {
            adapter.set_alias(&config.bluetooth.device_name).await?;
        }
        adapter
            .set_discoverable(
                config.bluetooth.discoverable,
                Some(config.bluetooth.discoverable_timeout),
            )
            .await?;
        adapter.set_pairable(true, None).await?;

        let snapshot = adapter.refresh_properties().await?;
        state.set_powered(snapshot.powered);
        info!(
            "adapter {} ({}) ready, {} known devices",
            snapshot.address,
            snapshot.alias,
            snapshot.devices.len()
        );

        // Every component reports into its own channel; pumps fan them
        // into the single stream the embedder consumes.
        let (bluez_tx, bluez_rx) = mpsc::channel(32);
        let (hfp_tx, hfp_rx) = mpsc::channel(32);
        let (opp_tx, opp_rx) = mpsc::channel(32);
        pump_events(bluez_rx, event_tx.clone());
        pump_events(hfp_rx, event_tx.clone());
        pump_events(opp_rx, event_tx);

        let monitor = AdapterMonitor::spawn(adapter.adapter(), bluez_tx);

        let sco = ScoManager::new(router);
        if let Err(e) = sco.listen() {
            // No SCO listener just means we only originate audio links.
            warn!("SCO listener unavailable: {e:#}");
        }

        // Note: With bluer, the SDP service records are registered by
        // BlueZ when we bind the RFCOMM channels. For more control we
        // would use the profile API.
        let opp = Arc::new(OppService::new(config.inbox_dir(), opp_tx)?);
        let opp_server = ObexServer::bind(config.profiles.opp_channel, opp.clone()).await?;
        state.set_opp_status(ProfileStatus::Listening);

        let ftp = Arc::new(FtpService::new(config.share_dir())?);
        let ftp_server = ObexServer::bind(config.profiles.ftp_channel, ftp).await?;

        let hfp = HfpService::listen(config.profiles.hfp_channel, sco.clone(), hfp_tx).await?;
        state.set_hfp_status(ProfileStatus::Listening);

        Ok(Self {
            config,
            adapter,
            monitor,
            opp,
            opp_server,
            ftp_server,
            hfp,
            sco,
            state,
        })
    }

    pub fn state(&self) -> Arc<DaemonState> {
        self.state.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Powers the adapter on or off.
    pub async fn set_powered(&self, powered: bool) -> Result<()> {
        self.adapter.set_powered(powered).await?;
        self.state.set_powered(powered);
        Ok(())
    }

    pub async fn set_discoverable(&self, discoverable: bool, timeout: Option<u32>) -> Result<()> {
        self.adapter.set_discoverable(discoverable, timeout).await
    }

    pub async fn start_discovery(&self) {
        self.monitor.start_discovery().await;
    }

    pub async fn stop_discovery(&self) {
        self.monitor.stop_discovery().await;
    }

    /// Pairs with a device and starts watching its properties.
    pub async fn pair(&self, addr: Address) -> Result<()> {
        self.adapter.pair_device(addr).await?;
        self.monitor.watch_device(addr).await;
        Ok(())
    }

    pub async fn remove_device(&self, addr: Address) -> Result<()> {
        self.monitor.unwatch_device(addr).await;
        self.adapter.remove_device(addr).await
    }

    /// Fresh adapter property snapshot.
    pub async fn adapter_properties(&self) -> Result<AdapterSnapshot> {
        self.adapter.refresh_properties().await
    }

    pub async fn device(&self, addr: Address) -> Result<DeviceSnapshot> {
        self.adapter.device(addr).await
    }

    pub async fn discover_services(&self, addr: Address) -> Result<Vec<Uuid>> {
        self.adapter.discover_services(addr).await
    }

    /// Connects the remote A2DP sink.
    pub async fn connect_sink(&self, addr: Address) -> Result<()> {
        self.adapter.connect_profile(addr, service_uuid::AUDIO_SINK).await
    }

    /// Pushes a file over the Object Push profile.
    pub async fn send_file(&self, addr: Address, channel: u8, path: &Path) -> Result<()> {
        self.opp.send_file(addr, channel, path).await
    }

    /// Dials out to a hands-free unit.
    pub async fn connect_hfp(&self, addr: Address, channel: u8) -> Result<()> {
        self.hfp.connect(addr, channel).await
    }

    /// Reports a call-state indicator to the connected hands-free unit.
    pub fn notify_indicator(&self, indicator: Indicator, value: u8) -> bool {
        self.hfp.notify_indicator(indicator, value)
    }

    /// Orderly teardown: profile endpoints first, then the bus monitor and
    /// the audio link. Every join is bounded.
    pub async fn shutdown(self) {
        info!("shutting down Bluetooth service");
        self.hfp.shutdown().await;
        self.opp_server.shutdown().await;
        self.ftp_server.shutdown().await;
        self.monitor.shutdown().await;
        self.sco.shutdown().await;
        self.state.set_opp_status(ProfileStatus::Idle);
        self.state.set_hfp_status(ProfileStatus::Idle);
        info!("Bluetooth service stopped");
    }
}

/// Forwards one component's events into the combined stream.
fn pump_events<T>(mut rx: mpsc::Receiver<T>, tx: mpsc::Sender<ServiceEvent>)
where
    T: Into<ServiceEvent> + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if tx.send(event.into()).await.is_err() {
                break;
            }
        }
    });
}
