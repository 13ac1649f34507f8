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

//! BlueZ integration: adapter façade, pairing agent and bus monitoring.

mod monitor;

pub use monitor::{AdapterMonitor, BluezEvent, MonitorCommand};

use anyhow::{Context, Result};
use bluer::agent::{Agent, AgentHandle, ReqResult};
use bluer::{Adapter, Address, Session};
use futures::FutureExt;
use parking_lot::RwLock;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// How many times adapter resolution is retried while bluetoothd is still
/// coming up.
pub const ADAPTER_RESOLVE_ATTEMPTS: usize = 1000;

const ADAPTER_RESOLVE_DELAY: Duration = Duration::from_millis(10);

/// Well-known SDP service class UUIDs for the profiles we speak.
pub mod service_uuid {
    use uuid::Uuid;

    pub const SERIAL_PORT: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805F9B34FB);
    pub const OBEX_OBJECT_PUSH: Uuid = Uuid::from_u128(0x00001105_0000_1000_8000_00805F9B34FB);
    pub const OBEX_FILE_TRANSFER: Uuid = Uuid::from_u128(0x00001106_0000_1000_8000_00805F9B34FB);
    pub const AUDIO_SINK: Uuid = Uuid::from_u128(0x0000110B_0000_1000_8000_00805F9B34FB);
    pub const HANDSFREE: Uuid = Uuid::from_u128(0x0000111E_0000_1000_8000_00805F9B34FB);
    pub const HANDSFREE_AG: Uuid = Uuid::from_u128(0x0000111F_0000_1000_8000_00805F9B34FB);
}

/// One refresh of the adapter's property dictionary. The cache may lag a
/// `PropertyChanged` signal until the next refresh; eventual consistency
/// is fine here.
#[derive(Debug, Clone)]
pub struct AdapterSnapshot {
    pub address: Address,
    pub name: String,
    pub alias: String,
    pub class: u32,
    pub powered: bool,
    pub discoverable: bool,
    pub discoverable_timeout: u32,
    pub pairable: bool,
    pub pairable_timeout: u32,
    pub discovering: bool,
    pub devices: Vec<Address>,
    pub uuids: Vec<Uuid>,
}

/// Property snapshot of one remote device.
#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
    pub address: Address,
    pub alias: String,
    pub class: Option<u32>,
    pub paired: bool,
    pub connected: bool,
    pub rssi: Option<i16>,
    pub uuids: Vec<Uuid>,
}

/// Retries `op` up to `attempts` times while `retryable` approves the
/// error; any other error fails immediately.
pub(crate) async fn retry_while<T, E, F, Fut, P>(
    attempts: usize,
    delay: Duration,
    mut op: F,
    mut retryable: P,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    P: FnMut(&E) -> bool,
{
    let attempts = attempts.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !retryable(&err) {
                    return Err(err);
                }
                last_err = Some(err);
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    Err(last_err.expect("at least one attempt was made"))
}

/// Whether an adapter-resolution error means the Bluetooth service is
/// still starting and worth another attempt.
fn is_service_starting(err: &bluer::Error) -> bool {
    err.kind == bluer::ErrorKind::NotFound || err.to_string().contains("ServiceUnknown")
}

/// Builds the device object path BlueZ uses under the given adapter path.
pub fn device_object_path(adapter_path: &str, addr: Address) -> String {
    format!("{}/dev_{}", adapter_path, addr.to_string().replace(':', "_"))
}

/// Extracts the device address from a BlueZ object path of the form
/// `.../dev_XX_XX_XX_XX_XX_XX`.
pub fn address_from_object_path(path: &str) -> Option<Address> {
    let tail = path.rsplit('/').next()?;
    let hex = tail.strip_prefix("dev_")?;
    hex.replace('_', ":").parse().ok()
}

/// Owns the bus session, the default adapter and the pairing agent.
/// Constructed once at startup and injected wherever adapter state is
/// needed.
pub struct AdapterService {
    _session: Session,
    adapter: Adapter,
    _agent: AgentHandle,
    cached: RwLock<Option<AdapterSnapshot>>,
}

impl AdapterService {
    /// Connects to the system bus and resolves the default adapter,
    /// retrying while bluetoothd is still starting.
    pub async fn new(power_on: bool) -> Result<Self> {
        let session = Session::new().await.context("connecting to the system bus")?;

        let adapter = retry_while(
            ADAPTER_RESOLVE_ATTEMPTS,
            ADAPTER_RESOLVE_DELAY,
            || session.default_adapter(),
            is_service_starting,
        )
        .await
        .context("resolving the default Bluetooth adapter")?;
        info!("using Bluetooth adapter {}", adapter.name());

        let agent = session
            .register_agent(pairing_agent())
            .await
            .context("registering the pairing agent")?;
        debug!("pairing agent registered");

        let service =
            Self { _session: session, adapter, _agent: agent, cached: RwLock::new(None) };
        if power_on && !service.adapter.is_powered().await? {
            info!("powering on Bluetooth adapter");
            service.adapter.set_powered(true).await?;
        }
        Ok(service)
    }

    /// The underlying adapter handle, for the monitor task.
    pub fn adapter(&self) -> Adapter {
        self.adapter.clone()
    }

    pub async fn address(&self) -> Result<Address> {
        Ok(self.adapter.address().await?)
    }

    /// Reads the full property set from BlueZ and replaces the cache.
    pub async fn refresh_properties(&self) -> Result<AdapterSnapshot> {
        let adapter = &self.adapter;
        let snapshot = AdapterSnapshot {
            address: adapter.address().await?,
            name: adapter.name().to_string(),
            alias: adapter.alias().await?,
            class: adapter.class().await?,
            powered: adapter.is_powered().await?,
            discoverable: adapter.is_discoverable().await?,
            discoverable_timeout: adapter.discoverable_timeout().await?,
            pairable: adapter.is_pairable().await?,
            pairable_timeout: adapter.pairable_timeout().await?,
            discovering: adapter.is_discovering().await?,
            devices: adapter.device_addresses().await?,
            uuids: adapter
                .uuids()
                .await?
                .unwrap_or_default()
                .into_iter()
                .collect(),
        };
        *self.cached.write() = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// The most recent snapshot, if any refresh has happened yet.
    pub fn cached_properties(&self) -> Option<AdapterSnapshot> {
        self.cached.read().clone()
    }

    /// Sets the adapter alias, optimistically updating the cache.
    pub async fn set_alias(&self, alias: &str) -> Result<()> {
        self.adapter.set_alias(alias.to_string()).await?;
        if let Some(cached) = self.cached.write().as_mut() {
            cached.alias = alias.to_string();
        }
        info!("adapter alias set to '{}'", alias);
        Ok(())
    }

    pub async fn set_powered(&self, powered: bool) -> Result<()> {
        self.adapter.set_powered(powered).await?;
        if let Some(cached) = self.cached.write().as_mut() {
            cached.powered = powered;
        }
        info!("adapter powered {}", if powered { "on" } else { "off" });
        Ok(())
    }

    pub async fn set_discoverable(&self, discoverable: bool, timeout: Option<u32>) -> Result<()> {
        if let Some(timeout) = timeout {
            self.adapter.set_discoverable_timeout(timeout).await?;
        }
        self.adapter.set_discoverable(discoverable).await?;
        if let Some(cached) = self.cached.write().as_mut() {
            cached.discoverable = discoverable;
            if let Some(timeout) = timeout {
                cached.discoverable_timeout = timeout;
            }
        }
        Ok(())
    }

    pub async fn set_pairable(&self, pairable: bool, timeout: Option<u32>) -> Result<()> {
        if let Some(timeout) = timeout {
            self.adapter.set_pairable_timeout(timeout).await?;
        }
        self.adapter.set_pairable(pairable).await?;
        if let Some(cached) = self.cached.write().as_mut() {
            cached.pairable = pairable;
            if let Some(timeout) = timeout {
                cached.pairable_timeout = timeout;
            }
        }
        Ok(())
    }

    /// Reads one device's property snapshot.
    pub async fn device(&self, addr: Address) -> Result<DeviceSnapshot> {
        let device = self.adapter.device(addr)?;
        Ok(DeviceSnapshot {
            address: addr,
            alias: device.alias().await.unwrap_or_else(|_| addr.to_string()),
            class: device.class().await.ok().flatten(),
            paired: device.is_paired().await?,
            connected: device.is_connected().await?,
            rssi: device.rssi().await.ok().flatten(),
            uuids: device
                .uuids()
                .await?
                .unwrap_or_default()
                .into_iter()
                .collect(),
        })
    }

    /// Initiates pairing. The registered agent auto-confirms the other
    /// side of the exchange; freshly paired devices are marked trusted so
    /// their profile connections skip per-connection authorization.
    pub async fn pair_device(&self, addr: Address) -> Result<()> {
        let device = self.adapter.device(addr)?;
        device.pair().await.with_context(|| format!("pairing with {addr}"))?;
        if let Err(e) = device.set_trusted(true).await {
            debug!("cannot mark {} trusted: {e}", addr);
        }
        info!("paired with {}", addr);
        Ok(())
    }

    pub async fn remove_device(&self, addr: Address) -> Result<()> {
        self.adapter.remove_device(addr).await?;
        info!("removed device {}", addr);
        Ok(())
    }

    /// Connects the device's profile with the given service UUID, e.g.
    /// [`service_uuid::AUDIO_SINK`].
    pub async fn connect_profile(&self, addr: Address, uuid: Uuid) -> Result<()> {
        let device = self.adapter.device(addr)?;
        device
            .connect_profile(&uuid)
            .await
            .with_context(|| format!("connecting profile {uuid} on {addr}"))?;
        Ok(())
    }

    /// Resolves the device's advertised service UUIDs.
    pub async fn discover_services(&self, addr: Address) -> Result<Vec<Uuid>> {
        let device = self.adapter.device(addr)?;
        Ok(device.uuids().await?.unwrap_or_default().into_iter().collect())
    }
}

/// The pairing agent: confirmation and authorization requests are accepted
/// outright, which matches a headless daemon with no one to ask.
fn pairing_agent() -> Agent {
    Agent {
        request_default: false,
        request_confirmation: Some(Box::new(|req| {
            async move {
                info!("confirming pairing with {} (passkey {:06})", req.device, req.passkey);
                ReqResult::Ok(())
            }
            .boxed()
        })),
        request_authorization: Some(Box::new(|req| {
            async move {
                info!("authorizing pairing with {}", req.device);
                ReqResult::Ok(())
            }
            .boxed()
        })),
        authorize_service: Some(Box::new(|req| {
            async move {
                info!("authorizing service {} for {}", req.service, req.device);
                ReqResult::Ok(())
            }
            .boxed()
        })),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, PartialEq)]
    struct ServiceUnknown;

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_op = calls.clone();

        let result = retry_while(
            ADAPTER_RESOLVE_ATTEMPTS,
            Duration::ZERO,
            move || {
                let calls = calls_in_op.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 7 {
                        Err(ServiceUnknown)
                    } else {
                        Ok("adapter-path")
                    }
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result, Ok("adapter-path"));
        assert_eq!(calls.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn test_retry_gives_up_at_the_attempt_ceiling() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_op = calls.clone();

        let result: std::result::Result<(), _> = retry_while(
            ADAPTER_RESOLVE_ATTEMPTS,
            Duration::ZERO,
            move || {
                let calls = calls_in_op.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ServiceUnknown)
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result, Err(ServiceUnknown));
        assert_eq!(calls.load(Ordering::SeqCst), ADAPTER_RESOLVE_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_retry_stops_on_non_retryable_error() {
        let result: std::result::Result<(), _> = retry_while(
            10,
            Duration::ZERO,
            || async { Err("access denied") },
            |err| *err == "service unknown",
        )
        .await;
        assert_eq!(result, Err("access denied"));
    }

    #[test]
    fn test_object_path_round_trip() {
        let addr: Address = "A0:B1:C2:D3:E4:F5".parse().unwrap();
        let path = device_object_path("/org/bluez/hci0", addr);
        assert_eq!(path, "/org/bluez/hci0/dev_A0_B1_C2_D3_E4_F5");
        assert_eq!(address_from_object_path(&path), Some(addr));

        // And back again: path -> address -> path.
        let original = "/org/bluez/hci0/dev_00_11_22_33_44_55";
        let addr = address_from_object_path(original).unwrap();
        assert_eq!(device_object_path("/org/bluez/hci0", addr), original);
    }

    #[test]
    fn test_malformed_object_paths_rejected() {
        assert_eq!(address_from_object_path("/org/bluez/hci0"), None);
        assert_eq!(address_from_object_path("/org/bluez/hci0/dev_xx_yy"), None);
        assert_eq!(address_from_object_path(""), None);
    }
}
