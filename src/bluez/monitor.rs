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

//! The bus event loop.
//!
//! One task multiplexes adapter signals, the discovery stream and a
//! registration table of per-device watches. Watch registration flows over
//! a command channel into this task, so the table has a single owner and
//! add/remove can never race the poll loop.

use bluer::{Adapter, AdapterEvent, AdapterProperty, Address, DeviceEvent, DeviceProperty};
use futures::stream::Stream;
use futures::StreamExt;
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Commands accepted by the monitor task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorCommand {
    /// Subscribe to property changes of one device.
    WatchDevice(Address),
    /// Drop the subscription for one device.
    UnwatchDevice(Address),
    StartDiscovery,
    StopDiscovery,
    Shutdown,
}

/// Signals delivered to the façade.
#[derive(Debug)]
pub enum BluezEvent {
    /// A device appeared during discovery.
    DeviceFound(Address),
    /// A known device went away.
    DeviceRemoved(Address),
    /// An adapter property changed.
    AdapterChanged(AdapterProperty),
    /// A watched device's property changed.
    DeviceChanged { address: Address, property: DeviceProperty },
    /// Discovery state flipped.
    Discovering(bool),
}

/// Registration table mapping device address to its forwarder task.
/// Inserting over an existing entry or removing one aborts the old task,
/// so the table and the running watches cannot drift apart.
#[derive(Default)]
struct WatchTable {
    entries: HashMap<Address, JoinHandle<()>>,
}

impl WatchTable {
    fn insert(&mut self, addr: Address, task: JoinHandle<()>) {
        if let Some(old) = self.entries.insert(addr, task) {
            debug!("replacing existing watch for {}", addr);
            old.abort();
        }
    }

    fn remove(&mut self, addr: Address) -> bool {
        match self.entries.remove(&addr) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    fn contains(&self, addr: Address) -> bool {
        self.entries.contains_key(&addr)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn clear(&mut self) {
        for (_, task) in self.entries.drain() {
            task.abort();
        }
    }
}

/// Handle to the running monitor task.
pub struct AdapterMonitor {
    cmd_tx: mpsc::Sender<MonitorCommand>,
    task: JoinHandle<()>,
}

impl AdapterMonitor {
    /// Spawns the monitor task. Bus events arrive on `event_tx`.
    pub fn spawn(adapter: Adapter, event_tx: mpsc::Sender<BluezEvent>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let task = tokio::spawn(run(adapter, event_tx, cmd_rx));
        Self { cmd_tx, task }
    }

    pub async fn send(&self, command: MonitorCommand) {
        if self.cmd_tx.send(command).await.is_err() {
            warn!("monitor task is gone, dropping {:?}", command);
        }
    }

    pub async fn start_discovery(&self) {
        self.send(MonitorCommand::StartDiscovery).await;
    }

    pub async fn stop_discovery(&self) {
        self.send(MonitorCommand::StopDiscovery).await;
    }

    pub async fn watch_device(&self, addr: Address) {
        self.send(MonitorCommand::WatchDevice(addr)).await;
    }

    pub async fn unwatch_device(&self, addr: Address) {
        self.send(MonitorCommand::UnwatchDevice(addr)).await;
    }

    /// Asks the task to exit and joins it with a bounded wait.
    pub async fn shutdown(mut self) {
        let _ = self.cmd_tx.send(MonitorCommand::Shutdown).await;
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut self.task).await.is_err() {
            warn!("monitor task did not stop in time, aborting it");
            self.task.abort();
        }
    }
}

type EventStream = Pin<Box<dyn Stream<Item = AdapterEvent> + Send>>;

async fn run(
    adapter: Adapter,
    event_tx: mpsc::Sender<BluezEvent>,
    mut cmd_rx: mpsc::Receiver<MonitorCommand>,
) {
    let mut watches = WatchTable::default();
    let (device_tx, mut device_rx) = mpsc::channel::<BluezEvent>(64);

    let mut adapter_events: EventStream = match adapter.events().await {
        Ok(stream) => Box::pin(stream),
        Err(e) => {
            error!("cannot subscribe to adapter events: {e}");
            return;
        }
    };
    let mut discovery: Option<EventStream> = None;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                None | Some(MonitorCommand::Shutdown) => break,
                Some(MonitorCommand::WatchDevice(addr)) => {
                    if !watches.contains(addr) {
                        watches.insert(
                            addr,
                            tokio::spawn(forward_device_events(
                                adapter.clone(),
                                addr,
                                device_tx.clone(),
                            )),
                        );
                        debug!("watching {} ({} watches active)", addr, watches.len());
                    }
                }
                Some(MonitorCommand::UnwatchDevice(addr)) => {
                    if watches.remove(addr) {
                        debug!("stopped watching {}", addr);
                    }
                }
                Some(MonitorCommand::StartDiscovery) => {
                    if discovery.is_none() {
                        match adapter.discover_devices().await {
                            Ok(stream) => {
                                info!("discovery started");
                                discovery = Some(Box::pin(stream));
                                let _ = event_tx.send(BluezEvent::Discovering(true)).await;
                            }
                            Err(e) => error!("cannot start discovery: {e}"),
                        }
                    }
                }
                Some(MonitorCommand::StopDiscovery) => {
                    // Dropping the stream releases the BlueZ discovery
                    // session.
                    if discovery.take().is_some() {
                        info!("discovery stopped");
                        let _ = event_tx.send(BluezEvent::Discovering(false)).await;
                    }
                }
            },

            Some(event) = device_rx.recv() => {
                let _ = event_tx.send(event).await;
            }

            event = adapter_events.next() => match event {
                Some(event) => {
                    dispatch_adapter_event(event, &adapter, &mut watches, &device_tx, &event_tx)
                        .await;
                }
                None => {
                    warn!("adapter event stream ended, stopping monitor");
                    break;
                }
            },

            event = async { discovery.as_mut().expect("guarded").next().await },
                    if discovery.is_some() => {
                match event {
                    Some(event) => {
                        dispatch_adapter_event(
                            event,
                            &adapter,
                            &mut watches,
                            &device_tx,
                            &event_tx,
                        )
                        .await;
                    }
                    None => {
                        discovery = None;
                        let _ = event_tx.send(BluezEvent::Discovering(false)).await;
                    }
                }
            }
        }
    }

    watches.clear();
    debug!("monitor task stopped");
}

async fn dispatch_adapter_event(
    event: AdapterEvent,
    adapter: &Adapter,
    watches: &mut WatchTable,
    device_tx: &mpsc::Sender<BluezEvent>,
    event_tx: &mpsc::Sender<BluezEvent>,
) {
    match event {
        AdapterEvent::DeviceAdded(addr) => {
            debug!("device found: {}", addr);
            // Found devices are watched automatically so property changes
            // (name resolution, RSSI) reach the façade.
            if !watches.contains(addr) {
                watches.insert(
                    addr,
                    tokio::spawn(forward_device_events(adapter.clone(), addr, device_tx.clone())),
                );
            }
            let _ = event_tx.send(BluezEvent::DeviceFound(addr)).await;
        }
        AdapterEvent::DeviceRemoved(addr) => {
            debug!("device removed: {}", addr);
            watches.remove(addr);
            let _ = event_tx.send(BluezEvent::DeviceRemoved(addr)).await;
        }
        AdapterEvent::PropertyChanged(property) => {
            let _ = event_tx.send(BluezEvent::AdapterChanged(property)).await;
        }
        #[allow(unreachable_patterns)]
        _ => {}
    }
}

/// Forwards one device's property changes into the monitor's funnel.
async fn forward_device_events(
    adapter: Adapter,
    addr: Address,
    tx: mpsc::Sender<BluezEvent>,
) {
    let device = match adapter.device(addr) {
        Ok(device) => device,
        Err(e) => {
            warn!("no device object for {}: {e}", addr);
            return;
        }
    };
    let mut events = match device.events().await {
        Ok(events) => events,
        Err(e) => {
            warn!("cannot watch {}: {e}", addr);
            return;
        }
    };

    while let Some(event) = events.next().await {
        match event {
            DeviceEvent::PropertyChanged(property) => {
                if tx.send(BluezEvent::DeviceChanged { address: addr, property }).await.is_err() {
                    break;
                }
            }
            #[allow(unreachable_patterns)]
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parked_task() -> JoinHandle<()> {
        tokio::spawn(std::future::pending())
    }

    #[tokio::test]
    async fn test_watch_table_bookkeeping() {
        let mut table = WatchTable::default();
        let a: Address = "00:00:00:00:00:01".parse().unwrap();
        let b: Address = "00:00:00:00:00:02".parse().unwrap();

        table.insert(a, parked_task());
        table.insert(b, parked_task());
        assert_eq!(table.len(), 2);
        assert!(table.contains(a));

        assert!(table.remove(a));
        assert!(!table.contains(a));
        assert!(!table.remove(a));
        assert_eq!(table.len(), 1);

        table.clear();
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn test_watch_table_replacement_aborts_old_task() {
        let mut table = WatchTable::default();
        let addr: Address = "00:00:00:00:00:03".parse().unwrap();

        let first = parked_task();
        let first_aborted = first.abort_handle();
        table.insert(addr, first);
        table.insert(addr, parked_task());

        // Still a single entry, and the replaced task is being torn down.
        assert_eq!(table.len(), 1);
        for _ in 0..100 {
            if first_aborted.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(first_aborted.is_finished());
    }
}
