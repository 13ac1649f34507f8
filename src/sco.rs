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

//! SCO voice link management and audio routing.
//!
//! The SCO socket only has to exist for the duration of the call; once the
//! link is up the audio itself flows through the platform audio path
//! selected via [`AudioRouter`].

use anyhow::Result;
use bluer::Address;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::transport::{LinkMode, RawListener, RawSocket, SocketType};

/// Where call audio should be routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioRoute {
    /// Route through the Bluetooth SCO link.
    Sco,
    /// Back to the platform default (speaker/earpiece).
    Default,
}

/// Platform hook invoked when the SCO link comes up or goes down.
pub trait AudioRouter: Send + Sync + 'static {
    fn set_audio_route(&self, route: AudioRoute);
}

/// Router that only logs; the real platform integration is injected by the
/// embedding application.
pub struct LogAudioRouter;

impl AudioRouter for LogAudioRouter {
    fn set_audio_route(&self, route: AudioRoute) {
        info!("audio route set to {:?}", route);
    }
}

/// Owns at most one SCO link at a time.
pub struct ScoManager {
    router: Arc<dyn AudioRouter>,
    link: Mutex<Option<RawSocket>>,
    listener: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl ScoManager {
    pub fn new(router: Arc<dyn AudioRouter>) -> Arc<Self> {
        Arc::new(Self { router, link: Mutex::new(None), listener: Mutex::new(None) })
    }

    pub fn is_connected(&self) -> bool {
        self.link.lock().is_some()
    }

    /// Establishes the SCO link to `addr`, replacing any existing link.
    pub async fn connect(&self, addr: Address) -> Result<()> {
        if let Some(old) = self.link.lock().take() {
            warn!("replacing existing SCO link to {}", old.peer_addr());
            old.shutdown();
        }

        let socket = RawSocket::connect(SocketType::Sco, addr, 0, LinkMode::NONE).await?;
        *self.link.lock() = Some(socket);
        self.router.set_audio_route(AudioRoute::Sco);
        info!("SCO link established to {}", addr);
        Ok(())
    }

    /// Drops the SCO link and restores the default audio route.
    pub fn disconnect(&self) {
        if let Some(socket) = self.link.lock().take() {
            socket.shutdown();
            self.router.set_audio_route(AudioRoute::Default);
            info!("SCO link closed");
        }
    }

    /// Accepts remote-initiated SCO links in the background.
    pub fn listen(self: &Arc<Self>) -> Result<()> {
        let mut slot = self.listener.lock();
        if slot.is_some() {
            return Ok(());
        }

        let listener = RawListener::bind_listen(SocketType::Sco, 0, LinkMode::NONE)?;
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let manager = self.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((socket, peer)) => {
                            info!("SCO link accepted from {}", peer);
                            if let Some(old) = manager.link.lock().replace(socket) {
                                warn!("dropping previous SCO link to {}", old.peer_addr());
                                old.shutdown();
                            }
                            manager.router.set_audio_route(AudioRoute::Sco);
                        }
                        Err(e) => {
                            error!("SCO accept failed: {e}");
                            break;
                        }
                    },
                }
            }
        });
        *slot = Some((shutdown_tx, task));
        Ok(())
    }

    /// Stops the accept task and tears down any live link.
    pub async fn shutdown(&self) {
        let taken = self.listener.lock().take();
        if let Some((shutdown_tx, mut task)) = taken {
            let _ = shutdown_tx.send(true);
            if tokio::time::timeout(Duration::from_secs(2), &mut task).await.is_err() {
                warn!("SCO accept task did not stop in time, aborting it");
                task.abort();
            }
        }
        self.disconnect();
    }
}
