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

//! Hands-Free Profile service: accept loop, AT session, SCO coordination.

use anyhow::{bail, Context, Result};
use bluer::rfcomm::{Listener, SocketAddr, Stream};
use bluer::Address;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::at::{
    indicator_report, read_at_line, send_line, AtResponder, Indicator, LINE_READ_TIMEOUT,
};
use crate::obex::SessionSlot;
use crate::sco::ScoManager;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Events the HFP service reports to the façade.
#[derive(Debug)]
pub enum HfpEvent {
    /// An AT session is up (inbound or outbound).
    Connected { address: Address },
    /// The session ended.
    Disconnected,
    /// The session hit a transport error and is being torn down.
    Error(String),
}

/// Shared handle to the live session's unsolicited-reply channel.
type UnsolicitedSlot = Arc<Mutex<Option<mpsc::Sender<String>>>>;

/// Hands-Free AG endpoint bound to a local RFCOMM channel.
pub struct HfpService {
    channel: u8,
    sco: Arc<ScoManager>,
    event_tx: mpsc::Sender<HfpEvent>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    accept_task: JoinHandle<()>,
    slot: SessionSlot,
    unsolicited: UnsolicitedSlot,
}

impl HfpService {
    /// Binds the channel and starts accepting hands-free connections.
    pub async fn listen(
        channel: u8,
        sco: Arc<ScoManager>,
        event_tx: mpsc::Sender<HfpEvent>,
    ) -> Result<Self> {
        let local_addr = SocketAddr::new(Address::any(), channel);
        let listener = Listener::bind(local_addr)
            .await
            .with_context(|| format!("binding HFP service to RFCOMM channel {channel}"))?;
        info!("HFP service listening on channel {}", channel);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let slot = SessionSlot::new();
        let unsolicited: UnsolicitedSlot = Arc::new(Mutex::new(None));

        let accept_task = tokio::spawn(accept_loop(
            listener,
            sco.clone(),
            event_tx.clone(),
            shutdown_rx.clone(),
            slot.clone(),
            unsolicited.clone(),
        ));

        Ok(Self {
            channel,
            sco,
            event_tx,
            shutdown_tx,
            shutdown_rx,
            accept_task,
            slot,
            unsolicited,
        })
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Whether an AT session is currently active.
    pub fn is_connected(&self) -> bool {
        self.slot.is_busy()
    }

    /// Dials out to a remote hands-free unit.
    pub async fn connect(&self, addr: Address, channel: u8) -> Result<()> {
        let Some(claim) = self.slot.try_claim() else {
            bail!("HFP session already active");
        };

        let stream = Stream::connect(SocketAddr::new(addr, channel))
            .await
            .with_context(|| format!("connecting HFP to {addr} channel {channel}"))?;
        info!("HFP connected to {} on channel {}", addr, channel);

        let (tx, rx) = mpsc::channel(8);
        *self.unsolicited.lock() = Some(tx);
        tokio::spawn(run_session(
            stream,
            addr,
            self.sco.clone(),
            self.event_tx.clone(),
            self.shutdown_rx.clone(),
            rx,
            claim,
            self.unsolicited.clone(),
        ));
        Ok(())
    }

    /// Queues an unsolicited `+CIEV` report for the live session. Delivery
    /// still depends on the peer having enabled reporting via `AT+CMER=`.
    /// Returns false when no session is up.
    pub fn notify_indicator(&self, indicator: Indicator, value: u8) -> bool {
        match self.unsolicited.lock().as_ref() {
            Some(tx) => tx.try_send(indicator_report(indicator, value)).is_ok(),
            None => false,
        }
    }

    /// Stops the accept task and lets the session observe shutdown on its
    /// next timeout tick.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut self.accept_task).await.is_err() {
            warn!("HFP accept task did not stop in time, aborting it");
            self.accept_task.abort();
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    listener: Listener,
    sco: Arc<ScoManager>,
    event_tx: mpsc::Sender<HfpEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
    slot: SessionSlot,
    unsolicited: UnsolicitedSlot,
) {
    let mut session: Option<JoinHandle<()>> = None;

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let Some(claim) = slot.try_claim() else {
                        info!("HFP session active, rejecting connection from {}", peer.addr);
                        drop(stream);
                        continue;
                    };

                    info!("HFP connection accepted from {}", peer.addr);
                    let (tx, rx) = mpsc::channel(8);
                    *unsolicited.lock() = Some(tx);
                    session = Some(tokio::spawn(run_session(
                        stream,
                        peer.addr,
                        sco.clone(),
                        event_tx.clone(),
                        shutdown_rx.clone(),
                        rx,
                        claim,
                        unsolicited.clone(),
                    )));
                }
                Err(e) => {
                    error!("HFP accept error: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            },
        }
    }

    drop(listener);
    if let Some(mut task) = session.take() {
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
            warn!("forcing HFP session down at shutdown");
            task.abort();
        }
    }
}

/// Runs one AT session to completion.
///
/// The loop shape mirrors the OBEX session: the line-read timeout doubles
/// as the tick on which shutdown and queued indicator reports are observed,
/// so nothing here depends on cancelling a read mid-line.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_session<S>(
    stream: S,
    peer: Address,
    sco: Arc<ScoManager>,
    event_tx: mpsc::Sender<HfpEvent>,
    shutdown_rx: watch::Receiver<bool>,
    mut unsolicited_rx: mpsc::Receiver<String>,
    claim: crate::obex::SlotGuard,
    unsolicited_slot: UnsolicitedSlot,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _claim = claim;
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut responder = AtResponder::new();

    let _ = event_tx.send(HfpEvent::Connected { address: peer }).await;

    // RFCOMM is up; next, the voice path. Peers without a usable address
    // get signalling only.
    if peer != Address::any() && !sco.is_connected() {
        if let Err(e) = sco.connect(peer).await {
            warn!("SCO setup to {} failed: {e:#}", peer);
        }
    }

    'session: loop {
        if *shutdown_rx.borrow() {
            debug!("HFP session observing shutdown");
            break;
        }

        // Queued indicator reports go out between reads; the peer gates
        // them with AT+CMER=.
        while let Ok(report) = unsolicited_rx.try_recv() {
            if responder.indicator_reporting() {
                if let Err(e) = send_line(&mut writer, &report).await {
                    error!("HFP indicator write failed: {e:#}");
                    break 'session;
                }
            } else {
                trace!("dropping indicator report, reporting disabled: {}", report);
            }
        }

        match read_at_line(&mut reader, LINE_READ_TIMEOUT).await {
            Ok(None) => continue,
            Ok(Some(line)) => {
                for reply in responder.handle(&line) {
                    if let Err(e) = send_line(&mut writer, &reply).await {
                        error!("HFP reply write failed: {e:#}");
                        let _ = event_tx.send(HfpEvent::Error(e.to_string())).await;
                        break 'session;
                    }
                }
            }
            Err(e) => {
                warn!("HFP read error: {e:#}");
                let _ = event_tx.send(HfpEvent::Error(e.to_string())).await;
                // Tear the audio link down off this task so the loop that
                // spotted the error is never the one blocking on it.
                let sco = sco.clone();
                tokio::spawn(async move { sco.disconnect() });
                break;
            }
        }
    }

    *unsolicited_slot.lock() = None;
    let _ = event_tx.send(HfpEvent::Disconnected).await;
    debug!("HFP session with {} ended", peer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sco::{AudioRouter, ScoManager};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    struct NullRouter;
    impl AudioRouter for NullRouter {
        fn set_audio_route(&self, _route: crate::sco::AudioRoute) {}
    }

    async fn read_reply<R: AsyncRead + Unpin>(reader: &mut R, len: usize) -> String {
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await.unwrap();
        String::from_utf8(buf).unwrap()
    }

    fn test_session(
        stream: tokio::io::DuplexStream,
    ) -> (
        mpsc::Receiver<HfpEvent>,
        mpsc::Sender<String>,
        watch::Sender<bool>,
        tokio::task::JoinHandle<()>,
    ) {
        let sco = ScoManager::new(Arc::new(NullRouter));
        let (event_tx, event_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (unsolicited_tx, unsolicited_rx) = mpsc::channel(8);
        let slot = SessionSlot::new();
        let claim = slot.try_claim().unwrap();
        let unsolicited_slot: UnsolicitedSlot = Arc::new(Mutex::new(None));

        // SCO connect fails fast in tests (no adapter), which the session
        // treats as non-fatal.
        let task = tokio::spawn(run_session(
            stream,
            Address::any(),
            sco,
            event_tx,
            shutdown_rx,
            unsolicited_rx,
            claim,
            unsolicited_slot,
        ));
        (event_rx, unsolicited_tx, shutdown_tx, task)
    }

    #[tokio::test]
    async fn test_session_answers_brsf() {
        let (mut peer, stream) = duplex(1024);
        let (mut events, _unsolicited, shutdown_tx, task) = test_session(stream);

        assert!(matches!(events.recv().await, Some(HfpEvent::Connected { .. })));

        peer.write_all(b"AT+BRSF=23\r").await.unwrap();
        let reply = read_reply(&mut peer, "\r\n+BRSF: 23\r\n\r\nOK\r\n".len()).await;
        assert_eq!(reply, "\r\n+BRSF: 23\r\n\r\nOK\r\n");

        peer.write_all(b"AT+BVRA\r").await.unwrap();
        let reply = read_reply(&mut peer, "\r\nERROR\r\n".len()).await;
        assert_eq!(reply, "\r\nERROR\r\n");

        let _ = shutdown_tx.send(true);
        task.await.unwrap();
        assert!(matches!(events.recv().await, Some(HfpEvent::Disconnected)));
    }

    #[tokio::test]
    async fn test_session_stays_silent_on_binary_junk() {
        let (mut peer, stream) = duplex(1024);
        let (_events, _unsolicited, shutdown_tx, task) = test_session(stream);

        peer.write_all(b"\xFF\xFE binary \xAD junk\r").await.unwrap();
        peer.write_all(b"AT+CHLD=?\r").await.unwrap();

        // The junk line yields nothing; the next reply belongs to AT+CHLD=?.
        let reply = read_reply(&mut peer, "\r\n+CHLD: (0,1,2,3)\r\n\r\nOK\r\n".len()).await;
        assert_eq!(reply, "\r\n+CHLD: (0,1,2,3)\r\n\r\nOK\r\n");

        let _ = shutdown_tx.send(true);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_indicator_reports_respect_cmer() {
        let (mut peer, stream) = duplex(1024);
        let (_events, unsolicited, shutdown_tx, task) = test_session(stream);

        // Reporting disabled: the queued report is dropped once the
        // session's next timeout tick drains it.
        unsolicited.send(indicator_report(Indicator::Call, 1)).await.unwrap();
        tokio::time::sleep(LINE_READ_TIMEOUT + Duration::from_millis(200)).await;

        peer.write_all(b"AT+CMER=3,0,0,1\r").await.unwrap();
        let reply = read_reply(&mut peer, "\r\nOK\r\n".len()).await;
        assert_eq!(reply, "\r\nOK\r\n");

        // Reporting enabled: the next report goes through. Nothing else
        // may precede it on the wire, proving the first one was dropped.
        unsolicited.send(indicator_report(Indicator::CallSetup, 2)).await.unwrap();
        let reply = read_reply(&mut peer, "\r\n+CIEV: 3,2\r\n".len()).await;
        assert_eq!(reply, "\r\n+CIEV: 3,2\r\n");

        let _ = shutdown_tx.send(true);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_error_ends_session() {
        let (peer, stream) = duplex(1024);
        let (mut events, _unsolicited, _shutdown_tx, task) = test_session(stream);

        assert!(matches!(events.recv().await, Some(HfpEvent::Connected { .. })));
        drop(peer);

        task.await.unwrap();
        let mut saw_error = false;
        while let Some(event) = events.recv().await {
            match event {
                HfpEvent::Error(_) => saw_error = true,
                HfpEvent::Disconnected => break,
                _ => {}
            }
        }
        assert!(saw_error);
    }
}
