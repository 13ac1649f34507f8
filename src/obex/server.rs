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

//! OBEX server: accept loop plus a single-session message handler.

use anyhow::{bail, Context, Result};
use bluer::rfcomm::{Listener, SocketAddr};
use bluer::Address;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::codec::{self, ConnectInfo, HeaderSet, Opcode, ResponseCode, PACKET_ENVELOPE_LEN};
use super::handler::{simple_response, InboundObject, ObexHandler};

/// Max packet size this server advertises in CONNECT responses.
const MAX_PACKET_LEN: u16 = 0x2000;

/// Cap on a reassembled inbound object. The Name/Length headers are under
/// peer control; without a cap a hostile peer could stream Put fragments
/// until memory runs out.
const MAX_OBJECT_SIZE: usize = 64 * 1024 * 1024;

/// How long shutdown waits for tasks before forcing them down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// One-session admission slot. The acceptor claims it with a single
/// compare-and-swap; a second inbound connection while a session is live
/// fails the claim and is closed immediately.
#[derive(Clone, Default)]
pub struct SessionSlot(Arc<AtomicBool>);

impl SessionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_claim(&self) -> Option<SlotGuard> {
        if self.0.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            Some(SlotGuard(self.0.clone()))
        } else {
            None
        }
    }

    pub fn is_busy(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Releases the slot when the session task finishes, however it finishes.
pub struct SlotGuard(Arc<AtomicBool>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Accumulates Name/Length/Body headers across Put fragments until the
/// final packet arrives.
#[derive(Default)]
struct ObjectAssembler {
    name: Option<String>,
    declared_length: Option<u32>,
    body: Vec<u8>,
}

impl ObjectAssembler {
    fn absorb(&mut self, headers: &HeaderSet) {
        if self.name.is_none() {
            self.name = headers.name().map(str::to_owned);
        }
        if self.declared_length.is_none() {
            self.declared_length = headers.length();
        }
        for chunk in headers.bodies() {
            self.body.extend_from_slice(chunk);
        }
    }

    fn over_limit(&self) -> bool {
        self.body.len() > MAX_OBJECT_SIZE
            || self.declared_length.is_some_and(|l| l as usize > MAX_OBJECT_SIZE)
    }

    fn finish(&mut self) -> InboundObject {
        let object = InboundObject {
            name: self.name.take(),
            declared_length: self.declared_length.take(),
            body: std::mem::take(&mut self.body),
        };
        if let Some(declared) = object.declared_length {
            if declared as usize != object.body.len() {
                warn!(
                    declared,
                    actual = object.body.len(),
                    "peer declared a different object length than it sent"
                );
            }
        }
        object
    }

    fn reset(&mut self) {
        self.name = None;
        self.declared_length = None;
        self.body.clear();
    }
}

/// OBEX server bound to a local RFCOMM channel.
pub struct ObexServer {
    channel: u8,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl ObexServer {
    /// Binds the channel and starts the accept task.
    pub async fn bind<H: ObexHandler>(channel: u8, handler: Arc<H>) -> Result<Self> {
        let local_addr = SocketAddr::new(Address::any(), channel);
        let listener = Listener::bind(local_addr)
            .await
            .with_context(|| format!("binding OBEX server to RFCOMM channel {channel}"))?;
        info!("OBEX server listening on channel {}", channel);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(listener, handler, shutdown_rx));

        Ok(Self { channel, shutdown_tx, accept_task })
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Signals the accept task and waits for it with a bounded grace
    /// period, forcing it down if a blocking read never returns.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut self.accept_task).await.is_err() {
            warn!("OBEX server on channel {} did not stop in time, aborting it", self.channel);
            self.accept_task.abort();
        }
    }
}

async fn accept_loop<H: ObexHandler>(
    listener: Listener,
    handler: Arc<H>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let slot = SessionSlot::new();
    let mut next_connection_id: u32 = 0;
    let mut session: Option<JoinHandle<()>> = None;

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let Some(claim) = slot.try_claim() else {
                        // Busy: refuse by closing right away, leaving the
                        // live session's socket untouched.
                        info!("OBEX session active, rejecting connection from {}", peer.addr);
                        drop(stream);
                        continue;
                    };

                    info!("OBEX connection accepted from {}", peer.addr);
                    let handler = handler.clone();
                    next_connection_id = next_connection_id.wrapping_add(1);
                    let connection_id = next_connection_id;
                    session = Some(tokio::spawn(async move {
                        let _claim = claim;
                        if let Err(e) = serve_session(stream, handler, connection_id).await {
                            error!("OBEX session error: {e:#}");
                        }
                    }));
                }
                Err(e) => {
                    error!("OBEX accept error: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            },
        }
    }

    drop(listener);
    if let Some(mut task) = session.take() {
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
            warn!("forcing OBEX session down at shutdown");
            task.abort();
        }
    }
}

/// Serves one connection: strict request/response turn-taking until the
/// peer disconnects or the stream closes.
///
/// Generic over the stream so sessions can be driven over in-memory pipes.
pub async fn serve_session<S, H>(
    mut stream: S,
    handler: Arc<H>,
    connection_id: u32,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: ObexHandler,
{
    let mut assembler = ObjectAssembler::default();

    loop {
        let mut envelope = [0u8; PACKET_ENVELOPE_LEN];
        match stream.read_exact(&mut envelope).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("OBEX peer closed the connection");
                return Ok(());
            }
            Err(e) => return Err(e).context("reading OBEX request envelope"),
        }

        let total = u16::from_be_bytes([envelope[1], envelope[2]]) as usize;
        if total < PACKET_ENVELOPE_LEN {
            bail!("peer request declares impossible packet length {total}");
        }

        // Partial reads accumulate here until the whole packet arrived.
        let mut payload = vec![0u8; total - PACKET_ENVELOPE_LEN];
        stream.read_exact(&mut payload).await.context("reading OBEX request payload")?;
        trace!(
            opcode = format_args!("0x{:02x}", envelope[0]),
            payload = %hex::encode(&payload),
            "OBEX <<"
        );

        let response = match Opcode::from_u8(envelope[0]) {
            Some(Opcode::Connect) => {
                handle_connect(&payload, handler.as_ref(), connection_id)
            }
            Some(Opcode::Disconnect) => {
                let code = handler.on_disconnect();
                stream.write_all(&simple_response(code)).await?;
                stream.flush().await?;
                debug!("OBEX peer disconnected");
                return Ok(());
            }
            Some(Opcode::SetPath) => handle_set_path(&payload, handler.as_ref()),
            Some(Opcode::Put) => match codec::parse_headers(&payload) {
                Ok(headers) => {
                    assembler.absorb(&headers);
                    if assembler.over_limit() {
                        warn!("inbound object exceeds size cap, refusing");
                        assembler.reset();
                        simple_response(ResponseCode::REQUESTED_ENTITY_TOO_LARGE)
                    } else {
                        // Intermediate fragments are always waved through.
                        simple_response(ResponseCode::CONTINUE)
                    }
                }
                Err(e) => {
                    warn!("malformed Put headers: {e}");
                    assembler.reset();
                    simple_response(ResponseCode::BAD_REQUEST)
                }
            },
            Some(Opcode::PutFinal) => match codec::parse_headers(&payload) {
                Ok(headers) => {
                    assembler.absorb(&headers);
                    if assembler.over_limit() {
                        warn!("inbound object exceeds size cap, refusing");
                        assembler.reset();
                        simple_response(ResponseCode::REQUESTED_ENTITY_TOO_LARGE)
                    } else {
                        let code = handler.on_put(assembler.finish());
                        simple_response(code)
                    }
                }
                Err(e) => {
                    warn!("malformed Put headers: {e}");
                    assembler.reset();
                    simple_response(ResponseCode::BAD_REQUEST)
                }
            },
            Some(op @ (Opcode::Get | Opcode::GetFinal)) => match codec::parse_headers(&payload) {
                Ok(headers) => {
                    handler.on_get(op == Opcode::GetFinal, connection_id, &headers)
                }
                Err(e) => {
                    warn!("malformed Get headers: {e}");
                    simple_response(ResponseCode::BAD_REQUEST)
                }
            },
            Some(Opcode::Abort) => {
                debug!("peer aborted the transfer in progress");
                assembler.reset();
                simple_response(ResponseCode::SUCCESS)
            }
            None => {
                warn!("unhandled OBEX opcode 0x{:02x}", envelope[0]);
                simple_response(ResponseCode::BAD_REQUEST)
            }
        };

        trace!(response = %hex::encode(&response), "OBEX >>");
        stream.write_all(&response).await?;
        stream.flush().await?;
    }
}

fn handle_connect<H: ObexHandler>(payload: &[u8], handler: &H, connection_id: u32) -> Vec<u8> {
    let info = match ConnectInfo::decode(payload) {
        Ok(info) => info,
        Err(e) => {
            warn!("malformed Connect request: {e}");
            return simple_response(ResponseCode::BAD_REQUEST);
        }
    };
    match codec::parse_headers(&payload[ConnectInfo::WIRE_LEN..]) {
        Ok(set) => debug!(
            peer_version = format_args!("{}.{}", info.version >> 4, info.version & 0x0F),
            peer_max_packet_len = info.max_packet_len,
            request_headers = set.headers.len(),
            "OBEX Connect"
        ),
        Err(e) => warn!("ignoring malformed Connect request headers: {e}"),
    }

    let code = handler.on_connect();
    let mut response = codec::start_packet(code.0);
    if code.is_success() {
        ConnectInfo { version: codec::OBEX_VERSION, flags: 0, max_packet_len: MAX_PACKET_LEN }
            .encode(&mut response);
        codec::push_connection_id(&mut response, connection_id);
    }
    codec::finish_packet(&mut response).expect("connect response always fits");
    response
}

fn handle_set_path<H: ObexHandler>(payload: &[u8], handler: &H) -> Vec<u8> {
    // SetPath carries two extra bytes (flags, constants) between the
    // envelope and the headers.
    if payload.len() < 2 {
        warn!("SetPath request too short");
        return simple_response(ResponseCode::BAD_REQUEST);
    }
    let flags = payload[0];
    match codec::parse_headers(&payload[2..]) {
        Ok(headers) => simple_response(handler.on_set_path(flags, &headers)),
        Err(e) => {
            warn!("malformed SetPath headers: {e}");
            simple_response(ResponseCode::BAD_REQUEST)
        }
    }
}
