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

//! OBEX client state machine: Connect, Put, Disconnect.

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

use super::codec::{self, ConnectInfo, Opcode, ResponseCode, PACKET_ENVELOPE_LEN};

/// Max packet size we advertise to the peer.
const LOCAL_MAX_PACKET_LEN: u16 = 0x2000;

/// Floor for the peer's advertised max packet size. IrOBEX requires at
/// least 255; anything smaller is treated as a broken peer.
const MIN_REMOTE_PACKET_LEN: u16 = 255;

/// OBEX client over any byte stream. The OPP send path wraps an RFCOMM
/// stream; tests drive it over an in-memory duplex.
pub struct ObexClient<S> {
    stream: S,
    connected: bool,
    connection_id: u32,
    remote_max_packet_len: u16,
    remote_version: u8,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ObexClient<S> {
    /// Wraps a connected stream. No OBEX traffic happens until
    /// [`connect`](Self::connect).
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            connected: false,
            connection_id: 0,
            remote_max_packet_len: MIN_REMOTE_PACKET_LEN,
            remote_version: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// The peer's advertised max packet length, learned from the Connect
    /// response.
    pub fn remote_max_packet_len(&self) -> u16 {
        self.remote_max_packet_len
    }

    /// The peer's OBEX version byte, e.g. `0x10` for 1.0.
    pub fn remote_version(&self) -> u8 {
        self.remote_version
    }

    /// Sends a CONNECT request and enters the connected state iff the peer
    /// answers Success.
    pub async fn connect(&mut self) -> Result<()> {
        if self.connected {
            bail!("OBEX connection already established");
        }

        self.connection_id = self.connection_id.wrapping_add(1);

        let mut packet = codec::start_packet(Opcode::Connect as u8);
        ConnectInfo {
            version: codec::OBEX_VERSION,
            flags: 0,
            max_packet_len: LOCAL_MAX_PACKET_LEN,
        }
        .encode(&mut packet);
        codec::push_connection_id(&mut packet, self.connection_id);
        codec::finish_packet(&mut packet)?;

        let (code, payload) = self.send_request(&packet).await?;
        if !code.is_success() {
            bail!("OBEX CONNECT rejected with response 0x{:02x}", code.0);
        }

        let info = ConnectInfo::decode(&payload).context("malformed CONNECT response")?;
        self.remote_version = info.version;
        self.remote_max_packet_len = info.max_packet_len.max(MIN_REMOTE_PACKET_LEN);
        if info.max_packet_len < MIN_REMOTE_PACKET_LEN {
            warn!(
                advertised = info.max_packet_len,
                "peer advertised an undersized max packet length, clamping"
            );
        }

        // Servers usually attach ConnectionId/Who headers here; decode them
        // for the log but nothing downstream depends on them.
        match codec::parse_headers(&payload[ConnectInfo::WIRE_LEN..]) {
            Ok(set) => debug!(
                version = format_args!("{}.{}", info.version >> 4, info.version & 0x0F),
                max_packet_len = self.remote_max_packet_len,
                response_headers = set.headers.len(),
                "OBEX connection established"
            ),
            Err(err) => warn!("ignoring malformed CONNECT response headers: {err}"),
        }

        self.connected = true;
        Ok(())
    }

    /// Pushes one named object, fragmenting the body across packets sized
    /// to the peer's max packet length.
    ///
    /// Every fragment must be answered with Continue or Success; any other
    /// response aborts the transfer with no partial-success state retained.
    pub async fn put(&mut self, name: &str, body: &[u8]) -> Result<()> {
        if !self.connected {
            bail!("OBEX Put without an established connection");
        }
        let total_len: u32 =
            body.len().try_into().context("object too large for an OBEX Length header")?;

        let max = self.remote_max_packet_len as usize;
        let mut sent = 0usize;
        let mut first = true;

        loop {
            let mut packet = codec::start_packet(Opcode::Put as u8);
            codec::push_connection_id(&mut packet, self.connection_id);
            if first {
                codec::push_name(&mut packet, name)?;
                codec::push_length(&mut packet, total_len);
            }

            // Room left for a Body chunk after its own 3-byte header.
            let space = max.saturating_sub(packet.len() + PACKET_ENVELOPE_LEN);
            if space == 0 {
                bail!(
                    "peer max packet length {} leaves no room for object data of '{}'",
                    max,
                    name
                );
            }

            let chunk_len = space.min(body.len() - sent);
            codec::push_body(&mut packet, &body[sent..sent + chunk_len])?;
            sent += chunk_len;

            let last = sent >= body.len();
            if last {
                packet[0] = Opcode::PutFinal as u8;
            }
            codec::finish_packet(&mut packet)?;

            let (code, _) = self.send_request(&packet).await?;
            if !code.is_continue() && !code.is_success() {
                bail!(
                    "OBEX Put of '{}' aborted after {} bytes: response 0x{:02x}",
                    name,
                    sent,
                    code.0
                );
            }
            debug!(sent, total = body.len(), "object fragment accepted");

            if last {
                return Ok(());
            }
            first = false;
        }
    }

    /// Sends the fixed 3-byte Disconnect request. The detailed response is
    /// only logged; the local state always leaves the connected state.
    pub async fn disconnect(&mut self) -> Result<()> {
        if !self.connected {
            return Ok(());
        }

        let mut packet = codec::start_packet(Opcode::Disconnect as u8);
        codec::finish_packet(&mut packet)?;
        let (code, _) = self.send_request(&packet).await?;
        if !code.is_success() {
            debug!(response = format_args!("0x{:02x}", code.0), "peer grumbled at Disconnect");
        }

        self.connected = false;
        Ok(())
    }

    /// One request/response exchange. All reads loop to completion via
    /// `read_exact`; short reads on the envelope are handled the same way
    /// as short reads on the payload.
    async fn send_request(&mut self, packet: &[u8]) -> Result<(ResponseCode, Vec<u8>)> {
        trace!(request = %hex::encode(packet), "OBEX >>");
        self.stream.write_all(packet).await?;
        self.stream.flush().await?;

        let mut envelope = [0u8; PACKET_ENVELOPE_LEN];
        self.stream.read_exact(&mut envelope).await.context("reading OBEX response envelope")?;
        let code = ResponseCode(envelope[0]);
        let total = u16::from_be_bytes([envelope[1], envelope[2]]) as usize;
        if total < PACKET_ENVELOPE_LEN {
            bail!("peer response declares impossible packet length {total}");
        }

        let mut payload = vec![0u8; total - PACKET_ENVELOPE_LEN];
        self.stream.read_exact(&mut payload).await.context("reading OBEX response payload")?;
        trace!(response = %hex::encode(&payload), code = format_args!("0x{:02x}", code.0), "OBEX <<");

        Ok((code, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    /// Reads one OBEX packet off a stream: returns (opcode, header region).
    async fn read_packet<S: AsyncRead + Unpin>(stream: &mut S) -> (u8, Vec<u8>) {
        let mut envelope = [0u8; 3];
        stream.read_exact(&mut envelope).await.unwrap();
        let total = u16::from_be_bytes([envelope[1], envelope[2]]) as usize;
        let mut payload = vec![0u8; total - 3];
        stream.read_exact(&mut payload).await.unwrap();
        (envelope[0], payload)
    }

    async fn write_simple_response<S: AsyncWrite + Unpin>(stream: &mut S, code: ResponseCode) {
        stream.write_all(&[code.0, 0x00, 0x03]).await.unwrap();
    }

    async fn write_connect_response<S: AsyncWrite + Unpin>(stream: &mut S, max_packet: u16) {
        let mut packet = codec::start_packet(ResponseCode::SUCCESS.0);
        ConnectInfo { version: codec::OBEX_VERSION, flags: 0, max_packet_len: max_packet }
            .encode(&mut packet);
        codec::push_connection_id(&mut packet, 1);
        codec::finish_packet(&mut packet).unwrap();
        stream.write_all(&packet).await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_put_disconnect_flow() {
        let (client_side, mut server_side) = duplex(64 * 1024);
        let body: Vec<u8> = (0..600u32).map(|i| i as u8).collect();
        let body_for_server = body.clone();

        let server = tokio::spawn(async move {
            let (op, payload) = read_packet(&mut server_side).await;
            assert_eq!(op, 0x80);
            let info = ConnectInfo::decode(&payload).unwrap();
            assert_eq!(info.version, 0x10);
            assert_eq!(info.max_packet_len, 0x2000);
            // Advertise a small packet size to force fragmentation.
            write_connect_response(&mut server_side, 256).await;

            let mut opcodes = Vec::new();
            let mut received = Vec::new();
            loop {
                let (op, payload) = read_packet(&mut server_side).await;
                opcodes.push(op);
                if op == 0x81 {
                    write_simple_response(&mut server_side, ResponseCode::SUCCESS).await;
                    break;
                }
                let set = codec::parse_headers(&payload).unwrap();
                assert_eq!(set.connection_id(), Some(1));
                for chunk in set.bodies() {
                    received.extend_from_slice(chunk);
                }
                let code = if op == 0x82 { ResponseCode::SUCCESS } else { ResponseCode::CONTINUE };
                write_simple_response(&mut server_side, code).await;
            }
            assert_eq!(received, body_for_server);
            opcodes
        });

        let mut client = ObexClient::new(client_side);
        client.connect().await.unwrap();
        assert!(client.is_connected());
        assert_eq!(client.remote_max_packet_len(), 256);

        client.put("ab.txt", &body).await.unwrap();
        client.disconnect().await.unwrap();
        assert!(!client.is_connected());

        // With max 256: the first packet's headers take 3 + 5 (connection
        // id) + 17 (name "ab.txt" in UTF-16) + 5 (length) = 30 bytes,
        // leaving 223 for the body; later packets carry 245. 600 bytes thus
        // need 3 fragments, the last one final.
        let opcodes = server.await.unwrap();
        assert_eq!(opcodes, vec![0x02, 0x02, 0x82, 0x81]);
    }

    #[tokio::test]
    async fn test_put_aborts_on_error_response() {
        let (client_side, mut server_side) = duplex(64 * 1024);

        let server = tokio::spawn(async move {
            let (op, _) = read_packet(&mut server_side).await;
            assert_eq!(op, 0x80);
            write_connect_response(&mut server_side, 256).await;

            let mut put_packets = 0u32;
            loop {
                let mut envelope = [0u8; 3];
                if server_side.read_exact(&mut envelope).await.is_err() {
                    break;
                }
                let total = u16::from_be_bytes([envelope[1], envelope[2]]) as usize;
                let mut payload = vec![0u8; total - 3];
                server_side.read_exact(&mut payload).await.unwrap();
                put_packets += 1;
                write_simple_response(&mut server_side, ResponseCode::FORBIDDEN).await;
            }
            put_packets
        });

        let mut client = ObexClient::new(client_side);
        client.connect().await.unwrap();

        let body = vec![0u8; 2048];
        let err = client.put("refused.bin", &body).await.unwrap_err();
        assert!(err.to_string().contains("0xc3"));
        drop(client);

        // The failing fragment kills the transfer; nothing further is sent.
        assert_eq!(server.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_empty_body_sends_single_final_packet() {
        let (client_side, mut server_side) = duplex(4096);

        let server = tokio::spawn(async move {
            let (op, _) = read_packet(&mut server_side).await;
            assert_eq!(op, 0x80);
            write_connect_response(&mut server_side, 1024).await;

            let (op, payload) = read_packet(&mut server_side).await;
            assert_eq!(op, 0x82);
            let set = codec::parse_headers(&payload).unwrap();
            assert_eq!(set.name(), Some("empty.txt"));
            assert_eq!(set.length(), Some(0));
            assert_eq!(set.bodies().next(), Some(&[][..]));
            write_simple_response(&mut server_side, ResponseCode::SUCCESS).await;
        });

        let mut client = ObexClient::new(client_side);
        client.connect().await.unwrap();
        client.put("empty.txt", &[]).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_rejected_leaves_client_disconnected() {
        let (client_side, mut server_side) = duplex(4096);

        tokio::spawn(async move {
            let _ = read_packet(&mut server_side).await;
            write_simple_response(&mut server_side, ResponseCode::SERVICE_UNAVAILABLE).await;
        });

        let mut client = ObexClient::new(client_side);
        assert!(client.connect().await.is_err());
        assert!(!client.is_connected());
        assert!(client.put("x", b"y").await.is_err());
    }
}
