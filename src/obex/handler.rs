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

//! Capability set the OBEX server dispatches into.

use super::codec::{self, HeaderSet, ResponseCode};

/// A fully reassembled inbound object, delivered once the final Put
/// fragment has arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundObject {
    /// Object name from the Name header, if the peer sent one.
    pub name: Option<String>,
    /// Total length the peer declared up front, if any.
    pub declared_length: Option<u32>,
    /// Concatenated Body chunks.
    pub body: Vec<u8>,
}

/// Profile hook invoked by the OBEX server. OPP and FTP implement this.
///
/// Get is asymmetric on purpose: its responses are large pre-built payloads
/// (folder listings), so the handler produces the entire response packet
/// rather than just a code.
pub trait ObexHandler: Send + Sync + 'static {
    fn on_connect(&self) -> ResponseCode {
        ResponseCode::SUCCESS
    }

    fn on_disconnect(&self) -> ResponseCode {
        ResponseCode::SUCCESS
    }

    fn on_set_path(&self, _flags: u8, _headers: &HeaderSet) -> ResponseCode {
        ResponseCode::NOT_IMPLEMENTED
    }

    fn on_put(&self, _object: InboundObject) -> ResponseCode {
        ResponseCode::NOT_IMPLEMENTED
    }

    fn on_get(&self, _final_packet: bool, _connection_id: u32, _headers: &HeaderSet) -> Vec<u8> {
        simple_response(ResponseCode::NOT_IMPLEMENTED)
    }
}

/// A bare 3-byte response packet carrying only a code.
pub fn simple_response(code: ResponseCode) -> Vec<u8> {
    let mut packet = codec::start_packet(code.0);
    codec::finish_packet(&mut packet).expect("3-byte packet always fits");
    packet
}
