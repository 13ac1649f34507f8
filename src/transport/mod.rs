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

//! Bluetooth socket transport.
//!
//! RFCOMM protocol traffic goes through `bluer`'s stream types; this module
//! carries the raw `AF_BLUETOOTH` socket support for the link types `bluer`
//! does not expose (SCO voice links, classic L2CAP).

mod raw;

pub use raw::{RawListener, RawSocket};

use bluer::Address;

/// Bluetooth socket protocol type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    /// Serial-port emulation, stream oriented. OBEX and HFP signalling.
    Rfcomm,
    /// Synchronous voice link, sequenced packets.
    Sco,
    /// L2CAP connection-oriented channel, sequenced packets.
    L2cap,
}

/// Link-mode security options applied to a socket before connect or bind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkMode {
    pub auth: bool,
    pub encrypt: bool,
}

impl LinkMode {
    pub const NONE: LinkMode = LinkMode { auth: false, encrypt: false };
    pub const AUTH: LinkMode = LinkMode { auth: true, encrypt: false };

    /// The `*_LM` socket option bitmask. RFCOMM and L2CAP share the bit
    /// values.
    pub fn bits(&self) -> i32 {
        let mut lm = 0;
        if self.auth {
            lm |= raw::LM_AUTH;
        }
        if self.encrypt {
            lm |= raw::LM_ENCRYPT;
        }
        if self.auth && self.encrypt {
            lm |= raw::LM_SECURE;
        }
        lm
    }
}

/// Converts a display-ordered address into the little-endian `bdaddr_t`
/// byte order the kernel expects.
pub fn bdaddr_bytes(addr: Address) -> [u8; 6] {
    let mut bytes = addr.0;
    bytes.reverse();
    bytes
}

/// Converts kernel `bdaddr_t` bytes back into an [`Address`].
pub fn address_from_bdaddr(mut bytes: [u8; 6]) -> Address {
    bytes.reverse();
    Address(bytes)
}
