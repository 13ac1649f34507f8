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

//! Raw `AF_BLUETOOTH` sockets over tokio's `AsyncFd`.
//!
//! Native type and constant definitions follow the BlueZ kernel headers;
//! none of them are exported by libc.

use anyhow::{Context, Result};
use bluer::Address;
use libc::{c_int, sa_family_t, socklen_t, AF_BLUETOOTH, SOCK_SEQPACKET, SOCK_STREAM};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tokio::io::unix::AsyncFd;
use tracing::debug;

use super::{address_from_bdaddr, bdaddr_bytes, LinkMode, SocketType};

const BTPROTO_L2CAP: c_int = 0;
const BTPROTO_SCO: c_int = 2;
const BTPROTO_RFCOMM: c_int = 3;

const SOL_L2CAP: c_int = 6;
const SOL_RFCOMM: c_int = 18;

const RFCOMM_LM: c_int = 0x03;
const L2CAP_LM: c_int = 0x03;

pub(super) const LM_AUTH: c_int = 0x0002;
pub(super) const LM_ENCRYPT: c_int = 0x0004;
pub(super) const LM_SECURE: c_int = 0x0020;

/// 70 KB send buffer for RFCOMM sockets.
const RFCOMM_SO_SNDBUF: c_int = 70 * 1024;

#[repr(C)]
struct SockaddrRc {
    rc_family: sa_family_t,
    rc_bdaddr: [u8; 6],
    rc_channel: u8,
}

#[repr(C)]
struct SockaddrSco {
    sco_family: sa_family_t,
    sco_bdaddr: [u8; 6],
}

#[repr(C)]
struct SockaddrL2 {
    l2_family: sa_family_t,
    l2_psm: u16,
    l2_bdaddr: [u8; 6],
    l2_cid: u16,
    l2_bdaddr_type: u8,
}

/// Writes the protocol-specific sockaddr for `ty` into `storage` and
/// returns its length.
fn fill_sockaddr(
    ty: SocketType,
    bdaddr: [u8; 6],
    channel: u16,
    storage: &mut libc::sockaddr_storage,
) -> socklen_t {
    *storage = unsafe { mem::zeroed() };
    match ty {
        SocketType::Rfcomm => {
            let sa = storage as *mut _ as *mut SockaddrRc;
            unsafe {
                (*sa).rc_family = AF_BLUETOOTH as sa_family_t;
                (*sa).rc_bdaddr = bdaddr;
                (*sa).rc_channel = channel as u8;
            }
            mem::size_of::<SockaddrRc>() as socklen_t
        }
        SocketType::Sco => {
            let sa = storage as *mut _ as *mut SockaddrSco;
            unsafe {
                (*sa).sco_family = AF_BLUETOOTH as sa_family_t;
                (*sa).sco_bdaddr = bdaddr;
            }
            mem::size_of::<SockaddrSco>() as socklen_t
        }
        SocketType::L2cap => {
            let sa = storage as *mut _ as *mut SockaddrL2;
            unsafe {
                (*sa).l2_family = AF_BLUETOOTH as sa_family_t;
                (*sa).l2_psm = channel.to_le();
                (*sa).l2_bdaddr = bdaddr;
            }
            mem::size_of::<SockaddrL2>() as socklen_t
        }
    }
}

/// Reads the peer address back out of a sockaddr filled by the kernel.
fn peer_address(ty: SocketType, storage: &libc::sockaddr_storage) -> Address {
    let bdaddr = match ty {
        SocketType::Rfcomm => unsafe { (*(storage as *const _ as *const SockaddrRc)).rc_bdaddr },
        SocketType::Sco => unsafe { (*(storage as *const _ as *const SockaddrSco)).sco_bdaddr },
        SocketType::L2cap => unsafe { (*(storage as *const _ as *const SockaddrL2)).l2_bdaddr },
    };
    address_from_bdaddr(bdaddr)
}

fn last_os_error() -> io::Error {
    io::Error::last_os_error()
}

fn setsockopt<T>(fd: RawFd, level: c_int, name: c_int, value: &T) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            value as *const T as *const libc::c_void,
            mem::size_of::<T>() as socklen_t,
        )
    };
    if ret < 0 {
        return Err(last_os_error());
    }
    Ok(())
}

fn socket_error(fd: RawFd) -> io::Result<()> {
    let mut err: c_int = 0;
    let mut len = mem::size_of::<c_int>() as socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(last_os_error());
    }
    if err != 0 {
        return Err(io::Error::from_raw_os_error(err));
    }
    Ok(())
}

/// Opens a non-blocking Bluetooth socket of the given type and applies the
/// link-mode options before any connect or bind.
fn create_socket(ty: SocketType, mode: LinkMode) -> io::Result<OwnedFd> {
    let (sock_type, proto) = match ty {
        SocketType::Rfcomm => (SOCK_STREAM, BTPROTO_RFCOMM),
        SocketType::Sco => (SOCK_SEQPACKET, BTPROTO_SCO),
        SocketType::L2cap => (SOCK_SEQPACKET, BTPROTO_L2CAP),
    };
    let fd = unsafe {
        libc::socket(AF_BLUETOOTH, sock_type | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, proto)
    };
    if fd < 0 {
        return Err(last_os_error());
    }
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };

    // Kernel does not support LM for SCO.
    let lm = mode.bits();
    if lm != 0 {
        match ty {
            SocketType::Rfcomm => setsockopt(fd, SOL_RFCOMM, RFCOMM_LM, &lm)?,
            SocketType::L2cap => setsockopt(fd, SOL_L2CAP, L2CAP_LM, &lm)?,
            SocketType::Sco => {}
        }
    }
    if ty == SocketType::Rfcomm {
        setsockopt(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, &RFCOMM_SO_SNDBUF)?;
    }

    debug!("created {:?} socket, fd {}, lm {:#x}", ty, fd, lm);
    Ok(owned)
}

/// A connected raw Bluetooth socket. Closes its descriptor on drop.
pub struct RawSocket {
    fd: AsyncFd<OwnedFd>,
    ty: SocketType,
    peer: Address,
}

impl RawSocket {
    /// Connects to `addr` on the given channel (RFCOMM channel or L2CAP
    /// PSM; unused for SCO).
    ///
    /// A non-blocking connect reporting `EINPROGRESS` is completed by
    /// waiting for writability and checking `SO_ERROR`; `EINTR` is retried.
    pub async fn connect(
        ty: SocketType,
        addr: Address,
        channel: u16,
        mode: LinkMode,
    ) -> Result<RawSocket> {
        let owned = create_socket(ty, mode)
            .with_context(|| format!("creating {ty:?} socket for {addr}"))?;
        let raw_fd = owned.as_raw_fd();

        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let len = fill_sockaddr(ty, bdaddr_bytes(addr), channel, &mut storage);

        let in_progress = loop {
            let ret = unsafe {
                libc::connect(raw_fd, &storage as *const _ as *const libc::sockaddr, len)
            };
            if ret == 0 {
                break false;
            }
            let err = last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EINPROGRESS) => break true,
                _ => {
                    return Err(err).with_context(|| format!("connecting {ty:?} socket to {addr}"))
                }
            }
        };

        let fd = AsyncFd::new(owned)?;
        if in_progress {
            fd.writable().await?.retain_ready();
            socket_error(raw_fd).with_context(|| format!("connecting {ty:?} socket to {addr}"))?;
        }

        debug!("{:?} socket connected to {}", ty, addr);
        Ok(RawSocket { fd, ty, peer: addr })
    }

    pub fn socket_type(&self) -> SocketType {
        self.ty
    }

    pub fn peer_addr(&self) -> Address {
        self.peer
    }

    /// Reads into `buf`, waiting for readiness. Returns the number of
    /// bytes read; 0 means the peer closed the link.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            let ret = unsafe {
                libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if ret >= 0 {
                return Ok(ret as usize);
            }
            let err = last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => {
                    guard.clear_ready();
                    continue;
                }
                _ => return Err(err.into()),
            }
        }
    }

    /// Writes `buf`, waiting for readiness. Returns the number of bytes
    /// accepted by the kernel.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        loop {
            let mut guard = self.fd.writable().await?;
            let ret = unsafe {
                libc::write(self.fd.as_raw_fd(), buf.as_ptr() as *const libc::c_void, buf.len())
            };
            if ret >= 0 {
                return Ok(ret as usize);
            }
            let err = last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => {
                    guard.clear_ready();
                    continue;
                }
                _ => return Err(err.into()),
            }
        }
    }

    /// Non-blocking peek at the number of buffered inbound bytes
    /// (`FIONREAD`).
    pub fn available(&self) -> Result<usize> {
        let mut count: c_int = 0;
        let ret = unsafe { libc::ioctl(self.fd.as_raw_fd(), libc::FIONREAD, &mut count) };
        if ret < 0 {
            return Err(last_os_error().into());
        }
        Ok(count as usize)
    }

    /// Shuts both directions down, unblocking any task parked in read.
    pub fn shutdown(&self) {
        unsafe {
            libc::shutdown(self.fd.as_raw_fd(), libc::SHUT_RDWR);
        }
    }
}

impl AsRawFd for RawSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// A bound and listening raw Bluetooth socket.
pub struct RawListener {
    fd: AsyncFd<OwnedFd>,
    ty: SocketType,
}

impl RawListener {
    /// Binds to the any-address plus `channel` and listens with a backlog
    /// of one: this transport serves a single peer at a time by design.
    pub fn bind_listen(ty: SocketType, channel: u16, mode: LinkMode) -> Result<RawListener> {
        let owned =
            create_socket(ty, mode).with_context(|| format!("creating {ty:?} listener"))?;
        let raw_fd = owned.as_raw_fd();

        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let len = fill_sockaddr(ty, [0u8; 6], channel, &mut storage);

        let ret =
            unsafe { libc::bind(raw_fd, &storage as *const _ as *const libc::sockaddr, len) };
        if ret < 0 {
            return Err(last_os_error())
                .with_context(|| format!("binding {ty:?} listener to channel {channel}"));
        }
        let ret = unsafe { libc::listen(raw_fd, 1) };
        if ret < 0 {
            return Err(last_os_error()).with_context(|| format!("listening on {ty:?} socket"));
        }

        debug!("{:?} listener bound on channel {}", ty, channel);
        Ok(RawListener { fd: AsyncFd::new(owned)?, ty })
    }

    /// Accepts the next inbound connection, retrying on `EINTR`.
    pub async fn accept(&self) -> Result<(RawSocket, Address)> {
        loop {
            let mut guard = self.fd.readable().await?;
            let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
            let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
            let ret = unsafe {
                libc::accept4(
                    self.fd.as_raw_fd(),
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut len,
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if ret >= 0 {
                let peer = peer_address(self.ty, &storage);
                let owned = unsafe { OwnedFd::from_raw_fd(ret) };
                debug!("{:?} connection accepted from {}", self.ty, peer);
                return Ok((RawSocket { fd: AsyncFd::new(owned)?, ty: self.ty, peer }, peer));
            }
            let err = last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => {
                    guard.clear_ready();
                    continue;
                }
                _ => return Err(err.into()),
            }
        }
    }
}

impl AsRawFd for RawListener {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
