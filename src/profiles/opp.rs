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

//! Object Push Profile: receive objects into an inbox, push files out.

use anyhow::{Context, Result};
use bluer::rfcomm::{SocketAddr, Stream};
use bluer::Address;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::sanitize_object_name;
use crate::obex::{InboundObject, ObexClient, ObexHandler, ResponseCode};

/// Fallback name for peers that push an object without a Name header.
const UNNAMED_OBJECT: &str = "received.bin";

/// Events the OPP service reports to the façade.
#[derive(Debug)]
pub enum OppEvent {
    /// An inbound object was stored in the inbox.
    ObjectReceived { name: String, size: usize, path: PathBuf },
    /// An outbound file transfer completed.
    FileSent { peer: Address, path: PathBuf },
}

/// Object Push endpoint: the handler side receives, `send_file` pushes.
pub struct OppService {
    inbox: PathBuf,
    event_tx: mpsc::Sender<OppEvent>,
}

impl OppService {
    pub fn new(inbox: PathBuf, event_tx: mpsc::Sender<OppEvent>) -> Result<Self> {
        std::fs::create_dir_all(&inbox)
            .with_context(|| format!("creating inbox directory {}", inbox.display()))?;
        Ok(Self { inbox, event_tx })
    }

    pub fn inbox(&self) -> &Path {
        &self.inbox
    }

    /// Pushes a local file to a remote OBEX server:
    /// Connect, Put, Disconnect.
    pub async fn send_file(&self, addr: Address, channel: u8, path: &Path) -> Result<()> {
        let body = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| UNNAMED_OBJECT.to_string());

        let stream = Stream::connect(SocketAddr::new(addr, channel))
            .await
            .with_context(|| format!("connecting OPP to {addr} channel {channel}"))?;
        info!("pushing '{}' ({} bytes) to {}", name, body.len(), addr);

        let mut client = ObexClient::new(stream);
        client.connect().await?;
        let put_result = client.put(&name, &body).await;
        // Even a failed Put gets a polite goodbye; the error wins though.
        if let Err(e) = client.disconnect().await {
            warn!("OBEX disconnect after push failed: {e:#}");
        }
        put_result?;

        let _ = self
            .event_tx
            .send(OppEvent::FileSent { peer: addr, path: path.to_path_buf() })
            .await;
        Ok(())
    }

    /// Picks a free path in the inbox, suffixing duplicates.
    fn unique_path(&self, name: &str) -> PathBuf {
        let candidate = self.inbox.join(name);
        if !candidate.exists() {
            return candidate;
        }

        let stem = Path::new(name).file_stem().map(|s| s.to_string_lossy().into_owned());
        let ext = Path::new(name).extension().map(|s| s.to_string_lossy().into_owned());
        for n in 1u32.. {
            let next = match (&stem, &ext) {
                (Some(stem), Some(ext)) => format!("{stem} ({n}).{ext}"),
                _ => format!("{name} ({n})"),
            };
            let candidate = self.inbox.join(next);
            if !candidate.exists() {
                return candidate;
            }
        }
        unreachable!("u32 suffixes exhausted");
    }
}

impl ObexHandler for OppService {
    fn on_connect(&self) -> ResponseCode {
        info!("OPP session opened");
        ResponseCode::SUCCESS
    }

    fn on_disconnect(&self) -> ResponseCode {
        info!("OPP session closed");
        ResponseCode::SUCCESS
    }

    fn on_put(&self, object: InboundObject) -> ResponseCode {
        let name = object
            .name
            .as_deref()
            .and_then(sanitize_object_name)
            .unwrap_or_else(|| UNNAMED_OBJECT.to_string());
        let path = self.unique_path(&name);

        if let Err(e) = std::fs::write(&path, &object.body) {
            error!("cannot store '{}' in inbox: {e}", name);
            return ResponseCode::INTERNAL_SERVER_ERROR;
        }

        info!("received '{}' ({} bytes) into {}", name, object.body.len(), path.display());
        let event = OppEvent::ObjectReceived { name, size: object.body.len(), path };
        if self.event_tx.try_send(event).is_err() {
            warn!("event channel full, dropping ObjectReceived notification");
        }
        ResponseCode::SUCCESS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn service(dir: &Path) -> (OppService, mpsc::Receiver<OppEvent>) {
        let (tx, rx) = mpsc::channel(8);
        (OppService::new(dir.to_path_buf(), tx).unwrap(), rx)
    }

    #[tokio::test]
    async fn test_put_stores_object_in_inbox() {
        let dir = tempdir().unwrap();
        let (opp, mut events) = service(dir.path());

        let code = opp.on_put(InboundObject {
            name: Some("note.txt".into()),
            declared_length: Some(5),
            body: b"hello".to_vec(),
        });
        assert_eq!(code, ResponseCode::SUCCESS);
        assert_eq!(std::fs::read(dir.path().join("note.txt")).unwrap(), b"hello");

        match events.try_recv().unwrap() {
            OppEvent::ObjectReceived { name, size, .. } => {
                assert_eq!(name, "note.txt");
                assert_eq!(size, 5);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_put_defuses_traversal_names() {
        let dir = tempdir().unwrap();
        let (opp, _events) = service(dir.path());

        let code = opp.on_put(InboundObject {
            name: Some("../../outside.txt".into()),
            declared_length: None,
            body: b"contained".to_vec(),
        });
        assert_eq!(code, ResponseCode::SUCCESS);

        // The object ends up inside the inbox under its base name.
        assert!(dir.path().join("outside.txt").exists());
        assert!(!dir.path().parent().unwrap().join("outside.txt").exists());
    }

    #[tokio::test]
    async fn test_duplicate_names_get_suffixed() {
        let dir = tempdir().unwrap();
        let (opp, _events) = service(dir.path());

        for body in [b"one".as_slice(), b"two", b"three"] {
            opp.on_put(InboundObject {
                name: Some("photo.jpg".into()),
                declared_length: None,
                body: body.to_vec(),
            });
        }

        assert_eq!(std::fs::read(dir.path().join("photo.jpg")).unwrap(), b"one");
        assert_eq!(std::fs::read(dir.path().join("photo (1).jpg")).unwrap(), b"two");
        assert_eq!(std::fs::read(dir.path().join("photo (2).jpg")).unwrap(), b"three");
    }

    #[tokio::test]
    async fn test_unnamed_object_gets_fallback_name() {
        let dir = tempdir().unwrap();
        let (opp, _events) = service(dir.path());

        opp.on_put(InboundObject { name: None, declared_length: None, body: b"x".to_vec() });
        assert!(dir.path().join(UNNAMED_OBJECT).exists());
    }
}
