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

//! File Transfer Profile: folder browsing over OBEX Get/SetPath.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

use crate::obex::{codec, simple_response, HeaderSet, ObexHandler, ResponseCode};

/// MIME type of an OBEX folder-listing request.
const FOLDER_LISTING_TYPE: &[u8] = b"x-obex/folder-listing";

/// SetPath flag: navigate to the parent folder before applying the name.
const SETPATH_FLAG_BACKUP: u8 = 0x01;

/// Serves folder listings rooted at a fixed directory. The browse position
/// is per-service; the OBEX server admits one session at a time, so there
/// is exactly one browsing peer.
pub struct FtpService {
    root: PathBuf,
    current: Mutex<PathBuf>,
}

impl FtpService {
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)
            .with_context(|| format!("creating share directory {}", root.display()))?;
        let root = root
            .canonicalize()
            .with_context(|| format!("resolving share directory {}", root.display()))?;
        Ok(Self { root, current: Mutex::new(PathBuf::new()) })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The browse position relative to the root.
    pub fn current_path(&self) -> PathBuf {
        self.current.lock().clone()
    }
}

impl ObexHandler for FtpService {
    fn on_connect(&self) -> ResponseCode {
        info!("FTP session opened");
        *self.current.lock() = PathBuf::new();
        ResponseCode::SUCCESS
    }

    fn on_disconnect(&self) -> ResponseCode {
        info!("FTP session closed");
        ResponseCode::SUCCESS
    }

    fn on_set_path(&self, flags: u8, headers: &HeaderSet) -> ResponseCode {
        let mut current = self.current.lock();

        if flags & SETPATH_FLAG_BACKUP != 0 {
            if !current.pop() {
                debug!("SetPath up from the share root refused");
                return ResponseCode::NOT_FOUND;
            }
            return ResponseCode::SUCCESS;
        }

        match headers.name() {
            None | Some("") => {
                // An empty name resets to the root folder.
                *current = PathBuf::new();
                ResponseCode::SUCCESS
            }
            Some(name) => {
                if !is_plain_component(name) {
                    warn!("SetPath to suspicious name '{}' refused", name);
                    return ResponseCode::FORBIDDEN;
                }
                let candidate = current.join(name);
                if self.root.join(&candidate).is_dir() {
                    *current = candidate;
                    ResponseCode::SUCCESS
                } else {
                    ResponseCode::NOT_FOUND
                }
            }
        }
    }

    fn on_get(&self, _final_packet: bool, connection_id: u32, headers: &HeaderSet) -> Vec<u8> {
        let Some(mime) = headers.mime_type() else {
            return simple_response(ResponseCode::BAD_REQUEST);
        };
        let mime = mime.strip_suffix(&[0]).unwrap_or(mime);
        if mime != FOLDER_LISTING_TYPE {
            debug!("Get for unsupported type {:?}", String::from_utf8_lossy(mime));
            return simple_response(ResponseCode::BAD_REQUEST);
        }

        let dir = self.root.join(self.current.lock().as_path());
        let at_root = dir == self.root;
        let listing = match folder_listing_xml(&dir, at_root) {
            Ok(listing) => listing,
            Err(e) => {
                warn!("cannot list {}: {e}", dir.display());
                return simple_response(ResponseCode::NOT_FOUND);
            }
        };

        let mut packet = codec::start_packet(ResponseCode::SUCCESS.0);
        codec::push_connection_id(&mut packet, connection_id);
        if codec::push_body(&mut packet, listing.as_bytes()).is_err()
            || codec::finish_packet(&mut packet).is_err()
        {
            warn!("folder listing for {} does not fit a packet", dir.display());
            return simple_response(ResponseCode::REQUESTED_ENTITY_TOO_LARGE);
        }
        packet
    }
}

/// A single path component with no separators or parent references.
fn is_plain_component(name: &str) -> bool {
    let path = Path::new(name);
    let mut components = path.components();
    matches!((components.next(), components.next()), (Some(Component::Normal(_)), None))
}

/// Builds the OBEX folder-listing XML document for one directory.
fn folder_listing_xml(dir: &Path, at_root: bool) -> std::io::Result<String> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.filter_map(|e| e.ok()).collect();
    entries.sort_by_key(|e| e.file_name());

    let mut xml = String::with_capacity(512);
    xml.push_str("<?xml version=\"1.0\"?>\r\n");
    xml.push_str("<!DOCTYPE folder-listing SYSTEM \"obex-folder-listing.dtd\">\r\n");
    xml.push_str("<folder-listing version=\"1.0\">\r\n");
    if !at_root {
        xml.push_str("<parent-folder/>\r\n");
    }

    for entry in entries {
        let name = xml_escape(&entry.file_name().to_string_lossy());
        let Ok(meta) = entry.metadata() else { continue };
        let modified = meta
            .modified()
            .map(|t| DateTime::<Utc>::from(t).format("%Y%m%dT%H%M%SZ").to_string())
            .unwrap_or_else(|_| "19800101T000000Z".to_string());

        if meta.is_dir() {
            xml.push_str(&format!(
                "<folder name=\"{}\" modified=\"{}\" user-perm=\"R\"/>\r\n",
                name, modified
            ));
        } else {
            xml.push_str(&format!(
                "<file name=\"{}\" size=\"{}\" modified=\"{}\" user-perm=\"R\"/>\r\n",
                name,
                meta.len(),
                modified
            ));
        }
    }

    xml.push_str("</folder-listing>\r\n");
    Ok(xml)
}

fn xml_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obex::Header;
    use tempfile::tempdir;

    fn listing_request() -> HeaderSet {
        HeaderSet {
            headers: vec![Header::Type(b"x-obex/folder-listing\0".to_vec())],
        }
    }

    fn set_path_to(name: &str) -> HeaderSet {
        HeaderSet { headers: vec![Header::Name(name.to_string())] }
    }

    #[test]
    fn test_get_returns_folder_listing_packet() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("music")).unwrap();
        std::fs::write(dir.path().join("readme.txt"), b"hi there").unwrap();

        let ftp = FtpService::new(dir.path().to_path_buf()).unwrap();
        let packet = ftp.on_get(true, 7, &listing_request());

        // Framing invariant holds for handler-built packets too.
        assert_eq!(packet[0], ResponseCode::SUCCESS.0);
        assert_eq!(u16::from_be_bytes([packet[1], packet[2]]) as usize, packet.len());

        let set = codec::parse_headers(&packet[3..]).unwrap();
        assert_eq!(set.connection_id(), Some(7));
        let body = String::from_utf8(set.bodies().next().unwrap().to_vec()).unwrap();
        assert!(body.contains("<folder name=\"music\""));
        assert!(body.contains("<file name=\"readme.txt\" size=\"8\""));
        assert!(!body.contains("<parent-folder/>"));
    }

    #[test]
    fn test_get_without_listing_type_is_rejected() {
        let dir = tempdir().unwrap();
        let ftp = FtpService::new(dir.path().to_path_buf()).unwrap();

        let response = ftp.on_get(true, 1, &HeaderSet::default());
        assert_eq!(response[0], ResponseCode::BAD_REQUEST.0);

        let capability =
            HeaderSet { headers: vec![Header::Type(b"x-obex/capability\0".to_vec())] };
        let response = ftp.on_get(true, 1, &capability);
        assert_eq!(response[0], ResponseCode::BAD_REQUEST.0);
    }

    #[test]
    fn test_set_path_navigation() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        let ftp = FtpService::new(dir.path().to_path_buf()).unwrap();

        assert_eq!(ftp.on_set_path(0, &set_path_to("a")), ResponseCode::SUCCESS);
        assert_eq!(ftp.on_set_path(0, &set_path_to("b")), ResponseCode::SUCCESS);
        assert_eq!(ftp.current_path(), PathBuf::from("a/b"));

        // Listings below the root advertise the parent folder.
        let packet = ftp.on_get(true, 1, &listing_request());
        let set = codec::parse_headers(&packet[3..]).unwrap();
        let body = String::from_utf8(set.bodies().next().unwrap().to_vec()).unwrap();
        assert!(body.contains("<parent-folder/>"));

        // Up twice is fine, a third time runs out of tree.
        assert_eq!(
            ftp.on_set_path(SETPATH_FLAG_BACKUP, &HeaderSet::default()),
            ResponseCode::SUCCESS
        );
        assert_eq!(
            ftp.on_set_path(SETPATH_FLAG_BACKUP, &HeaderSet::default()),
            ResponseCode::SUCCESS
        );
        assert_eq!(
            ftp.on_set_path(SETPATH_FLAG_BACKUP, &HeaderSet::default()),
            ResponseCode::NOT_FOUND
        );
    }

    #[test]
    fn test_set_path_rejects_traversal_and_missing_dirs() {
        let dir = tempdir().unwrap();
        let ftp = FtpService::new(dir.path().to_path_buf()).unwrap();

        assert_eq!(ftp.on_set_path(0, &set_path_to("../secrets")), ResponseCode::FORBIDDEN);
        assert_eq!(ftp.on_set_path(0, &set_path_to("..")), ResponseCode::FORBIDDEN);
        assert_eq!(ftp.on_set_path(0, &set_path_to("nope")), ResponseCode::NOT_FOUND);
        assert_eq!(ftp.current_path(), PathBuf::new());

        // The empty name resets to the root.
        assert_eq!(ftp.on_set_path(0, &set_path_to("")), ResponseCode::SUCCESS);
    }

    #[test]
    fn test_xml_escaping() {
        assert_eq!(xml_escape("a<b>&\"c'"), "a&lt;b&gt;&amp;&quot;c&apos;");
    }
}
