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

//! OBEX profile services built on the generic server: Object Push and
//! File Transfer.

mod ftp;
mod opp;

pub use ftp::FtpService;
pub use opp::{OppEvent, OppService};

/// Reduces an attacker-controlled object name to a bare file name: path
/// separators and relative components must not survive into the inbox.
pub(crate) fn sanitize_object_name(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next()?.trim();
    if base.is_empty() || base == "." || base == ".." {
        return None;
    }
    Some(base.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_strips_traversal() {
        assert_eq!(sanitize_object_name("report.pdf"), Some("report.pdf".into()));
        assert_eq!(sanitize_object_name("../../etc/passwd"), Some("passwd".into()));
        assert_eq!(sanitize_object_name("C:\\Users\\x\\boot.ini"), Some("boot.ini".into()));
        assert_eq!(sanitize_object_name("dir/.."), None);
        assert_eq!(sanitize_object_name(""), None);
        assert_eq!(sanitize_object_name("   "), None);
    }
}
