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

//! AT-command line codec and reply table for the Hands-Free Profile.

use anyhow::{Context, Result};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// How long a session waits for the first byte of a line before giving the
/// loop a chance to observe shutdown.
pub const LINE_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// AT lines longer than this are cut off.
const MAX_LINE_LEN: usize = 255;

/// Feature bitmask advertised in `+BRSF` replies: three-way calling, CLI
/// presentation, voice tags and remote volume control.
const LOCAL_FEATURES: u32 = 23;

const CIND_CURRENT: &str = "+CIND: 1,0,0,0,3,0,3";
const CIND_RANGE: &str = concat!(
    "+CIND: (\"service\",(0-1)),(\"call\",(0-1)),(\"callsetup\",(0-3)),",
    "(\"callheld\",(0-2)),(\"signal\",(0-5)),(\"roam\",(0-1)),(\"battchg\",(0-5))"
);
const CHLD_RANGE: &str = "+CHLD: (0,1,2,3)";

/// Indicator positions in the `+CIND` list, used for `+CIEV` reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Indicator {
    Service = 1,
    Call = 2,
    CallSetup = 3,
    CallHeld = 4,
    Signal = 5,
    Roam = 6,
    BattChg = 7,
}

/// Reads one AT line: bytes up to CR, with LF restarting the buffer so
/// CRLF pairs collapse into clean lines.
///
/// The timeout bounds the wait for the *first* byte only; once a line has
/// started it is read to completion. Returns `Ok(None)` on timeout,
/// `Ok(Some(""))` for lines rejected as non-ASCII (ITU V.250 allows IA5
/// only; some car kits send binary junk), and `Err` once the link is gone.
pub async fn read_at_line<R: AsyncRead + Unpin>(
    reader: &mut R,
    timeout: Duration,
) -> Result<Option<String>> {
    let first = match tokio::time::timeout(timeout, reader.read_u8()).await {
        Err(_) => return Ok(None),
        Ok(byte) => byte.context("AT link closed")?,
    };

    let mut buf: Vec<u8> = Vec::with_capacity(32);
    let mut byte = first;
    loop {
        match byte {
            b'\r' => break,
            b'\n' => buf.clear(),
            other => {
                buf.push(other);
                if buf.len() >= MAX_LINE_LEN {
                    warn!("AT line exceeded {} bytes, truncating", MAX_LINE_LEN);
                    break;
                }
            }
        }
        byte = reader.read_u8().await.context("AT link closed")?;
    }

    if buf.iter().any(|b| b & 0x80 != 0) {
        warn!("ignoring invalid AT command with non-ASCII bytes");
        return Ok(Some(String::new()));
    }

    // All bytes are 7-bit at this point.
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

/// Frames a reply line as `\r\n<line>\r\n` and sends it.
pub async fn send_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> Result<()> {
    let framed = format!("\r\n{line}\r\n");
    writer.write_all(framed.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Formats an unsolicited indicator report.
pub fn indicator_report(indicator: Indicator, value: u8) -> String {
    format!("+CIEV: {},{}", indicator as u8, value)
}

/// Per-session AT reply table. Most commands are acknowledged rather than
/// deeply implemented; the table is deliberately permissive and answers
/// `OK` to anything it does not recognize.
#[derive(Debug, Default)]
pub struct AtResponder {
    indicator_reporting: bool,
    remote_features: Option<u32>,
    speaker_gain: Option<u8>,
    mic_gain: Option<u8>,
}

impl AtResponder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the peer enabled `+CIEV` indicator reporting via `AT+CMER=`.
    pub fn indicator_reporting(&self) -> bool {
        self.indicator_reporting
    }

    /// The feature bitmask the peer announced with `AT+BRSF=`.
    pub fn remote_features(&self) -> Option<u32> {
        self.remote_features
    }

    /// Produces the reply lines for one received line, in send order. An
    /// empty input line (blanked by the reader) gets no reply at all.
    pub fn handle(&mut self, line: &str) -> Vec<String> {
        if line.is_empty() {
            return Vec::new();
        }
        debug!("AT recv: {}", line);

        // Longest prefixes first, so AT+CIND=? wins over AT+CIND.
        if let Some(rest) = line.strip_prefix("AT+BRSF=") {
            self.remote_features = rest.trim().parse().ok();
            return vec![format!("+BRSF: {LOCAL_FEATURES}"), "OK".into()];
        }
        if line.starts_with("AT+CIND=?") {
            return vec![CIND_RANGE.into(), "OK".into()];
        }
        if line.starts_with("AT+CIND") {
            return vec![CIND_CURRENT.into(), "OK".into()];
        }
        if let Some(rest) = line.strip_prefix("AT+CMER=") {
            self.indicator_reporting = cmer_enables_reporting(rest);
            debug!(
                "indicator event reporting {}",
                if self.indicator_reporting { "enabled" } else { "disabled" }
            );
            return vec!["OK".into()];
        }
        if line.starts_with("AT+CHLD=?") {
            return vec![CHLD_RANGE.into(), "OK".into()];
        }
        if line.starts_with("AT+CHLD=") {
            return vec!["OK".into()];
        }
        if let Some(rest) = line.strip_prefix("AT+VGS=") {
            self.speaker_gain = rest.trim().parse().ok();
            return vec!["OK".into()];
        }
        if let Some(rest) = line.strip_prefix("AT+VGM=") {
            self.mic_gain = rest.trim().parse().ok();
            return vec!["OK".into()];
        }
        if line.starts_with("ATA") || line.starts_with("AT+BLDN") {
            return vec!["OK".into()];
        }
        if line.starts_with("AT+BVRA") {
            // Voice recognition activation is not supported.
            return vec!["ERROR".into()];
        }

        debug!("AT command not handled, acknowledging anyway");
        vec!["OK".into()]
    }
}

/// `AT+CMER=<mode>,<keyp>,<disp>,<ind>`: reporting is on when the `ind`
/// field is 1.
fn cmer_enables_reporting(args: &str) -> bool {
    args.split(',').nth(3).map(str::trim) == Some("1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    #[test]
    fn test_brsf_reply_order() {
        let mut responder = AtResponder::new();
        let replies = responder.handle("AT+BRSF=23");
        assert_eq!(replies, vec!["+BRSF: 23".to_string(), "OK".to_string()]);
        assert_eq!(responder.remote_features(), Some(23));
    }

    #[test]
    fn test_cind_query_vs_range() {
        let mut responder = AtResponder::new();
        assert_eq!(
            responder.handle("AT+CIND=?"),
            vec![CIND_RANGE.to_string(), "OK".to_string()]
        );
        assert_eq!(
            responder.handle("AT+CIND?"),
            vec!["+CIND: 1,0,0,0,3,0,3".to_string(), "OK".to_string()]
        );
    }

    #[test]
    fn test_cmer_toggles_reporting() {
        let mut responder = AtResponder::new();
        assert!(!responder.indicator_reporting());

        assert_eq!(responder.handle("AT+CMER=3,0,0,1"), vec!["OK".to_string()]);
        assert!(responder.indicator_reporting());

        assert_eq!(responder.handle("AT+CMER=3,0,0,0"), vec!["OK".to_string()]);
        assert!(!responder.indicator_reporting());
    }

    #[test]
    fn test_bvra_is_rejected() {
        let mut responder = AtResponder::new();
        assert_eq!(responder.handle("AT+BVRA=1"), vec!["ERROR".to_string()]);
    }

    #[test]
    fn test_acknowledged_commands() {
        let mut responder = AtResponder::new();
        for line in ["AT+CHLD=1", "AT+VGS=9", "AT+VGM=12", "ATA", "AT+BLDN"] {
            assert_eq!(responder.handle(line), vec!["OK".to_string()], "for {line}");
        }
        assert_eq!(responder.handle("AT+CHLD=?"), vec![CHLD_RANGE.to_string(), "OK".to_string()]);
    }

    #[test]
    fn test_unknown_command_is_permissively_acknowledged() {
        let mut responder = AtResponder::new();
        assert_eq!(responder.handle("AT+XAPL=ABCD-1234,2"), vec!["OK".to_string()]);
    }

    #[test]
    fn test_blanked_line_gets_no_reply() {
        let mut responder = AtResponder::new();
        assert!(responder.handle("").is_empty());
    }

    #[test]
    fn test_indicator_report_format() {
        assert_eq!(indicator_report(Indicator::CallSetup, 2), "+CIEV: 3,2");
        assert_eq!(indicator_report(Indicator::Call, 1), "+CIEV: 2,1");
    }

    #[tokio::test]
    async fn test_read_line_normalizes_crlf() {
        let (mut tx, mut rx) = duplex(256);
        tx.write_all(b"\r\nAT+CIND?\r\n").await.unwrap();

        // The leading CR terminates an empty line first.
        let line = read_at_line(&mut rx, LINE_READ_TIMEOUT).await.unwrap();
        assert_eq!(line.as_deref(), Some(""));
        let line = read_at_line(&mut rx, LINE_READ_TIMEOUT).await.unwrap();
        assert_eq!(line.as_deref(), Some("AT+CIND?"));
    }

    #[tokio::test]
    async fn test_read_line_blanks_non_ascii() {
        let (mut tx, mut rx) = duplex(256);
        tx.write_all(b"AT+\xADDIAL\r").await.unwrap();

        let line = read_at_line(&mut rx, LINE_READ_TIMEOUT).await.unwrap();
        assert_eq!(line.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn test_read_line_times_out_without_data() {
        let (_tx, mut rx) = duplex(256);
        let line = read_at_line(&mut rx, Duration::from_millis(10)).await.unwrap();
        assert!(line.is_none());
    }

    #[tokio::test]
    async fn test_read_line_errors_on_close() {
        let (tx, mut rx) = duplex(256);
        drop(tx);
        assert!(read_at_line(&mut rx, LINE_READ_TIMEOUT).await.is_err());
    }

    #[tokio::test]
    async fn test_send_line_framing() {
        let (mut tx, mut rx) = duplex(256);
        send_line(&mut tx, "OK").await.unwrap();

        let mut buf = vec![0u8; 6];
        rx.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, b"\r\nOK\r\n");
    }
}
