//! Just enough of the PostgreSQL wire protocol to resolve a connection
//! and tap message boundaries for heartbeat activation: the startup
//! negotiation prelude (`SSLRequest`/`GSSENCRequest`/`StartupMessage`),
//! and a tag-only scanner for everything that follows. Bodies are never
//! parsed or buffered beyond their length prefix — the proxy forwards
//! bytes unmodified once resolution is done.

use snafu::{ResultExt, Snafu};
use std::collections::HashMap;
use std::convert::TryInto;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const SSL_REQUEST_CODE: i32 = 80_877_103;
const GSSENC_REQUEST_CODE: i32 = 80_877_104;

#[derive(Debug, Snafu)]
pub enum WireError {
    #[snafu(display("failed to read from client: {}", source))]
    Read { source: std::io::Error },
    #[snafu(display("failed to write negotiation reply: {}", source))]
    Write { source: std::io::Error },
    #[snafu(display("startup message length {} is shorter than the minimum frame", len))]
    ShortFrame { len: u32 },
}

/// The parsed `StartupMessage`: the negotiated parameters (`user`,
/// `database`, ...) and the raw frame bytes, forwarded verbatim to the
/// backend so it performs the client's actual authentication.
pub struct StartupInfo {
    pub parameters: HashMap<String, String>,
    pub raw: Vec<u8>,
}

/// Read the startup negotiation: reply `N` (no SSL/GSS support) to any
/// number of `SSLRequest`/`GSSENCRequest` preludes, as real PostgreSQL
/// servers do, then parse the `StartupMessage` that follows.
pub async fn read_startup<S>(stream: &mut S) -> Result<StartupInfo, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let len = read_u32(stream).await?;
        if len < 8 {
            return ShortFrame { len }.fail();
        }
        let mut body = vec![0u8; len as usize - 4];
        stream.read_exact(&mut body).await.context(Read)?;
        let code = i32::from_be_bytes(body[0..4].try_into().unwrap());

        if code == SSL_REQUEST_CODE || code == GSSENC_REQUEST_CODE {
            stream.write_all(b"N").await.context(Write)?;
            continue;
        }

        let parameters = parse_parameters(&body[4..]);
        let mut raw = Vec::with_capacity(4 + body.len());
        raw.extend_from_slice(&len.to_be_bytes());
        raw.extend_from_slice(&body);
        return Ok(StartupInfo { parameters, raw });
    }
}

async fn read_u32<S: AsyncRead + Unpin>(stream: &mut S) -> Result<u32, WireError> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.context(Read)?;
    Ok(u32::from_be_bytes(buf))
}

/// `key\0value\0...\0` pairs terminated by a final `\0`.
fn parse_parameters(buf: &[u8]) -> HashMap<String, String> {
    let mut fields: Vec<String> = buf.split(|&b| b == 0).map(|s| String::from_utf8_lossy(s).into_owned()).collect();
    while fields.last().map(String::is_empty).unwrap_or(false) {
        fields.pop();
    }
    let mut map = HashMap::new();
    let mut it = fields.into_iter();
    while let (Some(key), Some(value)) = (it.next(), it.next()) {
        map.insert(key, value);
    }
    map
}

/// A PostgreSQL `ErrorResponse` carrying a single `FATAL` field, sent
/// when the startup negotiation can't proceed (e.g. unknown database).
pub fn fatal_error_response(message: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.push(b'S');
    body.extend_from_slice(b"FATAL\0");
    body.push(b'M');
    body.extend_from_slice(message.as_bytes());
    body.push(0);
    body.push(0);

    let mut frame = Vec::with_capacity(5 + body.len());
    frame.push(b'E');
    frame.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    frame
}

/// Incremental tag scanner for the post-startup message stream: tracks
/// frame boundaries (`tag:u8, len:i32`) across arbitrarily-sized reads
/// and calls back with each tag seen. Bodies are not buffered, with one
/// exception: a `Query` message's body is buffered so its SQL text can
/// be logged for query-level observability.
pub struct MessageScanner {
    awaiting_tag: bool,
    len_buf: Vec<u8>,
    remaining: u64,
    current_tag: u8,
    capture: Option<Vec<u8>>,
}

impl MessageScanner {
    pub fn new() -> Self {
        Self { awaiting_tag: true, len_buf: Vec::with_capacity(4), remaining: 0, current_tag: 0, capture: None }
    }

    /// `on_tag` fires once per message header, as soon as the tag byte is
    /// seen. `on_query` fires once a `Query` message's full body (the
    /// null-terminated SQL string) has arrived.
    pub fn feed(&mut self, mut chunk: &[u8], mut on_tag: impl FnMut(u8), mut on_query: impl FnMut(&str)) {
        loop {
            if self.remaining > 0 {
                let take = self.remaining.min(chunk.len() as u64) as usize;
                if let Some(buf) = self.capture.as_mut() {
                    buf.extend_from_slice(&chunk[..take]);
                }
                chunk = &chunk[take..];
                self.remaining -= take as u64;
                if self.remaining == 0 {
                    if let Some(buf) = self.capture.take() {
                        on_query(String::from_utf8_lossy(&buf).trim_end_matches('\0'));
                    }
                }
                if chunk.is_empty() {
                    return;
                }
                continue;
            }

            if self.awaiting_tag {
                if chunk.is_empty() {
                    return;
                }
                self.current_tag = chunk[0];
                on_tag(chunk[0]);
                chunk = &chunk[1..];
                self.awaiting_tag = false;
                continue;
            }

            let need = 4 - self.len_buf.len();
            let take = need.min(chunk.len());
            self.len_buf.extend_from_slice(&chunk[..take]);
            chunk = &chunk[take..];
            if self.len_buf.len() == 4 {
                let len = u32::from_be_bytes(self.len_buf[0..4].try_into().unwrap()) as u64;
                self.remaining = len.saturating_sub(4);
                self.len_buf.clear();
                self.awaiting_tag = true;
                self.capture = if self.current_tag == b'Q' && self.remaining > 0 {
                    Some(Vec::with_capacity(self.remaining as usize))
                } else {
                    None
                };
            }
            if chunk.is_empty() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_startup_parses_user_and_database() {
        let mut body = Vec::new();
        body.extend_from_slice(&196_608i32.to_be_bytes());
        body.extend_from_slice(b"user\0alice\0database\0db1\0\0");
        let mut frame = Vec::new();
        frame.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
        frame.extend_from_slice(&body);

        let (mut feeder, mut server_side) = tokio::io::duplex(1024);
        feeder.write_all(&frame).await.unwrap();
        let info = read_startup(&mut server_side).await.unwrap();
        assert_eq!(info.parameters.get("user"), Some(&"alice".to_string()));
        assert_eq!(info.parameters.get("database"), Some(&"db1".to_string()));
    }

    #[tokio::test]
    async fn read_startup_answers_ssl_request_then_parses_startup() {
        let mut ssl_frame = Vec::new();
        ssl_frame.extend_from_slice(&8u32.to_be_bytes());
        ssl_frame.extend_from_slice(&SSL_REQUEST_CODE.to_be_bytes());

        let mut body = Vec::new();
        body.extend_from_slice(&196_608i32.to_be_bytes());
        body.extend_from_slice(b"user\0bob\0\0");
        let mut startup_frame = Vec::new();
        startup_frame.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
        startup_frame.extend_from_slice(&body);

        let mut input = ssl_frame;
        input.extend_from_slice(&startup_frame);

        let (mut feeder, mut server_side) = tokio::io::duplex(1024);
        feeder.write_all(&input).await.unwrap();
        let info = read_startup(&mut server_side).await.unwrap();
        assert_eq!(info.parameters.get("user"), Some(&"bob".to_string()));
    }

    #[test]
    fn scanner_finds_tags_split_across_feeds() {
        let mut seen = Vec::new();
        let mut scanner = MessageScanner::new();
        // Query message: 'Q', len=9 (includes itself), 4 bytes of body "x\0"... simplified
        let msg = [b'Q', 0, 0, 0, 9, b'x', b'y', b'z', 0];
        scanner.feed(&msg[..3], |t| seen.push(t), |_| {});
        scanner.feed(&msg[3..], |t| seen.push(t), |_| {});
        assert_eq!(seen, vec![b'Q']);
    }

    #[test]
    fn scanner_finds_consecutive_tags() {
        let mut seen = Vec::new();
        let mut scanner = MessageScanner::new();
        let parse = [b'P', 0, 0, 0, 4];
        let ready = [b'Z', 0, 0, 0, 5, b'I'];
        scanner.feed(&parse, |t| seen.push(t), |_| {});
        scanner.feed(&ready, |t| seen.push(t), |_| {});
        assert_eq!(seen, vec![b'P', b'Z']);
    }

    #[test]
    fn scanner_reports_query_text_split_across_feeds() {
        let mut queries = Vec::new();
        let mut scanner = MessageScanner::new();
        let body = b"select 1\0";
        let mut msg = vec![b'Q'];
        msg.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
        msg.extend_from_slice(body);

        scanner.feed(&msg[..7], |_| {}, |q| queries.push(q.to_string()));
        scanner.feed(&msg[7..], |_| {}, |q| queries.push(q.to_string()));
        assert_eq!(queries, vec!["select 1".to_string()]);
    }
}
