//! STOMP 1.1 wire codec.
//!
//! Decoding is incremental: `decode` returns `Ok(None)` until a complete frame
//! (header block, body and the terminating NUL) is buffered. Bare EOLs between
//! frames are heart-beats and are discarded.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::transport::frame::{Command, Frame, Headers};
use crate::utils::{Error, Result};

/// Upper bound for a single frame, header block included.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct StompCodec {
    max_frame_bytes: usize,
}

impl StompCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

impl Default for StompCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl Decoder for StompCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        skip_heartbeats(src);
        if src.is_empty() {
            return Ok(None);
        }

        let Some((head_len, body_start)) = find_header_end(src) else {
            return self.incomplete(src);
        };

        let head = std::str::from_utf8(&src[..head_len])
            .map_err(|_| Error::protocol("frame header is not valid UTF-8"))?;
        let mut lines = head
            .split('\n')
            .map(|line| line.strip_suffix('\r').unwrap_or(line));
        let name = lines.next().unwrap_or_default();
        let command =
            Command::parse(name).ok_or_else(|| Error::protocol(format!("unknown command {name:?}")))?;

        let mut headers = Headers::new();
        for line in lines {
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| Error::protocol(format!("header line without ':' ({line:?})")))?;
            if command.escapes_headers() {
                headers.push(unescape(key)?, unescape(value)?);
            } else {
                headers.push(key, value);
            }
        }

        let content_length = headers
            .get("content-length")
            .map(|v| v.trim().parse::<usize>())
            .transpose()
            .map_err(|_| Error::protocol("content-length is not a number"))?;

        let body_len = match content_length {
            Some(len) => {
                let end = body_start
                    .checked_add(len)
                    .filter(|end| *end < self.max_frame_bytes)
                    .ok_or_else(|| {
                        Error::protocol(format!(
                            "content-length {len} exceeds the {} byte frame limit",
                            self.max_frame_bytes
                        ))
                    })?;
                if src.len() <= end {
                    src.reserve(end + 1 - src.len());
                    return Ok(None);
                }
                if src[end] != 0 {
                    return Err(Error::protocol("body is not terminated by NUL"));
                }
                len
            }
            None => match src[body_start..].iter().position(|b| *b == 0) {
                Some(len) => len,
                None => return self.incomplete(src),
            },
        };

        let mut raw = src.split_to(body_start + body_len + 1);
        let body = raw.split_off(body_start).freeze().slice(..body_len);
        Ok(Some(Frame {
            command,
            headers,
            body,
        }))
    }
}

impl StompCodec {
    fn incomplete(&self, src: &BytesMut) -> Result<Option<Frame>> {
        if src.len() > self.max_frame_bytes {
            return Err(Error::protocol(format!(
                "frame exceeds the {} byte limit",
                self.max_frame_bytes
            )));
        }
        Ok(None)
    }
}

impl Encoder<Frame> for StompCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let escape_headers = frame.command.escapes_headers();
        dst.reserve(frame.body.len() + 64);
        dst.put_slice(frame.command.as_str().as_bytes());
        dst.put_u8(b'\n');
        for (key, value) in frame.headers.iter() {
            if escape_headers {
                dst.put_slice(escape(key).as_bytes());
                dst.put_u8(b':');
                dst.put_slice(escape(value).as_bytes());
            } else {
                dst.put_slice(key.as_bytes());
                dst.put_u8(b':');
                dst.put_slice(value.as_bytes());
            }
            dst.put_u8(b'\n');
        }
        dst.put_u8(b'\n');
        dst.put_slice(&frame.body);
        dst.put_u8(0);
        Ok(())
    }
}

fn skip_heartbeats(src: &mut BytesMut) {
    loop {
        if src.starts_with(b"\r\n") {
            src.advance(2);
        } else if src.starts_with(b"\n") {
            src.advance(1);
        } else {
            return;
        }
    }
}

/// Locates the blank line closing the header block. Returns the length of the
/// header block (without its trailing EOL) and the offset of the body.
fn find_header_end(buf: &[u8]) -> Option<(usize, usize)> {
    let mut from = 0;
    while let Some(pos) = buf[from..].iter().position(|b| *b == b'\n') {
        let nl = from + pos;
        let head_len = if nl > 0 && buf[nl - 1] == b'\r' {
            nl - 1
        } else {
            nl
        };
        match buf.get(nl + 1) {
            Some(b'\n') => return Some((head_len, nl + 2)),
            Some(b'\r') if buf.get(nl + 2) == Some(&b'\n') => return Some((head_len, nl + 3)),
            _ => {}
        }
        from = nl + 1;
    }
    None
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(raw: &str) -> Result<String> {
    if !raw.contains('\\') {
        return Ok(raw.to_string());
    }
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(Error::protocol(format!(
                    "invalid header escape sequence \\{}",
                    other.map(String::from).unwrap_or_default()
                )));
            }
        }
    }
    Ok(out)
}
