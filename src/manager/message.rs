//! Manager wire protocol: a pure, synchronous encoder/decoder for
//! newline-keyed messages (`spec.md` §4.3.1), kept dependency-free from
//! sockets so it is unit-testable without a listener.

use std::fmt;

/// One ordered (key, value) header pair, as the wire form preserves header
/// order within a message (`spec.md` §3, "Manager message").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub key: String,
    pub value: String,
}

/// A parsed or to-be-encoded manager message: an ordered sequence of
/// headers terminated by a blank line (`spec.md` §3, §4.3.1).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    headers: Vec<Header>,
}

impl Message {
    pub fn new() -> Self {
        Self { headers: Vec::new() }
    }

    /// Append a header, preserving insertion order. Multiple headers with
    /// the same key are both kept (the wire protocol does not require
    /// uniqueness).
    pub fn push(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(Header { key: key.into(), value: value.into() });
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers.iter().find(|h| h.key.eq_ignore_ascii_case(key)).map(|h| h.value.as_str())
    }

    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.headers.iter().filter(|h| h.key.eq_ignore_ascii_case(key)).map(|h| h.value.as_str()).collect()
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    pub fn action(&self) -> Option<&str> {
        self.get("Action")
    }

    pub fn action_id(&self) -> Option<&str> {
        self.get("ActionID")
    }

    /// Encode to wire form: `Key: Value\r\n` per header, terminated by a
    /// blank line. Continuation is never emitted by this encoder (only
    /// accepted on decode) since every value here is already a single
    /// logical line.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        for h in &self.headers {
            out.push_str(&h.key);
            out.push_str(": ");
            out.push_str(&h.value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Errors decoding a wire-format message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("continuation line with no preceding header")]
    DanglingContinuation,
    #[error("header line missing ':' separator: {0:?}")]
    MalformedHeader(String),
}

/// Decode one complete message (headers up to, but not including, the
/// terminating blank line) from `lines` already split on `\r\n` or `\n`.
/// Continuation lines (leading space or tab) extend the previous header's
/// value with a single joining space (`spec.md` §4.3.1).
pub fn decode_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Result<Message, DecodeError> {
    let mut msg = Message::new();
    for raw in lines {
        if raw.is_empty() {
            continue;
        }
        if raw.starts_with(' ') || raw.starts_with('\t') {
            let Some(last) = msg.headers.last_mut() else {
                return Err(DecodeError::DanglingContinuation);
            };
            last.value.push(' ');
            last.value.push_str(raw.trim_start());
            continue;
        }
        let Some((key, value)) = raw.split_once(':') else {
            return Err(DecodeError::MalformedHeader(raw.to_string()));
        };
        msg = msg.push(key.trim(), value.trim_start());
    }
    Ok(msg)
}

/// Incrementally feeds raw bytes from a socket and yields complete messages
/// as they arrive, handling partial reads and multiple messages landing in
/// one read (`spec.md` §4.3.3, reader side).
#[derive(Debug, Default)]
pub struct MessageDecoder {
    buffer: String,
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self { buffer: String::new() }
    }

    /// Feed newly read bytes (assumed valid UTF-8, as manager traffic is
    /// textual). Returns every complete message now available, in order.
    pub fn feed(&mut self, chunk: &str) -> Result<Vec<Message>, DecodeError> {
        self.buffer.push_str(chunk);
        let mut out = Vec::new();
        loop {
            let Some(terminator_pos) = find_blank_line(&self.buffer) else { break };
            let (head, rest) = self.buffer.split_at(terminator_pos);
            let message_text = head.to_string();
            let consumed = message_text.len() + blank_line_len(rest);
            let lines: Vec<&str> = message_text.split(['\n']).map(|l| l.trim_end_matches('\r')).collect();
            if !lines.iter().all(|l| l.is_empty()) {
                out.push(decode_lines(lines.into_iter().filter(|l| !l.is_empty()))?);
            }
            self.buffer.drain(..consumed);
        }
        Ok(out)
    }
}

fn find_blank_line(s: &str) -> Option<usize> {
    if let Some(pos) = s.find("\r\n\r\n") {
        return Some(pos);
    }
    s.find("\n\n")
}

fn blank_line_len(rest: &str) -> usize {
    if rest.starts_with("\r\n\r\n") {
        4
    } else if rest.starts_with("\n\n") {
        2
    } else {
        0
    }
}

/// The banner a listener emits immediately on accept (`spec.md` §4.3.1).
pub const BANNER: &str = "PBXQ Call Manager/1.0\r\n";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_roundtrips_through_decode() {
        let msg = Message::new().push("Action", "Login").push("Username", "admin").push("Secret", "swordfish");
        let encoded = msg.encode();
        let lines: Vec<&str> = encoded.trim_end().split("\r\n").collect();
        let decoded = decode_lines(lines).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn continuation_line_extends_previous_value() {
        let lines = vec!["Action: Command", "Command: show queues", " continued text"];
        let decoded = decode_lines(lines).unwrap();
        assert_eq!(decoded.get("Command"), Some("show queues continued text"));
    }

    #[test]
    fn dangling_continuation_is_an_error() {
        let lines = vec![" continued text"];
        assert_eq!(decode_lines(lines), Err(DecodeError::DanglingContinuation));
    }

    #[test]
    fn decoder_splits_multiple_messages_in_one_chunk() {
        let mut decoder = MessageDecoder::new();
        let chunk = "Action: Ping\r\n\r\nAction: Version\r\n\r\n";
        let messages = decoder.feed(chunk).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].action(), Some("Ping"));
        assert_eq!(messages[1].action(), Some("Version"));
    }

    #[test]
    fn decoder_buffers_partial_message_across_feeds() {
        let mut decoder = MessageDecoder::new();
        assert!(decoder.feed("Action: Ping\r\n").unwrap().is_empty());
        let messages = decoder.feed("\r\n").unwrap();
        assert_eq!(messages.len(), 1);
    }
}
