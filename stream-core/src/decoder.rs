//! Incremental decoder for the line-oriented event stream.
//!
//! Network reads arrive in arbitrary chunks. The decoder buffers an
//! incomplete trailing line until its terminator (`\n`, `\r\n` or `\r`)
//! shows up, so a record split across reads decodes exactly like the same
//! bytes delivered in one read.
//!
//! Field handling:
//! - `data:` appends to the record payload verbatim (no separator)
//! - `event:` names the record
//! - `id:` sets the record id and is reported immediately as the last event id
//! - `retry:` reports the server's reconnect suggestion in milliseconds
//! - `:` starts a comment; unknown fields are ignored
//!
//! A blank line completes the record.

use fedistream_types::RawEvent;
use std::mem;
use std::time::Duration;

/// Something the decoder produced from a complete line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete record.
    Event(RawEvent),
    /// The server assigned a new last event id.
    LastEventId(String),
    /// The server suggested a reconnect delay.
    Retry(Duration),
}

/// Stateful decoder for one connection.
#[derive(Debug, Default)]
pub struct EventDecoder {
    /// Bytes of the current, not yet terminated line.
    line: Vec<u8>,
    /// The previous byte was `\r`; a following `\n` belongs to it.
    skip_lf: bool,
    event: Option<String>,
    data: String,
    has_data: bool,
    id: Option<String>,
}

impl EventDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network read and return everything it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Decoded> {
        let mut out = Vec::new();
        for &byte in chunk {
            if mem::take(&mut self.skip_lf) && byte == b'\n' {
                continue;
            }
            match byte {
                b'\n' => self.end_line(&mut out),
                b'\r' => {
                    self.end_line(&mut out);
                    self.skip_lf = true;
                }
                _ => self.line.push(byte),
            }
        }
        out
    }

    /// Interpret one complete line (without its terminator).
    pub fn process_line(&mut self, line: &str) -> Option<Decoded> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "data" => {
                self.data.push_str(value);
                self.has_data = true;
                None
            }
            "event" => {
                self.event = Some(value.to_string());
                None
            }
            "id" => {
                // NUL in an id makes the whole field invalid
                if value.contains('\0') {
                    return None;
                }
                self.id = Some(value.to_string());
                Some(Decoded::LastEventId(value.to_string()))
            }
            "retry" => value
                .trim()
                .parse::<u64>()
                .ok()
                .map(|ms| Decoded::Retry(Duration::from_millis(ms))),
            _ => None,
        }
    }

    /// Number of buffered bytes waiting for a line terminator.
    pub fn pending_bytes(&self) -> usize {
        self.line.len()
    }

    /// Drop any partial line or record (used when a connection is replaced).
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn end_line(&mut self, out: &mut Vec<Decoded>) {
        let line = String::from_utf8_lossy(&self.line).into_owned();
        self.line.clear();
        if let Some(decoded) = self.process_line(&line) {
            out.push(decoded);
        }
    }

    fn dispatch(&mut self) -> Option<Decoded> {
        let event = self.event.take();
        let id = self.id.take();
        let data = mem::take(&mut self.data);
        let has_data = mem::take(&mut self.has_data);

        if !has_data && event.is_none() {
            return None;
        }
        Some(Decoded::Event(RawEvent { event, data, id }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(decoded: Vec<Decoded>) -> Vec<RawEvent> {
        decoded
            .into_iter()
            .filter_map(|d| match d {
                Decoded::Event(raw) => Some(raw),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn decodes_single_record() {
        let mut decoder = EventDecoder::new();
        let out = events(decoder.feed(b"event: update\ndata: {\"id\":\"1\"}\n\n"));

        assert_eq!(out, vec![RawEvent::new("update", "{\"id\":\"1\"}")]);
    }

    #[test]
    fn data_split_across_reads_is_concatenated() {
        let mut decoder = EventDecoder::new();

        assert!(decoder.feed(b"event: update\ndata: part1").is_empty());
        assert_eq!(decoder.pending_bytes(), "data: part1".len());

        let out = events(decoder.feed(b"part2\n\n"));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].data, "part1part2");
        assert_eq!(out[0].event.as_deref(), Some("update"));
    }

    #[test]
    fn every_split_point_matches_single_read() {
        let wire: &[u8] = b"event: notification\nid: 77\ndata: {\"a\":\ndata: 1}\n\n: ping\n\nevent: delete\r\ndata: 9\r\n\r\n";
        let expected = EventDecoder::new().feed(wire);
        assert_eq!(events(expected.clone()).len(), 2);

        for split in 0..=wire.len() {
            let mut decoder = EventDecoder::new();
            let mut out = decoder.feed(&wire[..split]);
            out.extend(decoder.feed(&wire[split..]));
            assert_eq!(out, expected, "split at byte {}", split);
        }
    }

    #[test]
    fn consecutive_data_lines_join_without_separator() {
        let mut decoder = EventDecoder::new();
        let out = events(decoder.feed(b"data: ab\ndata: cd\n\n"));
        assert_eq!(out[0].data, "abcd");
        assert_eq!(out[0].event, None);
    }

    #[test]
    fn id_is_reported_immediately_and_attached_to_record() {
        let mut decoder = EventDecoder::new();
        let out = decoder.feed(b"id: 42\ndata: x\n\n");

        assert_eq!(out[0], Decoded::LastEventId("42".into()));
        match &out[1] {
            Decoded::Event(raw) => assert_eq!(raw.id.as_deref(), Some("42")),
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[test]
    fn retry_is_parsed_as_milliseconds() {
        let mut decoder = EventDecoder::new();
        assert_eq!(
            decoder.feed(b"retry: 3000\n"),
            vec![Decoded::Retry(Duration::from_millis(3000))]
        );
        assert!(decoder.feed(b"retry: soon\n").is_empty());
    }

    #[test]
    fn comments_and_unknown_fields_are_ignored() {
        let mut decoder = EventDecoder::new();
        let out = decoder.feed(b": keepalive\nfoo: bar\n\n");
        assert!(out.is_empty());
    }

    #[test]
    fn blank_record_is_not_dispatched() {
        let mut decoder = EventDecoder::new();
        assert!(decoder.feed(b"\n\n\n").is_empty());
    }

    #[test]
    fn event_without_data_is_dispatched() {
        let mut decoder = EventDecoder::new();
        let out = events(decoder.feed(b"event: filters_changed\n\n"));
        assert_eq!(out, vec![RawEvent::new("filters_changed", "")]);
    }

    #[test]
    fn field_without_colon_has_empty_value() {
        let mut decoder = EventDecoder::new();
        let out = events(decoder.feed(b"data\n\n"));
        assert_eq!(out[0].data, "");
    }

    #[test]
    fn multibyte_characters_split_across_reads() {
        let wire = "data: héllo ✓\n\n".as_bytes();
        let mut decoder = EventDecoder::new();
        let mut out = decoder.feed(&wire[..8]);
        out.extend(decoder.feed(&wire[8..]));
        assert_eq!(events(out)[0].data, "héllo ✓");
    }

    #[test]
    fn reset_drops_partial_state() {
        let mut decoder = EventDecoder::new();
        decoder.feed(b"event: update\ndata: half");
        decoder.reset();

        assert_eq!(decoder.pending_bytes(), 0);
        let out = events(decoder.feed(b"data: fresh\n\n"));
        assert_eq!(out[0], RawEvent { event: None, data: "fresh".into(), id: None });
    }
}
