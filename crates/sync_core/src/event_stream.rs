/// Incremental `text/event-stream` decoder. Bytes go in as they arrive off the wire;
/// the `data` payload of every completed event comes out.
///
/// Only `data` lines matter for the progress channel. `event`, `id` and `retry` fields
/// are skipped, as are `:` comment lines used as keep-alives.
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl EventStreamDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(end) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw);
            if let Some(event) = self.line(line.trim_end_matches(['\n', '\r'])) {
                events.push(event);
            }
        }
        events
    }

    fn line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            if self.data.is_empty() {
                return None;
            }
            return Some(std::mem::take(&mut self.data).join("\n"));
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field == "data" {
            self.data.push(value.to_string());
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_split_across_chunks_are_reassembled() {
        let mut decoder = EventStreamDecoder::default();
        assert!(decoder.push(b"data: {\"type\":\"pi").is_empty());
        assert!(decoder.push(b"ng\"}\n").is_empty());
        assert_eq!(decoder.push(b"\ndata: {}\n\n"), vec!["{\"type\":\"ping\"}", "{}"]);
    }

    #[test]
    fn multi_line_data_is_joined_with_newlines() {
        let mut decoder = EventStreamDecoder::default();
        let events = decoder.push(b"event: progress\nid: 7\ndata: {\"a\":\ndata:1}\n\n");
        assert_eq!(events, vec!["{\"a\":\n1}"]);
    }

    #[test]
    fn comments_and_crlf_line_endings_are_handled() {
        let mut decoder = EventStreamDecoder::default();
        let events = decoder.push(b": keep-alive\r\n\r\ndata: {\"type\":\"ping\"}\r\n\r\n");
        assert_eq!(events, vec!["{\"type\":\"ping\"}"]);
    }

    #[test]
    fn blank_lines_without_data_emit_nothing() {
        let mut decoder = EventStreamDecoder::default();
        assert!(decoder.push(b"\n\nretry: 3000\n\n").is_empty());
    }
}
