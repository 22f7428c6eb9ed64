use bytes::Bytes;

/// Literal terminator of an OpenAI chat-completion event stream.
pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

/// Comment frame sent while the upstream is silent.
pub const KEEP_ALIVE_FRAME: &[u8] = b": keep-alive\n\n";

/// Encodes one `data:` event. Multi-line payloads get one `data:` line each.
pub fn encode_data(data: &str) -> Bytes {
    let mut out = String::with_capacity(data.len() + 8);
    for line in data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    Bytes::from(out)
}

pub fn encode_done() -> Bytes {
    Bytes::from_static(DONE_FRAME)
}

/// Incremental decoder for `data:`-only event streams. Comment lines and
/// `event:` names are ignored; events are yielded as their joined data.
#[derive(Debug, Default)]
pub struct SseDataDecoder {
    buffer: String,
    data_lines: Vec<String>,
}

impl SseDataDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                self.flush(&mut events);
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data_lines.push(value.trim_start().to_string());
            }
        }
        events
    }

    pub fn finish(&mut self) -> Vec<String> {
        let rest = std::mem::take(&mut self.buffer);
        if let Some(value) = rest.trim_end_matches('\r').strip_prefix("data:") {
            self.data_lines.push(value.trim_start().to_string());
        }
        let mut events = Vec::new();
        self.flush(&mut events);
        events
    }

    fn flush(&mut self, events: &mut Vec<String>) {
        if self.data_lines.is_empty() {
            return;
        }
        events.push(self.data_lines.join("\n"));
        self.data_lines.clear();
    }
}
