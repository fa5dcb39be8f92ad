use crate::WireFrame;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("invalid frame payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("stream ended inside a frame")]
    Truncated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    #[default]
    Sse,
    Ndjson,
}

impl WireFormat {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sse" | "event-stream" => Some(Self::Sse),
            "ndjson" | "jsonl" => Some(Self::Ndjson),
            _ => None,
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            WireFormat::Sse => "text/event-stream",
            WireFormat::Ndjson => "application/x-ndjson",
        }
    }

    pub fn encode(self, frame: &WireFrame) -> Result<String, WireError> {
        let payload = serde_json::to_string(frame)?;
        Ok(match self {
            WireFormat::Sse => format!("event: {}\ndata: {}\n\n", frame.kind(), payload),
            WireFormat::Ndjson => format!("{payload}\n"),
        })
    }
}

/// Incremental decoder for either wire format. Bytes may arrive split at any
/// point; complete frames are returned as soon as their terminator is seen.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    format: WireFormat,
    buffer: String,
}

impl FrameDecoder {
    pub fn new(format: WireFormat) -> Self {
        Self {
            format,
            buffer: String::new(),
        }
    }

    pub fn push(&mut self, chunk: &str) -> Result<Vec<WireFrame>, WireError> {
        self.buffer.push_str(&chunk.replace("\r\n", "\n"));
        let mut frames = Vec::new();
        match self.format {
            WireFormat::Sse => {
                while let Some(pos) = self.buffer.find("\n\n") {
                    let block = self.buffer[..pos].to_string();
                    self.buffer = self.buffer[pos + 2..].to_string();
                    if let Some(frame) = parse_sse_block(&block)? {
                        frames.push(frame);
                    }
                }
            }
            WireFormat::Ndjson => {
                while let Some(pos) = self.buffer.find('\n') {
                    let line = self.buffer[..pos].trim().to_string();
                    self.buffer = self.buffer[pos + 1..].to_string();
                    if line.is_empty() {
                        continue;
                    }
                    frames.push(serde_json::from_str(&line)?);
                }
            }
        }
        Ok(frames)
    }

    /// Flushes a final unterminated NDJSON line. Leftover SSE text is an
    /// error because SSE frames always end with a blank line.
    pub fn finish(mut self) -> Result<Vec<WireFrame>, WireError> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        if rest.is_empty() {
            return Ok(Vec::new());
        }
        match self.format {
            WireFormat::Ndjson => Ok(vec![serde_json::from_str(rest)?]),
            WireFormat::Sse => Err(WireError::Truncated),
        }
    }
}

fn parse_sse_block(block: &str) -> Result<Option<WireFrame>, WireError> {
    let data = block
        .lines()
        .filter(|line| line.starts_with("data:"))
        .map(|line| line.trim_start_matches("data:").trim())
        .collect::<Vec<_>>()
        .join("\n");
    if data.is_empty() {
        // keep-alive comments and bare event lines
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(&data)?))
}
