//! Incremental NDJSON record scanners for streamed responses.
//!
//! The runtime streams newline-delimited JSON records. Two scanners turn
//! an arriving byte stream into complete record strings:
//!
//! - [`LineScanner`]: standard framing, one record per newline.
//! - [`ConcatScanner`]: newline framing plus recovery of concatenated
//!   objects (`}` immediately followed by `{` with no separator), which
//!   some model families emit in violation of the framing contract.
//!
//! [`StreamDecoder`] selects between them by model family. Scanners hand
//! back record *text*; callers parse with `serde_json` and skip records
//! that fail to parse.
//!
//! Buffers hold raw bytes, not strings, so a UTF-8 sequence split across
//! chunk boundaries survives intact; conversion happens per complete
//! record.

/// Incrementally split a byte stream into newline-delimited records.
///
/// Feed chunks via [`LineScanner::push`] and collect complete records;
/// call [`LineScanner::flush`] at stream end for any trailing partial
/// record.
#[derive(Debug, Default)]
pub struct LineScanner {
    buffer: Vec<u8>,
}

impl LineScanner {
    /// Create a new scanner with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a chunk of bytes, returning any complete records.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut records = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                if let Some(record) = take_record(&mut self.buffer) {
                    records.push(record);
                }
            } else {
                self.buffer.push(byte);
            }
        }
        records
    }

    /// Flush any buffered partial record.
    ///
    /// Call this when the stream ends to give trailing content one final
    /// parse opportunity.
    pub fn flush(&mut self) -> Option<String> {
        take_record(&mut self.buffer)
    }
}

/// Incrementally split a byte stream into records on newlines *and* on
/// top-level object boundaries.
///
/// Tracks JSON string/escape state and brace depth so a `}` closing a
/// top-level object emits the record immediately, even when the server
/// concatenates objects with no separator. Braces inside string values
/// never split a record.
#[derive(Debug, Default)]
pub struct ConcatScanner {
    buffer: Vec<u8>,
    depth: u32,
    in_string: bool,
    escaped: bool,
}

impl ConcatScanner {
    /// Create a new scanner with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a chunk of bytes, returning any complete records.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut records = Vec::new();
        for &byte in chunk {
            if self.in_string {
                self.buffer.push(byte);
                if self.escaped {
                    self.escaped = false;
                } else if byte == b'\\' {
                    self.escaped = true;
                } else if byte == b'"' {
                    self.in_string = false;
                }
                continue;
            }

            match byte {
                b'"' => {
                    self.in_string = true;
                    self.buffer.push(byte);
                }
                b'{' => {
                    self.depth += 1;
                    self.buffer.push(byte);
                }
                b'}' => {
                    self.depth = self.depth.saturating_sub(1);
                    self.buffer.push(byte);
                    if self.depth == 0
                        && let Some(record) = take_record(&mut self.buffer)
                    {
                        records.push(record);
                    }
                }
                b'\n' if self.depth == 0 => {
                    if let Some(record) = take_record(&mut self.buffer) {
                        records.push(record);
                    }
                }
                _ => self.buffer.push(byte),
            }
        }
        records
    }

    /// Flush any buffered partial record.
    pub fn flush(&mut self) -> Option<String> {
        self.in_string = false;
        self.escaped = false;
        self.depth = 0;
        take_record(&mut self.buffer)
    }
}

/// Drain the buffer into a record string, or `None` when it holds only
/// whitespace.
fn take_record(buffer: &mut Vec<u8>) -> Option<String> {
    if buffer.last() == Some(&b'\r') {
        buffer.pop();
    }
    let bytes = std::mem::take(buffer);
    let record = String::from_utf8_lossy(&bytes);
    let trimmed = record.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_string())
}

/// Record framing strategy, selected per model family.
#[derive(Debug)]
pub enum StreamDecoder {
    /// Newline-delimited framing.
    Standard(LineScanner),
    /// Newline framing plus concatenated-object recovery.
    Aggressive(ConcatScanner),
}

impl StreamDecoder {
    /// Standard newline-delimited decoder.
    pub fn standard() -> Self {
        Self::Standard(LineScanner::new())
    }

    /// Aggressive decoder for servers emitting concatenated objects.
    pub fn aggressive() -> Self {
        Self::Aggressive(ConcatScanner::new())
    }

    /// Select a decoder for `model`: aggressive when the model name
    /// contains any configured family fragment (case-insensitive),
    /// standard otherwise.
    pub fn for_model(model: &str, aggressive_families: &[String]) -> Self {
        let lower = model.to_lowercase();
        let aggressive = aggressive_families
            .iter()
            .any(|family| lower.contains(&family.to_lowercase()));
        if aggressive {
            Self::aggressive()
        } else {
            Self::standard()
        }
    }

    /// Whether this is the aggressive variant.
    pub fn is_aggressive(&self) -> bool {
        matches!(self, Self::Aggressive(_))
    }

    /// Push a chunk of bytes, returning any complete records.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        match self {
            Self::Standard(scanner) => scanner.push(chunk),
            Self::Aggressive(scanner) => scanner.push(chunk),
        }
    }

    /// Flush any buffered partial record.
    pub fn flush(&mut self) -> Option<String> {
        match self {
            Self::Standard(scanner) => scanner.flush(),
            Self::Aggressive(scanner) => scanner.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── LineScanner ───────────────────────────────────────────

    #[test]
    fn line_single_chunk() {
        let mut scanner = LineScanner::new();
        let records = scanner.push(b"{\"a\":1}\n{\"b\":2}\n");
        assert_eq!(records, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn line_split_across_chunks() {
        let mut scanner = LineScanner::new();
        assert!(scanner.push(b"{\"a\"").is_empty());
        let records = scanner.push(b":1}\n");
        assert_eq!(records, vec!["{\"a\":1}"]);
    }

    #[test]
    fn line_crlf_stripped() {
        let mut scanner = LineScanner::new();
        let records = scanner.push(b"{\"a\":1}\r\n");
        assert_eq!(records, vec!["{\"a\":1}"]);
    }

    #[test]
    fn line_blank_lines_skipped() {
        let mut scanner = LineScanner::new();
        let records = scanner.push(b"\n\n{\"a\":1}\n\n");
        assert_eq!(records, vec!["{\"a\":1}"]);
    }

    #[test]
    fn line_flush_trailing() {
        let mut scanner = LineScanner::new();
        assert!(scanner.push(b"{\"tail\":true}").is_empty());
        assert_eq!(scanner.flush(), Some("{\"tail\":true}".to_string()));
        assert_eq!(scanner.flush(), None);
    }

    #[test]
    fn line_flush_empty() {
        let mut scanner = LineScanner::new();
        assert_eq!(scanner.flush(), None);
    }

    #[test]
    fn line_no_split_on_concatenated_objects() {
        let mut scanner = LineScanner::new();
        assert!(scanner.push(b"{\"a\":1}{\"b\":2}").is_empty());
        // One flush record holding both objects; the caller's parse fails
        // and skips it.
        assert_eq!(scanner.flush(), Some("{\"a\":1}{\"b\":2}".to_string()));
    }

    #[test]
    fn line_utf8_split_across_chunks() {
        let mut scanner = LineScanner::new();
        // "é" is 0xC3 0xA9; split it between chunks.
        assert!(scanner.push(b"{\"t\":\"\xc3").is_empty());
        let records = scanner.push(b"\xa9\"}\n");
        assert_eq!(records, vec!["{\"t\":\"é\"}"]);
    }

    // ── ConcatScanner ─────────────────────────────────────────

    #[test]
    fn concat_adjacent_objects_split() {
        let mut scanner = ConcatScanner::new();
        let records = scanner.push(b"{\"a\":1}{\"b\":2}");
        assert_eq!(records, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn concat_nested_braces_stay_together() {
        let mut scanner = ConcatScanner::new();
        let records = scanner.push(b"{\"m\":{\"c\":\"x\"}}{\"done\":true}");
        assert_eq!(records, vec!["{\"m\":{\"c\":\"x\"}}", "{\"done\":true}"]);
    }

    #[test]
    fn concat_brace_pair_inside_string_not_split() {
        let mut scanner = ConcatScanner::new();
        let records = scanner.push(b"{\"c\":\"}{\"}");
        assert_eq!(records, vec!["{\"c\":\"}{\"}"]);
    }

    #[test]
    fn concat_escaped_quote_inside_string() {
        let mut scanner = ConcatScanner::new();
        let records = scanner.push(b"{\"c\":\"say \\\"}{\\\" twice\"}{\"d\":1}");
        assert_eq!(records, vec!["{\"c\":\"say \\\"}{\\\" twice\"}", "{\"d\":1}"]);
    }

    #[test]
    fn concat_newline_framing_still_works() {
        let mut scanner = ConcatScanner::new();
        let records = scanner.push(b"{\"a\":1}\n{\"b\":2}\n");
        assert_eq!(records, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn concat_split_across_chunks() {
        let mut scanner = ConcatScanner::new();
        assert!(scanner.push(b"{\"a\":{\"b\"").is_empty());
        let records = scanner.push(b":2}}{\"c\":3}");
        assert_eq!(records, vec!["{\"a\":{\"b\":2}}", "{\"c\":3}"]);
    }

    #[test]
    fn concat_flush_trailing_partial() {
        let mut scanner = ConcatScanner::new();
        assert!(scanner.push(b"{\"half\":tr").is_empty());
        assert_eq!(scanner.flush(), Some("{\"half\":tr".to_string()));
    }

    // ── StreamDecoder ─────────────────────────────────────────

    fn families() -> Vec<String> {
        vec!["deepseek".to_string()]
    }

    #[test]
    fn decoder_standard_by_default() {
        let decoder = StreamDecoder::for_model("llama3.2:3b", &families());
        assert!(!decoder.is_aggressive());
    }

    #[test]
    fn decoder_family_match_is_case_insensitive() {
        assert!(StreamDecoder::for_model("DeepSeek-R1:8b", &families()).is_aggressive());
        assert!(StreamDecoder::for_model("my-deepseek-tune", &families()).is_aggressive());
        assert!(!StreamDecoder::for_model("deep-sea:latest", &families()).is_aggressive());
    }

    #[test]
    fn decoder_empty_family_list_never_aggressive() {
        let decoder = StreamDecoder::for_model("deepseek-r1", &[]);
        assert!(!decoder.is_aggressive());
    }

    #[test]
    fn decoder_delegates_push_and_flush() {
        let mut decoder = StreamDecoder::aggressive();
        let records = decoder.push(b"{\"a\":1}{\"b\":2}");
        assert_eq!(records.len(), 2);

        let mut decoder = StreamDecoder::standard();
        assert!(decoder.push(b"{\"a\":1}").is_empty());
        assert_eq!(decoder.flush(), Some("{\"a\":1}".to_string()));
    }
}
