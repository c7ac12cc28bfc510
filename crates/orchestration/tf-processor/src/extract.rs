//! Constant-memory extraction of records from a `{"Records":[...]}` stream.
//!
//! The extractor enumerates the objects of the top-level `Records` array
//! without parsing the whole document. It scans line by line and tracks
//! brace depth to find record boundaries, so memory use is bounded by the
//! largest single record rather than the document size.
//!
//! The scan deliberately does not track JSON string literals: a brace
//! inside a string would confuse it. Audit-log documents produced by the
//! trail service never contain such values in practice, and the tradeoff
//! buys a scanner that needs no JSON state machine. Inputs that violate
//! the assumption fail downstream when the emitted record is decoded.

use bytes::Bytes;
use tf_error::{DecodeError, FilterError, Result, SourceError};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Maximum size of a single scanned line and of a single record.
pub const MAX_RECORD_BYTES: usize = 10 * 1024 * 1024;

/// Initial capacity of the line buffer.
const INITIAL_LINE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    /// Discarding lines until one contains the `"Records"` token
    SeekingArray,

    /// `"Records"` seen, still looking for the opening `[`
    SeekingBracket,

    /// Between records inside the array
    OutsideRecord,

    /// Accumulating a record at the given brace depth
    InsideRecord { depth: u32 },

    /// Array closed; remainder of the input is ignored
    Done,
}

/// Streaming record extractor.
///
/// Feed it any buffered async reader (plain or already-gunzipped) and pull
/// records one at a time with [`RecordExtractor::next_record`]. Emitted
/// records are the raw bytes between balanced braces, suitable for
/// verbatim re-emission.
pub struct RecordExtractor<R> {
    reader: R,
    state: ScanState,
    line: Vec<u8>,
    cursor: usize,
    record: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> RecordExtractor<R> {
    /// Create an extractor over a buffered reader.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            state: ScanState::SeekingArray,
            line: Vec::with_capacity(INITIAL_LINE_CAPACITY),
            cursor: 0,
            record: Vec::new(),
        }
    }

    /// Produce the next record, or `None` at the end of the array or input.
    pub async fn next_record(&mut self) -> Result<Option<Bytes>> {
        loop {
            if self.state == ScanState::Done {
                return Ok(None);
            }

            if self.cursor >= self.line.len() {
                if !self.read_line().await? {
                    // EOF. A record cut off mid-stream is malformed input.
                    if matches!(self.state, ScanState::InsideRecord { .. }) {
                        return Err(FilterError::Decode(DecodeError::Malformed(
                            "input ended inside a record".to_string(),
                        )));
                    }
                    return Ok(None);
                }

                if self.state == ScanState::SeekingArray {
                    if !contains_token(&self.line, b"\"Records\"") {
                        self.cursor = self.line.len();
                        continue;
                    }
                    self.state = ScanState::SeekingBracket;
                }
            }

            while self.cursor < self.line.len() {
                let b = self.line[self.cursor];
                self.cursor += 1;

                match self.state {
                    ScanState::SeekingArray | ScanState::Done => {}
                    ScanState::SeekingBracket => {
                        if b == b'[' {
                            self.state = ScanState::OutsideRecord;
                        }
                    }
                    ScanState::OutsideRecord => match b {
                        b'{' => {
                            self.record.clear();
                            self.record.push(b);
                            self.state = ScanState::InsideRecord { depth: 1 };
                        }
                        b']' => {
                            self.state = ScanState::Done;
                            return Ok(None);
                        }
                        // Commas and whitespace between records
                        _ => {}
                    },
                    ScanState::InsideRecord { depth } => {
                        match b {
                            b'{' => {
                                self.push_record_byte(b)?;
                                self.state = ScanState::InsideRecord { depth: depth + 1 };
                            }
                            b'}' => {
                                self.push_record_byte(b)?;
                                if depth == 1 {
                                    self.state = ScanState::OutsideRecord;
                                    let record = Bytes::from(std::mem::take(&mut self.record));
                                    return Ok(Some(record));
                                }
                                self.state = ScanState::InsideRecord { depth: depth - 1 };
                            }
                            _ => self.push_record_byte(b)?,
                        }
                    }
                }
            }
        }
    }

    fn push_record_byte(&mut self, b: u8) -> Result<()> {
        if self.record.len() >= MAX_RECORD_BYTES {
            return Err(FilterError::Decode(DecodeError::RecordTooLarge(
                MAX_RECORD_BYTES,
            )));
        }
        self.record.push(b);
        Ok(())
    }

    /// Read one line (without its terminator) into the reusable buffer.
    /// Returns false at EOF with no bytes read. Lines longer than
    /// [`MAX_RECORD_BYTES`] are a decode failure.
    async fn read_line(&mut self) -> Result<bool> {
        self.line.clear();
        self.cursor = 0;

        loop {
            let buf = self
                .reader
                .fill_buf()
                .await
                .map_err(|e| FilterError::Source(SourceError::Read(format!("read failed: {e}"))))?;

            if buf.is_empty() {
                return Ok(!self.line.is_empty());
            }

            if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                self.line.extend_from_slice(&buf[..pos]);
                self.reader.consume(pos + 1);
                if self.line.last() == Some(&b'\r') {
                    self.line.pop();
                }
                if self.line.len() > MAX_RECORD_BYTES {
                    return Err(FilterError::Decode(DecodeError::RecordTooLarge(
                        MAX_RECORD_BYTES,
                    )));
                }
                return Ok(true);
            }

            let n = buf.len();
            self.line.extend_from_slice(buf);
            self.reader.consume(n);

            if self.line.len() > MAX_RECORD_BYTES {
                return Err(FilterError::Decode(DecodeError::RecordTooLarge(
                    MAX_RECORD_BYTES,
                )));
            }
        }
    }
}

fn contains_token(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}
