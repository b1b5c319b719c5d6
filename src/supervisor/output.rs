//! Output draining for the supervised process.
//!
//! Each of stdout and stderr gets its own watcher task. A watcher reads
//! whatever bytes are available, splits them into lines, drops shell noise,
//! and splits oversized lines into ordered chunks. A line that grows past
//! [`MAX_PENDING_BYTES`] before its newline arrives is flushed in pieces at
//! character boundaries; its chunk numbering carries on across the pieces. Records are logged and
//! forwarded to an optional sink with `try_send`, so a slow consumer can
//! never stall the child.

use std::fmt::{Display, Formatter};
use std::io::ErrorKind;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Bytes buffered without a newline before the partial line is flushed.
pub const MAX_PENDING_BYTES: usize = 1_048_576;

/// Which stdio stream a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl Display for OutputStream {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        })
    }
}

/// Position of a chunk within an oversized line (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkMarker {
    /// Chunk number, starting at 1.
    pub index: usize,
    /// Total number of chunks for the line; `None` while the line was still
    /// being read when this chunk was emitted.
    pub total: Option<usize>,
}

impl Display for ChunkMarker {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.total {
            Some(total) => write!(f, "[chunk {}/{total}]", self.index),
            None => write!(f, "[chunk {}/?]", self.index),
        }
    }
}

/// One line (or line chunk) of server output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRecord {
    /// Source stream.
    pub stream: OutputStream,
    /// Line text without marker or terminator.
    pub text: String,
    /// Set when the line was split.
    pub chunk: Option<ChunkMarker>,
}

impl Display for OutputRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.chunk {
            Some(marker) => write!(f, "{marker} {}", self.text),
            None => f.write_str(&self.text),
        }
    }
}

/// Output draining behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSettings {
    /// Lines longer than this (in bytes) are emitted as chunks.
    pub max_line_bytes: usize,
    /// Lines starting with any of these (after leading whitespace) are dropped.
    pub noise_prefixes: Vec<String>,
    /// Size of each read.
    pub read_buffer_bytes: usize,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            max_line_bytes: 4096,
            noise_prefixes: default_noise_prefixes(),
            read_buffer_bytes: 8192,
        }
    }
}

/// Shell login banners and session-restore chatter.
#[must_use]
pub fn default_noise_prefixes() -> Vec<String> {
    [
        "Last login:",
        "Restored session:",
        "Saving session...",
        "...copying shared history...",
        "...saving history...",
        "...truncating history files...",
        "...completed.",
    ]
    .iter()
    .map(|&p| p.to_owned())
    .collect()
}

impl OutputSettings {
    /// Whether a line carries no useful information.
    #[must_use]
    pub fn is_noise(&self, line: &str) -> bool {
        let trimmed = line.trim_start();
        trimmed.is_empty()
            || self
                .noise_prefixes
                .iter()
                .any(|prefix| trimmed.starts_with(prefix.as_str()))
    }

    /// Turn one complete line into zero or more records.
    #[must_use]
    pub fn records_for_line(&self, stream: OutputStream, line: &str) -> Vec<OutputRecord> {
        if self.is_noise(line) {
            return Vec::new();
        }

        if line.len() <= self.max_line_bytes {
            return vec![OutputRecord {
                stream,
                text: line.to_owned(),
                chunk: None,
            }];
        }

        self.chunk_records(stream, line, 0, true)
    }

    /// Chunk records for `text`, numbered after `already_emitted` earlier
    /// chunks of the same line.
    fn chunk_records(
        &self,
        stream: OutputStream,
        text: &str,
        already_emitted: usize,
        line_complete: bool,
    ) -> Vec<OutputRecord> {
        let pieces = split_at_char_boundaries(text, self.max_line_bytes);
        let total = line_complete.then_some(already_emitted + pieces.len());
        pieces
            .into_iter()
            .enumerate()
            .map(|(i, text)| OutputRecord {
                stream,
                text: text.to_owned(),
                chunk: Some(ChunkMarker {
                    index: already_emitted + i + 1,
                    total,
                }),
            })
            .collect()
    }
}

/// Turns [`LinePiece`]s from one stream into records, keeping chunk numbers
/// continuous across the pieces of a flushed line.
#[derive(Debug)]
pub struct LineAssembler {
    stream: OutputStream,
    emitted: usize,
    dropping: bool,
}

impl LineAssembler {
    /// Assembler for records of `stream`.
    #[must_use]
    pub fn new(stream: OutputStream) -> Self {
        Self {
            stream,
            emitted: 0,
            dropping: false,
        }
    }

    /// Records for the next piece of output.
    pub fn records(&mut self, settings: &OutputSettings, piece: &LinePiece) -> Vec<OutputRecord> {
        let starts_line = self.emitted == 0 && !self.dropping;
        if starts_line && piece.complete {
            return settings.records_for_line(self.stream, &piece.text);
        }
        if starts_line && settings.is_noise(&piece.text) {
            self.dropping = true;
        }
        if self.dropping {
            if piece.complete {
                self.dropping = false;
            }
            return Vec::new();
        }

        let records = settings.chunk_records(self.stream, &piece.text, self.emitted, piece.complete);
        self.emitted = if piece.complete {
            0
        } else {
            self.emitted + records.len()
        };
        records
    }
}

/// Split `line` into pieces of at most `max` bytes without breaking a UTF-8
/// sequence. A single character wider than `max` gets its own piece.
fn split_at_char_boundaries(line: &str, max: usize) -> Vec<&str> {
    let max = max.max(1);
    let mut pieces = Vec::new();
    let mut start = 0;

    while start < line.len() {
        let mut end = (start + max).min(line.len());
        while end > start && !line.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            end = line[start..]
                .char_indices()
                .nth(1)
                .map_or(line.len(), |(offset, _)| start + offset);
        }
        pieces.push(&line[start..end]);
        start = end;
    }

    pieces
}

/// Text handed out by [`LineSplitter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinePiece {
    /// Text without `\n`/`\r\n`.
    pub text: String,
    /// False when the line continues in the next piece.
    pub complete: bool,
}

impl LinePiece {
    /// A whole line.
    #[must_use]
    pub fn line(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            complete: true,
        }
    }
}

/// Accumulates raw bytes and yields lines, or pieces of lines that outgrow
/// [`MAX_PENDING_BYTES`].
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    /// Empty splitter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; returns every line completed by them, plus a partial
    /// piece whenever the pending line reaches [`MAX_PENDING_BYTES`].
    pub fn push(&mut self, bytes: &[u8]) -> Vec<LinePiece> {
        let mut pieces = Vec::new();

        for &byte in bytes {
            if byte == b'\n' {
                pieces.push(self.take_line());
            } else {
                self.pending.push(byte);
                if self.pending.len() >= MAX_PENDING_BYTES {
                    pieces.push(self.take_partial());
                }
            }
        }

        pieces
    }

    /// Flush a trailing unterminated line at end of stream.
    pub fn finish(&mut self) -> Option<LinePiece> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.take_line())
        }
    }

    fn take_line(&mut self) -> LinePiece {
        if self.pending.last() == Some(&b'\r') {
            self.pending.pop();
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        LinePiece::line(line)
    }

    /// Flush the pending bytes up to the last complete character. An
    /// unfinished UTF-8 sequence or a trailing `\r` stays pending.
    fn take_partial(&mut self) -> LinePiece {
        let mut cut = complete_prefix_len(&self.pending);
        if cut > 0 && self.pending[cut - 1] == b'\r' {
            cut -= 1;
        }
        let rest = self.pending.split_off(cut);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = rest;
        LinePiece {
            text,
            complete: false,
        }
    }
}

/// Length of `bytes` without a trailing, still incomplete UTF-8 sequence.
fn complete_prefix_len(bytes: &[u8]) -> usize {
    let tail_start = bytes.len().saturating_sub(3);
    for start in (tail_start..bytes.len()).rev() {
        // Continuation bytes look like 0b10xx_xxxx.
        if bytes[start] & 0xC0 != 0x80 {
            return match std::str::from_utf8(&bytes[start..]) {
                Err(err) if err.error_len().is_none() => start,
                _ => bytes.len(),
            };
        }
    }
    bytes.len()
}

/// Drain one stdio stream until EOF, a fatal read error, or cancellation.
///
/// Records are logged and offered to `sink` without waiting for room.
pub async fn run_output_watcher<R>(
    pid: u32,
    stream: OutputStream,
    mut reader: R,
    settings: Arc<OutputSettings>,
    sink: Option<mpsc::Sender<OutputRecord>>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut splitter = LineSplitter::new();
    let mut assembler = LineAssembler::new(stream);
    let mut buf = vec![0_u8; settings.read_buffer_bytes.max(1)];

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(pid, %stream, "output watcher cancelled");
                break;
            }

            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    if let Some(piece) = splitter.finish() {
                        emit(pid, assembler.records(&settings, &piece), sink.as_ref());
                    }
                    debug!(pid, %stream, "output stream closed");
                    break;
                }
                Ok(n) => {
                    for piece in splitter.push(&buf[..n]) {
                        emit(pid, assembler.records(&settings, &piece), sink.as_ref());
                    }
                    tokio::task::yield_now().await;
                }
                Err(err) if matches!(err.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => {
                    debug!(pid, %stream, %err, "transient output read error");
                }
                Err(err) => {
                    warn!(pid, %stream, %err, "output read failed, stopping watcher");
                    break;
                }
            }
        }
    }
}

fn emit(pid: u32, records: Vec<OutputRecord>, sink: Option<&mpsc::Sender<OutputRecord>>) {
    for record in records {
        let stream = record.stream;
        match stream {
            OutputStream::Stdout => info!(target: "server_output", pid, "{record}"),
            OutputStream::Stderr => warn!(target: "server_output", pid, "{record}"),
        }

        if let Some(tx) = sink {
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(record) {
                trace!(pid, %stream, "output sink full, dropping record");
            }
        }
    }
}
