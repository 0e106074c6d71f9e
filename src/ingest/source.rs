//! Event sources
//!
//! A source yields raw inbound events as strings, one at a time. The
//! pipeline normalizes and stores them in arrival order.

use async_trait::async_trait;
use std::path::Path;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};

/// Something that produces raw inbound events
#[async_trait]
pub trait EventSource: Send {
    /// Name recorded with parked events from this source
    fn name(&self) -> &str;

    /// Next raw event, or `None` once the source is exhausted
    async fn next_event(&mut self) -> std::io::Result<Option<String>>;
}

/// Newline-delimited JSON: one raw event per line, blank lines skipped
pub struct JsonLinesSource<R> {
    name: String,
    lines: Lines<R>,
    line_number: u64,
}

impl<R: AsyncBufRead + Unpin + Send> JsonLinesSource<R> {
    pub fn new(name: impl Into<String>, reader: R) -> Self {
        Self {
            name: name.into(),
            lines: reader.lines(),
            line_number: 0,
        }
    }

    /// Line number of the last event returned (1-based)
    pub fn line_number(&self) -> u64 {
        self.line_number
    }
}

impl JsonLinesSource<BufReader<tokio::io::Stdin>> {
    pub fn stdin() -> Self {
        Self::new("stdin", BufReader::new(tokio::io::stdin()))
    }
}

impl JsonLinesSource<BufReader<tokio::fs::File>> {
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = tokio::fs::File::open(path.as_ref()).await?;
        Ok(Self::new(path.as_ref().display().to_string(), BufReader::new(file)))
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> EventSource for JsonLinesSource<R> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next_event(&mut self) -> std::io::Result<Option<String>> {
        while let Some(line) = self.lines.next_line().await? {
            self.line_number += 1;
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                return Ok(Some(trimmed.to_string()));
            }
        }
        Ok(None)
    }
}
