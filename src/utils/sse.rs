//! Bounded reader for upstream `text/event-stream` bodies.
//!
//! Only `data:` fields matter to the backend stream; `event:`, `id:` and
//! comment lines are skipped. A bare `[DONE]` payload terminates the stream.

use futures_util::TryStreamExt;
use futures_util::stream::{self, BoxStream};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::io::StreamReader;

use crate::{GenaiError, Result};

#[derive(Clone, Copy, Debug)]
pub struct SseLimits {
    pub max_line_bytes: usize,
    pub max_event_bytes: usize,
}

impl Default for SseLimits {
    fn default() -> Self {
        Self {
            max_line_bytes: 256 * 1024,
            max_event_bytes: 4 * 1024 * 1024,
        }
    }
}

struct SseReader<R> {
    inner: R,
    line: Vec<u8>,
    data: String,
    limits: SseLimits,
}

impl<R> SseReader<R>
where
    R: AsyncBufRead + Unpin,
{
    fn new(inner: R, limits: SseLimits) -> Self {
        Self {
            inner,
            line: Vec::new(),
            data: String::new(),
            limits,
        }
    }

    /// Fills `self.line` with the next line, newline included. Returns false at EOF.
    async fn fill_line(&mut self) -> Result<bool> {
        self.line.clear();
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                return Ok(!self.line.is_empty());
            }

            let newline = available.iter().position(|b| *b == b'\n');
            let take = newline.map_or(available.len(), |pos| pos + 1);
            if self.line.len().saturating_add(take) > self.limits.max_line_bytes {
                return Err(GenaiError::InvalidResponse(format!(
                    "SSE line exceeds max_line_bytes={}",
                    self.limits.max_line_bytes
                )));
            }

            self.line.extend_from_slice(&available[..take]);
            self.inner.consume(take);
            if newline.is_some() {
                return Ok(true);
            }
        }
    }

    fn push_data(&mut self, value: &str) -> Result<()> {
        let separator = usize::from(!self.data.is_empty());
        let next_len = self
            .data
            .len()
            .saturating_add(separator)
            .saturating_add(value.len());
        if next_len > self.limits.max_event_bytes {
            return Err(GenaiError::InvalidResponse(format!(
                "SSE event exceeds max_event_bytes={}",
                self.limits.max_event_bytes
            )));
        }
        if separator == 1 {
            self.data.push('\n');
        }
        self.data.push_str(value);
        Ok(())
    }

    fn take_event(&mut self) -> Option<String> {
        if self.data == "[DONE]" {
            self.data.clear();
            return None;
        }
        Some(std::mem::take(&mut self.data))
    }

    async fn next_event(&mut self) -> Result<Option<String>> {
        self.data.clear();
        loop {
            if !self.fill_line().await? {
                if self.data.is_empty() {
                    return Ok(None);
                }
                return Ok(self.take_event());
            }

            let line = std::str::from_utf8(&self.line)
                .map_err(|err| GenaiError::InvalidResponse(format!("invalid SSE UTF-8: {err}")))?
                .trim_end_matches(['\r', '\n'])
                .to_owned();

            if line.is_empty() {
                if self.data.is_empty() {
                    continue;
                }
                return Ok(self.take_event());
            }

            if let Some(value) = line.strip_prefix("data:") {
                self.push_data(value.strip_prefix(' ').unwrap_or(value))?;
            }
        }
    }
}

pub fn sse_data_stream_from_reader_with_limits<R>(
    reader: R,
    limits: SseLimits,
) -> BoxStream<'static, Result<String>>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    Box::pin(stream::try_unfold(
        SseReader::new(reader, limits),
        |mut reader| async move {
            let event = reader.next_event().await?;
            Ok(event.map(|data| (data, reader)))
        },
    ))
}

pub fn sse_data_stream_from_reader<R>(reader: R) -> BoxStream<'static, Result<String>>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    sse_data_stream_from_reader_with_limits(reader, SseLimits::default())
}

pub fn sse_data_stream_from_response(
    response: reqwest::Response,
) -> BoxStream<'static, Result<String>> {
    let bytes = response.bytes_stream().map_err(std::io::Error::other);
    sse_data_stream_from_reader(BufReader::new(StreamReader::new(bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::StreamExt;

    fn reader_of(raw: impl Into<String>) -> impl AsyncBufRead + Unpin + Send + 'static {
        let chunks = stream::iter([Ok::<_, std::io::Error>(Bytes::from(raw.into()))]);
        BufReader::new(StreamReader::new(chunks))
    }

    #[tokio::test]
    async fn collects_data_fields_per_event() -> Result<()> {
        let raw = concat!(
            ": keepalive\r\n",
            "event: message\r\n",
            "data: {\"a\":1}\r\n\r\n",
            "data: first\n",
            "data: second\n\n",
            "data: [DONE]\n\n",
            "data: ignored\n\n",
        );

        let events: Vec<String> = sse_data_stream_from_reader(reader_of(raw))
            .try_collect()
            .await?;
        assert_eq!(events, vec!["{\"a\":1}", "first\nsecond"]);
        Ok(())
    }

    #[tokio::test]
    async fn flushes_trailing_event_without_blank_line() -> Result<()> {
        let events: Vec<String> = sse_data_stream_from_reader(reader_of("data: tail"))
            .try_collect()
            .await?;
        assert_eq!(events, vec!["tail"]);
        Ok(())
    }

    #[tokio::test]
    async fn rejects_overlong_line() {
        let raw = format!("data: {}\n\n", "x".repeat(512));
        let mut events = sse_data_stream_from_reader_with_limits(
            reader_of(raw),
            SseLimits {
                max_line_bytes: 64,
                max_event_bytes: 4096,
            },
        );
        let err = events.next().await.expect("item").expect_err("limit");
        assert!(err.to_string().contains("max_line_bytes"));
    }

    #[tokio::test]
    async fn rejects_oversized_event() {
        let raw = format!("data: {}\ndata: {}\n\n", "a".repeat(100), "b".repeat(100));
        let mut events = sse_data_stream_from_reader_with_limits(
            reader_of(raw),
            SseLimits {
                max_line_bytes: 4096,
                max_event_bytes: 128,
            },
        );
        let err = events.next().await.expect("item").expect_err("limit");
        assert!(err.to_string().contains("max_event_bytes"));
    }
}
