//! Minimal line-based SSE decoder (SPEC_FULL §8)
//!
//! The real server-sent-event wire decoder is an external collaborator
//! (spec.md §1); this is the "something to drive the streaming contract"
//! stand-in SPEC_FULL calls for, grounded on `futures-util`/`bytes`/
//! `pin-project-lite`, which the teacher already depends on for its own
//! streaming body handling.

use bytes::{Buf, Bytes, BytesMut};
use futures_util::Stream;
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};

/// One decoded `event: .. \n data: ..` block. `event` defaults to
/// `"message"` per the SSE spec when the field is absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSentEvent {
    pub event: String,
    pub data: String,
}

pin_project! {
    /// Decodes a raw byte stream into [`ServerSentEvent`]s, buffering
    /// partial lines/blocks across chunk boundaries.
    pub struct SseDecoder<S> {
        #[pin]
        inner: S,
        buf: BytesMut,
        done: bool,
    }
}

impl<S> SseDecoder<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buf: BytesMut::new(),
            done: false,
        }
    }
}

/// Pull one complete `\n\n`-terminated block out of `buf`, if present,
/// parsing its `event:`/`data:` lines. Multiple `data:` lines are joined
/// with `\n` per the SSE spec.
fn take_event(buf: &mut BytesMut) -> Option<ServerSentEvent> {
    let bytes = buf.as_ref();
    let sep = find_double_newline(bytes)?;
    let block = buf.split_to(sep.0);
    buf.advance(sep.1 - sep.0);

    let text = String::from_utf8_lossy(&block);
    let mut event = None;
    let mut data_lines = Vec::new();
    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start().to_string());
        }
    }

    if event.is_none() && data_lines.is_empty() {
        return None;
    }

    Some(ServerSentEvent {
        event: event.unwrap_or_else(|| "message".to_string()),
        data: data_lines.join("\n"),
    })
}

/// Returns `(block_end, consumed_end)` for the first `\n\n` or `\r\n\r\n`.
fn find_double_newline(bytes: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'\n' && bytes[i + 1] == b'\n' {
            return Some((i, i + 2));
        }
        if i + 3 < bytes.len()
            && bytes[i] == b'\r'
            && bytes[i + 1] == b'\n'
            && bytes[i + 2] == b'\r'
            && bytes[i + 3] == b'\n'
        {
            return Some((i, i + 4));
        }
        i += 1;
    }
    None
}

impl<S, E> Stream for SseDecoder<S>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    type Item = Result<ServerSentEvent, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            if let Some(event) = take_event(this.buf) {
                return Poll::Ready(Some(Ok(event)));
            }
            if *this.done {
                return Poll::Ready(None);
            }
            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.buf.extend_from_slice(&chunk);
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => {
                    *this.done = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
