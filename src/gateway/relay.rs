//! Streaming relay between a backend generation and the SSE response body.
//!
//! One producer task drains the backend stream, translates each chunk and hands it
//! over a single-slot channel as a [`RelayItem`]. The response body pulls from the
//! channel one event at a time. Dropping the body (client disconnect) aborts the
//! producer, which releases the backend stream and session with it.

use std::convert::Infallible;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use serde_json::json;
use tokio::sync::mpsc;

use super::GatewayError;
use super::sse::Event;
use super::translation::ChatChunkEncoder;
use crate::model::StreamResult;
use crate::utils::task::AbortOnDrop;

#[derive(Debug)]
pub enum RelayItem {
    /// A serialized `chat.completion.chunk`.
    Chunk(String),
    Done,
    Failed(GatewayError),
}

pub type RelayBody = BoxStream<'static, Result<Bytes, Infallible>>;

/// Spawns the producer and returns the SSE body. `keep_alive` (typically the backend
/// session) is owned by the producer and dropped when it finishes or is aborted.
pub fn relay_chat_stream<K>(
    upstream: StreamResult,
    encoder: ChatChunkEncoder,
    keep_alive: K,
) -> RelayBody
where
    K: Send + 'static,
{
    let (tx, rx) = mpsc::channel::<RelayItem>(1);
    let handle = tokio::spawn(produce(upstream, encoder, tx, keep_alive));
    relay_body(rx, AbortOnDrop::new(handle.abort_handle()))
}

async fn produce<K>(
    mut upstream: StreamResult,
    mut encoder: ChatChunkEncoder,
    tx: mpsc::Sender<RelayItem>,
    keep_alive: K,
) {
    let _keep_alive = keep_alive;
    while let Some(item) = upstream.next().await {
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(err) => {
                let _ = tx.send(RelayItem::Failed(err.into())).await;
                return;
            }
        };
        let Some(json) = encoder.push(chunk) else {
            continue;
        };
        if tx.send(RelayItem::Chunk(json)).await.is_err() {
            tracing::debug!("stream consumer went away; stopping producer");
            return;
        }
    }

    for json in encoder.finish() {
        if tx.send(RelayItem::Chunk(json)).await.is_err() {
            return;
        }
    }
    let _ = tx.send(RelayItem::Done).await;
}

fn error_event(err: &GatewayError) -> Event {
    let api_error = err.normalize();
    Event::data(&json!({ "error": api_error }).to_string())
}

pub(crate) fn relay_body(rx: mpsc::Receiver<RelayItem>, guard: AbortOnDrop) -> RelayBody {
    Box::pin(stream::unfold(
        (rx, guard, false),
        |(mut rx, guard, finished)| async move {
            if finished {
                return None;
            }
            let bytes = match rx.recv().await {
                Some(RelayItem::Chunk(json)) => {
                    return Some((Ok(Event::data(&json).encode()), (rx, guard, false)));
                }
                Some(RelayItem::Failed(err)) => {
                    let mut out = BytesMut::new();
                    out.extend_from_slice(&error_event(&err).encode());
                    out.extend_from_slice(&Event::done().encode());
                    out.freeze()
                }
                Some(RelayItem::Done) => Event::done().encode(),
                None => {
                    tracing::debug!("relay channel closed without a terminal item");
                    Event::done().encode()
                }
            };
            Some((Ok(bytes), (rx, guard, true)))
        },
    ))
}
