//! Streaming backpressure via bounded channels.
//!
//! Provider streams are decoded on a producer task and handed to the chain
//! through a bounded `tokio::sync::mpsc::channel`. When the consumer falls
//! behind, the producer stops reading the upstream body, so a slow caller
//! cannot grow memory without bound.

use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use crate::types::PartStream;

/// Default number of parts buffered between producer and consumer.
pub const DEFAULT_STREAM_BUFFER: usize = 64;

/// Move `inner` onto a producer task behind a channel of `buffer_size`.
///
/// Dropping the returned stream stops the producer at its next send, which
/// drops `inner` and with it any upstream slot it holds.
///
/// Requires a tokio runtime context.
pub fn bounded_stream(inner: PartStream, buffer_size: usize) -> PartStream {
    let (tx, rx) = tokio::sync::mpsc::channel(buffer_size.max(1));

    tokio::spawn(async move {
        let mut inner = inner;
        while let Some(item) = inner.next().await {
            if tx.send(item).await.is_err() {
                break;
            }
        }
    });

    Box::pin(ReceiverStream::new(rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StreamPart;
    use futures_util::stream;

    #[tokio::test]
    async fn forwards_items_in_order() {
        let parts = StreamPart::text_parts("t", "hi");
        let inner: PartStream = Box::pin(stream::iter(parts.clone().into_iter().map(Ok)));
        let out: Vec<_> = bounded_stream(inner, 1)
            .map(|p| p.unwrap())
            .collect()
            .await;
        assert_eq!(out, parts);
    }
}
