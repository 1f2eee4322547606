//! Streaming responses: framing, normalization and assembly.
//!
//! Bytes flow through three stages: [`framing`] splits them into [`RawEvent`]s, [`normalize`]
//! translates each provider's chunks into canonical [`StreamEvent`]s, and [`assembler`]
//! rebuilds the finished [`Message`](crate::llm::models::Message).

pub mod assembler;
pub mod events;
pub mod framing;
pub mod normalize;

pub use assembler::{
    assemble, cancel_pair, Assembled, AssemblerState, CancelHandle, CancelSignal, StreamAssembler,
};
pub use events::{BlockKind, Delta, RawEvent, StreamEvent};
pub use framing::{raw_events, response_events, Framing};
pub use normalize::{normalizer_for, EventNormalizer};

use crate::error::Result;
use crate::llm::models::Provider;
use futures::stream::{Stream, StreamExt};

/// Translate framed provider events into the canonical vocabulary.
pub fn canonical_events<S>(provider: Provider, raw: S) -> impl Stream<Item = Result<StreamEvent>> + Send
where
    S: Stream<Item = Result<RawEvent>> + Send,
{
    async_stream::stream! {
        let mut raw = Box::pin(raw);
        let mut normalizer = normalizer_for(provider);

        while let Some(event) = raw.next().await {
            let translated = match event {
                Ok(event) => normalizer.normalize(&event),
                Err(e) => Err(e),
            };
            match translated {
                Ok(events) => {
                    for event in events {
                        yield Ok(event);
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }

        match normalizer.finish() {
            Ok(events) => {
                for event in events {
                    yield Ok(event);
                }
            }
            Err(e) => yield Err(e),
        }
    }
}

/// Assemble a provider's framed events into a message.
pub async fn assemble_raw<S>(provider: Provider, raw: S, cancel: &CancelSignal) -> Result<Assembled>
where
    S: Stream<Item = Result<RawEvent>> + Send,
{
    assemble(provider, canonical_events(provider, raw), cancel).await
}
