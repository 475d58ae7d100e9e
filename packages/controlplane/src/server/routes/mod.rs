//! Route handlers, grouped by resource.

pub mod agents;
pub mod challenges;
pub mod health;
pub mod jobs;
pub mod sessions;

use std::convert::Infallible;

use axum::response::sse::Event;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use crate::kernel::broker::BrokerEvent;

/// The sentinel every stream opens with, so clients can tell a live
/// connection from a dead idle one.
pub(crate) fn ready_event() -> Event {
    Event::default().event("ready").data("{}")
}

/// Adapt a broker subscription into SSE events. A subscriber that lags past
/// its buffer silently loses the oldest events and keeps reading.
pub(crate) fn live_events<T>(
    rx: broadcast::Receiver<T>,
) -> impl Stream<Item = Result<Event, Infallible>>
where
    T: BrokerEvent + Serialize + Clone + Send + 'static,
{
    BroadcastStream::new(rx).filter_map(|result| async move {
        match result {
            Ok(event) => Event::default()
                .event(event.kind())
                .json_data(&event)
                .ok()
                .map(Ok),
            Err(BroadcastStreamRecvError::Lagged(_)) => None,
        }
    })
}
