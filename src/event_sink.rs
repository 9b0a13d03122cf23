use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Properties, Result};

/// An event ready for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedEvent {
    /// Unique event id.
    pub uuid: Uuid,
    /// Event name.
    pub event: String,
    /// Distinct id the event is attributed to.
    pub distinct_id: String,
    /// Event properties, including super, session and app properties.
    pub properties: Properties,
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
}

/// Delivers batches of captured events, e.g. to the PostHog batch API.
///
/// Any `Fn(Vec<CapturedEvent>)` closure is a sink.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver `events`. An error keeps nothing: the batch is dropped and logged.
    async fn send(&self, events: Vec<CapturedEvent>) -> Result<()>;
}

pub(crate) struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    async fn send(&self, events: Vec<CapturedEvent>) -> Result<()> {
        log::debug!(target: "posthog", count = events.len(); "no event sink configured, dropping events");
        Ok(())
    }
}

#[async_trait]
impl<T: Fn(Vec<CapturedEvent>) + Send + Sync> EventSink for T {
    async fn send(&self, events: Vec<CapturedEvent>) -> Result<()> {
        self(events);
        Ok(())
    }
}
