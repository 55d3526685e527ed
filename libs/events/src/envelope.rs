//! Event envelope - the common wrapper for all broadcast events.

use chrono::{DateTime, Utc};
use rackalloc_id::{AllocationIndex, EventId, RequestId};
use serde::{Deserialize, Serialize};

use crate::{AllocationEvent, EventError};

/// Who caused the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    /// A client command (allocate, free).
    Client,
    /// A provisioning callback (inauguration reports, failures).
    Provisioner,
    /// The allocator itself (deadline expiry).
    #[default]
    System,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::Client => write!(f, "client"),
            ActorType::Provisioner => write!(f, "provisioner"),
            ActorType::System => write!(f, "system"),
        }
    }
}

/// The event envelope - common metadata for all events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope<P> {
    /// Unique event identifier.
    pub event_id: EventId,

    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,

    /// The allocation this event belongs to.
    pub allocation: AllocationIndex,

    /// The event type (e.g., "allocation.created").
    pub event_type: String,

    /// Schema version for this event type.
    pub event_version: i32,

    /// Type of actor that triggered the event.
    pub actor_type: ActorType,

    /// Command that triggered the event, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,

    /// Event-specific payload.
    pub payload: P,
}

impl<P> EventEnvelope<P> {
    /// Creates a new event envelope builder.
    pub fn builder() -> EventEnvelopeBuilder<P> {
        EventEnvelopeBuilder::new()
    }
}

impl EventEnvelope<serde_json::Value> {
    /// Wraps a typed allocation event with fresh envelope metadata.
    pub fn from_event(
        event: &AllocationEvent,
        actor_type: ActorType,
        request_id: Option<RequestId>,
    ) -> Result<Self, EventError> {
        let mut builder = Self::builder()
            .allocation(event.index())
            .event_type(event.event_type())
            .actor(actor_type)
            .payload(event.payload_json()?);
        if let Some(request_id) = request_id {
            builder = builder.request_id(request_id);
        }
        builder.build()
    }

    /// Decodes the payload back into a typed event.
    pub fn decode(&self) -> Result<AllocationEvent, EventError> {
        AllocationEvent::from_parts(&self.event_type, self.payload.clone())
    }
}

/// Builder for constructing event envelopes.
#[derive(Debug)]
pub struct EventEnvelopeBuilder<P> {
    event_id: Option<EventId>,
    occurred_at: Option<DateTime<Utc>>,
    allocation: Option<AllocationIndex>,
    event_type: Option<String>,
    event_version: i32,
    actor_type: ActorType,
    request_id: Option<RequestId>,
    payload: Option<P>,
}

impl<P> EventEnvelopeBuilder<P> {
    pub fn new() -> Self {
        Self {
            event_id: None,
            occurred_at: None,
            allocation: None,
            event_type: None,
            event_version: 1,
            actor_type: ActorType::default(),
            request_id: None,
            payload: None,
        }
    }

    pub fn event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }

    pub fn occurred_at(mut self, ts: DateTime<Utc>) -> Self {
        self.occurred_at = Some(ts);
        self
    }

    pub fn allocation(mut self, index: AllocationIndex) -> Self {
        self.allocation = Some(index);
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn event_version(mut self, version: i32) -> Self {
        self.event_version = version;
        self
    }

    pub fn actor(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }

    pub fn request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn payload(mut self, payload: P) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Builds the envelope. The event id and timestamp default to fresh values.
    pub fn build(self) -> Result<EventEnvelope<P>, EventError> {
        Ok(EventEnvelope {
            event_id: self.event_id.unwrap_or_default(),
            occurred_at: self.occurred_at.unwrap_or_else(Utc::now),
            allocation: self.allocation.ok_or(EventError::MissingField("allocation"))?,
            event_type: self.event_type.ok_or(EventError::MissingField("event_type"))?,
            event_version: self.event_version,
            actor_type: self.actor_type,
            request_id: self.request_id,
            payload: self.payload.ok_or(EventError::MissingField("payload"))?,
        })
    }
}

impl<P> Default for EventEnvelopeBuilder<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{event_types, AllocationRefPayload};

    #[test]
    fn test_actor_type_serialization() {
        assert_eq!(serde_json::to_string(&ActorType::Client).unwrap(), "\"client\"");
        assert_eq!(
            serde_json::to_string(&ActorType::Provisioner).unwrap(),
            "\"provisioner\""
        );
        assert_eq!(ActorType::System.to_string(), "system");
    }

    #[test]
    fn test_builder_requires_allocation() {
        let result = EventEnvelope::<serde_json::Value>::builder()
            .event_type(event_types::ALLOCATION_DONE)
            .payload(serde_json::json!({}))
            .build();
        assert!(matches!(result, Err(EventError::MissingField("allocation"))));
    }

    #[test]
    fn test_envelope_from_event() {
        let event = AllocationEvent::Freed(AllocationRefPayload {
            index: AllocationIndex::new(2),
        });
        let request_id = RequestId::new();
        let envelope =
            EventEnvelope::from_event(&event, ActorType::Client, Some(request_id)).unwrap();

        assert_eq!(envelope.event_type, "allocation.freed");
        assert_eq!(envelope.event_version, 1);
        assert_eq!(envelope.allocation, AllocationIndex::new(2));
        assert_eq!(envelope.request_id, Some(request_id));
        assert_eq!(envelope.decode().unwrap(), event);

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["payload"]["index"], 2);
        assert_eq!(json["actor_type"], "client");
    }
}
