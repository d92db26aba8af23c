use std::collections::VecDeque;

use crate::protocol::events::{EventPayload, StreamEvent};

/// Bounded, tail-merged history of one stream.
#[derive(Debug, Default)]
pub(crate) struct StreamHistory {
    events: VecDeque<StreamEvent>,
    last_sequence: i64,
    pub(crate) last_touch: u64,
}

impl StreamHistory {
    pub(crate) fn last_sequence(&self) -> i64 {
        self.last_sequence
    }

    /// Appends at the tail, folding the event into the current tail when the two merge.
    /// Events at or below the last accepted sequence are stale and rejected.
    pub(crate) fn push(&mut self, event: StreamEvent, capacity: usize) -> bool {
        if event.sequence <= self.last_sequence {
            return false;
        }
        self.last_sequence = event.sequence;

        if let Some(tail) = self.events.back_mut() {
            if absorb(tail, &event) {
                return true;
            }
        }

        self.events.push_back(event);
        while self.events.len() > capacity.max(1) {
            self.events.pop_front();
        }
        true
    }

    pub(crate) fn events(&self) -> impl Iterator<Item = &StreamEvent> {
        self.events.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.events.len()
    }
}

/// Folds `next` into `tail` when both are of the same event type on the same stream.
///
/// Text deltas concatenate in arrival order, and tool-call argument deltas concatenate while
/// the `tool_call_id` stays the same. Any other consecutive event of the same type replaces
/// the tail, so only the latest value is kept.
pub(crate) fn absorb(tail: &mut StreamEvent, next: &StreamEvent) -> bool {
    if tail.stream_id != next.stream_id || tail.event_type() != next.event_type() {
        return false;
    }

    match (&mut tail.event, &next.event) {
        (EventPayload::ContentDelta(current), EventPayload::ContentDelta(incoming))
        | (EventPayload::ReasoningDelta(current), EventPayload::ReasoningDelta(incoming)) => {
            current.delta.push_str(&incoming.delta);
        }
        (EventPayload::ToolCallDelta(current), EventPayload::ToolCallDelta(incoming))
            if current.tool_call_id == incoming.tool_call_id =>
        {
            current.delta.push_str(&incoming.delta);
        }
        (current, incoming) => *current = incoming.clone(),
    }

    tail.sequence = next.sequence;
    tail.created_at = next.created_at;
    tail.message_id = next.message_id.clone();
    true
}
