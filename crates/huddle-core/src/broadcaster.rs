//! Room fan-out for Huddle.
//!
//! The broadcaster delivers one payload to every connection in a room. It
//! holds the registry lock for the whole read-then-deliver sequence, so a
//! fan-out always targets one consistent membership snapshot, and deliveries
//! to the same room are serialized. Each push is a non-blocking outbox
//! `try_send`; a full outbox only affects its own connection.

use crate::connection::{ConnectionId, DeliveryOutcome, Outbox};
use crate::message::Delivery;
use crate::registry::Registry;
use std::sync::Arc;
use tracing::trace;

/// Counts from one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOut {
    /// Deliveries queued.
    pub delivered: usize,
    /// Deliveries dropped because a connection's outbox was full.
    pub dropped: usize,
}

impl FanOut {
    fn record(&mut self, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Queued => self.delivered += 1,
            DeliveryOutcome::Dropped => self.dropped += 1,
            DeliveryOutcome::Closed => {}
        }
    }
}

/// Delivers payloads to rooms and to individual connections.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    registry: Arc<Registry>,
}

impl Broadcaster {
    /// Create a broadcaster over a registry.
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Deliver to every connection in `room` except `exclude`.
    pub fn broadcast(
        &self,
        room: &str,
        delivery: Delivery,
        exclude: Option<&ConnectionId>,
    ) -> FanOut {
        let delivery = Arc::new(delivery);
        let fan_out = self
            .registry
            .with_room(room, exclude, |view| Self::deliver_all(view.outboxes(), &delivery));
        trace!(
            room = %room,
            delivered = fan_out.delivered,
            dropped = fan_out.dropped,
            "Broadcast"
        );
        fan_out
    }

    /// Deliver the room's current member list to the room.
    ///
    /// The list is computed under the same lock as the fan-out, so the last
    /// list a member receives matches the latest membership.
    pub fn broadcast_members(&self, room: &str) -> FanOut {
        self.registry.with_room(room, None, |view| {
            let delivery = Arc::new(Delivery::UserList {
                room: view.room().to_string(),
                users: view.members(),
            });
            Self::deliver_all(view.outboxes(), &delivery)
        })
    }

    /// Deliver to an explicit set of outboxes.
    pub fn deliver_all<'a>(
        outboxes: impl IntoIterator<Item = &'a Outbox>,
        delivery: &Arc<Delivery>,
    ) -> FanOut {
        let mut fan_out = FanOut::default();
        for outbox in outboxes {
            fan_out.record(outbox.deliver(Arc::clone(delivery)));
        }
        fan_out
    }

    /// Deliver to a single connection.
    pub fn deliver(outbox: &Outbox, delivery: Delivery) -> DeliveryOutcome {
        outbox.deliver(Arc::new(delivery))
    }
}
