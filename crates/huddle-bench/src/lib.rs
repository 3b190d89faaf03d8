//! Shared fixtures for the Huddle benchmarks.

use huddle_core::{Command, Connection, OutboxReceiver, Router, RouterConfig, WriteBehind};

/// A router without persistence and with outboxes large enough for a batch.
#[must_use]
pub fn bench_router(outbox_capacity: usize) -> Router {
    let config = RouterConfig {
        outbox_capacity,
        ..Default::default()
    };
    Router::with_config(config, WriteBehind::disabled())
}

/// Join `members` connections, named `user-0..`, to `room`.
///
/// # Panics
///
/// Panics if a join is rejected.
#[must_use]
pub fn populate_room(
    router: &Router,
    room: &str,
    members: usize,
) -> Vec<(Connection, OutboxReceiver)> {
    (0..members)
        .map(|i| {
            let (mut conn, mut rx) = router.connect();
            router
                .handle(
                    &mut conn,
                    Command::Join {
                        username: format!("user-{}", i),
                        room: room.to_string(),
                    },
                )
                .expect("join rejected");
            drain(&mut rx);
            (conn, rx)
        })
        .collect()
}

/// Discard everything queued for a connection. Returns how many were queued.
pub fn drain(rx: &mut OutboxReceiver) -> usize {
    let mut count = 0;
    while rx.try_recv().is_ok() {
        count += 1;
    }
    count
}
