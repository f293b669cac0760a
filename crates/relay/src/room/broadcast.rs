use std::collections::HashMap;

use axum::body::Bytes;

use super::{ConnectionId, Member};

/// Outcome of a single fan-out.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Members whose send queue was already closed. Their own teardown removes them.
    pub failed: Vec<ConnectionId>,
}

/// Queue `frame` for every member except `origin`.
///
/// Delivery is per member: a closed queue is reported and skipped, the rest
/// still receive the frame exactly once.
pub fn broadcast(
    members: &HashMap<ConnectionId, Member>,
    frame: &Bytes,
    origin: Option<ConnectionId>,
) -> BroadcastReport {
    let mut report = BroadcastReport::default();

    for (connection_id, member) in members {
        if Some(*connection_id) == origin {
            continue;
        }

        if member.outbound.send(frame.clone()).is_ok() {
            report.delivered += 1;
        } else {
            report.failed.push(*connection_id);
        }
    }

    report
}
