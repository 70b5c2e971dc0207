//! Execution hosts and the load-balanced slot list built from them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named execution host with a fixed thread capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: i64,
    pub name: String,
    pub total_threads: i64,
    pub created_at: DateTime<Utc>,
}

/// One free execution slot on a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub server_id: i64,
    pub server_name: String,
}

/// Build the candidate slot list, least-loaded server first.
///
/// Each server contributes `total_threads - running` slots. Slots are handed
/// out one at a time to whichever server has the lowest projected load
/// (running threads plus slots already handed out), ties broken by server id.
pub fn balanced_slots(servers: &[Server], running: &HashMap<i64, i64>) -> Vec<Slot> {
    let mut load: Vec<(i64, i64, &Server)> = servers
        .iter()
        .map(|s| {
            let used = running.get(&s.id).copied().unwrap_or(0);
            (used, (s.total_threads - used).max(0), s)
        })
        .collect();

    let total: i64 = load.iter().map(|(_, free, _)| *free).sum();
    let mut slots = Vec::with_capacity(total as usize);

    for _ in 0..total {
        let next = load
            .iter_mut()
            .filter(|(_, free, _)| *free > 0)
            .min_by_key(|(used, _, server)| (*used, server.id));
        let Some((used, free, server)) = next else {
            break;
        };
        *used += 1;
        *free -= 1;
        slots.push(Slot {
            server_id: server.id,
            server_name: server.name.clone(),
        });
    }

    slots
}
