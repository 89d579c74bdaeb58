//! Coordination-store key contract.
//!
//! These names are shared with the game server. Renaming any of them is a
//! breaking protocol change, so every crate goes through this module instead
//! of spelling keys inline.

/// Set of bot ids asserted as "should be participating in the queue".
pub const DEPLOYED_SET: &str = "bots:deployed";

/// Set of bot ids currently inside a match room.
pub const ACTIVE_SET: &str = "bots:active";

/// Set of bot ids with a deploy cycle in flight; see [`cycling_guard_key`].
pub const CYCLING_SET: &str = "bots:cycling";

/// Ordered list of bot ids eligible for deployment. Head is popped on
/// deploy, recycled bots are appended to the tail.
pub const ROTATION_QUEUE: &str = "bots:rotation:queue";

/// Hash of rotation settings (`minDeployed`, `totalBots`, `deployDelayMs`,
/// `initialJoinDelayMs`).
pub const ROTATION_CONFIG: &str = "bots:rotation:config";

/// Sorted set of queue membership, scored by rating. Owned by the game
/// server; read as the source of truth for "waiting in queue".
pub const QUEUE_ELO: &str = "queue:elo";

/// Set of live match ids. Owned by the game server.
pub const MATCHES_ACTIVE: &str = "matches:active";

/// Leader lease key; holds the leading instance id with a PX expiry.
pub const LEADER_KEY: &str = "bots:leader";

/// Pub/sub channel carrying [`crate::FleetCommand`] envelopes.
pub const COMMANDS_CHANNEL: &str = "bots:commands";

/// Per-bot cycle guard string; value is the acquisition timestamp in ms.
#[must_use]
pub fn cycling_guard_key(bot_id: &str) -> String {
    format!("bots:cycling:{bot_id}")
}

/// Per-bot lifecycle state (`queued` / `matched` / `playing`), 1 h TTL.
#[must_use]
pub fn state_key(bot_id: &str) -> String {
    format!("bots:state:{bot_id}")
}

/// Pointer to the match a bot is inside. Maintained by the game server.
#[must_use]
pub fn current_match_key(bot_id: &str) -> String {
    format!("bot:current_match:{bot_id}")
}

/// Seat reservation blob. Owned by the game server; the controller only
/// reads it and deletes it on cleanup.
#[must_use]
pub fn reservation_key(bot_id: &str) -> String {
    format!("queue:reservation:{bot_id}")
}
