use std::collections::HashMap;

/// Deployment policy read from the `bots:rotation:config` hash each
/// reconciliation tick. Operators mutate the hash at runtime; missing or
/// unparsable fields fall back to the defaults below (delays fall back to
/// the controller configuration).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationSettings {
    /// Floor on `|deployed| + |active|`.
    pub min_deployed: i64,
    /// Cap on the fleet; 0 means uncapped.
    pub total_bots: i64,
    /// Spacing between successive deploys within one tick.
    pub deploy_delay_ms: u64,
    /// Settle delay before a freshly deployed bot joins the queue.
    pub initial_join_delay_ms: u64,
}

pub const MIN_DEPLOYED_FIELD: &str = "minDeployed";
pub const TOTAL_BOTS_FIELD: &str = "totalBots";
pub const DEPLOY_DELAY_FIELD: &str = "deployDelayMs";
pub const INITIAL_JOIN_DELAY_FIELD: &str = "initialJoinDelayMs";

pub const DEFAULT_MIN_DEPLOYED: i64 = 5;
pub const DEFAULT_TOTAL_BOTS: i64 = 0;

impl RotationSettings {
    #[must_use]
    pub fn from_map(
        map: &HashMap<String, String>,
        fallback_deploy_delay_ms: u64,
        fallback_initial_join_delay_ms: u64,
    ) -> Self {
        Self {
            min_deployed: parse_field(map, MIN_DEPLOYED_FIELD, DEFAULT_MIN_DEPLOYED),
            total_bots: parse_field(map, TOTAL_BOTS_FIELD, DEFAULT_TOTAL_BOTS),
            deploy_delay_ms: parse_field(map, DEPLOY_DELAY_FIELD, fallback_deploy_delay_ms),
            initial_join_delay_ms: parse_field(
                map,
                INITIAL_JOIN_DELAY_FIELD,
                fallback_initial_join_delay_ms,
            ),
        }
    }
}

fn parse_field<T: std::str::FromStr + Copy>(
    map: &HashMap<String, String>,
    field: &str,
    fallback: T,
) -> T {
    map.get(field)
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(fallback)
}
