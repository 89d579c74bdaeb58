use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub coord: CoordConfig,
    pub registry: RegistryConfig,
    pub game_server: GameServerConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordConfig {
    pub host: String,
    #[serde(default = "default_coord_port")]
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
    /// Comma-separated node URLs. When set, the multi-node client is used
    /// and `host`/`port` only serve the pub/sub connection.
    #[serde(default)]
    pub cluster_nodes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub url: String,
    #[serde(default = "default_registry_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameServerConfig {
    pub base_url: String,
    #[serde(default)]
    pub bot_service_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Identity used for the leader lease. Every replica must have its own.
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
    #[serde(default = "default_leader_ttl_ms")]
    pub leader_ttl_ms: u64,
    #[serde(default = "default_deploy_check_interval_ms")]
    pub deploy_check_interval_ms: u64,
    #[serde(default = "default_queue_prune_interval_ms")]
    pub queue_prune_interval_ms: u64,
    #[serde(default = "default_deploy_delay_ms")]
    pub deploy_delay_ms: u64,
    #[serde(default = "default_initial_join_delay_ms")]
    pub initial_join_delay_ms: u64,
    /// A human waiting longer than this triggers surge deployment.
    #[serde(default = "default_extra_bot_wait_threshold_ms")]
    pub extra_bot_wait_threshold_ms: i64,
    /// A cycle guard older than this is treated as abandoned.
    #[serde(default = "default_max_cycling_time_ms")]
    pub max_cycling_time_ms: i64,
    /// Hard expiry on the guard key. Must exceed `max_cycling_time_ms`.
    #[serde(default = "default_cycling_guard_ttl_secs")]
    pub cycling_guard_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_port")]
    pub port: u16,
}

const fn default_coord_port() -> u16 {
    6379
}

const fn default_registry_max_connections() -> u32 {
    5
}

fn default_instance_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

const fn default_leader_ttl_ms() -> u64 {
    15_000
}

const fn default_deploy_check_interval_ms() -> u64 {
    5_000
}

const fn default_queue_prune_interval_ms() -> u64 {
    30_000
}

const fn default_deploy_delay_ms() -> u64 {
    200
}

const fn default_initial_join_delay_ms() -> u64 {
    250
}

const fn default_extra_bot_wait_threshold_ms() -> i64 {
    15_000
}

const fn default_max_cycling_time_ms() -> i64 {
    300_000
}

const fn default_cycling_guard_ttl_secs() -> u64 {
    360
}

const fn default_health_port() -> u16 {
    3000
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
            leader_ttl_ms: default_leader_ttl_ms(),
            deploy_check_interval_ms: default_deploy_check_interval_ms(),
            queue_prune_interval_ms: default_queue_prune_interval_ms(),
            deploy_delay_ms: default_deploy_delay_ms(),
            initial_join_delay_ms: default_initial_join_delay_ms(),
            extra_bot_wait_threshold_ms: default_extra_bot_wait_threshold_ms(),
            max_cycling_time_ms: default_max_cycling_time_ms(),
            cycling_guard_ttl_secs: default_cycling_guard_ttl_secs(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            port: default_health_port(),
        }
    }
}

impl AppConfig {
    /// Checks required fields and enforced minimums before any connection is
    /// opened. A failure here is fatal at startup.
    ///
    /// # Errors
    /// Returns an error describing the first offending field.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.coord.host.is_empty() {
            anyhow::bail!("coord.host must be set");
        }
        if self.registry.url.is_empty() {
            anyhow::bail!("registry.url must be set");
        }
        if !self.game_server.base_url.starts_with("http://")
            && !self.game_server.base_url.starts_with("https://")
        {
            anyhow::bail!(
                "game_server.base_url must be an http(s) URL, got '{}'",
                self.game_server.base_url
            );
        }
        if self.controller.instance_id.is_empty() {
            anyhow::bail!("controller.instance_id must not be empty");
        }
        if self.controller.leader_ttl_ms < 5_000 {
            anyhow::bail!(
                "controller.leader_ttl_ms must be at least 5000, got {}",
                self.controller.leader_ttl_ms
            );
        }
        if self.controller.deploy_check_interval_ms < 2_000 {
            anyhow::bail!(
                "controller.deploy_check_interval_ms must be at least 2000, got {}",
                self.controller.deploy_check_interval_ms
            );
        }
        if self.controller.queue_prune_interval_ms < 5_000 {
            anyhow::bail!(
                "controller.queue_prune_interval_ms must be at least 5000, got {}",
                self.controller.queue_prune_interval_ms
            );
        }
        let guard_ttl_ms = self.controller.cycling_guard_ttl_secs.saturating_mul(1000);
        if i64::try_from(guard_ttl_ms).unwrap_or(i64::MAX) <= self.controller.max_cycling_time_ms {
            anyhow::bail!(
                "controller.cycling_guard_ttl_secs ({}s) must exceed max_cycling_time_ms ({}ms)",
                self.controller.cycling_guard_ttl_secs,
                self.controller.max_cycling_time_ms
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig {
            coord: CoordConfig {
                host: "127.0.0.1".to_string(),
                port: 6379,
                password: None,
                cluster_nodes: None,
            },
            registry: RegistryConfig {
                url: "postgresql://localhost/botfleet".to_string(),
                max_connections: 5,
            },
            game_server: GameServerConfig {
                base_url: "http://localhost:4000".to_string(),
                bot_service_secret: None,
            },
            controller: ControllerConfig::default(),
            health: HealthConfig::default(),
        }
    }

    #[test]
    fn defaults_pass_validation() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn leader_ttl_below_minimum_is_rejected() {
        let mut config = base_config();
        config.controller.leader_ttl_ms = 4_999;
        assert!(config.validate().is_err());
    }

    #[test]
    fn guard_ttl_must_exceed_max_cycling_time() {
        let mut config = base_config();
        config.controller.cycling_guard_ttl_secs = 300;
        config.controller.max_cycling_time_ms = 300_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn non_http_game_server_url_is_rejected() {
        let mut config = base_config();
        config.game_server.base_url = "ftp://example.com".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn each_instance_gets_a_distinct_default_id() {
        let a = ControllerConfig::default();
        let b = ControllerConfig::default();
        assert_ne!(a.instance_id, b.instance_id);
    }
}
