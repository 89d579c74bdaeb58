//! Read-only access to bot identities.
//!
//! Bot identities outlive the controller and are owned by the platform's
//! account service; this crate only lists and fetches them.

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};

/// A bot identity: stable id, display name, and current rating.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BotProfile {
    pub bot_id: String,
    pub display_name: String,
    pub rating: i64,
}

#[async_trait]
pub trait BotDirectory: Send + Sync {
    async fn list_bots(&self) -> Result<Vec<BotProfile>>;
    async fn get_bot(&self, bot_id: &str) -> Result<Option<BotProfile>>;
}

/// Postgres-backed directory.
#[derive(Clone)]
pub struct PgBotDirectory {
    pool: PgPool,
}

impl PgBotDirectory {
    /// Opens a connection pool to the registry database.
    ///
    /// # Errors
    /// Returns an error if the database is unreachable.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .context("registry database unreachable")?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl BotDirectory for PgBotDirectory {
    async fn list_bots(&self) -> Result<Vec<BotProfile>> {
        let bots = sqlx::query_as::<_, BotProfile>(
            "SELECT bot_id, display_name, rating FROM bots ORDER BY bot_id",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list bots")?;
        Ok(bots)
    }

    async fn get_bot(&self, bot_id: &str) -> Result<Option<BotProfile>> {
        let bot = sqlx::query_as::<_, BotProfile>(
            "SELECT bot_id, display_name, rating FROM bots WHERE bot_id = $1",
        )
        .bind(bot_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to load bot {bot_id}"))?;
        Ok(bot)
    }
}

/// Fixed in-memory directory. Backs the test suites and lets the
/// controller run against a canned fleet without a database.
#[derive(Clone, Default)]
pub struct StaticDirectory {
    bots: Vec<BotProfile>,
}

impl StaticDirectory {
    #[must_use]
    pub fn new(bots: Vec<BotProfile>) -> Self {
        Self { bots }
    }

    /// Convenience constructor: `n` bots named `bot-1..=bot-n` at the given
    /// rating.
    #[must_use]
    pub fn with_fleet(n: usize, rating: i64) -> Self {
        let bots = (1..=n)
            .map(|i| BotProfile {
                bot_id: format!("bot-{i}"),
                display_name: format!("Bot {i}"),
                rating,
            })
            .collect();
        Self { bots }
    }
}

#[async_trait]
impl BotDirectory for StaticDirectory {
    async fn list_bots(&self) -> Result<Vec<BotProfile>> {
        Ok(self.bots.clone())
    }

    async fn get_bot(&self, bot_id: &str) -> Result<Option<BotProfile>> {
        Ok(self.bots.iter().find(|bot| bot.bot_id == bot_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_directory_lists_and_fetches() {
        let directory = StaticDirectory::with_fleet(3, 1200);
        let bots = directory.list_bots().await.unwrap();
        assert_eq!(bots.len(), 3);
        assert_eq!(bots[0].bot_id, "bot-1");

        let bot = directory.get_bot("bot-2").await.unwrap().unwrap();
        assert_eq!(bot.display_name, "Bot 2");
        assert_eq!(bot.rating, 1200);

        assert!(directory.get_bot("bot-9").await.unwrap().is_none());
    }
}
