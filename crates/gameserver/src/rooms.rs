use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

/// Close/error code the game server uses when the seat reservation backing
/// a queue join has expired. Joins failing with this code are retried with
/// backoff; everything else propagates.
pub const RESERVATION_EXPIRED_CODE: u16 = 4002;

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("seat reservation expired")]
    ReservationExpired,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Events surfaced by the matchmaking queue room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueRoomEvent {
    /// Enrollment acknowledged; position is informational.
    Queued { position: i64 },
    /// The trigger: a duel was arranged for this bot.
    MatchFound {
        room_id: String,
        match_id: String,
        problem_id: String,
    },
    Error { code: u16, message: String },
    /// The server closed the room.
    Closed,
}

/// Events surfaced by a match room. The controller never plays; it only
/// waits for the room to end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchRoomEvent {
    Init,
    /// Opponent keystrokes; acknowledged and ignored.
    CodeUpdate,
    Error { code: u16, message: String },
    /// Room leave: the match is over.
    Closed,
}

#[async_trait]
pub trait QueueRoom: Send {
    async fn next_event(&mut self) -> Result<QueueRoomEvent>;
    async fn leave(&mut self) -> Result<()>;
}

#[async_trait]
pub trait MatchRoom: Send {
    async fn next_event(&mut self) -> Result<MatchRoomEvent>;
    async fn leave(&mut self) -> Result<()>;
}

/// Room factory for the realtime side of the game server. One short-lived
/// connection per room, owned by a single lifecycle task.
#[async_trait]
pub trait MatchServer: Send + Sync {
    async fn join_queue(
        &self,
        bot_id: &str,
        rating: i64,
    ) -> Result<Box<dyn QueueRoom>, JoinError>;

    async fn join_match(&self, match_id: &str, bot_id: &str) -> Result<Box<dyn MatchRoom>>;
}
