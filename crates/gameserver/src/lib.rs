pub mod breaker;
pub mod http;
pub mod rooms;
pub mod ws;

pub use breaker::{BreakerSnapshot, BreakerState, CircuitBreaker};
pub use http::{BreakerBoard, GameApi, GameServerClient, GlobalStats, MatchSummary, QueueStats};
pub use rooms::{JoinError, MatchRoom, MatchRoomEvent, MatchServer, QueueRoom, QueueRoomEvent};
pub use ws::GameSocket;
