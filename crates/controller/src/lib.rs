pub mod cleanup;
pub mod controller;
pub mod leader;
pub mod lifecycle;
pub mod pruner;
pub mod reconciler;
pub mod subscriber;

pub use cleanup::{cleanup_bot_state, clear_bot_queue_state, CleanupReport};
pub use controller::Controller;
pub use leader::{LeaderElector, LeaderState};
pub use lifecycle::{DeployOutcome, LifecycleDriver};
pub use pruner::Pruner;
pub use reconciler::{plan, Plan, Reconciler};
pub use subscriber::{rotate_bot, CommandSubscriber};
