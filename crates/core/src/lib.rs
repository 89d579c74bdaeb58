pub mod commands;
pub mod config;
pub mod config_loader;
pub mod keys;
pub mod rotation;

pub use commands::FleetCommand;
pub use config::{
    AppConfig, ControllerConfig, CoordConfig, GameServerConfig, HealthConfig, RegistryConfig,
};
pub use config_loader::ConfigLoader;
pub use rotation::RotationSettings;
