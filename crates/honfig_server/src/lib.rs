#![doc = include_str!("../README.md")]

pub mod autoscaler;
pub mod config;
pub mod error;
pub mod event;
pub mod instance;
pub mod manager;
pub mod replay;
pub mod service;
pub mod spawn;
pub mod stats;

pub use autoscaler::{Autoscaler, ScalePolicy};
pub use config::{AutoscaleConfig, AutoscaleMode, ManagerConfig, ReplayCleanerConfig};
pub use error::Error;
pub use event::{BusStats, EventBus, EventHandler, GameEvent, GameEventKind, HISTORY_CAP};
pub use instance::{
    transition_allowed, Instance, InstanceSettings, InstanceSnapshot, InstanceState, LobbyInfo,
    MAX_CLIENTS,
};
pub use manager::{InstanceManager, ManagerSettings};
pub use replay::{
    HttpUploader, ReplayCoordinator, ReplaySettings, ReplayStatusSink, ReplayUploader,
};
pub use service::{ChatIdentity, ManagerService, ServiceOptions};
pub use spawn::{LaunchSpec, ProcessHandle, ProcessSpawner, TokioSpawner};
pub use stats::{MatchRecord, MatchStatsSink, MemoryStats, StatsHandler};
