#![doc = include_str!("../README.md")]

pub use honfig_network as network;
pub use honfig_protocol as protocol;
pub use honfig_server as server;

pub use honfig_network::{ChatSession, GameListener};
pub use honfig_server::{
    Autoscaler, ChatIdentity, EventBus, InstanceManager, ManagerConfig, ManagerService,
    ReplayCoordinator,
};

#[cfg(test)]
mod tests;
