#![doc = include_str!("../README.md")]

pub mod chat;
pub mod listener;
pub mod queue;

pub use chat::{
    ChatCallbacks, ChatSession, ChatSessionState, KeepaliveMode, KeepaliveSettings, NoCallbacks,
    SessionError,
};
pub use listener::{Disconnect, GameListener, InstanceRegistry, ListenerError, ListenerSettings};
pub use queue::{packet_queue, PacketSender, DEFAULT_QUEUE_DEPTH};

/// Size of the chunks pulled off a socket before they are queued into a
/// frame decoder.
pub(crate) const READ_BUF_SIZE: usize = 4096;
