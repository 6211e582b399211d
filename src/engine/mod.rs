//! Connection Engine Module
//!
//! Interface to the multi-device protocol engine plus the built-in loopback
//! implementation.

pub mod adapter;
pub mod loopback;
#[cfg(test)]
pub(crate) mod scripted;

pub use adapter::{
    ConnectionEngine, ConnectionHandle, DisconnectReason, EngineConnection, EngineError,
    EngineEvent, EngineResult,
};
pub use loopback::LoopbackEngine;
