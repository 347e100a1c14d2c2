//! Core join procedure, key derivation and session-key retrieval for a
//! LoRaWAN 1.1 Join Server. `main.rs` is a thin binary wrapper around this
//! library so integration tests can drive the engine directly.

pub mod codec;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod ids;
pub mod prefix;
pub mod registry;
pub mod rpc;
