//! ---
//! xmq_section: "01-core-functionality"
//! xmq_subsection: "module"
//! xmq_type: "source"
//! xmq_scope: "code"
//! xmq_description: "Shared primitives and utilities for the messaging runtime."
//! xmq_version: "v0.0.0-prealpha"
//! xmq_owner: "tbd"
//! ---
//! Core shared primitives for the XMQ workspace.
//! This crate exposes configuration loading, logging, cooperative
//! cancellation and clock utilities consumed across the workspace.

pub mod cancel;
pub mod config;
pub mod logging;
pub mod time;

pub use cancel::CancellationToken;
pub use config::{
    AuthConfig, BrokerConfig, DumperConfig, ListenerConfig, LoadedMqConfig, LoggingConfig,
    MqConfig, SharedConfig,
};
pub use logging::{init_tracing, LogFormat};
