//! Shared configuration and value types for the shellbridge PTY bridge.
//!
//! This crate holds everything the bridge's session layer and its binary
//! agree on: the immutable per-run [`config::SessionConfig`], the TOML-backed
//! [`config::BridgeConfig`] with its tunables, and the small value types
//! exchanged between components ([`types::TerminalSize`],
//! [`types::AgentStatus`], [`types::StatusEvent`]).

pub mod config;
pub mod types;
