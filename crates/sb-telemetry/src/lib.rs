//! Logging setup for shellbridge.
//!
//! The bridge's stdout is the byte stream the host renders, so every
//! subscriber installed here writes to stderr.

pub mod logging;
