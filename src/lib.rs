//! filesync library
//!
//! Cached-metadata directory synchronization over the local filesystem or a
//! token-authenticated TCP protocol.

#[macro_use]
pub mod logger;

pub mod cache;
pub mod cli;
pub mod config;
pub mod copy;
pub mod diff;
pub mod error;
pub mod fs_enum;
pub mod net;
pub mod oper;
pub mod protocol;
pub mod protocol_core;
pub mod snapshot;
pub mod sync;
