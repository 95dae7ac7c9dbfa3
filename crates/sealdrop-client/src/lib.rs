//! Sealdrop Client Library
//!
//! Configuration, file sink, network diagnostic and the in-process loopback
//! driver behind the `sealdrop` binary.

pub mod config;
pub mod diagnostics;
pub mod loopback;
pub mod sink;
