// Copyright 2026 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! A remote-storage helper for a local compiler cache. The cache client
//! speaks a framed binary protocol over a unix-domain socket; the helper
//! translates each request into HTTP(S) requests against a configured origin
//! and frames the outcome back.
//!
//! One cooperative event loop drives both halves: the IPC server with its
//! accepted sessions, and a curl multi handle carrying every in-flight HTTP
//! transfer. The process is started on demand, serves until a STOP request
//! or the idle timer, and exits.

#[macro_use]
extern crate log;

mod server;
mod session;
mod storage;

pub mod config;
pub mod logger;
pub mod protocol;

pub use config::{Config, ConfigError, UrlLayout};
pub use server::Server;
pub use storage::{StorageResponse, StorageResult};
