//! Dispatch tasks through a bounded ring onto dedicated or shared worker threads.
//!
//! # Overview
//!
//! The crate is built from the leaves up:
//!
//! - [bip::CircularBuffer]: a ring that only ever exposes contiguous read and write spans.
//! - [barrier::Barrier]: a reusable two-phase rendezvous for a fixed number of participants.
//! - [pool::ThreadPool]: a shared pool of OS threads processing reference-counted work items.
//! - [queue::TaskQueue]: a bounded multi-producer/multi-consumer task queue that stores records in
//!   a [bip::CircularBuffer] and runs them on either its own threads or a [pool::ThreadPool].
//!
//! # Status
//!
//! `ringwork-dispatch` is **ALPHA** software and is not yet recommended for production use.
//! Developers should expect breaking changes and occasional instability.

use std::any::Any;
use thiserror::Error;

pub mod barrier;
pub mod bip;
pub mod pool;
pub mod queue;

pub use pool::ThreadPool;
pub use queue::{Context, Task, TaskQueue};

/// Errors that can occur when setting up a [queue::TaskQueue] or [pool::ThreadPool].
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to build thread pool: {0}")]
    PoolBuild(#[from] rayon::ThreadPoolBuildError),
    #[error("failed to spawn worker: {0}")]
    SpawnFailed(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
}

/// Extract a printable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
