//! Inter-process communication for offload worker processes.
//!
//! This module provides the protocol and utilities for communicating
//! with forked worker processes that run a single callable each.

mod channel;
mod process;
pub mod protocol;
mod worker;

pub use process::KillHandle;
pub use protocol::{ChildMessage, ParentMessage, read_message, write_message};
pub(crate) use worker::Worker;
