//! # stackd-utils
//!
//! Host plumbing shared by the stackd daemon: the allowlisted external
//! command runner, change-suppressing file writes and traversal-safe path
//! handling, and graceful teardown of PTY children.

pub mod cmd;
pub mod fs;
pub mod process;
