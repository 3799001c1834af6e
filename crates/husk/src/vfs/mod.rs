//! Virtual filesystem backing shell I/O.
//!
//! This module provides:
//! - `VirtualFileSystem` - in-memory tree of files and directories with a
//!   session-wide current directory
//! - `path` - Unix-style normalization of absolute and relative paths

mod filesystem;
pub mod path;

pub use filesystem::*;
