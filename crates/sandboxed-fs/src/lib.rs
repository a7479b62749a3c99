//! # Sandboxed FS
//!
//! Path-confined async filesystem operations with atomic write and publish
//! primitives.
//!
//! Every operation takes a base-relative path that is lexically cleaned and
//! verified against the sandbox base before any filesystem access, so `..`
//! components, absolute inputs, and nested escapes are rejected up front.
//! Writes go through a hidden same-directory temp file followed by a rename;
//! `publish` extends the same protocol to targets on other filesystems by
//! falling back to copy-into-target-directory + rename.
//!
//! Directories are created with mode `0750` and files with `0640` (Unix).
//!
//! ## Usage
//!
//! ```no_run
//! use sandboxed_fs::Sandbox;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let sandbox = Sandbox::create("/var/lib/tvforge/pipeline").await?;
//!
//! sandbox.write("staging/playlist.m3u", "#EXTM3U\n").await?;
//! let content = sandbox.read_to_string("staging/playlist.m3u").await?;
//!
//! // Atomic cross-filesystem publish to a stable output location.
//! sandbox
//!     .publish("staging/playlist.m3u", std::path::Path::new("/srv/out/proxy.m3u"))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod manager;
pub mod security;

pub use error::{Result, SandboxError};
pub use manager::Sandbox;
