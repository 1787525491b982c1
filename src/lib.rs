//! # directory-helpers
//!
//! Test-fixture helpers for projects on disk: lay out directories and files,
//! run commands in them, and start a project's long-running process, wait for
//! it to report readiness, then stop it together with everything it forked.
//!
//! ## Modules
//!
//! - `subprocess` - Process spawning, merged output streams and start/stop lifecycle
//! - `project` - Project manifest (`package.json`) reading
//! - `fixture` - Directory and file fixtures
//! - `config` - Process supervision settings
//! - `logging` - Tracing subscriber setup for the binary

pub mod config;
pub mod fixture;
pub mod logging;
pub mod project;
pub mod subprocess;

pub use config::ProcessConfig;
pub use fixture::{Directory, File, FileContents};
pub use subprocess::{
    Chunk, ChunkSource, LifecycleController, OutputStream, ProcessError, ProcessHandle,
};
