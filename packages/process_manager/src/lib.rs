//! Process Manager - child process lifecycle and line-oriented output plumbing
//!
//! This crate spawns external commands with piped output, turns their byte
//! streams into complete lines and decoded JSON events, and keeps a registry of
//! live processes so they can all be terminated at shutdown.
//! It has no HTTP dependencies and no knowledge of which tool is being run.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use process_manager::{CommandSpec, ProcessHandle, ProcessRegistry, decode_line, read_lines};
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = ProcessRegistry::new();
//!
//!     let spec = CommandSpec::new("sh").args(["-c", "echo '{\"type\":\"hello\"}'"]);
//!     let (handle, pipes) = ProcessHandle::spawn(&spec).unwrap();
//!     registry.register(handle.clone()).await;
//!
//!     read_lines(pipes.stdout, |line| {
//!         let event = decode_line(&line);
//!         println!("event: {}", event);
//!         async {}
//!     })
//!     .await;
//!
//!     let code = handle.wait().await.unwrap();
//!     registry.deregister(handle.pid()).await;
//!     println!("exited with {}", code);
//!
//!     registry.sweep_and_terminate_all(Duration::from_secs(2)).await;
//! }
//! ```

mod error;
pub mod lines;
pub mod ndjson;
pub mod process;
mod registry;

pub use error::ProcessError;
pub use lines::{LineDemuxer, read_lines};
pub use ndjson::{decode_line, event_type, raw_event};
pub use process::{CommandSpec, ProcessHandle, ProcessPipes, ShutdownOutcome};
pub use registry::{ProcessRegistry, SweepReport};
