//! ThreadLens Core Library
//!
//! Runs a short critical section while every other thread of the current
//! process is frozen, then lets them run again. Best-effort exclusion for
//! code that cannot coordinate with the threads it needs to keep quiet.
//!
//! ```no_run
//! let answer = threadlens_core::focus_console_input(Some("Continue? [y/n]")).unwrap();
//! println!("got {:?}", answer);
//! ```

pub mod config;
pub mod console;
pub mod error;
pub mod freezer;
pub mod platform;
pub mod report;

#[cfg(test)]
mod testing;

pub use config::FreezerConfig;
pub use console::focus_console_input;
pub use error::{Error, Result};
pub use freezer::{focus, Freezer};
pub use platform::{ParkHandle, PlatformFault, SignalPlatform, ThreadPlatform, Tid};
pub use report::{FreezeReport, Stage, ThreadFailure};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
