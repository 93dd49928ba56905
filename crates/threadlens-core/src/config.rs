use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

/// Freezer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FreezerConfig {
    /// Signal used to park threads (default: "SIGUSR2")
    pub suspend_signal: String,

    /// How long a thread may take to acknowledge a suspend, in ms (default: 250)
    pub ack_timeout_ms: u64,

    /// How long a released thread may take to leave its handler, in ms (default: 1000)
    pub release_timeout_ms: u64,
}

impl Default for FreezerConfig {
    fn default() -> Self {
        Self {
            suspend_signal: "SIGUSR2".to_string(),
            ack_timeout_ms: 250,
            release_timeout_ms: 1000,
        }
    }
}

impl FreezerConfig {
    /// Load configuration from TOML file
    ///
    /// # Example
    /// ```no_run
    /// use threadlens_core::FreezerConfig;
    ///
    /// let config = FreezerConfig::load_from_file("/etc/threadlens/config.toml").unwrap();
    /// println!("Suspend signal: {}", config.suspend_signal);
    /// ```
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Save configuration to TOML file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        self.signal()?;

        if self.ack_timeout_ms == 0 {
            return Err(Error::Config("Ack timeout must be > 0".to_string()));
        }

        if self.release_timeout_ms == 0 {
            return Err(Error::Config("Release timeout must be > 0".to_string()));
        }

        Ok(())
    }

    /// Parse `suspend_signal`, rejecting signals that cannot carry a handler
    /// or that the kernel raises synchronously on faults
    pub fn signal(&self) -> Result<Signal> {
        let signal = Signal::from_str(&self.suspend_signal).map_err(|_| {
            Error::Config(format!("Unknown suspend signal: {}", self.suspend_signal))
        })?;

        match signal {
            Signal::SIGKILL
            | Signal::SIGSTOP
            | Signal::SIGCONT
            | Signal::SIGSEGV
            | Signal::SIGBUS
            | Signal::SIGILL
            | Signal::SIGFPE
            | Signal::SIGTRAP
            | Signal::SIGABRT => Err(Error::Config(format!(
                "{} cannot be used as suspend signal",
                signal.as_str()
            ))),
            _ => Ok(signal),
        }
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn release_timeout(&self) -> Duration {
        Duration::from_millis(self.release_timeout_ms)
    }
}
