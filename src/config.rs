// src/config.rs
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{PetrelError, PetrelResult};

/// How readiness is reported for a registered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    /// Fires while the condition holds; one bounded read per event.
    Level,
    /// Fires once per transition; the consumer must drain fully.
    Edge,
}

/// Which side of the event loop runs `feed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DispatchMode {
    /// The reactor feeds/accumulates inline and hands parse/flush work to a
    /// worker tagged with the phase.
    SplitPhase,
    /// A worker runs feed plus the whole request/response cycle in one task.
    Unified,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Document root for static resources.
    pub doc_root: PathBuf,
    /// Page served for a bare `/` target.
    pub default_document: String,
    pub workers: usize,
    pub queue_capacity: usize,
    pub store_capacity: usize,
    /// Periodic alarm interval in seconds; idle connections are evicted
    /// after three timeslots without activity.
    pub timeslot_secs: u64,
    pub listen_trigger: TriggerMode,
    pub conn_trigger: TriggerMode,
    pub dispatch: DispatchMode,
    /// Enables SO_LINGER on the listening socket.
    pub linger: bool,
    pub log_path: Option<PathBuf>,
    pub log_queue_capacity: usize,
    /// JSON object of user/password pairs preloaded into the store.
    pub credentials_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9006,
            doc_root: PathBuf::from("./root"),
            default_document: "judge.html".to_string(),
            workers: 8,
            queue_capacity: 10_000,
            store_capacity: 8,
            timeslot_secs: 5,
            listen_trigger: TriggerMode::Level,
            conn_trigger: TriggerMode::Level,
            dispatch: DispatchMode::SplitPhase,
            linger: false,
            log_path: None,
            log_queue_capacity: 1000,
            credentials_file: None,
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> PetrelResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let cfg: ServerConfig = serde_json::from_str(&raw)
            .map_err(|e| PetrelError::Config(format!("{:?}: {}", path, e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> PetrelResult<()> {
        if self.workers == 0 {
            return Err(PetrelError::Config("workers must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(PetrelError::Config("queue_capacity must be positive".into()));
        }
        if self.store_capacity == 0 {
            return Err(PetrelError::Config("store_capacity must be positive".into()));
        }
        if self.timeslot_secs == 0 {
            return Err(PetrelError::Config("timeslot_secs must be positive".into()));
        }
        Ok(())
    }

    /// Absolute idle deadline granted on registration and on each refresh.
    pub fn idle_timeout_secs(&self) -> u64 {
        self.timeslot_secs * 3
    }
}
