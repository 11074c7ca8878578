//! Pipeline controller collaborator.
//!
//! The dispatch core treats media execution as an opaque subsystem behind
//! [`PipelineBackend`]. The default implementation is an in-process registry
//! that tracks descriptors and playback state with strict transitions; a
//! real deployment substitutes a backend that drives the actual media
//! framework.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

/// Identifier assigned to a running pipeline, echoed in stop/pause/resume
/// requests.
pub type PipelineId = u32;

/// Handlers may block on the backend (it is a subsystem they own) but must
/// never touch network I/O.
pub trait PipelineBackend: Send + Sync {
    /// Launch a pipeline from a descriptor and return its id.
    fn start(&self, descriptor: &str) -> Result<PipelineId, PipelineError>;
    /// Tear a pipeline down. Valid from any state.
    fn stop(&self, id: PipelineId) -> Result<(), PipelineError>;
    /// Playing → Paused.
    fn pause(&self, id: PipelineId) -> Result<(), PipelineError>;
    /// Paused → Playing.
    fn resume(&self, id: PipelineId) -> Result<(), PipelineError>;
}

/// Backend failures, surfaced to clients as JSON-RPC `-32000` errors.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum PipelineError {
    /// No pipeline with this id.
    NotFound(PipelineId),
    /// Pause requires the pipeline to be playing.
    NotPlaying(PipelineId),
    /// Resume requires the pipeline to be paused.
    NotPaused(PipelineId),
    /// The backend refused the descriptor.
    Rejected { reason: String },
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "pipeline {id} not found"),
            Self::NotPlaying(id) => write!(f, "pipeline {id} is not playing"),
            Self::NotPaused(id) => write!(f, "pipeline {id} is not paused"),
            Self::Rejected { reason } => write!(f, "pipeline rejected: {reason}"),
        }
    }
}

impl std::error::Error for PipelineError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Playing,
    Paused,
}

struct Entry {
    descriptor: String,
    state: PipelineState,
}

struct Registry {
    next_id: PipelineId,
    entries: HashMap<PipelineId, Entry>,
}

/// Default in-process backend: a mutex-guarded registry with sequential id
/// assignment. Starting is always accepted (the descriptor is opaque here);
/// state transitions are strict.
pub struct PipelineRegistry {
    inner: Mutex<Registry>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Registry {
                next_id: 1,
                entries: HashMap::new(),
            }),
        }
    }

    /// Number of live pipelines.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// State snapshot for one pipeline.
    pub fn state(&self, id: PipelineId) -> Option<PipelineState> {
        self.lock().entries.get(&id).map(|e| e.state)
    }

    /// Descriptor a pipeline was launched with.
    pub fn descriptor(&self, id: PipelineId) -> Option<String> {
        self.lock().entries.get(&id).map(|e| e.descriptor.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.inner.lock().expect("pipeline registry mutex poisoned")
    }
}

impl Default for PipelineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineBackend for PipelineRegistry {
    fn start(&self, descriptor: &str) -> Result<PipelineId, PipelineError> {
        let mut reg = self.lock();
        let id = reg.next_id;
        reg.next_id += 1;
        reg.entries.insert(
            id,
            Entry {
                descriptor: descriptor.to_owned(),
                state: PipelineState::Playing,
            },
        );
        Ok(id)
    }

    fn stop(&self, id: PipelineId) -> Result<(), PipelineError> {
        self.lock()
            .entries
            .remove(&id)
            .map(|_| ())
            .ok_or(PipelineError::NotFound(id))
    }

    fn pause(&self, id: PipelineId) -> Result<(), PipelineError> {
        let mut reg = self.lock();
        let entry = reg.entries.get_mut(&id).ok_or(PipelineError::NotFound(id))?;
        if entry.state != PipelineState::Playing {
            return Err(PipelineError::NotPlaying(id));
        }
        entry.state = PipelineState::Paused;
        Ok(())
    }

    fn resume(&self, id: PipelineId) -> Result<(), PipelineError> {
        let mut reg = self.lock();
        let entry = reg.entries.get_mut(&id).ok_or(PipelineError::NotFound(id))?;
        if entry.state != PipelineState::Paused {
            return Err(PipelineError::NotPaused(id));
        }
        entry.state = PipelineState::Playing;
        Ok(())
    }
}
