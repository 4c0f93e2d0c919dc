//! Central error handling for the device core.
//!
//! Every fallible device operation returns a [`DeviceResult`]; low-level
//! failures are additionally captured into a shared [`ErrorState`] so that
//! later operations on the same device short-circuit instead of piling
//! secondary failures on top of the root cause.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Centralized error type for all device operations.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// Accelerator context creation failed; the device is unusable.
    #[error("Context init error: {0}")]
    ContextInit(String),

    /// Missing or incompatible compiled kernel artifact.
    #[error("Kernel load error: {0}")]
    KernelLoad(String),

    /// Allocation failed after exhausting device, eviction and host-mapped options.
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// Kernel launch or stream synchronization failed.
    #[error("Launch error: {0}")]
    Launch(String),

    /// Acceleration structure build call failed.
    #[error("Build error: {0}")]
    Build(String),
}

pub type DeviceResult<T> = Result<T, DeviceError>;

impl DeviceError {
    pub fn context_init<T: ToString>(msg: T) -> Self {
        DeviceError::ContextInit(msg.to_string())
    }

    pub fn kernel_load<T: ToString>(msg: T) -> Self {
        DeviceError::KernelLoad(msg.to_string())
    }

    pub fn out_of_memory<T: ToString>(msg: T) -> Self {
        DeviceError::OutOfMemory(msg.to_string())
    }

    pub fn launch<T: ToString>(msg: T) -> Self {
        DeviceError::Launch(msg.to_string())
    }

    pub fn build<T: ToString>(msg: T) -> Self {
        DeviceError::Build(msg.to_string())
    }
}

struct ErrorInner {
    raised: AtomicBool,
    first: Mutex<Option<DeviceError>>,
}

/// Shared per-device error slot with first-error-wins semantics.
///
/// The first raised error is preserved as the root cause; subsequent errors
/// are logged but do not overwrite it. Cloning the handle shares the slot.
#[derive(Clone)]
pub struct ErrorState {
    inner: Arc<ErrorInner>,
}

impl ErrorState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ErrorInner {
                raised: AtomicBool::new(false),
                first: Mutex::new(None),
            }),
        }
    }

    /// Record an error. A no-op (beyond logging) once an error is already set.
    pub fn raise(&self, err: DeviceError) {
        let mut first = self.inner.first.lock().unwrap();
        if first.is_none() {
            log::error!("device error: {}", err);
            *first = Some(err);
            self.inner.raised.store(true, Ordering::Release);
        } else {
            log::warn!("suppressed subsequent device error: {}", err);
        }
    }

    pub fn has_error(&self) -> bool {
        self.inner.raised.load(Ordering::Acquire)
    }

    pub fn first_error(&self) -> Option<DeviceError> {
        self.inner.first.lock().unwrap().clone()
    }

    pub fn first_message(&self) -> Option<String> {
        self.first_error().map(|e| e.to_string())
    }

    /// Clear the slot. Only valid at context teardown/reinit.
    pub fn clear(&self) {
        let mut first = self.inner.first.lock().unwrap();
        *first = None;
        self.inner.raised.store(false, Ordering::Release);
    }

    /// Guard used at the top of every device operation.
    pub fn check(&self) -> DeviceResult<()> {
        match self.first_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Default for ErrorState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_error_wins() {
        let state = ErrorState::new();
        assert!(!state.has_error());
        assert!(state.check().is_ok());

        state.raise(DeviceError::launch("stream sync failed"));
        state.raise(DeviceError::out_of_memory("later failure"));

        assert!(state.has_error());
        assert_eq!(
            state.first_error(),
            Some(DeviceError::Launch("stream sync failed".to_string()))
        );
        assert!(matches!(state.check(), Err(DeviceError::Launch(_))));
    }

    #[test]
    fn clear_resets_slot() {
        let state = ErrorState::new();
        state.raise(DeviceError::build("bad instance list"));
        state.clear();
        assert!(!state.has_error());
        assert!(state.first_error().is_none());
    }

    #[test]
    fn clones_share_the_slot() {
        let state = ErrorState::new();
        let other = state.clone();
        other.raise(DeviceError::kernel_load("missing module"));
        assert!(state.has_error());
    }
}
