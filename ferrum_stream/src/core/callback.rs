use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::error;

use crate::framework::errors::{FerrumStreamError, Result};

/// Runs a synchronous user hook, turning both errors and panics into `CallbackFailure`.
pub(crate) fn invoke<T>(hook: &str, f: impl FnOnce() -> anyhow::Result<T>) -> Result<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => {
            error!("user {} hook failed: {:#}", hook, err);
            Err(FerrumStreamError::CallbackFailure(format!("{}: {:#}", hook, err)))
        }
        Err(payload) => {
            let reason = panic_message(payload.as_ref());
            error!("user {} hook panicked: {}", hook, reason);
            Err(FerrumStreamError::CallbackFailure(format!(
                "{} panicked: {}",
                hook, reason
            )))
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
