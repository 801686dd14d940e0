use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::error;

use crate::api::datum::{Datum, Message};
use crate::api::map::Mapper;
use crate::core::callback::panic_message;
use crate::framework::errors::{FerrumStreamError, Result};

/// Runs the user map hook for one datum at a time. Holds no state between calls.
pub struct MapExecutor<M> {
    mapper: Arc<M>,
}

impl<M> Clone for MapExecutor<M> {
    fn clone(&self) -> Self {
        MapExecutor {
            mapper: self.mapper.clone(),
        }
    }
}

/// Aborts the hook task when the call is dropped before it finishes.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl<M: Mapper> MapExecutor<M> {
    pub fn new(mapper: Arc<M>) -> Self {
        MapExecutor { mapper }
    }

    /// The hook runs on its own task so a panic fails this call only.
    pub async fn apply(&self, datum: Datum) -> Result<Vec<Message>> {
        let mapper = self.mapper.clone();
        let mut task = AbortOnDrop(tokio::spawn(async move { mapper.map(datum).await }));

        match (&mut task.0).await {
            Ok(Ok(messages)) => Ok(messages),
            Ok(Err(err)) => {
                error!("user map hook failed: {:#}", err);
                Err(FerrumStreamError::CallbackFailure(format!("map: {:#}", err)))
            }
            Err(err) if err.is_panic() => {
                let reason = panic_message(err.into_panic().as_ref());
                error!("user map hook panicked: {}", reason);
                Err(FerrumStreamError::CallbackFailure(format!(
                    "map panicked: {}",
                    reason
                )))
            }
            Err(err) => Err(FerrumStreamError::InternalError(err.to_string())),
        }
    }
}
