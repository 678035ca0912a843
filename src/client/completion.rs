//! Exactly-once completion delivery for background fetches.

use crate::{Error, Result};

/// Boxed completion callback.
pub type OnComplete<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

/// One-shot owner of a completion callback.
///
/// The callback runs exactly once: either through [`Completion::complete`],
/// or with [`Error::AdapterReset`] when the `Completion` is dropped unfulfilled
/// (the background task was aborted, its runtime shut down, or the future was
/// discarded before it finished).
pub struct Completion<T> {
    callback: Option<OnComplete<T>>,
}

impl<T> Completion<T> {
    /// Wrap a callback.
    pub fn new(callback: impl FnOnce(Result<T>) + Send + 'static) -> Self {
        Self {
            callback: Some(Box::new(callback)),
        }
    }

    /// Deliver the result.
    pub fn complete(mut self, result: Result<T>) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            tracing::debug!("Completion dropped unfulfilled, reporting adapter reset");
            callback(Err(Error::AdapterReset));
        }
    }
}
