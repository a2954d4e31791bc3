//! Completion cells for asynchronous protocol operations.
//!
//! Channel opens, channel closes, channel requests, global requests and
//! service requests all complete when a message arrives from the peer. A
//! [`RequestFuture`] is the shared handle both sides of that wait hold.
//!
//! # Example
//!
//! ```rust
//! use strand_proto::ssh::future::RequestFuture;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let future = RequestFuture::new("exec");
//! let waiter = future.clone();
//!
//! future.done(true);
//! future.done(false); // ignored, the first completion wins
//!
//! assert!(waiter.wait().await);
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use strand_platform::{StrandError, StrandResult};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Outcome {
    success: bool,
    data: Option<Vec<u8>>,
    reason: Option<String>,
}

/// Shared, clonable completion handle.
///
/// The first call to one of the `done` methods wins; later calls are
/// ignored. Any number of tasks may wait concurrently.
#[derive(Clone)]
pub struct RequestFuture {
    name: Arc<str>,
    state: Arc<watch::Sender<Option<Outcome>>>,
}

impl RequestFuture {
    /// Creates a pending future labelled `name` for diagnostics.
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            name: Arc::from(name.into()),
            state: Arc::new(tx),
        }
    }

    /// Label given at construction.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn complete(&self, outcome: Outcome) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(outcome);
            true
        })
    }

    /// Completes the future. Returns false if it was already complete.
    pub fn done(&self, success: bool) -> bool {
        self.complete(Outcome {
            success,
            data: None,
            reason: None,
        })
    }

    /// Completes the future with a response payload.
    pub fn done_with_data(&self, success: bool, data: Vec<u8>) -> bool {
        self.complete(Outcome {
            success,
            data: Some(data),
            reason: None,
        })
    }

    /// Completes the future unsuccessfully with a reason.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.complete(Outcome {
            success: false,
            data: None,
            reason: Some(reason.into()),
        })
    }

    /// Whether the future has completed.
    pub fn is_done(&self) -> bool {
        self.state.borrow().is_some()
    }

    /// Whether the future completed successfully.
    pub fn is_success(&self) -> bool {
        self.state.borrow().as_ref().map_or(false, |o| o.success)
    }

    /// Response payload, if any.
    pub fn data(&self) -> Option<Vec<u8>> {
        self.state.borrow().as_ref().and_then(|o| o.data.clone())
    }

    /// Failure reason, if any.
    pub fn failure_reason(&self) -> Option<String> {
        self.state.borrow().as_ref().and_then(|o| o.reason.clone())
    }

    /// Waits for completion and returns the success flag.
    pub async fn wait(&self) -> bool {
        let mut rx = self.state.subscribe();
        let success = match rx.wait_for(Option::is_some).await {
            Ok(state) => state.as_ref().map_or(false, |o| o.success),
            Err(_) => false,
        };
        success
    }

    /// Waits at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`StrandError::Timeout`] if the future is still pending. The
    /// operation itself is not cancelled and may still complete later.
    pub async fn wait_timeout(&self, timeout: Duration) -> StrandResult<bool> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| {
                StrandError::Timeout(format!(
                    "{} did not complete within {:?}",
                    self.name, timeout
                ))
            })
    }
}

impl std::fmt::Debug for RequestFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestFuture")
            .field("name", &self.name)
            .field("state", &*self.state.borrow())
            .finish()
    }
}
