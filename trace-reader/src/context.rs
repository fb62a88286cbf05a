use crate::error::ReaderError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation and deadline of one read request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    cancellation: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestContext {
    /// No deadline, never cancelled unless [`RequestContext::cancellation_token`] is used.
    pub fn new() -> Self {
        Self {
            cancellation: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancellation: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn check(&self) -> Result<(), ReaderError> {
        if self.cancellation.is_cancelled() {
            return Err(ReaderError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(ReaderError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Drives `fut` until it completes, the request is cancelled or the deadline passes.
    /// `fut` is dropped in the latter two cases.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, ReaderError> {
        self.check()?;
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => Err(ReaderError::Cancelled),
            _ = deadline => Err(ReaderError::DeadlineExceeded),
            output = fut => Ok(output),
        }
    }
}
