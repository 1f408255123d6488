use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A self-rescheduling background loop.
///
/// The next run is scheduled only after the previous one finished, so runs never
/// overlap. Cancelling the parent token (or this task's own token) stops the loop
/// at its next suspension point.
pub struct RecurringTask {
    name: String,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl RecurringTask {
    pub fn spawn<F, Fut>(name: impl Into<String>, interval: Duration, parent: &CancellationToken, mut run: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        let name = name.into();
        let token = parent.child_token();
        let loop_token = token.clone();
        let loop_name = name.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if loop_token.is_cancelled() {
                    break;
                }
                if run().await.is_break() {
                    break;
                }
            }
            debug!(task = %loop_name, "Recurring task stopped");
        });

        Self {
            name,
            token,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Cancels the loop and waits for it to exit.
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for RecurringTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
