//! Ordered teardown and error escalation.
//!
//! Subsystems register teardown actions; `request_shutdown` latches an exit
//! code and cancels the root token, which every blocking primitive observes.
//! Actions run in reverse registration order on exit.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Upper bound on a single teardown action; covers the soft-quit-then-hard-
/// close window granted to workers.
const ACTION_TIMEOUT: Duration = Duration::from_secs(310);

type Action = (&'static str, BoxFuture<'static, ()>);

pub struct ShutdownManager {
    token: CancellationToken,
    code: Mutex<Option<i32>>,
    actions: Mutex<Vec<Action>>,
}

impl ShutdownManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            token: CancellationToken::new(),
            code: Mutex::new(None),
            actions: Mutex::new(Vec::new()),
        })
    }

    /// Request shutdown with the given exit code. Idempotent; a non-zero
    /// code is retained over a zero one.
    pub fn request_shutdown(&self, code: i32) {
        {
            let mut latched = self.code.lock();
            match *latched {
                None => *latched = Some(code),
                Some(0) if code != 0 => *latched = Some(code),
                Some(_) => {}
            }
        }
        if code != 0 {
            tracing::warn!(code, "shutdown requested");
        } else {
            tracing::info!("shutdown requested");
        }
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Latched exit code; zero if shutdown was never signalled with an error.
    pub fn exit_code(&self) -> i32 {
        self.code.lock().unwrap_or(0)
    }

    /// Future resolving when shutdown has been requested.
    pub fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// Token handed to spawned tasks so they can observe cancellation.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Register a named teardown action. Actions run in reverse
    /// registration order.
    pub fn register<F>(&self, name: &'static str, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.actions.lock().push((name, Box::pin(action)));
    }

    /// Run all registered actions, newest first, each under a timeout.
    pub async fn run_teardown(&self) {
        let mut actions = {
            let mut guard = self.actions.lock();
            std::mem::take(&mut *guard)
        };
        while let Some((name, action)) = actions.pop() {
            tracing::info!(action = name, "running teardown action");
            if tokio::time::timeout(ACTION_TIMEOUT, action).await.is_err() {
                tracing::warn!(action = name, "teardown action timed out");
            }
        }
    }
}
