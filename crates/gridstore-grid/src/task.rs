//! Scheduled tasks
//!
//! A task runs on a fixed period after an initial delay until its handle is
//! cancelled or dropped. The body is synchronous and may block on storage,
//! so each run goes to tokio's blocking pool.

use gridstore_common::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Body = Arc<dyn Fn() + Send + Sync>;

/// Revocable handle to a periodic task
pub struct TaskHandle {
    name: String,
    body: Body,
    runs: Arc<AtomicU64>,
    token: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl TaskHandle {
    /// Run `body` every `period`, first after `delay`
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<F>(name: &str, delay: Duration, period: Duration, body: F) -> Result<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if period.is_zero() {
            return Err(Error::invalid_argument("task period must be positive"));
        }
        let runtime = Handle::try_current()
            .map_err(|e| Error::internal(format!("scheduled tasks need a tokio runtime: {e}")))?;

        let runs = Arc::new(AtomicU64::new(0));
        let counted = Arc::clone(&runs);
        let body: Body = Arc::new(move || {
            body();
            counted.fetch_add(1, Ordering::Relaxed);
        });
        let token = CancellationToken::new();

        let join = runtime.spawn(run_loop(
            name.to_string(),
            Arc::clone(&body),
            token.clone(),
            delay,
            period,
        ));
        info!("Scheduled task {} every {:?} after {:?}", name, period, delay);

        Ok(Self {
            name: name.to_string(),
            body,
            runs,
            token,
            join: Some(join),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the body once on the calling thread, outside the schedule
    pub fn run_now(&self) {
        (self.body)();
    }

    /// Stop future scheduled runs; a run in progress completes
    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            debug!("Cancelling task {}", self.name);
            self.token.cancel();
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completed runs, scheduled or forced
    #[must_use]
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    /// Cancel and wait for the scheduling loop to end
    pub async fn shutdown(mut self) {
        self.cancel();
        if let Some(join) = self.join.take()
            && let Err(e) = join.await
        {
            warn!("Task {} loop ended abnormally: {}", self.name, e);
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn run_loop(
    name: String,
    body: Body,
    token: CancellationToken,
    delay: Duration,
    period: Duration,
) {
    let mut ticker = interval_at(Instant::now() + delay, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = ticker.tick() => {
                let body = Arc::clone(&body);
                if let Err(e) = tokio::task::spawn_blocking(move || body()).await {
                    warn!("Task {} run failed: {}", name, e);
                }
            }
        }
    }
    debug!("Task {} stopped", name);
}
