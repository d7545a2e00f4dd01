//! Fixed-interval poll loop with cooperative shutdown.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, info_span, instrument, Instrument};
use uuid::Uuid;

use crate::bsky::{AuthError, SearchApi};
use crate::cursor::{CursorOptions, SearchCursor};
use crate::db::{self, Store};
use crate::fanout::{FanoutEngine, IngestRules};
use crate::session::SessionManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Polling,
    Sleeping,
    ShuttingDown,
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub pages: u32,
    pub scanned: usize,
    pub new_posts: usize,
    pub accepted_posts: usize,
    pub records: usize,
    /// Marker written at the end of the pass, if any.
    pub marker: Option<String>,
}

/// One search + fan-out pass over the current filter set.
pub struct Poller {
    api: Arc<dyn SearchApi>,
    store: Arc<dyn Store>,
    rules: IngestRules,
    cursor: CursorOptions,
    default_filter: String,
}

impl Poller {
    pub fn new(
        api: Arc<dyn SearchApi>,
        store: Arc<dyn Store>,
        rules: IngestRules,
        cursor: CursorOptions,
        default_filter: impl Into<String>,
    ) -> Self {
        Self {
            api,
            store,
            rules,
            cursor,
            default_filter: default_filter.into(),
        }
    }

    /// The marker only moves once every collected post has been processed.
    #[instrument(skip_all)]
    pub async fn run_pass(&self) -> Result<PassReport> {
        let filters = db::load_filters(self.store.as_ref(), &self.default_filter).await?;
        let cursor = SearchCursor::new(self.api.as_ref(), self.store.as_ref(), &self.cursor);
        let fetched = cursor.fetch_new_posts().await?;
        let engine = FanoutEngine::new(self.store.as_ref(), &self.rules);

        let mut report = PassReport {
            pages: fetched.pages,
            scanned: fetched.scanned,
            new_posts: fetched.posts.len(),
            ..Default::default()
        };

        for post in &fetched.posts {
            let written = engine
                .process(post, &filters)
                .await
                .with_context(|| format!("failed to process {}", post.uri))?;
            if written > 0 {
                report.accepted_posts += 1;
            }
            report.records += written;
        }

        if let Some(newest) = fetched.posts.last() {
            cursor.advance(&newest.uri).await?;
            info!(last_seen = %newest.uri, "updated last seen post");
            report.marker = Some(newest.uri.clone());
        }

        info!(
            posts = report.accepted_posts,
            records = report.records,
            pages = report.pages,
            "pass complete"
        );
        Ok(report)
    }
}

pub struct PollScheduler {
    session: SessionManager,
    poller: Poller,
    interval: Duration,
    state: SchedulerState,
}

enum Wake {
    Authenticated(Result<String, AuthError>),
    Timer,
    Shutdown,
}

impl PollScheduler {
    pub fn new(session: SessionManager, poller: Poller, interval: Duration) -> Self {
        Self {
            session,
            poller,
            interval,
            state: SchedulerState::Idle,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    fn transition(&mut self, next: SchedulerState) {
        tracing::debug!(from = ?self.state, to = ?next, "scheduler state");
        self.state = next;
    }

    /// Authenticate once, then poll until `shutdown` flips to `true`.
    /// A login rate limit ends the run cleanly; other auth failures are errors.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.transition(SchedulerState::Idle);

        let wake = tokio::select! {
            res = self.session.authenticate() => Wake::Authenticated(res),
            _ = wait_for_shutdown(&mut shutdown) => Wake::Shutdown,
        };
        match wake {
            Wake::Authenticated(Ok(handle)) => info!(%handle, "logged in"),
            Wake::Authenticated(Err(AuthError::RateLimited)) => {
                error!("login rate limit reached; shutting down");
                self.stop();
                return Ok(());
            }
            Wake::Authenticated(Err(err)) => {
                self.stop();
                return Err(err).context("authentication failed");
            }
            Wake::Shutdown | Wake::Timer => {
                self.stop();
                return Ok(());
            }
        }

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.transition(SchedulerState::Polling);
            info!("waking up");
            let span = info_span!("pass", pass_id = %Uuid::new_v4());
            if let Err(err) = self.poller.run_pass().instrument(span).await {
                error!(?err, "pass failed; retrying at next wake-up");
            }

            if *shutdown.borrow() {
                break;
            }

            self.transition(SchedulerState::Sleeping);
            let wake = tokio::select! {
                _ = tokio::time::sleep(self.interval) => Wake::Timer,
                _ = wait_for_shutdown(&mut shutdown) => Wake::Shutdown,
            };
            if matches!(wake, Wake::Shutdown) {
                break;
            }
        }

        self.stop();
        Ok(())
    }

    fn stop(&mut self) {
        self.transition(SchedulerState::ShuttingDown);
        info!("ending");
        self.transition(SchedulerState::Stopped);
        info!("done");
    }
}

/// Resolves once `true` has been sent. A dropped sender never resolves.
async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
