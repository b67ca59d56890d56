//! Per-user submission state.
//!
//! A session runs at most one query at a time:
//!
//! ```text
//! Idle ──submit──► Submitting ──► Succeeded ──┐
//!                       │                      ├──submit──► Submitting …
//!                       └───────► Failed ──────┘
//! ```
//!
//! `Succeeded` and `Failed` are resting states that remember how the last
//! submission ended; [`Session::acknowledge`] returns them to `Idle`. A submit
//! while `Submitting` is rejected with `Busy` and leaves the running query
//! alone.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::cancel::CancellationToken;
use crate::engine::Engine;
use crate::error::{ErrorKind, QuarryError, QuarryResult};
use crate::normalize::ResultSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Submitting,
    Succeeded,
    Failed,
}

/// Error left behind by the last failed submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
}

/// Point-in-time copy of a session's state.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub last_text: Option<String>,
    pub last_success: Option<Arc<ResultSet>>,
    pub last_error: Option<LastError>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Inner {
    state: SessionState,
    last_text: Option<String>,
    last_success: Option<Arc<ResultSet>>,
    last_error: Option<LastError>,
    submitted_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    current: Option<CancellationToken>,
    touched: Instant,
}

/// One user's submission state machine over a shared engine.
#[derive(Debug)]
pub struct Session {
    engine: Arc<Engine>,
    inner: Mutex<Inner>,
}

impl Session {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            inner: Mutex::new(Inner {
                state: SessionState::Idle,
                last_text: None,
                last_success: None,
                last_error: None,
                submitted_at: None,
                finished_at: None,
                current: None,
                touched: Instant::now(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn is_busy(&self) -> bool {
        self.state() == SessionState::Submitting
    }

    /// Time since the last submission started or ended (or since creation).
    /// `None` while a submission is running.
    pub fn idle_for(&self) -> Option<Duration> {
        let inner = self.lock();
        (inner.state != SessionState::Submitting).then(|| inner.touched.elapsed())
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.lock();
        SessionSnapshot {
            state: inner.state,
            last_text: inner.last_text.clone(),
            last_success: inner.last_success.clone(),
            last_error: inner.last_error.clone(),
            submitted_at: inner.submitted_at,
            finished_at: inner.finished_at,
        }
    }

    /// Return a finished session to `Idle`. No effect while submitting.
    pub fn acknowledge(&self) {
        let mut inner = self.lock();
        if inner.state != SessionState::Submitting {
            inner.state = SessionState::Idle;
        }
    }

    /// Cancel the running submission, if any.
    pub fn cancel(&self) -> bool {
        match &self.lock().current {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Submit one query and wait for it.
    pub async fn submit(&self, text: &str) -> QuarryResult<Arc<ResultSet>> {
        let (guard, token) = self.begin(text)?;
        tracing::info!("Submitting query ({} bytes)", text.len());
        tracing::debug!("Query text: {}", text.trim());

        let result = self.engine.run_with(text, &token).await.map(Arc::new);
        guard.finish(&result);
        result
    }

    fn begin(&self, text: &str) -> QuarryResult<(SubmissionGuard<'_>, CancellationToken)> {
        let mut inner = self.lock();
        if inner.state == SessionState::Submitting {
            tracing::warn!("Rejected submission while another query is running");
            return Err(QuarryError::Busy);
        }

        let token = CancellationToken::new();
        inner.state = SessionState::Submitting;
        inner.last_text = Some(text.to_string());
        inner.submitted_at = Some(Utc::now());
        inner.finished_at = None;
        inner.current = Some(token.clone());
        inner.touched = Instant::now();

        Ok((
            SubmissionGuard {
                session: self,
                done: false,
            },
            token,
        ))
    }

    fn record(&self, result: Result<&Arc<ResultSet>, &QuarryError>) {
        let mut inner = self.lock();
        inner.current = None;
        inner.finished_at = Some(Utc::now());
        inner.touched = Instant::now();
        match result {
            Ok(set) => {
                inner.state = SessionState::Succeeded;
                inner.last_success = Some(Arc::clone(set));
                inner.last_error = None;
                tracing::info!("Query returned {} row(s)", set.len());
            }
            Err(err) => {
                inner.state = SessionState::Failed;
                inner.last_error = Some(LastError {
                    kind: err.kind(),
                    message: err.to_string(),
                    position: err.position(),
                });
            }
        }
    }
}

/// Marks the submission `Failed` if it is dropped before finishing, e.g. when
/// the request future is cancelled.
struct SubmissionGuard<'a> {
    session: &'a Session,
    done: bool,
}

impl SubmissionGuard<'_> {
    fn finish(mut self, result: &QuarryResult<Arc<ResultSet>>) {
        self.done = true;
        self.session.record(result.as_ref());
    }
}

impl Drop for SubmissionGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            tracing::warn!("Submission abandoned before completion");
            let err = QuarryError::Cancelled("submission abandoned".to_string());
            self.session.record(Err(&err));
        }
    }
}
