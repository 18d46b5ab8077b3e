//! Pull request check dispatcher
//!
//! Webhook handlers push [`CheckRequest`]s onto a bounded [`CheckQueue`]. A
//! single [`Dispatcher`] task drains it, running each check on the blocking
//! pool and publishing the resulting commit status.

use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, info_span, warn};
use uuid::Uuid;

use crate::backend::{GpgBackend, Keyring, Verifier};
use crate::config::AppConfig;
use crate::error::Result;
use crate::git::GitCli;
use crate::github::GitHubClient;
use crate::models::{CommitStatus, PullRequestContext, StatusState, TrustSearchResult};
use crate::observer::TracingObserver;
use crate::trust::{ResolverOptions, TrustResolver};

/// A pull request head commit waiting to be checked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRequest {
    pub delivery_id: Uuid,
    /// Clone URL of the base repository
    pub clone_url: String,
    /// Statuses API URL for the head commit
    pub statuses_url: String,
    pub head_sha: String,
    /// API URL of the pull request
    pub pull_request_url: String,
    pub number: u64,
    pub received_at: DateTime<Utc>,
}

/// Errors when queueing a check
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Check queue is full")]
    Full,

    #[error("Check dispatcher is not running")]
    Closed,
}

#[derive(Debug, Default)]
struct QueueCounters {
    queued: AtomicUsize,
    completed: AtomicU64,
}

/// Sending side of the check queue
#[derive(Debug, Clone)]
pub struct CheckQueue {
    sender: mpsc::Sender<CheckRequest>,
    counters: Arc<QueueCounters>,
}

/// Receiving side of the check queue, owned by the [`Dispatcher`]
#[derive(Debug)]
pub struct CheckReceiver {
    receiver: mpsc::Receiver<CheckRequest>,
    counters: Arc<QueueCounters>,
}

impl CheckQueue {
    /// Create a queue holding at most `capacity` pending checks
    pub fn new(capacity: usize) -> (Self, CheckReceiver) {
        let (sender, receiver) = mpsc::channel(capacity);
        let counters = Arc::new(QueueCounters::default());
        (
            Self {
                sender,
                counters: counters.clone(),
            },
            CheckReceiver { receiver, counters },
        )
    }

    /// Queue a check without waiting for capacity
    pub fn enqueue(&self, request: CheckRequest) -> std::result::Result<(), QueueError> {
        // Count before sending so the worker never decrements below zero
        self.counters.queued.fetch_add(1, Ordering::SeqCst);
        match self.sender.try_send(request) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.counters.queued.fetch_sub(1, Ordering::SeqCst);
                match err {
                    mpsc::error::TrySendError::Full(_) => Err(QueueError::Full),
                    mpsc::error::TrySendError::Closed(_) => Err(QueueError::Closed),
                }
            }
        }
    }

    /// Checks waiting to run
    pub fn queued(&self) -> usize {
        self.counters.queued.load(Ordering::SeqCst)
    }

    /// Checks finished since startup
    pub fn completed(&self) -> u64 {
        self.counters.completed.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl CheckReceiver {
    async fn next(&mut self) -> Option<CheckRequest> {
        let request = self.receiver.recv().await?;
        self.counters.queued.fetch_sub(1, Ordering::SeqCst);
        Some(request)
    }

    #[cfg(test)]
    pub(crate) fn try_next(&mut self) -> Option<CheckRequest> {
        let request = self.receiver.try_recv().ok()?;
        self.counters.queued.fetch_sub(1, Ordering::SeqCst);
        Some(request)
    }

    fn finished(&self) {
        self.counters.completed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Blocking work performed for one check
#[cfg_attr(test, mockall::automock)]
pub trait CheckRunner: Send + Sync {
    /// Run the trust search for the request's head commit
    fn resolve(&self, request: &CheckRequest) -> Result<TrustSearchResult>;

    /// Publish a commit status for the request's head commit
    fn publish(&self, request: &CheckRequest, status: &CommitStatus) -> Result<()>;
}

/// Run one check to completion and return the status that was reported
pub fn process(runner: &dyn CheckRunner, request: &CheckRequest, context: &str) -> CommitStatus {
    let pending = CommitStatus::new(StatusState::Pending, "Checking signatures", context);
    if let Err(err) = runner.publish(request, &pending) {
        warn!(error = %err, "Failed to publish pending status");
    }

    let status = match runner.resolve(request) {
        Ok(result) => {
            let verdict = result.verdict();
            info!(verdict = verdict.as_str(), key_id = ?result.key_id(), "Trust search finished");
            CommitStatus::from_verdict(&verdict, context)
        }
        Err(err) => {
            warn!(error = %err, "Trust undetermined");
            CommitStatus::undetermined(&err, context)
        }
    };

    if let Err(err) = runner.publish(request, &status) {
        error!(error = %err, state = status.state.as_str(), "Failed to publish commit status");
    }
    status
}

/// Single worker draining the check queue
pub struct Dispatcher {
    receiver: CheckReceiver,
    runner: Arc<dyn CheckRunner>,
    context: String,
}

impl Dispatcher {
    pub fn new(receiver: CheckReceiver, runner: Arc<dyn CheckRunner>, context: impl Into<String>) -> Self {
        Self {
            receiver,
            runner,
            context: context.into(),
        }
    }

    /// Process checks one at a time until every queue sender is dropped
    pub async fn run(mut self) {
        info!("Check dispatcher started");
        while let Some(request) = self.receiver.next().await {
            let started = Instant::now();
            let span = info_span!(
                "check",
                delivery_id = %request.delivery_id,
                pull_request = request.number,
                head_sha = %request.head_sha,
            );
            let runner = self.runner.clone();
            let context = self.context.clone();

            let outcome = tokio::task::spawn_blocking(move || {
                let _guard = span.enter();
                process(runner.as_ref(), &request, &context)
            })
            .await;

            let state = match outcome {
                Ok(status) => status.state,
                Err(err) => {
                    error!(error = %err, "Check task failed");
                    StatusState::Error
                }
            };
            crate::metrics::record_check(state.as_str(), started.elapsed().as_secs_f64());
            self.receiver.finished();
        }
        info!("Check queue closed, dispatcher stopping");
    }
}

/// [`CheckRunner`] backed by git, gpg and the GitHub API
pub struct GitHubCheckRunner {
    config: AppConfig,
}

impl GitHubCheckRunner {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    fn scratch_dir(&self) -> Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("keygate-checkout-");
        let dir = match &self.config.work_dir {
            Some(work_dir) => builder.tempdir_in(work_dir)?,
            None => builder.tempdir()?,
        };
        Ok(dir)
    }

    fn checkout(&self, request: &CheckRequest, dest: &Path) -> Result<GitCli> {
        let repo = GitCli::clone_bare(&self.config.git, &request.clone_url, dest)?;
        let pull_ref = format!("refs/pull/{}/head", request.number);
        repo.fetch_ref(&request.clone_url, &format!("+{0}:{0}", pull_ref))?;
        Ok(repo)
    }
}

impl CheckRunner for GitHubCheckRunner {
    fn resolve(&self, request: &CheckRequest) -> Result<TrustSearchResult> {
        let github = GitHubClient::new(self.config.github.clone())?;
        let scratch = self.scratch_dir()?;
        let repo = self.checkout(request, &scratch.path().join("repo.git"))?;

        let keyring = match &self.config.gpg.keyring {
            Some(path) => Keyring::persistent(path),
            None => Keyring::temporary()?,
        };
        let verifier = Verifier::new(GpgBackend::new(&self.config.gpg)?)
            .with_observer(Arc::new(TracingObserver));
        let resolver = TrustResolver::new(&repo, &github, &verifier).with_options(ResolverOptions {
            fork_tag_failures: self.config.dispatcher.fork_tag_failures,
        });

        resolver.resolve(
            &request.head_sha,
            Some(&PullRequestContext::new(&request.pull_request_url)),
            &keyring,
            self.config.gpg.allow_key_download,
        )
    }

    fn publish(&self, request: &CheckRequest, status: &CommitStatus) -> Result<()> {
        GitHubClient::new(self.config.github.clone())?.post_commit_status(&request.statuses_url, status)
    }
}
