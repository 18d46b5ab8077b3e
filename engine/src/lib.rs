//! Keygate engine library
//!
//! Establishes whether a git commit is trusted: it either carries a good
//! OpenPGP signature itself, or an annotated tag pointing at it does. The
//! same engine backs the `keygate` CLI and the webhook dispatcher.

pub mod api;
pub mod backend;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod git;
pub mod github;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod object;
pub mod observer;
pub mod trust;

pub use backend::{GpgBackend, GpgConfig, Keyring, SignatureBackend, Verifier};
pub use error::{Result, TrustError};
pub use git::{GitCli, GitRepository};
pub use github::{ForgeApi, GitHubClient};
pub use models::{ObjectKind, SignedObject, TrustSearchResult, TrustSource, VerificationOutcome};
pub use observer::{NullObserver, TracingObserver, TrustObserver};
pub use trust::{ForkTagPolicy, ResolverOptions, TrustResolver};

/// Application state shared across all handlers
pub struct AppState {
    pub config: config::AppConfig,
    pub queue: dispatcher::CheckQueue,
}
