//! Trust search observation
//!
//! The engine never writes output itself. Progress is reported to a
//! [`TrustObserver`]; [`TracingObserver`] forwards events to `tracing` and
//! the metrics recorder.

use crate::error::TrustError;
use crate::models::{ObjectKind, TrustSearchResult, VerificationOutcome};

/// Receives events from the verifier and the trust resolver.
///
/// Every method has a no-op default.
pub trait TrustObserver {
    /// A signed payload is about to be handed to the backend
    fn verifying(&self, _kind: ObjectKind, _id: &str, _payload_sha256: &str) {}

    fn object_checked(&self, _kind: ObjectKind, _id: &str, _outcome: &VerificationOutcome) {}

    /// The object could not be parsed; the search moves on to the next one
    fn object_malformed(&self, _kind: ObjectKind, _id: &str, _error: &TrustError) {}

    fn key_downloaded(&self, _key_id: &str) {}

    fn key_download_failed(&self, _key_id: &str, _error: &TrustError) {}

    fn fork_tags_found(&self, _remote: &str, _tags: &[String]) {}

    /// Fork tag discovery failed and the search continues without it
    fn fork_discovery_skipped(&self, _error: &TrustError) {}

    fn search_finished(&self, _commit_id: &str, _result: &TrustSearchResult) {}
}

/// Observer that ignores every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NullObserver;

impl TrustObserver for NullObserver {}

/// Observer that emits structured `tracing` events and metrics
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl TrustObserver for TracingObserver {
    fn verifying(&self, kind: ObjectKind, id: &str, payload_sha256: &str) {
        tracing::debug!(kind = %kind, id = %id, payload_sha256 = %payload_sha256, "Verifying signature");
    }

    fn object_checked(&self, kind: ObjectKind, id: &str, outcome: &VerificationOutcome) {
        crate::metrics::record_object_check(kind, outcome);
        match outcome.key_id() {
            Some(key_id) => {
                tracing::info!(kind = %kind, id = %id, key_id = %key_id, "Good signature")
            }
            None if outcome.any_signature_present() => {
                tracing::info!(kind = %kind, id = %id, "Signature present but not verified")
            }
            None => tracing::debug!(kind = %kind, id = %id, "Not signed"),
        }
    }

    fn object_malformed(&self, kind: ObjectKind, id: &str, error: &TrustError) {
        crate::metrics::record_malformed_object(kind);
        tracing::warn!(kind = %kind, id = %id, error = %error, "Skipping malformed object");
    }

    fn key_downloaded(&self, key_id: &str) {
        crate::metrics::record_key_download(true);
        tracing::info!(key_id = %key_id, "Downloaded public key");
    }

    fn key_download_failed(&self, key_id: &str, error: &TrustError) {
        crate::metrics::record_key_download(false);
        tracing::warn!(key_id = %key_id, error = %error, "Public key download failed");
    }

    fn fork_tags_found(&self, remote: &str, tags: &[String]) {
        crate::metrics::record_fork_tags(tags.len());
        tracing::info!(remote = %remote, tags = ?tags, "Fetching tags from pull request source");
    }

    fn fork_discovery_skipped(&self, error: &TrustError) {
        tracing::warn!(error = %error, "Skipping fork tag discovery");
    }

    fn search_finished(&self, commit_id: &str, result: &TrustSearchResult) {
        let verdict = result.verdict();
        crate::metrics::record_search(&verdict);
        tracing::info!(
            commit = %commit_id,
            verdict = verdict.as_str(),
            key_id = ?result.key_id(),
            "Trust search finished"
        );
    }
}
