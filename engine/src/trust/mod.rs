//! Repository trust resolution
//!
//! Searches for a good signature on a commit, falling back to the tags that
//! point at it. For pull requests, tags that only exist in the contributor's
//! repository are discovered and fetched before the tag search.

use serde::{Deserialize, Serialize};

use crate::backend::{Keyring, Verifier};
use crate::error::{Result, TrustError};
use crate::git::{validate_commit_id, validate_tag_name, GitRepository};
use crate::github::ForgeApi;
use crate::models::{
    ObjectKind, PullRequestContext, TrustSearchResult, TrustSource, VerificationOutcome,
};

/// What to do when fork tag discovery fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForkTagPolicy {
    /// Abort the search; trust is undetermined
    #[default]
    Abort,
    /// Continue with the tags already present locally
    Skip,
}

/// Trust search options
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolverOptions {
    pub fork_tag_failures: ForkTagPolicy,
}

/// Ordered trust search over a repository
pub struct TrustResolver<'a> {
    repo: &'a dyn GitRepository,
    forge: &'a dyn ForgeApi,
    verifier: &'a Verifier,
    options: ResolverOptions,
}

/// Whether a full commit id from a remote names the (possibly abbreviated) `wanted` id
fn same_commit(full: &str, wanted: &str) -> bool {
    full.get(..wanted.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(wanted))
}

impl<'a> TrustResolver<'a> {
    pub fn new(repo: &'a dyn GitRepository, forge: &'a dyn ForgeApi, verifier: &'a Verifier) -> Self {
        Self {
            repo,
            forge,
            verifier,
            options: ResolverOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ResolverOptions) -> Self {
        self.options = options;
        self
    }

    /// Establish trust in `commit_id`.
    ///
    /// Checks the commit itself, then (for pull requests) fetches matching
    /// tags from the source repository, then checks every local tag pointing
    /// at the commit. Stops at the first good signature. Key download is
    /// only honoured for a temporary keyring.
    ///
    /// A malformed commit or tag ends the check of that object only. The
    /// first such error is returned if no other object verifies.
    pub fn resolve(
        &self,
        commit_id: &str,
        pull_request: Option<&PullRequestContext>,
        keyring: &Keyring,
        allow_key_download: bool,
    ) -> Result<TrustSearchResult> {
        validate_commit_id(commit_id)?;
        let allow_key_download = keyring.permits_download(allow_key_download);

        let mut malformed = None;

        let text = self.repo.object_text(ObjectKind::Commit, commit_id)?;
        let outcome = self.check_object(
            ObjectKind::Commit,
            commit_id,
            &text,
            keyring,
            allow_key_download,
            &mut malformed,
        )?;
        if let Some(key_id) = outcome.key_id() {
            return Ok(self.finish(commit_id, TrustSearchResult::trusted(key_id, TrustSource::Commit)));
        }
        let mut any_signature_present = outcome.any_signature_present();

        if let Some(pull_request) = pull_request {
            match self.fetch_fork_tags(commit_id, pull_request) {
                Ok(()) => {}
                Err(err)
                    if err.is_fork_discovery()
                        && self.options.fork_tag_failures == ForkTagPolicy::Skip =>
                {
                    self.verifier.observer().fork_discovery_skipped(&err);
                }
                Err(err) => return Err(err),
            }
        }

        for tag in self.repo.tags_pointing_at(commit_id)? {
            let text = match self.repo.object_text(ObjectKind::Tag, &tag) {
                Ok(text) => text,
                // Lightweight tags have no tag object and cannot carry a signature
                Err(TrustError::ObjectNotFound { .. }) => continue,
                Err(err) => return Err(err),
            };
            let outcome = self.check_object(
                ObjectKind::Tag,
                &tag,
                &text,
                keyring,
                allow_key_download,
                &mut malformed,
            )?;
            any_signature_present |= outcome.any_signature_present();
            if let Some(key_id) = outcome.key_id() {
                let result = TrustSearchResult::trusted(key_id, TrustSource::Tag(tag.clone()));
                return Ok(self.finish(commit_id, result));
            }
        }

        match malformed {
            Some(err) => Err(err),
            None => Ok(self.finish(commit_id, TrustSearchResult::untrusted(any_signature_present))),
        }
    }

    /// Verify one object, setting a malformed object aside as unverified
    fn check_object(
        &self,
        kind: ObjectKind,
        id: &str,
        text: &[u8],
        keyring: &Keyring,
        allow_key_download: bool,
        malformed: &mut Option<TrustError>,
    ) -> Result<VerificationOutcome> {
        match self
            .verifier
            .verify_object(kind, id, text, keyring, allow_key_download)
        {
            Err(err @ TrustError::MalformedObject { .. }) => {
                self.verifier.observer().object_malformed(kind, id, &err);
                malformed.get_or_insert(err);
                Ok(VerificationOutcome::unsigned())
            }
            other => other,
        }
    }

    /// Fetch tags on `commit_id` that exist in the pull request's source repository
    fn fetch_fork_tags(&self, commit_id: &str, pull_request: &PullRequestContext) -> Result<()> {
        let metadata = self.forge.pull_request(&pull_request.api_url)?;
        let Some(remote) = metadata.source_clone_url else {
            return Ok(());
        };

        let names: Vec<String> = self
            .repo
            .list_remote_tags(&remote)?
            .into_iter()
            .filter(|tag| same_commit(&tag.commit_id, commit_id))
            .map(|tag| tag.name)
            .filter(|name| validate_tag_name(name).is_ok())
            .collect();

        if names.is_empty() {
            return Ok(());
        }
        self.verifier.observer().fork_tags_found(&remote, &names);
        self.repo.fetch_tags(&remote, &names)
    }

    fn finish(&self, commit_id: &str, result: TrustSearchResult) -> TrustSearchResult {
        self.verifier.observer().search_finished(commit_id, &result);
        result
    }
}
