//! Git repository access
//!
//! The trust resolver only needs a handful of read/fetch operations, expressed
//! by [`GitRepository`]. [`GitCli`] implements them by running the `git`
//! binary against a local checkout.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, TrustError};
use crate::models::{ObjectKind, RemoteTag};

static COMMIT_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-fA-F]{4,64}$").expect("valid commit id pattern"));

/// Characters and sequences git refuses in ref names
static INVALID_REF_CHARS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\.\.|@\{|//|[\x00-\x20\x7f~^:?*\[\\])").expect("valid ref pattern")
});

/// Suffix `git ls-remote` uses for the object an annotated tag points at
const PEELED_SUFFIX: &str = "^{}";

/// Git configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    /// git binary name or path
    #[serde(default = "default_program")]
    pub program: String,
}

fn default_program() -> String {
    "git".to_string()
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
        }
    }
}

/// Repository operations required by the trust search
#[cfg_attr(test, mockall::automock)]
pub trait GitRepository {
    /// Raw bytes of a commit or tag object
    fn object_text(&self, kind: ObjectKind, id: &str) -> Result<Vec<u8>>;

    /// Names of local tags pointing at `commit_id`, in listing order
    fn tags_pointing_at(&self, commit_id: &str) -> Result<Vec<String>>;

    /// Fetch the named tag objects from `remote_url` in one operation
    fn fetch_tags(&self, remote_url: &str, tag_names: &[String]) -> Result<()>;

    /// Annotated tags advertised by `remote_url`, dereferenced to their targets
    fn list_remote_tags(&self, remote_url: &str) -> Result<Vec<RemoteTag>>;
}

/// Check that `id` looks like a (possibly abbreviated) object id
pub fn validate_commit_id(id: &str) -> Result<()> {
    if COMMIT_ID.is_match(id) {
        Ok(())
    } else {
        Err(TrustError::InvalidReference {
            value: id.to_string(),
        })
    }
}

/// Check that `name` is safe to use as `refs/tags/<name>`
pub fn validate_tag_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name.starts_with('-')
        || name.starts_with('/')
        || name.ends_with('/')
        || name.ends_with('.')
        || name.ends_with(".lock")
        || name.split('/').any(|part| part.starts_with('.'))
        || INVALID_REF_CHARS.is_match(name);
    if invalid {
        Err(TrustError::InvalidReference {
            value: name.to_string(),
        })
    } else {
        Ok(())
    }
}

fn validate_remote_url(url: &str) -> Result<()> {
    if url.is_empty() || url.starts_with('-') {
        return Err(TrustError::InvalidReference {
            value: url.to_string(),
        });
    }
    Ok(())
}

/// Parse `git ls-remote --tags` output, keeping only peeled annotated tags
pub fn parse_ls_remote(stdout: &str) -> Vec<RemoteTag> {
    stdout
        .lines()
        .filter_map(|line| {
            let (commit_id, reference) = line.split_once('\t')?;
            let name = reference
                .strip_prefix("refs/tags/")?
                .strip_suffix(PEELED_SUFFIX)?;
            Some(RemoteTag {
                commit_id: commit_id.trim().to_string(),
                name: name.to_string(),
            })
        })
        .collect()
}

/// `git` command line repository
#[derive(Debug, Clone)]
pub struct GitCli {
    program: PathBuf,
    dir: PathBuf,
}

impl GitCli {
    /// Open an existing checkout (bare or not)
    pub fn open(config: &GitConfig, dir: impl Into<PathBuf>) -> Result<Self> {
        let repo = Self {
            program: Self::locate(config)?,
            dir: dir.into(),
        };
        repo.run("rev-parse", ["rev-parse", "--git-dir"])?;
        Ok(repo)
    }

    /// Bare-clone `url` into `dest`
    pub fn clone_bare(config: &GitConfig, url: &str, dest: &Path) -> Result<Self> {
        validate_remote_url(url)?;
        let program = Self::locate(config)?;
        let output = Command::new(&program)
            .args([OsStr::new("clone"), OsStr::new("--bare"), OsStr::new("--quiet")])
            .arg(url)
            .arg(dest)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()?;
        if !output.status.success() {
            return Err(TrustError::Fetch {
                remote: url.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(Self {
            program,
            dir: dest.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Fetch a single refspec from `remote`
    pub fn fetch_ref(&self, remote: &str, refspec: &str) -> Result<()> {
        validate_remote_url(remote)?;
        let output = self.git(["fetch", "--no-tags", "--quiet", remote, refspec])?;
        if !output.status.success() {
            return Err(TrustError::Fetch {
                remote: remote.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    fn locate(config: &GitConfig) -> Result<PathBuf> {
        which::which(&config.program).map_err(|e| TrustError::Git {
            command: "lookup".to_string(),
            stderr: format!("{} not found: {}", config.program, e),
        })
    }

    fn git<I, S>(&self, args: I) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = Command::new(&self.program)
            .current_dir(&self.dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .args(args)
            .output()?;
        Ok(output)
    }

    /// Run a git command that must succeed and return its stdout
    fn run<I, S>(&self, command: &str, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = self.git(args)?;
        if !output.status.success() {
            return Err(TrustError::Git {
                command: command.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl GitRepository for GitCli {
    fn object_text(&self, kind: ObjectKind, id: &str) -> Result<Vec<u8>> {
        match kind {
            ObjectKind::Commit => validate_commit_id(id)?,
            ObjectKind::Tag => validate_tag_name(id)?,
        }
        let output = self.git(["cat-file", kind.as_str(), id])?;
        if !output.status.success() {
            debug!(
                kind = %kind,
                id = %id,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "git cat-file failed"
            );
            return Err(TrustError::ObjectNotFound {
                kind,
                id: id.to_string(),
            });
        }
        Ok(output.stdout)
    }

    fn tags_pointing_at(&self, commit_id: &str) -> Result<Vec<String>> {
        validate_commit_id(commit_id)?;
        let stdout = self.run("tag", ["tag", "--points-at", commit_id])?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn fetch_tags(&self, remote_url: &str, tag_names: &[String]) -> Result<()> {
        validate_remote_url(remote_url)?;
        let mut args = vec![
            "fetch".to_string(),
            "--no-tags".to_string(),
            "--quiet".to_string(),
            remote_url.to_string(),
        ];
        for name in tag_names {
            validate_tag_name(name)?;
            args.push(format!("refs/tags/{0}:refs/tags/{0}", name));
        }

        let output = self.git(&args)?;
        if !output.status.success() {
            return Err(TrustError::Fetch {
                remote: remote_url.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    fn list_remote_tags(&self, remote_url: &str) -> Result<Vec<RemoteTag>> {
        validate_remote_url(remote_url)?;
        let output = self.git(["ls-remote", "--tags", remote_url])?;
        if !output.status.success() {
            return Err(TrustError::Fetch {
                remote: remote_url.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(parse_ls_remote(&String::from_utf8_lossy(&output.stdout)))
    }
}
