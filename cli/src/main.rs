//! Keygate CLI - signature trust checks from the command line
//!
//! Runs the same trust search as the dispatcher against a local checkout,
//! verifies single objects, and shows what would be handed to gpg.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use reqwest::blocking::Client;
use serde::Serialize;

use keygate_engine::config::AppConfig;
use keygate_engine::logging::init_logging;
use keygate_engine::models::{
    CommitStatus, HealthResponse, HealthStatus, PullRequestContext, TrustVerdict,
};
use keygate_engine::{
    object, ForkTagPolicy, GitCli, GitHubClient, GitRepository, GpgBackend, GpgConfig, Keyring,
    ObjectKind, ResolverOptions, TracingObserver, TrustResolver, TrustSearchResult, Verifier,
};

/// Exit code for a trusted commit or verified object
const EXIT_TRUSTED: u8 = 0;
/// Exit code when no good signature was found
const EXIT_UNTRUSTED: u8 = 1;
/// Exit code when trust could not be determined
const EXIT_UNDETERMINED: u8 = 2;

/// Keygate CLI - Check that git commits carry a trusted signature
#[derive(Parser)]
#[command(name = "keygate")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Signature trust checks for git commits and tags", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides it
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a commit, falling back to the tags that point at it
    Check {
        /// Repository checkout
        #[arg(short, long, default_value = ".")]
        repo: PathBuf,

        /// Commit id
        commit: String,

        /// API URL of the pull request the commit belongs to
        #[arg(long)]
        pull_request: Option<String>,

        #[command(flatten)]
        keys: KeyArgs,

        /// Continue with local tags when fork tag discovery fails
        #[arg(long)]
        skip_fork_failures: bool,

        /// Statuses API URL to publish the verdict to
        #[arg(long)]
        post_status: Option<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        output: OutputFormat,
    },

    /// Verify a single commit or tag without any fallback
    Object {
        /// Repository checkout
        #[arg(short, long, default_value = ".")]
        repo: PathBuf,

        /// Object kind
        #[arg(short, long, value_enum)]
        kind: KindArg,

        /// Commit id or tag name
        id: String,

        #[command(flatten)]
        keys: KeyArgs,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        output: OutputFormat,
    },

    /// Print the signed payload and signature of a raw object
    Parse {
        /// Object kind
        #[arg(short, long, value_enum)]
        kind: KindArg,

        /// Raw object file (`git cat-file <kind> <id>` output); stdin when absent or `-`
        file: Option<PathBuf>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        output: OutputFormat,
    },

    /// Get dispatcher health status
    Health {
        /// Dispatcher URL
        #[arg(short, long, default_value = "http://127.0.0.1:8080")]
        api_url: String,
    },
}

#[derive(clap::Args)]
struct KeyArgs {
    /// Persistent keyring to verify against (no downloads)
    #[arg(long)]
    keyring: Option<PathBuf>,

    /// Download missing public keys into the temporary keyring [default: gpg.allow_key_download]
    #[arg(long, overrides_with = "no_download_keys")]
    download_keys: bool,

    /// Never download public keys
    #[arg(long, overrides_with = "download_keys")]
    no_download_keys: bool,
}

impl KeyArgs {
    /// Whether missing keys may be downloaded, falling back to the configuration
    fn allow_download(&self, gpg: &GpgConfig) -> bool {
        if self.no_download_keys {
            false
        } else {
            self.download_keys || gpg.allow_key_download
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum KindArg {
    Commit,
    Tag,
}

impl From<KindArg> for ObjectKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Commit => ObjectKind::Commit,
            KindArg::Tag => ObjectKind::Tag,
        }
    }
}

/// JSON report of a trust search
#[derive(Serialize)]
struct CheckReport<'a> {
    commit: &'a str,
    verdict: &'static str,
    #[serde(flatten)]
    result: Option<&'a TrustSearchResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("{} {:#}", "error:".red().bold(), err);
            ExitCode::from(EXIT_UNDETERMINED)
        }
    }
}

fn run(cli: Cli) -> Result<u8> {
    init_logging(&cli.log_level, None)?;

    match cli.command {
        Commands::Check {
            repo,
            commit,
            pull_request,
            keys,
            skip_fork_failures,
            post_status,
            output,
        } => {
            let config = AppConfig::load()?;
            let repo = GitCli::open(&config.git, &repo)
                .with_context(|| format!("Not a git repository: {}", repo.display()))?;
            let github = GitHubClient::new(config.github.clone())?;
            let keyring = select_keyring(&keys, &config)?;
            let verifier = Verifier::new(GpgBackend::new(&config.gpg)?)
                .with_observer(Arc::new(TracingObserver));

            let fork_tag_failures = if skip_fork_failures {
                ForkTagPolicy::Skip
            } else {
                config.dispatcher.fork_tag_failures
            };
            let resolver = TrustResolver::new(&repo, &github, &verifier)
                .with_options(ResolverOptions { fork_tag_failures });

            let pull_request = pull_request.map(PullRequestContext::new);
            let outcome = resolver.resolve(
                &commit,
                pull_request.as_ref(),
                &keyring,
                keys.allow_download(&config.gpg),
            );

            let context = config.github.status_context.as_str();
            let (status, code) = match &outcome {
                Ok(result) => {
                    let verdict = result.verdict();
                    let code = verdict_exit_code(&verdict);
                    (CommitStatus::from_verdict(&verdict, context), code)
                }
                Err(err) => (CommitStatus::undetermined(err, context), EXIT_UNDETERMINED),
            };

            match output {
                OutputFormat::Json => {
                    let report = match &outcome {
                        Ok(result) => CheckReport {
                            commit: &commit,
                            verdict: result.verdict().as_str(),
                            result: Some(result),
                            error: None,
                        },
                        Err(err) => CheckReport {
                            commit: &commit,
                            verdict: "undetermined",
                            result: None,
                            error: Some(err.to_string()),
                        },
                    };
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
                OutputFormat::Text => {
                    let line = format!("{} {}", commit, status.description);
                    match code {
                        EXIT_TRUSTED => println!("{} {}", "✓".green(), line),
                        EXIT_UNTRUSTED => println!("{} {}", "✗".red(), line),
                        _ => println!("{} {}", "!".yellow(), line),
                    }
                }
            }

            if let Some(statuses_url) = post_status {
                github
                    .post_commit_status(&statuses_url, &status)
                    .context("Failed to publish commit status")?;
                eprintln!("{} {}", "Status posted:".cyan(), status.state.as_str());
            }

            Ok(code)
        }

        Commands::Object {
            repo,
            kind,
            id,
            keys,
            output,
        } => {
            let config = AppConfig::load()?;
            let kind = ObjectKind::from(kind);
            let repo = GitCli::open(&config.git, &repo)
                .with_context(|| format!("Not a git repository: {}", repo.display()))?;
            let keyring = select_keyring(&keys, &config)?;
            let verifier = Verifier::new(GpgBackend::new(&config.gpg)?)
                .with_observer(Arc::new(TracingObserver));

            let text = repo.object_text(kind, &id)?;
            let outcome =
                verifier.verify_object(kind, &id, &text, &keyring, keys.allow_download(&config.gpg))?;

            match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&outcome)?),
                OutputFormat::Text => match outcome.key_id() {
                    Some(key_id) => println!("{} {} {} signed by key {}", "✓".green(), kind, id, key_id),
                    None if outcome.any_signature_present() => println!(
                        "{} {} {} has a signature that could not be verified",
                        "✗".red(),
                        kind,
                        id
                    ),
                    None => println!("{} {} {} is not signed", "✗".red(), kind, id),
                },
            }

            Ok(if outcome.is_verified() {
                EXIT_TRUSTED
            } else {
                EXIT_UNTRUSTED
            })
        }

        Commands::Parse { kind, file, output } => {
            let kind = ObjectKind::from(kind);
            let text = read_input(file.as_deref())?;

            let Some(signed) = object::parse(kind, &text)? else {
                match output {
                    OutputFormat::Json => println!("null"),
                    OutputFormat::Text => println!("{} {} is not signed", "✗".red(), kind),
                }
                return Ok(EXIT_UNTRUSTED);
            };

            match output {
                OutputFormat::Json => {
                    let json = serde_json::json!({
                        "payload": String::from_utf8_lossy(&signed.payload),
                        "signature": String::from_utf8_lossy(&signed.signature),
                    });
                    println!("{}", serde_json::to_string_pretty(&json)?);
                }
                OutputFormat::Text => {
                    // Raw bytes: the payload need not be UTF-8
                    let mut stdout = std::io::stdout().lock();
                    writeln!(stdout, "{}", "PAYLOAD:".bright_green().bold())?;
                    stdout.write_all(&signed.payload)?;
                    writeln!(stdout, "{}", "=".repeat(60).bright_blue())?;
                    writeln!(stdout, "{}", "SIGNATURE:".bright_green().bold())?;
                    stdout.write_all(&signed.signature)?;
                }
            }
            Ok(EXIT_TRUSTED)
        }

        Commands::Health { api_url } => {
            let client = Client::new();
            let response = client
                .get(format!("{}/health", api_url.trim_end_matches('/')))
                .send()
                .context("Failed to get health")?;

            if !response.status().is_success() {
                anyhow::bail!("Health check failed: {}", response.status());
            }

            let health: HealthResponse = response.json().context("Failed to parse response")?;

            println!("{}", "Keygate Dispatcher Status".bright_cyan().bold());
            println!("{}", "=".repeat(40).bright_blue());
            println!(
                "{} {}",
                "Status:".cyan(),
                match health.status {
                    HealthStatus::Healthy => "healthy".green(),
                    HealthStatus::Degraded => "degraded".yellow(),
                }
            );
            println!("{} {}", "Version:".cyan(), health.version);
            println!("{} {}s", "Uptime:".cyan(), health.uptime_seconds);
            println!("{} {}", "Queued Checks:".cyan(), health.queued_checks);
            println!("{} {}", "Completed Checks:".cyan(), health.completed_checks);

            Ok(match health.status {
                HealthStatus::Healthy => EXIT_TRUSTED,
                HealthStatus::Degraded => EXIT_UNTRUSTED,
            })
        }
    }
}

fn verdict_exit_code(verdict: &TrustVerdict) -> u8 {
    match verdict {
        TrustVerdict::Trusted { .. } => EXIT_TRUSTED,
        TrustVerdict::Unverified | TrustVerdict::Unsigned => EXIT_UNTRUSTED,
    }
}

/// Keyring from `--keyring`, else the configured one, else a fresh temporary keyring
fn select_keyring(keys: &KeyArgs, config: &AppConfig) -> Result<Keyring> {
    let keyring = match keys.keyring.as_ref().or(config.gpg.keyring.as_ref()) {
        Some(path) => {
            if keys.download_keys {
                eprintln!(
                    "{} key download is disabled for persistent keyring {}",
                    "warning:".yellow().bold(),
                    path.display()
                );
            }
            Keyring::persistent(path)
        }
        None => Keyring::temporary().context("Failed to create temporary keyring")?,
    };
    Ok(keyring)
}

fn read_input(file: Option<&Path>) -> Result<Vec<u8>> {
    match file {
        Some(path) if path != Path::new("-") => fs::read(path)
            .with_context(|| format!("Failed to read object file: {}", path.display())),
        _ => {
            let mut text = Vec::new();
            std::io::stdin()
                .read_to_end(&mut text)
                .context("Failed to read object from stdin")?;
            Ok(text)
        }
    }
}
