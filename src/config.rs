//! Command-line surface and the resolved, immutable configuration derived
//! from it. Every flag is additionally readable from a `TRAFFICMIRROR_*`
//! environment variable via clap's `env` feature, the same derive-plus-env
//! shape the rest of the workspace uses for its service binaries.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::error::{MirrorError, Result};

/// Raw CLI arguments, parsed with `clap::Parser`. See [`ProxyConfig`] for the
/// resolved form consumed by the rest of the crate.
#[derive(Parser, Debug)]
#[command(
    name = "trafficmirror",
    version,
    about = "HTTP proxy that forwards to a main endpoint and mirrors requests to additional targets"
)]
pub struct Cli {
    /// Address to listen on and mirror traffic from.
    #[arg(long, env = "TRAFFICMIRROR_LISTEN", default_value = ":8080")]
    pub listen: String,

    /// Main proxy target; its responses are returned to the client.
    #[arg(
        long = "main",
        env = "TRAFFICMIRROR_MAIN",
        default_value = "http://localhost:8888"
    )]
    pub main: String,

    /// Path on which mirror targets can be added/deleted/listed via PUT, DELETE and GET.
    #[arg(long, env = "TRAFFICMIRROR_TARGETS", default_value = "targets")]
    pub targets: String,

    /// Address on which the targets endpoint is exposed. Leave empty to share
    /// the address being mirrored.
    #[arg(long = "targets-address", env = "TRAFFICMIRROR_TARGETS_ADDRESS", default_value = "")]
    pub targets_address: String,

    /// Username protecting the targets endpoint.
    #[arg(long, env = "TRAFFICMIRROR_USERNAME")]
    pub username: Option<String>,

    /// Password protecting the targets endpoint.
    #[arg(long, env = "TRAFFICMIRROR_PASSWORD")]
    pub password: Option<String>,

    /// File containing a single `username:password` line, used instead of
    /// `--username`/`--password`.
    #[arg(long = "password-file", env = "TRAFFICMIRROR_PASSWORD_FILE")]
    pub password_file: Option<PathBuf>,

    /// Remove a target when it has been failing for this many minutes.
    #[arg(long = "fail-after", env = "TRAFFICMIRROR_FAIL_AFTER", default_value_t = 30)]
    pub fail_after: u64,

    /// After 5 successive failures a target is disabled; retried after this many minutes.
    #[arg(long = "retry-after", env = "TRAFFICMIRROR_RETRY_AFTER", default_value_t = 1)]
    pub retry_after: u64,

    /// Maximum amount of requests queued per mirror.
    #[arg(
        long = "max-queued-requests",
        env = "TRAFFICMIRROR_MAX_QUEUED_REQUESTS",
        default_value_t = 500
    )]
    pub max_queued_requests: usize,

    /// Delay delivery to the main target, letting slower mirrors catch up
    /// and increase discovered parallelism.
    #[arg(
        long = "main-target-delay-ms",
        env = "TRAFFICMIRROR_MAIN_TARGET_DELAY_MS",
        default_value_t = 0
    )]
    pub main_target_delay_ms: u64,

    /// Start with mirroring traffic to the provided targets (persistent, never auto-evicted).
    #[arg(long = "mirror", env = "TRAFFICMIRROR_MIRROR", value_delimiter = ',')]
    pub mirror: Vec<String>,

    /// Print more verbose logging; repeatable (-v, -vv, -vvv).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Resolved `(username, password)` pair gating the targets endpoint.
/// Absent when no auth was configured.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Resolves credentials from either a password file or inline
    /// username/password flags. Returns `Ok(None)` when neither is set.
    pub fn resolve(cli: &Cli) -> Result<Option<Self>> {
        if let Some(path) = &cli.password_file {
            let data = fs::read_to_string(path).map_err(|source| MirrorError::PasswordFile {
                path: path.display().to_string(),
                source,
            })?;
            let trimmed = data.trim_end_matches(['\n', '\r']);
            let (username, password) =
                trimmed
                    .split_once(':')
                    .ok_or_else(|| MirrorError::PasswordFileFormat {
                        path: path.display().to_string(),
                    })?;
            return Ok(Some(Credentials {
                username: username.to_string(),
                password: password.to_string(),
            }));
        }

        match (&cli.username, &cli.password) {
            (Some(username), Some(password)) => Ok(Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            })),
            _ => Ok(None),
        }
    }
}

/// Confirms `raw` parses as an absolute URL (scheme + host), the shape every
/// `--main`/`--mirror` target must have since it is later concatenated with
/// a request's path and query.
fn validate_target_url(raw: &str) -> Result<()> {
    url::Url::parse(raw)
        .map(|_| ())
        .map_err(|source| MirrorError::InvalidUrl {
            url: raw.to_string(),
            source,
        })
}

/// Fully resolved, immutable configuration for the life of the process.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen: String,
    pub main_target: String,
    pub targets_endpoint: String,
    pub targets_address: Option<String>,
    pub credentials: Option<Credentials>,
    pub persistent_failure_timeout: Duration,
    pub retry_after: Duration,
    pub max_queued_requests: usize,
    pub main_target_delay: Duration,
    pub initial_mirrors: Vec<String>,
    /// Optional ceiling on buffered inbound request bodies. Disabled
    /// (`None`) by default, matching the original's unbounded buffering;
    /// no CLI flag sets this today, it exists for embedders of the library.
    pub max_body_bytes: Option<usize>,
    pub verbosity: u8,
}

impl ProxyConfig {
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let credentials = Credentials::resolve(&cli)?;
        let targets_address = if cli.targets_address.is_empty() {
            None
        } else {
            Some(cli.targets_address)
        };

        validate_target_url(&cli.main)?;
        for mirror in &cli.mirror {
            validate_target_url(mirror)?;
        }

        Ok(Self {
            listen: cli.listen,
            main_target: cli.main,
            targets_endpoint: cli.targets,
            targets_address,
            credentials,
            persistent_failure_timeout: Duration::from_secs(cli.fail_after * 60),
            retry_after: Duration::from_secs(cli.retry_after * 60),
            max_queued_requests: cli.max_queued_requests,
            main_target_delay: Duration::from_millis(cli.main_target_delay_ms),
            initial_mirrors: cli.mirror,
            max_body_bytes: None,
            verbosity: cli.verbose,
        })
    }

    /// Maps the repeated `-v` count onto a `tracing_subscriber::EnvFilter`
    /// directive, the same 0/1/2/3+ step the original mapped onto zerolog
    /// levels, with `RUST_LOG` still honored as an override.
    pub fn default_log_directive(&self) -> &'static str {
        match self.verbosity {
            0 => "error",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}
