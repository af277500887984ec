//! Exposes the command line application.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use flightcache_clients::db::{DbClient, SimulatedDatabase};
use flightcache_clients::types::{User, UserId};
use flightcache_clients::users::{HttpUserSource, UserDirectory, UserError, UserSource};
use futures::future;
use url::Url;

use crate::config::Config;
use crate::logging;
use crate::output::{self, OutputFormat, Outcome, Report};

/// Drives the cached clients and reports how many loads they needed.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// How to print the results.
    #[arg(long, short, global = true, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Looks up users, requesting every id twice at the same time.
    Users {
        /// The base URL of the users service.
        ///
        /// Defaults to `users_url` from the configuration file.
        #[arg(long)]
        url: Option<Url>,

        /// The ids of the users to look up.
        #[arg(required = true)]
        ids: Vec<UserId>,
    },

    /// Reads records from a simulated database that connects on first use.
    Records {
        /// Refuse this many connection attempts before accepting one.
        #[arg(long, default_value_t = 0)]
        fail_connects: usize,

        /// The ids of the records to read.
        #[arg(required = true)]
        ids: Vec<String>,
    },
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    // SAFETY: This is called at the very start of the program, before any other threads are spawned.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        flightcache::metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )
        .context("failed to configure statsd")?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("flightcli")
        .build()
        .context("failed to create tokio runtime")?;

    let report = runtime.block_on(async {
        match cli.command {
            Command::Users { url, ids } => {
                let url = url
                    .or_else(|| config.users_url.clone())
                    .context("no users service configured, pass `--url` or set `users_url`")?;
                Ok::<_, anyhow::Error>(lookup_users(url, &ids, &config).await)
            }
            Command::Records { fail_connects, ids } => {
                Ok(read_records(fail_connects, &ids, &config).await)
            }
        }
    })?;

    output::print(&report, cli.format)?;
    if report.failures() > 0 {
        tracing::warn!(
            failures = report.failures(),
            lookups = report.rows.len(),
            "Some lookups failed"
        );
    }

    Ok(())
}

/// Counts the requests that actually reach the wrapped source.
struct CountingSource<S> {
    inner: S,
    requests: Arc<AtomicUsize>,
}

#[async_trait]
impl<S: UserSource> UserSource for CountingSource<S> {
    async fn fetch_user(&self, id: UserId) -> Result<User, UserError> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.inner.fetch_user(id).await
    }
}

async fn lookup_users(url: Url, ids: &[UserId], config: &Config) -> Report {
    let requests = Arc::new(AtomicUsize::new(0));
    let source = CountingSource {
        inner: HttpUserSource::new(url),
        requests: Arc::clone(&requests),
    };
    let directory = UserDirectory::new(source, config.cache_for("users"));

    let lookups = ids
        .iter()
        .flat_map(|&id| [id, id])
        .map(|id| directory.get_user_by_id(id));
    let results = future::join_all(lookups).await;

    let mut report = Report::new("users", "requests");
    for (id, result) in ids.iter().flat_map(|&id| [id, id]).zip(&results) {
        let result = result.as_ref().map(|user| &user.name);
        report.push(id, Outcome::from(&result));
    }
    report.loads = requests.load(Ordering::Relaxed);
    report
}

async fn read_records(fail_connects: usize, ids: &[String], config: &Config) -> Report {
    let database =
        SimulatedDatabase::with_failing_connects(config.database.connect_latency, fail_connects);
    let client = DbClient::new(database.clone(), config.cache_for("database"));

    let mut report = Report::new("records", "connects");
    // every round reads all records concurrently, a refused connection fails the whole round
    for _ in 0..=fail_connects {
        let results = future::join_all(ids.iter().map(|id| client.get_record(id))).await;
        let failed = results.iter().any(Result::is_err);

        for (id, result) in ids.iter().zip(&results) {
            let result = result.as_ref().map(|record| &record.payload);
            report.push(id, Outcome::from(&result));
        }
        if !failed {
            break;
        }
    }
    report.loads = database.connects();
    report
}
