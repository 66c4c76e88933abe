// src/bin/rate_limiter_cli.rs

use prettytable::{row, Table};
use serde::Serialize;
use std::time::Duration;
use structopt::StructOpt;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use quota_backend::algorithms::{
    Decision, FixedWindow, LeakyBucket, RateLimitAlgorithm, SlidingWindow, TokenBucket,
    WindowAlgorithm,
};
use quota_backend::clock::{Clock, SystemClock};
use quota_backend::config::{InMemoryConfig, LegacyConfig, RateLimiterConfig, RedisConfig};
use quota_backend::error::RateLimiterError;
use quota_backend::legacy::{BucketRecord, LegacyBackend};
use quota_backend::storage::{
    MemoryCluster, MemoryStorage, NodeConnector, RedisConnector, RedisStorage, StorageBackend,
};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "rate_limiter_cli",
    about = "Inspect and drive store-backed rate limits"
)]
struct Opt {
    /// Redis connection URL
    #[structopt(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    /// Use a throwaway in-memory store instead of Redis
    #[structopt(long)]
    memory: bool,

    /// Key prefix of the engines
    #[structopt(long, env = "RATE_LIMIT_PREFIX", default_value = "ratelimit")]
    prefix: String,

    /// Deadline for each store round trip, in milliseconds
    #[structopt(long, default_value = "2000")]
    timeout_ms: u64,

    /// Print JSON instead of a table
    #[structopt(long)]
    json: bool,

    /// Verbosity level
    #[structopt(short, long, parse(from_occurrences))]
    verbose: usize,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Count a hit and decide
    Hit {
        #[structopt(flatten)]
        target: Target,

        /// Limit (windows) or capacity (buckets)
        #[structopt(short, long)]
        limit: u64,

        /// Hits to count, or bucket cost
        #[structopt(short, long, default_value = "1")]
        increment: u64,
    },
    /// Add to a window counter without deciding
    Inc {
        #[structopt(flatten)]
        target: Target,

        #[structopt(short, long, default_value = "1")]
        increment: u64,
    },
    /// Overwrite a window counter
    Set {
        #[structopt(flatten)]
        target: Target,

        #[structopt(short, long)]
        count: u64,
    },
    /// Read a counter or bucket level
    Get {
        #[structopt(flatten)]
        target: Target,
    },
    /// Count a hit against a legacy bucket record
    CountHit {
        #[structopt(flatten)]
        legacy: LegacyOpts,

        #[structopt(long)]
        bucket: u64,

        #[structopt(long)]
        id: String,

        #[structopt(short, long, default_value = "1")]
        increment: u64,

        /// Hit time in unix seconds; defaults to now
        #[structopt(long)]
        now: Option<u64>,
    },
    /// Read a legacy bucket record
    GetBucket {
        #[structopt(flatten)]
        legacy: LegacyOpts,

        #[structopt(long)]
        bucket: u64,

        #[structopt(long)]
        id: String,
    },
    /// Delete every legacy bucket record of an identifier
    DeleteBuckets {
        #[structopt(flatten)]
        legacy: LegacyOpts,

        #[structopt(long)]
        id: String,
    },
}

#[derive(Debug, StructOpt)]
struct Target {
    /// Engine backing the limit
    #[structopt(short, long, possible_values = &["fixed_window", "sliding_window", "token_bucket", "leaky_bucket"], default_value = "fixed_window")]
    algorithm: String,

    /// Caller key
    #[structopt(short, long)]
    key: String,

    /// Window length in seconds (windows) or rate per second (buckets)
    #[structopt(short, long)]
    scale: f64,
}

#[derive(Debug, StructOpt)]
struct LegacyOpts {
    /// Record lifetime in seconds; required
    #[structopt(long, env = "LEGACY_EXPIRY_SECS")]
    expiry_secs: Option<u64>,

    #[structopt(long, env = "LEGACY_PREFIX", default_value = "ratelimit:legacy:")]
    legacy_prefix: String,

    /// Seed nodes of a multi-node deployment (host:port); repeat for each node
    #[structopt(long = "cluster-node")]
    cluster_nodes: Vec<String>,
}

impl LegacyOpts {
    fn config(&self, timeout: Duration) -> LegacyConfig {
        LegacyConfig {
            key_prefix: self.legacy_prefix.clone(),
            expiry: self.expiry_secs.map(Duration::from_secs),
            cluster_nodes: self.cluster_nodes.clone(),
            timeout,
            ..LegacyConfig::new(Duration::ZERO)
        }
    }
}

/// What a command printed
#[derive(Debug, Default, Serialize)]
struct Report {
    operation: &'static str,
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    allowed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    record: Option<BucketRecord>,
}

impl Report {
    fn decision(key: &str, decision: Decision) -> Self {
        Self {
            operation: "hit",
            key: key.to_string(),
            allowed: Some(decision.is_allowed()),
            count: decision.count(),
            retry_after_ms: decision.retry_after().map(|d| d.as_millis() as u64),
            record: None,
        }
    }

    fn count(operation: &'static str, key: &str, count: u64) -> Self {
        Self {
            operation,
            key: key.to_string(),
            count: Some(count),
            ..Self::default()
        }
    }

    fn print(&self, json: bool) -> Result<(), Box<dyn std::error::Error>> {
        if json {
            println!("{}", serde_json::to_string_pretty(self)?);
            return Ok(());
        }

        let mut table = Table::new();
        table.add_row(row!["operation", self.operation]);
        table.add_row(row!["key", self.key]);
        if let Some(allowed) = self.allowed {
            table.add_row(row!["allowed", allowed]);
        }
        if let Some(count) = self.count {
            table.add_row(row!["count", count]);
        }
        if let Some(retry_after_ms) = self.retry_after_ms {
            table.add_row(row!["retry after (ms)", retry_after_ms]);
        }
        if let Some(record) = &self.record {
            table.add_row(row!["bucket", record.bucket]);
            table.add_row(row!["id", record.id]);
            table.add_row(row!["count", record.count]);
            table.add_row(row!["created", record.created]);
            table.add_row(row!["updated", record.updated]);
        }
        table.printstd();
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    let opt = Opt::from_args();

    let log_level = match opt.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(format!(
            "rate_limiter_cli={},quota_backend={}",
            log_level, log_level
        )))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let timeout = Duration::from_millis(opt.timeout_ms);
    let report = if opt.memory {
        info!("Using in-memory store");
        let storage = MemoryStorage::new(InMemoryConfig::default());
        let connector = MemoryCluster::new(&[], InMemoryConfig::default(), std::sync::Arc::new(SystemClock));
        run(&opt, storage, connector, timeout).await?
    } else {
        let redis_config = RedisConfig {
            url: opt.redis_url.clone(),
            connection_timeout: timeout,
        };
        info!(url = %redis_config.url, "Connecting to Redis");
        let storage = RedisStorage::new(redis_config.clone()).await?;
        run(&opt, storage, RedisConnector::new(redis_config), timeout).await?
    };

    report.print(opt.json)
}

async fn run<S, C>(
    opt: &Opt,
    storage: S,
    connector: C,
    timeout: Duration,
) -> Result<Report, RateLimiterError>
where
    S: StorageBackend,
    C: NodeConnector<S>,
{
    let config = RateLimiterConfig {
        key_prefix: opt.prefix.clone(),
        timeout,
    };

    match &opt.command {
        Command::Hit {
            target,
            limit,
            increment,
        } => {
            let decision = match target.algorithm.as_str() {
                "fixed_window" => {
                    FixedWindow::new(storage, config)
                        .hit(&target.key, window(target.scale)?, *limit, *increment)
                        .await?
                }
                "sliding_window" => {
                    SlidingWindow::new(storage, config)
                        .hit(&target.key, window(target.scale)?, *limit, *increment)
                        .await?
                }
                "token_bucket" => {
                    TokenBucket::new(storage, config)
                        .hit(&target.key, target.scale, *limit, *increment)
                        .await?
                }
                "leaky_bucket" => {
                    LeakyBucket::new(storage, config)
                        .hit(&target.key, target.scale, *limit, *increment)
                        .await?
                }
                other => return Err(unknown_algorithm(other)),
            };
            Ok(Report::decision(&target.key, decision))
        }
        Command::Inc { target, increment } => {
            let scale = window(target.scale)?;
            let count = match target.algorithm.as_str() {
                "fixed_window" => {
                    FixedWindow::new(storage, config)
                        .inc(&target.key, scale, *increment)
                        .await?
                }
                "sliding_window" => {
                    SlidingWindow::new(storage, config)
                        .inc(&target.key, scale, *increment)
                        .await?
                }
                other => return Err(window_only(other)),
            };
            Ok(Report::count("inc", &target.key, count))
        }
        Command::Set { target, count } => {
            let scale = window(target.scale)?;
            let count = match target.algorithm.as_str() {
                "fixed_window" => {
                    FixedWindow::new(storage, config)
                        .set(&target.key, scale, *count)
                        .await?
                }
                "sliding_window" => {
                    SlidingWindow::new(storage, config)
                        .set(&target.key, scale, *count)
                        .await?
                }
                other => return Err(window_only(other)),
            };
            Ok(Report::count("set", &target.key, count))
        }
        Command::Get { target } => {
            let count = match target.algorithm.as_str() {
                "fixed_window" => {
                    FixedWindow::new(storage, config)
                        .get(&target.key, window(target.scale)?)
                        .await?
                }
                "sliding_window" => {
                    SlidingWindow::new(storage, config)
                        .get(&target.key, window(target.scale)?)
                        .await?
                }
                "token_bucket" => {
                    TokenBucket::new(storage, config)
                        .get(&target.key, target.scale)
                        .await?
                }
                "leaky_bucket" => {
                    LeakyBucket::new(storage, config)
                        .get(&target.key, target.scale)
                        .await?
                }
                other => return Err(unknown_algorithm(other)),
            };
            Ok(Report::count("get", &target.key, count))
        }
        Command::CountHit {
            legacy,
            bucket,
            id,
            increment,
            now,
        } => {
            let backend =
                LegacyBackend::connect(legacy.config(timeout), storage, connector).await?;
            let now = now.unwrap_or_else(|| SystemClock.now_secs());
            let count = backend.count_hit(*bucket, id, now, *increment).await?;
            Ok(Report::count("count-hit", id, count))
        }
        Command::GetBucket { legacy, bucket, id } => {
            let backend =
                LegacyBackend::connect(legacy.config(timeout), storage, connector).await?;
            let record = backend.get_bucket(*bucket, id).await?;
            debug!(found = record.is_some(), "Bucket lookup");
            Ok(Report {
                operation: "get-bucket",
                key: id.clone(),
                record,
                ..Report::default()
            })
        }
        Command::DeleteBuckets { legacy, id } => {
            let backend =
                LegacyBackend::connect(legacy.config(timeout), storage, connector).await?;
            let deleted = backend.delete_buckets(id).await?;
            Ok(Report::count("delete-buckets", id, deleted))
        }
    }
}

fn window(seconds: f64) -> Result<Duration, RateLimiterError> {
    Duration::try_from_secs_f64(seconds)
        .map_err(|e| RateLimiterError::Config(format!("invalid window {}: {}", seconds, e)))
}

fn unknown_algorithm(name: &str) -> RateLimiterError {
    RateLimiterError::Config(format!("unknown algorithm: {}", name))
}

fn window_only(name: &str) -> RateLimiterError {
    RateLimiterError::Config(format!("{} has no window counter to update", name))
}
