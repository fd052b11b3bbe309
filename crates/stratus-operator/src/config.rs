//! Command line and runtime configuration
//!
//! Every flag has an environment fallback so the operator can be configured
//! from a container spec alone.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use stratus_cluster::LifecycleConfig;
use stratus_common::wait::{PollConfig, RETRY_INTERVAL, RETRY_TIMEOUT};

use crate::envelope::Intent;

/// Default NATS server
pub const DEFAULT_NATS_URL: &str = "nats://127.0.0.1:4222";

/// Default JetStream stream holding every intent
pub const DEFAULT_STREAM: &str = "STRATUS_OPERATIONS";

/// Default subject prefix
pub const DEFAULT_SUBJECT_PREFIX: &str = "stratus";

/// Stratus operator - provisions, upgrades and deletes Kubernetes clusters
/// across clouds from a durable operation queue
#[derive(Parser, Debug)]
#[command(name = "stratus-operator", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Operator subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Consume operations until interrupted
    Run(RunArgs),
    /// Publish an operation envelope
    Enqueue(EnqueueArgs),
}

/// Connection to the queue
#[derive(Args, Debug, Clone)]
pub struct NatsArgs {
    /// NATS server URL
    #[arg(long, env = "STRATUS_NATS_URL", default_value = DEFAULT_NATS_URL)]
    pub nats_url: String,

    /// JetStream stream name
    #[arg(long, env = "STRATUS_STREAM", default_value = DEFAULT_STREAM)]
    pub stream: String,

    /// Subject prefix; intents are published on `<prefix>.<intent>`
    #[arg(long, env = "STRATUS_SUBJECT_PREFIX", default_value = DEFAULT_SUBJECT_PREFIX)]
    pub subject_prefix: String,

    /// Seconds a delivered message may stay unacknowledged before redelivery
    #[arg(long, env = "STRATUS_ACK_WAIT", default_value_t = 600)]
    pub ack_wait_secs: u64,
}

/// Where records live
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process memory; lost on exit
    Memory,
    /// JSON files under `--store-dir`
    #[default]
    File,
}

/// Arguments of `run`
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Queue connection
    #[command(flatten)]
    pub nats: NatsArgs,

    /// Concurrent workers per intent
    #[arg(long, env = "STRATUS_WORKERS", default_value_t = 2)]
    pub workers: usize,

    /// Record store backend
    #[arg(long, env = "STRATUS_STORE", value_enum, default_value_t = StoreBackend::File)]
    pub store: StoreBackend,

    /// Root directory of the file store
    #[arg(long, env = "STRATUS_STORE_DIR", default_value = "/var/lib/stratus")]
    pub store_dir: PathBuf,

    /// Keep the resources of clusters that fail to provision
    #[arg(long, env = "STRATUS_PRESERVE_FAILED")]
    pub preserve_failed: bool,

    /// Register the simulated connector for every provider
    #[arg(long, env = "STRATUS_SIMULATE")]
    pub simulate: bool,

    /// Mirror operation progress to `<cluster>-<owner>` on NATS
    #[arg(long, env = "STRATUS_MIRROR_LOGS")]
    pub mirror_logs: bool,

    /// Seconds between checks while waiting on the cloud
    #[arg(long, env = "STRATUS_POLL_INTERVAL", default_value_t = RETRY_INTERVAL.as_secs())]
    pub poll_interval_secs: u64,

    /// Seconds before a cloud wait gives up
    #[arg(long, env = "STRATUS_POLL_TIMEOUT", default_value_t = RETRY_TIMEOUT.as_secs())]
    pub poll_timeout_secs: u64,

    /// Emit human-readable logs instead of JSON
    #[arg(long, env = "STRATUS_LOG_TEXT")]
    pub log_text: bool,
}

impl RunArgs {
    /// Consumer settings
    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            workers: self.workers.max(1),
            ..ConsumerConfig::from(&self.nats)
        }
    }

    /// Lifecycle settings
    pub fn lifecycle_config(&self) -> LifecycleConfig {
        let poll = PollConfig::new(
            Duration::from_secs(self.poll_interval_secs.max(1)),
            Duration::from_secs(self.poll_timeout_secs),
        );
        LifecycleConfig {
            preserve_failed: self.preserve_failed,
            poll,
            control_plane_poll: poll,
        }
    }
}

/// Arguments of `enqueue`
#[derive(Args, Debug, Clone)]
pub struct EnqueueArgs {
    /// Queue connection
    #[command(flatten)]
    pub nats: NatsArgs,

    /// What the operation asks for
    #[arg(value_enum)]
    pub intent: Intent,

    /// ID of an operation record already in the store
    pub operation_id: String,
}

/// Queue consumer settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// NATS server URL
    pub nats_url: String,
    /// JetStream stream name
    pub stream: String,
    /// Subject prefix
    pub subject_prefix: String,
    /// Ack window before redelivery
    pub ack_wait: Duration,
    /// Concurrent workers per intent
    pub workers: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            nats_url: DEFAULT_NATS_URL.to_string(),
            stream: DEFAULT_STREAM.to_string(),
            subject_prefix: DEFAULT_SUBJECT_PREFIX.to_string(),
            ack_wait: Duration::from_secs(600),
            workers: 2,
        }
    }
}

impl From<&NatsArgs> for ConsumerConfig {
    fn from(args: &NatsArgs) -> Self {
        Self {
            nats_url: args.nats_url.clone(),
            stream: args.stream.clone(),
            subject_prefix: args.subject_prefix.clone(),
            ack_wait: Duration::from_secs(args.ack_wait_secs),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("stratus-operator").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_run_defaults() {
        let Commands::Run(args) = parse(&["run"]).command else {
            panic!("expected run");
        };
        assert_eq!(args.store, StoreBackend::File);
        assert!(!args.preserve_failed);
        assert_eq!(args.consumer_config(), ConsumerConfig::default());

        let lifecycle = args.lifecycle_config();
        assert_eq!(lifecycle.poll, PollConfig::default());
        assert!(!lifecycle.preserve_failed);
    }

    #[test]
    fn test_run_flags() {
        let Commands::Run(args) = parse(&[
            "run",
            "--store",
            "memory",
            "--preserve-failed",
            "--simulate",
            "--workers",
            "0",
            "--poll-interval-secs",
            "5",
            "--poll-timeout-secs",
            "60",
            "--nats-url",
            "nats://queue:4222",
        ])
        .command
        else {
            panic!("expected run");
        };
        assert_eq!(args.store, StoreBackend::Memory);
        assert!(args.simulate);

        let consumer = args.consumer_config();
        assert_eq!(consumer.workers, 1);
        assert_eq!(consumer.nats_url, "nats://queue:4222");

        let lifecycle = args.lifecycle_config();
        assert!(lifecycle.preserve_failed);
        assert_eq!(lifecycle.poll.interval, Duration::from_secs(5));
        assert_eq!(lifecycle.control_plane_poll.timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_enqueue_parses_intent() {
        let Commands::Enqueue(args) = parse(&["enqueue", "retry-cluster", "op-42"]).command else {
            panic!("expected enqueue");
        };
        assert_eq!(args.intent, Intent::RetryCluster);
        assert_eq!(args.operation_id, "op-42");
        assert_eq!(args.nats.subject_prefix, DEFAULT_SUBJECT_PREFIX);
    }

    #[test]
    fn test_unknown_intent_rejected() {
        let result = Cli::try_parse_from(["stratus-operator", "enqueue", "resize-cluster", "op"]);
        assert!(result.is_err());
    }
}
