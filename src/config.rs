//! Configuration for the courier bridge server.
//!
//! CLI arguments take precedence over environment variables, which take
//! precedence over the built-in defaults.

use std::time::Duration;

use clap::Parser;

pub const DEFAULT_BIND: &str = "0.0.0.0:8081";
pub const DEFAULT_MAX_TTL_SECS: u64 = 300;
pub const DEFAULT_MAX_MESSAGES: usize = 1_000;
pub const DEFAULT_MAX_QUEUE_BYTES: usize = 4 * 1024 * 1024;
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 256 * 1024;
pub const DEFAULT_HEARTBEAT_SECS: u64 = 10;
pub const DEFAULT_SWEEP_SECS: u64 = 30;
pub const DEFAULT_POLL_TIMEOUT_SECS: u64 = 25;
/// Hard ceiling for caller-supplied long-poll timeouts.
pub const MAX_POLL_TIMEOUT_SECS: u64 = 60;

/// Store-and-forward message bridge.
///
/// Senders POST opaque payloads addressed to a 64-hex recipient id;
/// recipients receive them over SSE or long poll within a bounded TTL.
#[derive(Parser, Debug, Default)]
#[command(name = "courier", version, about)]
pub struct Cli {
    /// HTTP bind address [env: COURIER_BIND] [default: 0.0.0.0:8081]
    #[arg(long, short = 'b')]
    pub bind: Option<String>,

    /// Maximum accepted message TTL in seconds [env: COURIER_MAX_TTL_SECS]
    #[arg(long)]
    pub max_ttl_secs: Option<u64>,

    /// Maximum queued messages per recipient [env: COURIER_MAX_MESSAGES]
    #[arg(long)]
    pub max_messages: Option<usize>,

    /// Maximum queued bytes per recipient [env: COURIER_MAX_QUEUE_BYTES]
    #[arg(long)]
    pub max_queue_bytes: Option<usize>,

    /// Maximum payload size per message [env: COURIER_MAX_PAYLOAD_BYTES]
    #[arg(long)]
    pub max_payload_bytes: Option<usize>,

    /// Seconds between SSE heartbeat frames [env: COURIER_HEARTBEAT_SECS]
    #[arg(long)]
    pub heartbeat_secs: Option<u64>,

    /// Seconds between expiry sweeps [env: COURIER_SWEEP_SECS]
    #[arg(long)]
    pub sweep_secs: Option<u64>,

    /// Clock correction offset in milliseconds, applied to the system clock
    /// [env: COURIER_CLOCK_OFFSET_MS]
    #[arg(long)]
    pub clock_offset_ms: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub max_ttl: Duration,
    pub max_messages: usize,
    pub max_queue_bytes: usize,
    pub max_payload_bytes: usize,
    pub heartbeat: Duration,
    pub sweep_interval: Duration,
    pub default_poll_timeout: Duration,
    pub clock_offset_ms: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND.to_string(),
            max_ttl: Duration::from_secs(DEFAULT_MAX_TTL_SECS),
            max_messages: DEFAULT_MAX_MESSAGES,
            max_queue_bytes: DEFAULT_MAX_QUEUE_BYTES,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            heartbeat: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_SECS),
            default_poll_timeout: Duration::from_secs(DEFAULT_POLL_TIMEOUT_SECS),
            clock_offset_ms: 0,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}

impl Config {
    pub fn from_cli_and_env(cli: Cli) -> Self {
        let defaults = Config::default();

        let bind_addr = cli
            .bind
            .or_else(|| std::env::var("COURIER_BIND").ok())
            .unwrap_or(defaults.bind_addr);

        let max_ttl_secs = cli
            .max_ttl_secs
            .or_else(|| env_parse("COURIER_MAX_TTL_SECS"))
            .unwrap_or(DEFAULT_MAX_TTL_SECS);

        let max_messages = cli
            .max_messages
            .or_else(|| env_parse("COURIER_MAX_MESSAGES"))
            .unwrap_or(defaults.max_messages);

        let max_queue_bytes = cli
            .max_queue_bytes
            .or_else(|| env_parse("COURIER_MAX_QUEUE_BYTES"))
            .unwrap_or(defaults.max_queue_bytes);

        let max_payload_bytes = cli
            .max_payload_bytes
            .or_else(|| env_parse("COURIER_MAX_PAYLOAD_BYTES"))
            .unwrap_or(defaults.max_payload_bytes);

        let heartbeat_secs = cli
            .heartbeat_secs
            .or_else(|| env_parse("COURIER_HEARTBEAT_SECS"))
            .unwrap_or(DEFAULT_HEARTBEAT_SECS);

        let sweep_secs = cli
            .sweep_secs
            .or_else(|| env_parse("COURIER_SWEEP_SECS"))
            .unwrap_or(DEFAULT_SWEEP_SECS);

        let clock_offset_ms = cli
            .clock_offset_ms
            .or_else(|| env_parse("COURIER_CLOCK_OFFSET_MS"))
            .unwrap_or(0);

        Self {
            bind_addr,
            max_ttl: Duration::from_secs(max_ttl_secs),
            max_messages,
            max_queue_bytes,
            max_payload_bytes,
            heartbeat: Duration::from_secs(heartbeat_secs),
            sweep_interval: Duration::from_secs(sweep_secs),
            default_poll_timeout: defaults.default_poll_timeout,
            clock_offset_ms,
        }
    }
}
