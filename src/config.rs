use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use argh::FromArgs;

use crate::error::{RelayError, Result};

pub const UPSTREAM_URL: &str = "https://ncsmusic.s3.eu-west-1.amazonaws.com/tracks/000/001/759/invincible-sped-up-1727366457-RfLWTl9BNp.mp3";
pub const SEARCH_ENDPOINT: &str = "https://ncs.io/music-search";
pub const LISTEN_ADDR: &str = "0.0.0.0:8080";

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8192;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 150;
pub const DEFAULT_BLOCK_TIMEOUT_MS: u64 = 50;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(FromArgs, Debug)]
/// Live audio relay: fetches one upstream stream and rebroadcasts it to every listener.
pub struct Args {
    /// upstream audio url to relay
    #[argh(option, short = 'u')]
    pub upstream_url: Option<String>,
    /// address to listen on (default 0.0.0.0:8080)
    #[argh(option, short = 'l')]
    pub listen: Option<String>,
    /// per-listener queue capacity in chunks (default 100)
    #[argh(option, short = 'q')]
    pub queue_capacity: Option<usize>,
    /// upstream read buffer size in bytes (default 8192)
    #[argh(option, short = 'b')]
    pub read_buffer_size: Option<usize>,
    /// upstream poll interval in milliseconds (default 150)
    #[argh(option, short = 'p')]
    pub poll_interval: Option<u64>,
    /// policy for full listener queues: drop-oldest, drop-newest or block (default drop-oldest)
    #[argh(option)]
    pub backpressure: Option<BackpressureKind>,
    /// how long the block policy waits for queue space, in milliseconds (default 50)
    #[argh(option)]
    pub block_timeout: Option<u64>,
    /// keep the upstream download running when the last listener leaves
    #[argh(switch)]
    pub keep_running_idle: bool,
    /// maximum number of concurrent listeners (unlimited when unset)
    #[argh(option)]
    pub max_listeners: Option<usize>,
    /// upstream connect timeout in seconds (default 10)
    #[argh(option)]
    pub connect_timeout: Option<u64>,
    /// third-party search endpoint used by /search
    #[argh(option)]
    pub search_endpoint: Option<String>,
}

/// Names accepted on the command line for the backpressure policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackpressureKind {
    DropOldest,
    DropNewest,
    Block,
}

impl FromStr for BackpressureKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop-oldest" | "oldest" => Ok(Self::DropOldest),
            "drop-newest" | "newest" => Ok(Self::DropNewest),
            "block" | "block-with-timeout" => Ok(Self::Block),
            other => Err(format!(
                "unknown backpressure policy '{other}' (expected drop-oldest, drop-newest or block)"
            )),
        }
    }
}

/// What a listener's queue does when a chunk arrives and it is already full.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum BackpressurePolicy {
    /// Evict the oldest queued chunk to make room.
    #[default]
    DropOldest,
    /// Discard the incoming chunk.
    DropNewest,
    /// Wait up to the timeout for space, then discard the incoming chunk.
    BlockWithTimeout(Duration),
}

impl fmt::Display for BackpressurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DropOldest => f.write_str("drop-oldest"),
            Self::DropNewest => f.write_str("drop-newest"),
            Self::BlockWithTimeout(timeout) => write!(f, "block({}ms)", timeout.as_millis()),
        }
    }
}

/// What happens to a running broadcast session once it has no listeners.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum IdlePolicy {
    #[default]
    Stop,
    KeepRunning,
}

impl fmt::Display for IdlePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stop => f.write_str("stop"),
            Self::KeepRunning => f.write_str("keep-running"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub upstream_url: String,
    pub listen_addr: SocketAddr,
    pub queue_capacity: usize,
    pub read_buffer_size: usize,
    pub poll_interval: Duration,
    pub backpressure: BackpressurePolicy,
    pub idle_policy: IdlePolicy,
    pub max_listeners: Option<usize>,
    pub connect_timeout: Duration,
    pub search_endpoint: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            upstream_url: UPSTREAM_URL.to_string(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            backpressure: BackpressurePolicy::DropOldest,
            idle_policy: IdlePolicy::Stop,
            max_listeners: None,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            search_endpoint: SEARCH_ENDPOINT.to_string(),
        }
    }
}

impl RelayConfig {
    /// Checks the invariants the relay relies on.
    pub fn validate(&self) -> Result<()> {
        reqwest::Url::parse(&self.upstream_url)
            .map_err(|e| RelayError::Config(format!("upstream url '{}': {e}", self.upstream_url)))?;
        reqwest::Url::parse(&self.search_endpoint).map_err(|e| {
            RelayError::Config(format!("search endpoint '{}': {e}", self.search_endpoint))
        })?;
        if self.queue_capacity == 0 {
            return Err(RelayError::Config("queue capacity must be at least 1".into()));
        }
        if self.read_buffer_size == 0 {
            return Err(RelayError::Config("read buffer size must be at least 1".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(RelayError::Config("poll interval must be non-zero".into()));
        }
        if self.max_listeners == Some(0) {
            return Err(RelayError::Config("max listeners must be at least 1".into()));
        }
        Ok(())
    }
}

impl TryFrom<Args> for RelayConfig {
    type Error = RelayError;

    fn try_from(args: Args) -> Result<Self> {
        let defaults = RelayConfig::default();
        let listen = args.listen.unwrap_or_else(|| LISTEN_ADDR.to_string());
        let listen_addr = listen
            .parse::<SocketAddr>()
            .map_err(|e| RelayError::Config(format!("listen address '{listen}': {e}")))?;
        let block_timeout =
            Duration::from_millis(args.block_timeout.unwrap_or(DEFAULT_BLOCK_TIMEOUT_MS));
        let backpressure = match args.backpressure.unwrap_or(BackpressureKind::DropOldest) {
            BackpressureKind::DropOldest => BackpressurePolicy::DropOldest,
            BackpressureKind::DropNewest => BackpressurePolicy::DropNewest,
            BackpressureKind::Block => BackpressurePolicy::BlockWithTimeout(block_timeout),
        };

        let config = RelayConfig {
            upstream_url: args.upstream_url.unwrap_or(defaults.upstream_url),
            listen_addr,
            queue_capacity: args.queue_capacity.unwrap_or(defaults.queue_capacity),
            read_buffer_size: args.read_buffer_size.unwrap_or(defaults.read_buffer_size),
            poll_interval: args
                .poll_interval
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            backpressure,
            idle_policy: if args.keep_running_idle {
                IdlePolicy::KeepRunning
            } else {
                IdlePolicy::Stop
            },
            max_listeners: args.max_listeners,
            connect_timeout: args
                .connect_timeout
                .map(Duration::from_secs)
                .unwrap_or(defaults.connect_timeout),
            search_endpoint: args.search_endpoint.unwrap_or(defaults.search_endpoint),
        };
        config.validate()?;
        Ok(config)
    }
}
