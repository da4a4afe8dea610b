use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

/// CLI arguments for the relay server.
#[derive(Parser, Debug, Clone)]
#[command(name = "huddles")]
#[command(about = "Huddle signalling relay")]
#[command(version)]
pub struct Args {
    /// Socket address to listen on.
    #[arg(long, default_value = "0.0.0.0:8080", env = "HUDDLES_LISTEN")]
    pub listen: SocketAddr,
    /// Socket address for the metrics and health endpoint.
    #[arg(long, default_value = "127.0.0.1:9090", env = "HUDDLES_METRICS")]
    pub metrics_addr: SocketAddr,
    /// Maximum total concurrent connections.
    #[arg(long, default_value = "10000", env = "HUDDLES_MAX_CONNS")]
    pub max_conns: usize,
    /// How long a dropped participant is retained for resumption, in milliseconds.
    #[arg(long, default_value = "5000", env = "HUDDLES_GRACE_PERIOD_MS")]
    pub grace_period_ms: u64,
    /// Maximum messages per minute per connection.
    #[arg(long, default_value = "600", env = "HUDDLES_MSG_RATE")]
    pub msg_rate: u32,
    /// Maximum bytes per minute per connection.
    #[arg(long, default_value = "4194304", env = "HUDDLES_BW_RATE")]
    pub bw_rate: u64,
    /// Maximum WebSocket message size in bytes.
    #[arg(long, default_value = "65536", env = "HUDDLES_MAX_MESSAGE_SIZE")]
    pub max_message_size: usize,
    /// Interval between WebSocket pings in seconds.
    #[arg(long, default_value = "30", env = "HUDDLES_PING_INTERVAL")]
    pub ping_interval: u64,
    /// Connection idle timeout in seconds.
    #[arg(long, default_value = "120", env = "HUDDLES_IDLE_TIMEOUT")]
    pub idle_timeout: u64,
    /// Messages queued per connection before further deliveries are dropped.
    #[arg(long, default_value = "256", env = "HUDDLES_OUTBOUND_QUEUE")]
    pub outbound_queue: usize,
    /// Increase log verbosity (repeat for more detail).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub listen: SocketAddr,
    /// Socket address for the metrics and health endpoint.
    pub metrics_addr: SocketAddr,
    /// Maximum total concurrent connections.
    pub max_conns: usize,
    /// Grace window in milliseconds.
    pub grace_period_ms: u64,
    /// Maximum messages per minute per connection.
    pub msg_rate: u32,
    /// Maximum bytes per minute per connection.
    pub bw_rate: u64,
    /// Maximum WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Interval between WebSocket pings in seconds.
    pub ping_interval: u64,
    /// Connection idle timeout in seconds.
    pub idle_timeout: u64,
    /// Per-connection outbound queue depth.
    pub outbound_queue: usize,
}

impl ServerConfig {
    /// Grace window as a [`Duration`].
    #[must_use]
    pub const fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_conns == 0 {
            return Err("max_conns must be greater than 0".to_string());
        }
        if self.max_conns > 1_000_000 {
            return Err("max_conns exceeds reasonable limit (1,000,000)".to_string());
        }

        if self.grace_period_ms == 0 {
            return Err("grace_period_ms must be greater than 0".to_string());
        }
        if self.grace_period_ms > 3_600_000 {
            return Err("grace_period_ms exceeds reasonable limit (1 hour)".to_string());
        }

        if self.msg_rate == 0 {
            return Err("msg_rate must be greater than 0".to_string());
        }
        if self.msg_rate > 1_000_000 {
            return Err("msg_rate exceeds reasonable limit (1,000,000 msg/min)".to_string());
        }
        if self.bw_rate == 0 {
            return Err("bw_rate must be greater than 0".to_string());
        }

        const MAX_ALLOWED_MESSAGE: usize = 16 * 1024 * 1024;
        if self.max_message_size < 1024 {
            return Err("max_message_size must be at least 1024 bytes".to_string());
        }
        if self.max_message_size > MAX_ALLOWED_MESSAGE {
            return Err(format!(
                "max_message_size exceeds maximum allowed ({MAX_ALLOWED_MESSAGE} bytes)"
            ));
        }

        if self.ping_interval == 0 {
            return Err("ping_interval must be greater than 0".to_string());
        }
        if self.ping_interval > 3600 {
            return Err("ping_interval exceeds reasonable limit (3600 seconds)".to_string());
        }
        if self.idle_timeout < self.ping_interval {
            return Err("idle_timeout must be at least ping_interval".to_string());
        }
        if self.idle_timeout > 86_400 {
            return Err(
                "idle_timeout exceeds reasonable limit (86400 seconds / 1 day)".to_string(),
            );
        }

        if self.outbound_queue == 0 {
            return Err("outbound_queue must be greater than 0".to_string());
        }
        Ok(())
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: args.listen,
            metrics_addr: args.metrics_addr,
            max_conns: args.max_conns,
            grace_period_ms: args.grace_period_ms,
            msg_rate: args.msg_rate,
            bw_rate: args.bw_rate,
            max_message_size: args.max_message_size,
            ping_interval: args.ping_interval,
            idle_timeout: args.idle_timeout,
            outbound_queue: args.outbound_queue,
        }
    }
}
