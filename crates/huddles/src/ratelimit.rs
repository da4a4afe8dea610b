use std::collections::VecDeque;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);
const MAX_TRACKED: usize = 10_000;

/// Which per-connection budget was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    /// Too many messages in the window.
    Messages,
    /// Too many bytes in the window.
    Bytes,
}

impl Limit {
    /// Metric label for this limit.
    pub const fn label(self) -> &'static str {
        match self {
            Self::Messages => "msg_rate",
            Self::Bytes => "bw_rate",
        }
    }
}

/// Sliding one-minute window over a connection's inbound messages.
///
/// Each accepted message is remembered with its size until it ages out, so a
/// burst straddling a minute boundary still counts against one window.
#[derive(Debug, Default)]
pub struct RateLimiter {
    seen: VecDeque<(Instant, u64)>,
    bytes: u64,
}

impl RateLimiter {
    /// Creates an empty limiter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&(at, size)) = self.seen.front() {
            if now.duration_since(at) < WINDOW {
                break;
            }
            self.bytes = self.bytes.saturating_sub(size);
            self.seen.pop_front();
        }
    }

    /// Record a message of `size` bytes if both budgets allow it.
    ///
    /// Returns the exceeded [`Limit`] when the message must be refused.
    pub fn check_and_record(&mut self, msg_rate: u32, bw_rate: u64, size: usize) -> Option<Limit> {
        self.check_and_record_at(Instant::now(), msg_rate, bw_rate, size)
    }

    fn check_and_record_at(
        &mut self,
        now: Instant,
        msg_rate: u32,
        bw_rate: u64,
        size: usize,
    ) -> Option<Limit> {
        self.expire(now);

        let size = u64::try_from(size).unwrap_or(u64::MAX);
        if self.seen.len() >= msg_rate as usize {
            return Some(Limit::Messages);
        }
        if self.bytes.saturating_add(size) > bw_rate {
            return Some(Limit::Bytes);
        }

        self.seen.push_back((now, size));
        self.bytes = self.bytes.saturating_add(size);
        if self.seen.len() > MAX_TRACKED {
            if let Some((_, oldest)) = self.seen.pop_front() {
                self.bytes = self.bytes.saturating_sub(oldest);
            }
        }
        None
    }
}
