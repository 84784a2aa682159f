//! Clock, seed and stringification services.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

static SEED: AtomicU64 = AtomicU64::new(1);

/// A process-wide monotonic counter, used to stamp connections and
/// lifecycle observers.
#[inline]
pub fn next_seed() -> u64 {
    SEED.fetch_add(1, Ordering::Relaxed)
}

/// A coarse cached wall clock.
///
/// Consumers read the cached value; the owning event loop refreshes it on
/// each wake. Reads never take a lock, and a cold cache falls back to the
/// real clock.
pub struct CoarseClock {
    origin: Instant,
    origin_unix_ms: u64,
    cached_offset_ms: AtomicU64,
}

impl Default for CoarseClock {
    fn default() -> Self {
        Self::new()
    }
}

impl CoarseClock {
    pub fn new() -> Self {
        let origin_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self { origin: Instant::now(), origin_unix_ms, cached_offset_ms: AtomicU64::new(0) }
    }

    /// Recompute the cached offset. Called by the owner at its tick points.
    pub fn refresh(&self) -> u64 {
        let offset = self.origin.elapsed().as_millis() as u64;
        self.cached_offset_ms.store(offset, Ordering::Relaxed);
        self.origin_unix_ms + offset
    }

    /// Milliseconds since the unix epoch, at the cache's resolution.
    #[inline]
    pub fn now_ms(&self) -> u64 {
        self.origin_unix_ms + self.cached_offset_ms.load(Ordering::Relaxed)
    }
}

/// Readable form of an optional socket address for log lines.
pub fn addr_repr(addr: Option<&SocketAddr>) -> String {
    match addr {
        Some(a) => a.to_string(),
        None => "?".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_monotonic() {
        let a = next_seed();
        let b = next_seed();
        assert!(b > a);
    }

    #[test]
    fn test_coarse_clock_refresh() {
        let clock = CoarseClock::new();
        let cold = clock.now_ms();
        assert!(cold > 0);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let warmed = clock.refresh();
        assert!(warmed >= cold);
        assert_eq!(clock.now_ms(), warmed);
    }

    #[test]
    fn test_addr_repr() {
        assert_eq!(addr_repr(None), "?");
        let a: SocketAddr = "127.0.0.1:80".parse().unwrap();
        assert_eq!(addr_repr(Some(&a)), "127.0.0.1:80");
    }
}
