//! Injected time source and the TTL cache built on top of it, so tests can
//! control expiry deterministically.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use contracts::TimestampMs;

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> TimestampMs;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> TimestampMs {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as TimestampMs)
            .unwrap_or(0)
    }
}

/// Test clock advanced by hand.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn at(now: TimestampMs) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: TimestampMs) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: TimestampMs) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> TimestampMs {
        self.now.load(Ordering::SeqCst)
    }
}

/// Single-value cache with a fixed TTL, parameterized by the caller's clock.
#[derive(Debug)]
pub struct TtlCache<T: Clone> {
    ttl_ms: TimestampMs,
    slot: Mutex<Option<(T, TimestampMs)>>,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(ttl_ms: TimestampMs) -> Self {
        Self {
            ttl_ms,
            slot: Mutex::new(None),
        }
    }

    /// Returns the cached value when still fresh, otherwise recomputes it via
    /// `load` and stamps it with the clock's current time.
    pub fn get_or_load<E>(
        &self,
        clock: &dyn Clock,
        load: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E> {
        let now = clock.now_ms();
        let mut slot = self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some((value, stored_at)) = slot.as_ref() {
            if now - stored_at < self.ttl_ms {
                return Ok(value.clone());
            }
        }

        let value = load()?;
        *slot = Some((value.clone(), now));
        Ok(value)
    }

    pub fn invalidate(&self) {
        let mut slot = self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_serves_fresh_value_until_ttl_expires() {
        let clock = ManualClock::at(1_000);
        let cache = TtlCache::new(500);
        let mut loads = 0_u32;

        let first: Result<u32, ()> = cache.get_or_load(&clock, || {
            loads += 1;
            Ok(7)
        });
        assert_eq!(first, Ok(7));

        clock.advance(499);
        let second: Result<u32, ()> = cache.get_or_load(&clock, || {
            loads += 1;
            Ok(8)
        });
        assert_eq!(second, Ok(7), "value within ttl must come from cache");
        assert_eq!(loads, 1);

        clock.advance(1);
        let third: Result<u32, ()> = cache.get_or_load(&clock, || {
            loads += 1;
            Ok(9)
        });
        assert_eq!(third, Ok(9));
        assert_eq!(loads, 2);
    }

    #[test]
    fn invalidate_forces_reload() {
        let clock = ManualClock::at(0);
        let cache = TtlCache::new(10_000);

        let _: Result<u32, ()> = cache.get_or_load(&clock, || Ok(1));
        cache.invalidate();
        let value: Result<u32, ()> = cache.get_or_load(&clock, || Ok(2));
        assert_eq!(value, Ok(2));
    }
}
