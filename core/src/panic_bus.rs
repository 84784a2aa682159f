//! Process-wide panic fan-out.
//!
//! Subsystems that hit an unrecoverable invariant publish a `Kernel` level
//! [`Error`] on the bus instead of unwinding across the transport. The bus
//! is an explicit value passed to adapters at construction, not a global.

use crate::error::Error;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

type Subscriber = Arc<dyn Fn(&Error) + Send + Sync + 'static>;

/// A registry of panic subscribers.
///
/// Publishing never fails and never unwinds: a panicking subscriber is
/// caught and dropped from that publish.
pub struct PanicBus {
    subscribers: Mutex<Vec<(u64, Subscriber)>>,
    next_id: AtomicU64,
}

impl PanicBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { subscribers: Mutex::new(Vec::new()), next_id: AtomicU64::new(1) })
    }

    /// Register `on_panic`. Dropping the returned guard unsubscribes.
    pub fn subscribe(
        self: &Arc<Self>, on_panic: impl Fn(&Error) + Send + Sync + 'static,
    ) -> PanicSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().unwrap().push((id, Arc::new(on_panic)));
        PanicSubscription { bus: self.clone(), id }
    }

    /// Fan `err` out to all current subscribers.
    pub fn publish(&self, err: &Error) {
        log::error!("panic bus: {}", err);
        let subs: Vec<Subscriber> = {
            let guard = self.subscribers.lock().unwrap();
            guard.iter().map(|(_, s)| s.clone()).collect()
        };
        for sub in subs {
            // A broken subscriber must not take the publisher down.
            let _ = catch_unwind(AssertUnwindSafe(|| sub(err)));
        }
    }

    fn unsubscribe(&self, id: u64) {
        let mut guard = self.subscribers.lock().unwrap();
        guard.retain(|(sub_id, _)| *sub_id != id);
    }
}

/// RAII guard for a [`PanicBus`] subscription.
pub struct PanicSubscription {
    bus: Arc<PanicBus>,
    id: u64,
}

impl Drop for PanicSubscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ERR_KERNEL;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_publish_fan_out() {
        let bus = PanicBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h1 = hits.clone();
        let h2 = hits.clone();
        let _s1 = bus.subscribe(move |_| {
            h1.fetch_add(1, Ordering::SeqCst);
        });
        let _s2 = bus.subscribe(move |_| {
            h2.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(&Error::new(&ERR_KERNEL));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe_on_drop() {
        let bus = PanicBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let sub = bus.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(&Error::new(&ERR_KERNEL));
        drop(sub);
        bus.publish(&Error::new(&ERR_KERNEL));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_subscriber_is_contained() {
        let bus = PanicBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let _bad = bus.subscribe(|_| panic!("subscriber panic"));
        let _good = bus.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(&Error::new(&ERR_KERNEL));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
