//! The open/run/close lifecycle controller.
//!
//! Every long-lived transport object (poller, listener, channel, adapter)
//! is driven by one [`OrcManager`]. It is the only place where concurrency
//! between lifecycle operations is resolved; the callbacks passed to
//! `open`/`run`/`close` hold no locks of their own on this manager.
//!
//! The state is a single 64-bit atomic word:
//!
//! - bits 0..2: status, one of Closed(0) / Ready(1) / Closing(2)
//! - bit 2 (value 4): run-lock, held while a `run` callback executes
//! - bits 3..: generation counter, advanced on every close, so lifecycle
//!   observers can tell one lifetime from the next.

use std::sync::{
    Condvar, Mutex,
    atomic::{AtomicU64, Ordering},
};

const STATUS_MASK: u64 = 0b011;
const STATUS_CLOSED: u64 = 0;
const STATUS_READY: u64 = 1;
const STATUS_CLOSING: u64 = 2;
const LOCK_BIT: u64 = 0b100;
const GEN_SHIFT: u32 = 3;

pub struct OrcManager {
    state: AtomicU64,
    mutex: Mutex<()>,
    cond: Condvar,
}

impl Default for OrcManager {
    fn default() -> Self {
        Self::new()
    }
}

impl OrcManager {
    pub fn new() -> Self {
        Self { state: AtomicU64::new(STATUS_CLOSED), mutex: Mutex::new(()), cond: Condvar::new() }
    }

    #[inline]
    fn load(&self) -> u64 {
        self.state.load(Ordering::Acquire)
    }

    // Must be called with the mutex held.
    #[inline]
    fn store(&self, s: u64) {
        self.state.store(s, Ordering::Release);
        self.cond.notify_all();
    }

    /// Fast-path predicate: status is Ready (run-lock bit does not matter).
    #[inline]
    pub fn is_running(&self) -> bool {
        self.load() & STATUS_MASK == STATUS_READY
    }

    /// Current generation, for lifetime observers.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.load() >> GEN_SHIFT
    }

    /// Prepare resources. Waits out a concurrent close, then transitions
    /// Closed -> Ready when `on_open` returns true.
    pub fn open(&self, on_open: impl FnOnce() -> bool) -> bool {
        let mut guard = self.mutex.lock().unwrap();
        loop {
            let s = self.load();
            match s & STATUS_MASK {
                STATUS_CLOSING => {
                    guard = self.cond.wait(guard).unwrap();
                }
                STATUS_CLOSED => {
                    if on_open() {
                        self.store((s & !(STATUS_MASK | LOCK_BIT)) | STATUS_READY);
                        return true;
                    }
                    return false;
                }
                _ => return false,
            }
        }
    }

    /// Execute a long-running loop while holding the run-lock bit.
    ///
    /// `on_run` receives a lightweight `is_running` predicate that reads the
    /// atomic word without the mutex; loops should consult it at their
    /// natural suspension points. Returns false when Ready could not be
    /// acquired.
    pub fn run(&self, on_run: impl FnOnce(&dyn Fn() -> bool) -> bool) -> bool {
        let mut guard = self.mutex.lock().unwrap();
        loop {
            let s = self.load();
            let masked = s & (STATUS_MASK | LOCK_BIT);
            if masked == STATUS_READY | LOCK_BIT {
                guard = self.cond.wait(guard).unwrap();
            } else if masked == STATUS_READY {
                let generation = s >> GEN_SHIFT;
                self.store(s | LOCK_BIT);
                drop(guard);
                let is_running = move || {
                    let cur = self.state.load(Ordering::Acquire);
                    cur & STATUS_MASK == STATUS_READY && (cur >> GEN_SHIFT) == generation
                };
                let _ = on_run(&is_running);
                let guard = self.mutex.lock().unwrap();
                let cur = self.load();
                self.store(cur & !LOCK_BIT);
                drop(guard);
                return true;
            } else {
                return false;
            }
        }
    }

    /// Idempotent teardown.
    ///
    /// Transitions Ready -> Closing, runs `will_close` (returning false
    /// aborts the close and restores Ready), waits for a concurrent `run`
    /// callback to release the run-lock, then runs `did_close` and settles
    /// in Closed with the generation advanced.
    pub fn close(&self, will_close: impl FnOnce() -> bool, did_close: impl FnOnce()) -> bool {
        let mut guard = self.mutex.lock().unwrap();
        loop {
            let s = self.load();
            let masked = s & (STATUS_MASK | LOCK_BIT);
            if masked == STATUS_READY || masked == STATUS_READY | LOCK_BIT {
                self.store((s & !STATUS_MASK) | STATUS_CLOSING);
                if !will_close() {
                    let cur = self.load();
                    self.store((cur & !STATUS_MASK) | STATUS_READY);
                    return false;
                }
                while self.load() & LOCK_BIT != 0 {
                    guard = self.cond.wait(guard).unwrap();
                }
                did_close();
                let cur = self.load();
                let generation = (cur >> GEN_SHIFT) + 1;
                self.store(generation << GEN_SHIFT | STATUS_CLOSED);
                return true;
            } else if masked & STATUS_MASK == STATUS_CLOSING {
                // Wait for the current closer, then report we had nothing
                // to close ourselves.
                guard = self.cond.wait(guard).unwrap();
            } else {
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_open_run_close_sequence() {
        let orc = OrcManager::new();
        assert!(!orc.is_running());
        assert!(orc.open(|| true));
        assert!(orc.is_running());
        // double open fails
        assert!(!orc.open(|| true));
        assert!(orc.run(|is_running| {
            assert!(is_running());
            true
        }));
        assert!(orc.close(|| true, || ()));
        assert!(!orc.is_running());
        // double close fails
        assert!(!orc.close(|| true, || ()));
    }

    #[test]
    fn test_open_callback_veto() {
        let orc = OrcManager::new();
        assert!(!orc.open(|| false));
        assert!(!orc.is_running());
        assert!(orc.open(|| true));
    }

    #[test]
    fn test_will_close_veto_restores_ready() {
        let orc = OrcManager::new();
        assert!(orc.open(|| true));
        assert!(!orc.close(|| false, || panic!("did_close must not run")));
        assert!(orc.is_running());
        assert!(orc.close(|| true, || ()));
    }

    #[test]
    fn test_generation_monotonic() {
        let orc = OrcManager::new();
        assert_eq!(orc.generation(), 0);
        for i in 1..=5u64 {
            assert!(orc.open(|| true));
            assert!(orc.close(|| true, || ()));
            assert_eq!(orc.generation(), i);
        }
    }

    #[test]
    fn test_close_waits_for_run_lock() {
        let orc = Arc::new(OrcManager::new());
        assert!(orc.open(|| true));
        let orc2 = orc.clone();
        let runner = thread::spawn(move || {
            orc2.run(|is_running| {
                while is_running() {
                    thread::sleep(std::time::Duration::from_millis(1));
                }
                true
            })
        });
        // Give the run loop time to take the lock bit.
        thread::sleep(std::time::Duration::from_millis(20));
        let did = Arc::new(AtomicUsize::new(0));
        let did2 = did.clone();
        assert!(orc.close(|| true, move || {
            did2.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(runner.join().unwrap());
        assert_eq!(did.load(Ordering::SeqCst), 1);
        assert!(!orc.is_running());
    }

    #[test]
    fn test_is_running_observes_generation() {
        let orc = OrcManager::new();
        assert!(orc.open(|| true));
        orc.run(|is_running| {
            assert!(is_running());
            true
        });
        assert!(orc.close(|| true, || ()));
        // Reopen: a predicate captured in the previous lifetime would now
        // be false even though status is Ready again, but a fresh run sees
        // the new generation.
        assert!(orc.open(|| true));
        assert!(orc.run(|is_running| {
            assert!(is_running());
            true
        }));
        assert!(orc.close(|| true, || ()));
    }

    #[test]
    fn test_concurrent_open_close_balance() {
        let orc = Arc::new(OrcManager::new());
        let opens = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let orc = orc.clone();
            let opens = opens.clone();
            let closes = closes.clone();
            handles.push(thread::spawn(move || {
                for i in 0..200 {
                    match i % 3 {
                        0 => {
                            if orc.open(|| true) {
                                opens.fetch_add(1, Ordering::SeqCst);
                            }
                        }
                        1 => {
                            let _ = orc.run(|_| true);
                        }
                        _ => {
                            if orc.close(|| true, || ()) {
                                closes.fetch_add(1, Ordering::SeqCst);
                            }
                        }
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        // Settle: one more close balances a trailing successful open.
        if orc.close(|| true, || ()) {
            closes.fetch_add(1, Ordering::SeqCst);
        }
        assert_eq!(opens.load(Ordering::SeqCst), closes.load(Ordering::SeqCst));
        assert!(!orc.is_running());
    }
}
