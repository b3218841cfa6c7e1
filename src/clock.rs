//! Simulated clock: monotonic simulated time advanced at a configurable
//! speed, with pause/resume and a blocking wait primitive the session
//! worker uses to pace event delivery.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::core_types::TimestampNs;

type TimeListener = Box<dyn Fn(TimestampNs) + Send + Sync>;

pub struct SimClock {
    current_time: AtomicI64,
    /// Simulated seconds per wall-clock second; 0.0 means unlimited (max speed).
    speed_factor: Mutex<f64>,
    running: AtomicBool,
    paused: AtomicBool,
    pause_cv: Condvar,
    pause_mutex: Mutex<()>,
    listeners: Mutex<Vec<TimeListener>>,
}

impl SimClock {
    pub fn new(start_time: TimestampNs, speed_factor: f64) -> Self {
        Self {
            current_time: AtomicI64::new(start_time),
            speed_factor: Mutex::new(speed_factor),
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            pause_cv: Condvar::new(),
            pause_mutex: Mutex::new(()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn current_time(&self) -> TimestampNs {
        self.current_time.load(Ordering::SeqCst)
    }

    pub fn set_time(&self, ts: TimestampNs) {
        self.current_time.store(ts, Ordering::SeqCst);
    }

    pub fn set_speed(&self, speed: f64) {
        *self.speed_factor.lock().unwrap() = speed;
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        let _guard = self.pause_mutex.lock().unwrap();
        self.paused.store(false, Ordering::SeqCst);
        self.pause_cv.notify_all();
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _guard = self.pause_mutex.lock().unwrap();
        self.pause_cv.notify_all();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn add_listener(&self, listener: TimeListener) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Blocks, pacing wall-clock sleep against `speed_factor`, until
    /// `event_ts` is reached, then advances `current_time` to it.
    /// Returns `false` if the clock was stopped (or never started)
    /// before the advance could happen.
    pub fn wait_for_next_event(&self, event_ts: TimestampNs) -> bool {
        if !self.is_running() {
            return false;
        }

        {
            let mut guard = self.pause_mutex.lock().unwrap();
            while self.is_paused() && self.is_running() {
                guard = self.pause_cv.wait(guard).unwrap();
                let _ = &guard;
            }
        }
        if !self.is_running() {
            return false;
        }

        let speed = *self.speed_factor.lock().unwrap();
        let now = self.current_time();
        let diff = event_ts - now;
        if speed > 0.0 && diff > 0 {
            let wall_ns = (diff as f64 / speed) as u64;
            std::thread::sleep(Duration::from_nanos(wall_ns));
        }

        // CAS loop: never regress current_time even if another advance
        // raced ahead of us while we were sleeping.
        loop {
            let prev = self.current_time.load(Ordering::SeqCst);
            let next = prev.max(event_ts);
            if next == prev {
                break;
            }
            if self
                .current_time
                .compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }

        for listener in self.listeners.lock().unwrap().iter() {
            listener(self.current_time());
        }
        true
    }
}
