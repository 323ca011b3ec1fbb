//! Common test utilities and helpers

#![allow(dead_code)]

use crossbeam::channel;
use peelforce::rig::port::memory::{self, MemoryHandle, MemoryPort};
use peelforce::rig::Event;
use std::thread;
use std::time::{Duration, Instant};

/// Upper bound for anything that crosses the port thread.
pub fn test_timeout() -> Duration {
    Duration::from_secs(2)
}

/// Polls `cond` until it holds or the timeout expires.
pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + test_timeout();
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

/// A memory port that answers configuration commands the way the rig
/// firmware does, echoing its settings after every change.
pub fn simulated_rig() -> (MemoryPort, MemoryHandle) {
    let (raw, handle) = memory::pair();
    let mut rpm = 100u32;
    let mut interval = 1000u32;
    let raw = raw.with_responder(move |cmd| {
        if let Some(v) = cmd.strip_prefix('R').and_then(|v| v.parse().ok()) {
            rpm = v;
        } else if let Some(v) = cmd.strip_prefix('I').and_then(|v| v.parse().ok()) {
            interval = v;
        } else if cmd == "A" {
            return vec!["Motor started".to_string()];
        } else {
            return Vec::new();
        }
        vec![format!("R:{},I:{}", rpm, interval)]
    });
    (raw, handle)
}

pub fn drain_events(rx: &channel::Receiver<Event>) -> Vec<Event> {
    rx.try_iter().collect()
}
