//! Telemetry router
//!
//! Every line read by a connection goes through a `Router`, which hands it
//! to at most one `Target`. Swapping the target takes the same lock as
//! delivery, so a line is delivered to the old target or to the new one,
//! never both, and a swap takes effect on the very next line. Lines
//! arriving while no target is set are dropped.
//!
//! Temporary owners of the stream (a calibration session) take a `Claim`,
//! which puts back the previous target when released or dropped.

use crate::rig::proto::TelemetryLine;
use crossbeam::channel;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace, warn};

/// Receiving end of the routed stream: a named channel sender.
#[derive(Debug, Clone)]
pub struct Target {
    name: String,
    tx: channel::Sender<TelemetryLine>,
}

impl Target {
    /// Creates a target and the receiver its lines arrive on. The channel is
    /// unbounded, so delivery never blocks the port thread.
    pub fn channel(name: impl Into<String>) -> (Target, channel::Receiver<TelemetryLine>) {
        let (tx, rx) = channel::unbounded();
        (
            Target {
                name: name.into(),
                tx,
            },
            rx,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Shared, cloneable router handle.
#[derive(Debug, Clone, Default)]
pub struct Router {
    current: Arc<Mutex<Option<Target>>>,
}

impl Router {
    pub fn new() -> Router {
        Router::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Target>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Atomically replaces the target, returning the previous one.
    pub fn set_target(&self, target: Option<Target>) -> Option<Target> {
        let mut current = self.lock();
        debug!(
            from = current.as_ref().map(Target::name),
            to = target.as_ref().map(Target::name),
            "router target swap"
        );
        std::mem::replace(&mut *current, target)
    }

    pub fn target_name(&self) -> Option<String> {
        self.lock().as_ref().map(|t| t.name.clone())
    }

    /// Hands `line` to the current target. Returns false if the line was
    /// dropped, either for lack of a target or because its receiver is gone.
    pub fn deliver(&self, line: TelemetryLine) -> bool {
        let current = self.lock();
        match current.as_ref() {
            Some(target) => {
                if target.tx.send(line).is_ok() {
                    true
                } else {
                    warn!(sink = %target.name, "router target receiver dropped, line lost");
                    false
                }
            }
            None => {
                trace!(line = %line, "no router target, line dropped");
                false
            }
        }
    }

    /// Makes `target` current until the returned `Claim` is released.
    pub fn claim(&self, target: Target) -> Claim {
        let previous = self.set_target(Some(target));
        Claim {
            router: self.clone(),
            previous: Some(previous),
        }
    }
}

/// Scoped ownership of a `Router`. Restores the target that was current
/// before the claim, on `release()` or on drop.
#[derive(Debug)]
pub struct Claim {
    router: Router,
    previous: Option<Option<Target>>,
}

impl Claim {
    pub fn release(mut self) {
        self.restore();
    }

    fn restore(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.router.set_target(previous);
        }
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.restore();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_without_target() {
        let router = Router::new();
        assert!(!router.deliver(TelemetryLine::new("1,2")));
        assert_eq!(router.target_name(), None);
    }

    #[test]
    fn swap_routes_next_line_to_new_target_only() {
        let router = Router::new();
        let (a, a_rx) = Target::channel("a");
        let (b, b_rx) = Target::channel("b");

        router.set_target(Some(a));
        assert!(router.deliver(TelemetryLine::new("first")));
        let previous = router.set_target(Some(b));
        assert_eq!(previous.map(|t| t.name().to_string()), Some("a".to_string()));
        assert!(router.deliver(TelemetryLine::new("second")));

        assert_eq!(a_rx.try_iter().map(|l| l.text().to_string()).collect::<Vec<_>>(), vec!["first"]);
        assert_eq!(b_rx.try_iter().map(|l| l.text().to_string()).collect::<Vec<_>>(), vec!["second"]);
    }

    #[test]
    fn claim_restores_on_release_and_drop() {
        let router = Router::new();
        let (main, main_rx) = Target::channel("main");
        router.set_target(Some(main));

        let (cal, cal_rx) = Target::channel("calibration");
        let claim = router.claim(cal);
        router.deliver(TelemetryLine::new("Place weight"));
        claim.release();
        router.deliver(TelemetryLine::new("10,2.5"));

        assert_eq!(cal_rx.try_iter().count(), 1);
        assert_eq!(main_rx.try_recv().unwrap().text(), "10,2.5");

        {
            let (cal, _cal_rx) = Target::channel("calibration");
            let _claim = router.claim(cal);
            assert_eq!(router.target_name().as_deref(), Some("calibration"));
        }
        assert_eq!(router.target_name().as_deref(), Some("main"));
    }

    #[test]
    fn claim_restores_empty_target() {
        let router = Router::new();
        let (cal, _rx) = Target::channel("calibration");
        drop(router.claim(cal));
        assert_eq!(router.target_name(), None);
    }

    #[test]
    fn dead_receiver_drops_line() {
        let router = Router::new();
        let (t, rx) = Target::channel("gone");
        router.set_target(Some(t));
        drop(rx);
        assert!(!router.deliver(TelemetryLine::new("x")));
    }
}
