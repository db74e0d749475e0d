//! Interrupt-signal ladder.
//!
//! One process-wide handler, shared between the signal task and the main
//! flow behind a mutex. First interrupt during a scan cancels the scan
//! cooperatively; without a scan it warns and arms the kill timer; a
//! second interrupt within the window means force-stop (freeze the store
//! and exit non-zero). The mutex is never held across blocking work.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::ServiceScanJob;
use std::sync::Arc;

/// Window within which a second interrupt escalates to force-stop.
pub const FORCE_STOP_WINDOW: Duration = Duration::from_secs(12);

/// What the caller should do about an interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// A running scan was asked to stop; keep waiting for it.
    InterruptedScan,
    /// Nothing interruptible is running; warn that a second interrupt
    /// within the window force-stops.
    Warn,
    /// Freeze the database and exit with a failure code. State on disk
    /// may be inconsistent; the next scan re-converges.
    ForceStop,
}

#[derive(Default)]
struct SignalState {
    scan_job: Option<Arc<ServiceScanJob>>,
    first_interrupt: Option<Instant>,
}

#[derive(Default)]
pub struct SignalHandler {
    state: Mutex<SignalState>,
}

impl SignalHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the scan job interrupts should be routed to.
    pub fn watch(&self, job: Arc<ServiceScanJob>) {
        let mut state = self.state.lock().expect("signal state poisoned");
        if state.scan_job.is_some() {
            tracing::warn!("Signal handler was already watching a scan job");
        }
        state.scan_job = Some(job);
    }

    pub fn stop_watch(&self) {
        let mut state = self.state.lock().expect("signal state poisoned");
        state.scan_job = None;
    }

    /// Forget a pending first interrupt (e.g. when the prompt returns).
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("signal state poisoned");
        state.first_interrupt = None;
    }

    /// Advance the ladder for one interrupt.
    pub fn on_interrupt(&self) -> SignalAction {
        self.on_interrupt_at(Instant::now())
    }

    fn on_interrupt_at(&self, now: Instant) -> SignalAction {
        let mut state = self.state.lock().expect("signal state poisoned");

        if let Some(first) = state.first_interrupt {
            if now.duration_since(first) <= FORCE_STOP_WINDOW {
                return SignalAction::ForceStop;
            }
            // The window lapsed; treat this as a fresh first interrupt.
        }
        state.first_interrupt = Some(now);

        if let Some(job) = &state.scan_job {
            job.interrupt();
            SignalAction::InterruptedScan
        } else {
            SignalAction::Warn
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_interrupt_within_window_force_stops() {
        let handler = SignalHandler::new();
        let base = Instant::now();

        assert_eq!(handler.on_interrupt_at(base), SignalAction::Warn);
        assert_eq!(
            handler.on_interrupt_at(base + Duration::from_secs(5)),
            SignalAction::ForceStop
        );
    }

    #[test]
    fn lapsed_window_restarts_the_ladder() {
        let handler = SignalHandler::new();
        let base = Instant::now();

        assert_eq!(handler.on_interrupt_at(base), SignalAction::Warn);
        assert_eq!(
            handler.on_interrupt_at(base + FORCE_STOP_WINDOW + Duration::from_secs(1)),
            SignalAction::Warn
        );
        assert_eq!(
            handler.on_interrupt_at(base + FORCE_STOP_WINDOW + Duration::from_secs(3)),
            SignalAction::ForceStop
        );
    }

    #[test]
    fn reset_clears_the_pending_interrupt() {
        let handler = SignalHandler::new();
        let base = Instant::now();

        assert_eq!(handler.on_interrupt_at(base), SignalAction::Warn);
        handler.reset();
        assert_eq!(
            handler.on_interrupt_at(base + Duration::from_secs(1)),
            SignalAction::Warn
        );
    }
}
