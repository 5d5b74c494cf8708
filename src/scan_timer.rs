use crossbeam_channel::{bounded, select, tick, Sender};
use serde::{Deserialize, Serialize};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Fixed poll period of the scan counter.
pub const SCAN_TICK_PERIOD: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum ScanTimerError {
    #[error("Scan timer is not active")]
    NotActive,

    #[error("Scan timer is already active")]
    AlreadyActive,

    #[error("Unable to spawn scan timer thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Scan timer thread panicked")]
    Panicked,

    #[error("Unknown scan type code {0}")]
    UnknownScanType(u8),
}

/// Kind of parameter sweep the upstream coordinator is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ScanType {
    #[default]
    None,
    Latency,
    Threshold,
    SCurve,
}

impl ScanType {
    pub fn code(&self) -> u8 {
        match self {
            ScanType::None => 0,
            ScanType::Latency => 1,
            ScanType::Threshold => 2,
            ScanType::SCurve => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScanType::None => "none",
            ScanType::Latency => "latency",
            ScanType::Threshold => "threshold",
            ScanType::SCurve => "scurve",
        }
    }

    /// Threshold and S-curve scans count continuously generated triggers.
    pub fn requires_continuous_triggers(&self) -> bool {
        matches!(self, ScanType::Threshold | ScanType::SCurve)
    }
}

impl TryFrom<u8> for ScanType {
    type Error = ScanTimerError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(ScanType::None),
            1 => Ok(ScanType::Latency),
            2 => Ok(ScanType::Threshold),
            3 => Ok(ScanType::SCurve),
            other => Err(ScanTimerError::UnknownScanType(other)),
        }
    }
}

impl From<ScanType> for u8 {
    fn from(scan_type: ScanType) -> Self {
        scan_type.code()
    }
}

/// Progress of the current scan point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ScanState {
    pub scan_type: ScanType,
    pub target_trigger_count: u64,
    pub baseline_counter_value: u64,
}

impl ScanState {
    pub fn new(scan_type: ScanType, target_trigger_count: u64) -> Self {
        Self {
            scan_type,
            target_trigger_count,
            baseline_counter_value: 0,
        }
    }

    pub fn is_continuous(&self) -> bool {
        self.scan_type.requires_continuous_triggers()
    }

    /// Triggers counted since the last baseline. A counter that went
    /// backwards (reset or wrap) counts as zero.
    pub fn triggers_since_baseline(&self, counter: u64) -> u64 {
        counter.saturating_sub(self.baseline_counter_value)
    }

    pub fn point_complete(&self, counter: u64) -> bool {
        self.triggers_since_baseline(counter) >= self.target_trigger_count
    }

    pub fn rebase(&mut self, counter: u64) {
        self.baseline_counter_value = counter;
    }
}

struct TimerWorker {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// Periodic background worker that drives the scan counter poll.
///
/// The callback runs on a dedicated thread right after `start` and then once
/// per period. `stop` wakes the thread, waits for the tick in flight to
/// finish and joins it.
pub struct ScanTimer {
    period: Duration,
    worker: Option<TimerWorker>,
}

impl Default for ScanTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanTimer {
    pub fn new() -> Self {
        Self::with_period(SCAN_TICK_PERIOD)
    }

    pub fn with_period(period: Duration) -> Self {
        Self {
            period,
            worker: None,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_active(&self) -> bool {
        self.worker.is_some()
    }

    pub fn start<F>(&mut self, mut on_tick: F) -> Result<(), ScanTimerError>
    where
        F: FnMut() + Send + 'static,
    {
        if self.worker.is_some() {
            return Err(ScanTimerError::AlreadyActive);
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let ticker = tick(self.period);
        let handle = thread::Builder::new()
            .name("amc13-scan-timer".to_string())
            .spawn(move || {
                on_tick();
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => on_tick(),
                    }
                }
            })?;

        log::debug!("Scan timer started with period {:?}", self.period);
        self.worker = Some(TimerWorker { stop_tx, handle });
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), ScanTimerError> {
        let worker = self.worker.take().ok_or(ScanTimerError::NotActive)?;
        // Dropping the sender disconnects the channel and wakes the worker.
        drop(worker.stop_tx);
        worker.handle.join().map_err(|_| ScanTimerError::Panicked)?;
        log::debug!("Scan timer stopped");
        Ok(())
    }
}

impl Drop for ScanTimer {
    fn drop(&mut self) {
        if self.worker.is_some() {
            if let Err(e) = self.stop() {
                log::warn!("Failed to stop scan timer on drop: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_scan_type_codes() {
        assert_eq!(ScanType::try_from(2).unwrap(), ScanType::Threshold);
        assert!(ScanType::try_from(3).unwrap().requires_continuous_triggers());
        assert!(!ScanType::Latency.requires_continuous_triggers());
        assert!(!ScanType::None.requires_continuous_triggers());
        assert!(matches!(
            ScanType::try_from(9),
            Err(ScanTimerError::UnknownScanType(9))
        ));
    }

    #[test]
    fn test_scan_state_delta() {
        let mut state = ScanState::new(ScanType::Threshold, 100);
        assert!(!state.point_complete(99));
        assert!(state.point_complete(100));

        state.rebase(100);
        assert_eq!(state.triggers_since_baseline(150), 50);
        assert!(!state.point_complete(150));
        assert!(state.point_complete(200));

        // Counter reset below the baseline.
        assert_eq!(state.triggers_since_baseline(10), 0);
    }

    #[test]
    fn test_stop_inactive_timer() {
        let mut timer = ScanTimer::new();
        assert!(!timer.is_active());
        assert!(matches!(timer.stop(), Err(ScanTimerError::NotActive)));
    }

    #[test]
    fn test_timer_ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let mut timer = ScanTimer::with_period(Duration::from_millis(5));

        let counter = Arc::clone(&ticks);
        timer
            .start(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert!(timer.is_active());
        assert!(matches!(
            timer.start(|| {}),
            Err(ScanTimerError::AlreadyActive)
        ));

        thread::sleep(Duration::from_millis(60));
        timer.stop().unwrap();
        let after_stop = ticks.load(Ordering::SeqCst);
        assert!(after_stop >= 1);

        thread::sleep(Duration::from_millis(30));
        assert_eq!(ticks.load(Ordering::SeqCst), after_stop);
        assert!(matches!(timer.stop(), Err(ScanTimerError::NotActive)));
    }

    #[test]
    fn test_first_tick_is_immediate() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let mut timer = ScanTimer::with_period(Duration::from_secs(3600));

        let counter = Arc::clone(&ticks);
        timer
            .start(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        let mut waited = 0;
        while ticks.load(Ordering::SeqCst) == 0 && waited < 200 {
            thread::sleep(Duration::from_millis(5));
            waited += 1;
        }
        timer.stop().unwrap();
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_timer_restart() {
        let mut timer = ScanTimer::with_period(Duration::from_millis(5));
        timer.start(|| {}).unwrap();
        timer.stop().unwrap();
        timer.start(|| {}).unwrap();
        assert!(timer.is_active());
    }
}
