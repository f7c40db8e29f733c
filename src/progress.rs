use std::sync::Mutex;

/// Notifications pushed to whatever front end drives an import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportEvent {
    ExtractionStarted,
    ExtractionProgress(u8),
}

pub trait ProgressSink: Send + Sync {
    fn report(&self, event: ImportEvent);
}

/// Drops every event.
pub struct SilentSink;

impl ProgressSink for SilentSink {
    fn report(&self, _event: ImportEvent) {}
}

pub type PercentCallback<'a> = &'a (dyn Fn(u8) + Sync);

/// Forwards percentages to a callback, suppressing anything that would move
/// the value backwards or repeat it. Safe to share between extraction workers.
pub struct PercentTracker<'a> {
    callback: Option<PercentCallback<'a>>,
    last: Mutex<Option<u8>>,
}

impl<'a> PercentTracker<'a> {
    pub fn new(callback: Option<PercentCallback<'a>>) -> Self {
        Self {
            callback,
            last: Mutex::new(None),
        }
    }

    pub fn silent() -> Self {
        Self::new(None)
    }

    pub fn report(&self, percent: u8) {
        let percent = percent.min(100);
        let Ok(mut last) = self.last.lock() else {
            return;
        };
        if matches!(*last, Some(previous) if previous >= percent) {
            return;
        }
        *last = Some(percent);
        if let Some(callback) = self.callback {
            callback(percent);
        }
    }

    pub fn report_ratio(&self, done: usize, total: usize) {
        if total == 0 {
            self.report(100);
            return;
        }
        let done = done.min(total);
        let percent = ((done as f64 / total as f64) * 100.0).round() as u8;
        self.report(percent);
    }

    pub fn finish(&self) {
        self.report(100);
    }

    pub fn last(&self) -> Option<u8> {
        self.last.lock().ok().and_then(|last| *last)
    }
}
