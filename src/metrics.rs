use std::{
    sync::Arc,
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    time::Instant,
};

use once_cell::sync::Lazy;

pub static METRICS: Lazy<Arc<Metrics>> = Lazy::new(|| Arc::new(Metrics::new()));

/// Process-wide counters exported on `/k8s/metrics`.
#[derive(Debug)]
pub struct Metrics {
    start: Instant,
    ready: AtomicBool,
    active_sessions: AtomicUsize,
    tracks_started: AtomicU64,
    auto_advances: AtomicU64,
    tracks_queued: AtomicU64,
    access_denials: AtomicU64,
}

impl Metrics {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            ready: AtomicBool::new(false),
            active_sessions: AtomicUsize::new(0),
            tracks_started: AtomicU64::new(0),
            auto_advances: AtomicU64::new(0),
            tracks_queued: AtomicU64::new(0),
            access_denials: AtomicU64::new(0),
        }
    }

    pub fn set_ready(&self, v: bool) {
        self.ready.store(v, Ordering::Relaxed);
    }
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn inc_sessions(&self) {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }
    pub fn dec_sessions(&self) {
        let _ = self
            .active_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
                Some(x.saturating_sub(1))
            });
    }

    pub fn inc_tracks_started(&self) {
        self.tracks_started.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_auto_advances(&self) {
        self.auto_advances.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_tracks_queued(&self) {
        self.tracks_queued.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_access_denials(&self) {
        self.access_denials.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.start.elapsed().as_secs(),
            ready: self.is_ready(),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            tracks_started: self.tracks_started.load(Ordering::Relaxed),
            auto_advances: self.auto_advances.load(Ordering::Relaxed),
            tracks_queued: self.tracks_queued.load(Ordering::Relaxed),
            access_denials: self.access_denials.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub ready: bool,
    pub active_sessions: usize,
    pub tracks_started: u64,
    pub auto_advances: u64,
    pub tracks_queued: u64,
    pub access_denials: u64,
}

impl MetricsSnapshot {
    /// Prometheus text exposition.
    pub fn render(&self) -> String {
        let rows: [(&str, &str, &str, String); 7] = [
            ("greenroom_uptime_seconds", "counter", "Seconds since process start", self.uptime_secs.to_string()),
            ("greenroom_ready", "gauge", "1 once the gateway reported ready", u8::from(self.ready).to_string()),
            ("greenroom_active_sessions", "gauge", "Guilds with a connected music session", self.active_sessions.to_string()),
            ("greenroom_tracks_started_total", "counter", "Tracks that started playing", self.tracks_started.to_string()),
            ("greenroom_auto_advances_total", "counter", "Tracks started by auto-advance", self.auto_advances.to_string()),
            ("greenroom_tracks_queued_total", "counter", "Tracks appended to a queue", self.tracks_queued.to_string()),
            ("greenroom_access_denials_total", "counter", "Cannabis content refused by the age gate", self.access_denials.to_string()),
        ];
        let mut out = String::new();
        for (name, kind, help, value) in rows {
            out.push_str(&format!("# HELP {name} {help}\n# TYPE {name} {kind}\n{name} {value}\n"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sessions_gauge_never_underflows() {
        let m = Metrics::new();
        m.dec_sessions();
        m.inc_sessions();
        assert_eq!(m.snapshot().active_sessions, 1);
    }

    #[test]
    fn render_lists_every_series() {
        let m = Metrics::new();
        m.inc_access_denials();
        let text = m.snapshot().render();
        assert!(text.contains("greenroom_access_denials_total 1\n"));
        assert!(text.contains("# TYPE greenroom_active_sessions gauge\n"));
        assert_eq!(text.lines().filter(|l| l.starts_with("# HELP")).count(), 7);
    }
}
