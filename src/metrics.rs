//! Workload metrics — counters and derived statistics driving admission
//!
//! A single [`WorkerMetrics`] aggregate is shared by every request task and
//! the background loops. All mutation goes through its methods, each of
//! which takes the internal lock exactly once and never awaits while
//! holding it.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

/// Floor for the throughput divisor so `wait_time` never divides by zero.
pub const THROUGHPUT_EPSILON: f64 = 1e-5;

/// Lifecycle of a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Created,
    Started,
    Success,
    Errored,
    Canceled,
    Rejected,
    Ended,
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Success => "success",
            Self::Errored => "errored",
            Self::Canceled => "canceled",
            Self::Rejected => "rejected",
            Self::Ended => "ended",
        };
        write!(f, "{}", s)
    }
}

/// Tracks one in-flight request.
#[derive(Debug, Clone)]
pub struct RequestMetrics {
    pub request_idx: i64,
    pub reqnum: i64,
    pub workload: f64,
    pub status: RequestStatus,
    pub success: bool,
}

impl RequestMetrics {
    pub fn new(request_idx: i64, reqnum: i64, workload: f64) -> Self {
        Self {
            request_idx,
            reqnum,
            workload,
            status: RequestStatus::Created,
            success: false,
        }
    }
}

/// Process-wide workload counters and the in-flight working set.
#[derive(Debug)]
pub struct ModelMetrics {
    // Cumulative counters, zeroed after each successful report
    pub workload_served: f64,
    pub workload_received: f64,
    pub workload_cancelled: f64,
    pub workload_errored: f64,
    pub workload_rejected: f64,
    // Not reset by the reporting cycle
    pub workload_pending: f64,
    pub error_msg: Option<String>,
    pub max_throughput: f64,
    /// Reqnums seen since boot
    pub requests_received: HashSet<i64>,
    /// Currently in-flight requests, keyed by reqnum
    pub requests_working: HashMap<i64, RequestMetrics>,
    /// Terminal requests awaiting delete notification to the autoscaler
    pub requests_deleting: Vec<RequestMetrics>,
    /// When the cumulative counters were last zeroed
    pub last_update: Instant,
}

impl ModelMetrics {
    pub fn empty() -> Self {
        Self {
            workload_served: 0.0,
            workload_received: 0.0,
            workload_cancelled: 0.0,
            workload_errored: 0.0,
            workload_rejected: 0.0,
            workload_pending: 0.0,
            error_msg: None,
            max_throughput: 0.0,
            requests_received: HashSet::new(),
            requests_working: HashMap::new(),
            requests_deleting: Vec::new(),
            last_update: Instant::now(),
        }
    }

    /// Estimated seconds until the current working set drains at the
    /// calibrated rate. Zero when nothing is in flight.
    pub fn wait_time(&self) -> f64 {
        if self.requests_working.is_empty() {
            return 0.0;
        }
        self.cur_load() / self.max_throughput.max(THROUGHPUT_EPSILON)
    }

    /// Total workload of the in-flight working set.
    pub fn cur_load(&self) -> f64 {
        self.requests_working.values().map(|r| r.workload).sum()
    }

    pub fn working_request_idxs(&self) -> Vec<i64> {
        self.requests_working.values().map(|r| r.request_idx).collect()
    }

    pub fn set_errored(&mut self, error_msg: String) {
        self.reset();
        self.error_msg = Some(error_msg);
    }

    /// Zero the cumulative counters after a successful report.
    pub fn reset(&mut self) {
        self.workload_served = 0.0;
        self.workload_received = 0.0;
        self.workload_cancelled = 0.0;
        self.workload_errored = 0.0;
        self.workload_rejected = 0.0;
        self.last_update = Instant::now();
    }
}

/// Host-level stats reported alongside the workload counters.
#[derive(Debug)]
pub struct SystemMetrics {
    model_loading_start: Instant,
    /// Seconds from boot to calibration Ready; reported once, then cleared
    pub model_loading_time: Option<f64>,
    last_disk_usage: f64,
    pub additional_disk_usage: f64,
    pub model_is_loaded: bool,
}

impl SystemMetrics {
    pub fn new() -> Self {
        let disk_usage = disk_usage_gb();
        Self {
            model_loading_start: Instant::now(),
            model_loading_time: None,
            last_disk_usage: disk_usage,
            additional_disk_usage: 0.0,
            model_is_loaded: false,
        }
    }

    pub fn update_disk_usage(&mut self) {
        let disk_usage = disk_usage_gb();
        self.additional_disk_usage = disk_usage - self.last_disk_usage;
        self.last_disk_usage = disk_usage;
    }

    fn mark_loaded(&mut self) {
        if !self.model_is_loaded {
            self.model_loading_time = Some(self.model_loading_start.elapsed().as_secs_f64());
            self.model_is_loaded = true;
        }
    }

    /// The autoscaler expects `loadtime` exactly once. After a successful
    /// report the sent value is cleared so the next cycle reports nothing.
    fn reset_loadtime(&mut self, expected: f64) {
        if self.model_loading_time == Some(expected) {
            self.model_loading_time = None;
        }
    }
}

impl Default for SystemMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Used space of the root filesystem in GiB.
fn disk_usage_gb() -> f64 {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .find(|d| d.mount_point() == Path::new("/"))
        .or_else(|| disks.list().first())
        .map(|d| (d.total_space() - d.available_space()) as f64 / (1u64 << 30) as f64)
        .unwrap_or(0.0)
}

/// Point-in-time view handed to the reporting loop.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub workload_served: f64,
    pub workload_received: f64,
    pub workload_cancelled: f64,
    pub workload_errored: f64,
    pub workload_rejected: f64,
    pub workload_pending: f64,
    pub cur_load: f64,
    pub max_throughput: f64,
    pub error_msg: Option<String>,
    pub loadtime: f64,
    pub additional_disk_usage: f64,
    pub num_requests_working: usize,
    pub num_requests_received: usize,
    pub working_request_idxs: Vec<i64>,
    /// Seconds since the counters were last zeroed
    pub elapsed: f64,
}

impl MetricsSnapshot {
    /// Load accepted this interval that is still worth scheduling for,
    /// floored at zero when cancellations outpace arrivals.
    pub fn workload_processing(&self) -> f64 {
        (self.workload_received - self.workload_cancelled).max(0.0)
    }
}

struct MetricsInner {
    model: ModelMetrics,
    system: SystemMetrics,
}

/// Shared metrics aggregate. Identity fields are immutable; everything
/// else is mutated only through the methods below.
pub struct WorkerMetrics {
    pub id: i64,
    pub mtoken: String,
    pub version: String,
    pub worker_url: String,
    inner: Mutex<MetricsInner>,
}

impl WorkerMetrics {
    pub fn new(id: i64, mtoken: String, version: String, worker_url: String) -> Self {
        Self {
            id,
            mtoken,
            version,
            worker_url,
            inner: Mutex::new(MetricsInner {
                model: ModelMetrics::empty(),
                system: SystemMetrics::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MetricsInner> {
        // A poisoned lock means a panic inside one of these short critical
        // sections; the counters are still usable, so keep serving.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Request admitted: enters the working set and the received counters.
    pub fn request_start(&self, rm: &mut RequestMetrics) {
        rm.status = RequestStatus::Started;
        let mut inner = self.lock();
        inner.model.workload_received += rm.workload;
        inner.model.requests_received.insert(rm.reqnum);
        inner.model.requests_working.insert(rm.reqnum, rm.clone());
        inner.model.workload_pending = inner.model.cur_load();
    }

    pub fn request_success(&self, rm: &mut RequestMetrics) {
        rm.status = RequestStatus::Success;
        rm.success = true;
        let mut inner = self.lock();
        inner.model.workload_served += rm.workload;
        if let Some(entry) = inner.model.requests_working.get_mut(&rm.reqnum) {
            entry.status = RequestStatus::Success;
            entry.success = true;
        }
    }

    pub fn request_errored(&self, rm: &mut RequestMetrics) {
        rm.status = RequestStatus::Errored;
        let mut inner = self.lock();
        inner.model.workload_errored += rm.workload;
        if let Some(entry) = inner.model.requests_working.get_mut(&rm.reqnum) {
            entry.status = RequestStatus::Errored;
        }
    }

    pub fn request_canceled(&self, rm: &mut RequestMetrics) {
        rm.status = RequestStatus::Canceled;
        let mut inner = self.lock();
        inner.model.workload_cancelled += rm.workload;
        if let Some(entry) = inner.model.requests_working.get_mut(&rm.reqnum) {
            entry.status = RequestStatus::Canceled;
        }
    }

    /// Rejected requests never enter the working set.
    pub fn request_reject(&self, rm: &mut RequestMetrics) {
        rm.status = RequestStatus::Rejected;
        let mut inner = self.lock();
        inner.model.workload_rejected += rm.workload;
    }

    /// Terminal bookkeeping: leave the working set, queue the delete
    /// notification. No-op for requests that were never started.
    pub fn request_end(&self, rm: &mut RequestMetrics) {
        let mut inner = self.lock();
        if let Some(mut entry) = inner.model.requests_working.remove(&rm.reqnum) {
            entry.status = RequestStatus::Ended;
            inner.model.requests_deleting.push(entry);
        }
        rm.status = RequestStatus::Ended;
        inner.model.workload_pending = inner.model.cur_load();
    }

    /// Calibration finished: record throughput and clear any sticky error.
    pub fn model_loaded(&self, max_throughput: f64) {
        let mut inner = self.lock();
        inner.model.max_throughput = max_throughput.max(THROUGHPUT_EPSILON);
        inner.model.error_msg = None;
        inner.system.mark_loaded();
    }

    pub fn model_errored(&self, error_msg: String) {
        let mut inner = self.lock();
        inner.model.set_errored(error_msg);
    }

    pub fn wait_time(&self) -> f64 {
        self.lock().model.wait_time()
    }

    pub fn max_throughput(&self) -> f64 {
        self.lock().model.max_throughput
    }

    pub fn error_msg(&self) -> Option<String> {
        self.lock().model.error_msg.clone()
    }

    pub fn working_len(&self) -> usize {
        self.lock().model.requests_working.len()
    }

    /// Snapshot for the reporting loop. Refreshes disk usage.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut inner = self.lock();
        inner.system.update_disk_usage();
        MetricsSnapshot {
            workload_served: inner.model.workload_served,
            workload_received: inner.model.workload_received,
            workload_cancelled: inner.model.workload_cancelled,
            workload_errored: inner.model.workload_errored,
            workload_rejected: inner.model.workload_rejected,
            workload_pending: inner.model.workload_pending,
            cur_load: inner.model.cur_load(),
            max_throughput: inner.model.max_throughput,
            error_msg: inner.model.error_msg.clone(),
            loadtime: inner.system.model_loading_time.unwrap_or(0.0),
            additional_disk_usage: inner.system.additional_disk_usage,
            num_requests_working: inner.model.requests_working.len(),
            num_requests_received: inner.model.requests_received.len(),
            working_request_idxs: inner.model.working_request_idxs(),
            elapsed: inner.model.last_update.elapsed().as_secs_f64(),
        }
    }

    /// Zero the cumulative counters after the snapshot was delivered.
    pub fn commit_report(&self, snapshot: &MetricsSnapshot) {
        let mut inner = self.lock();
        inner.model.reset();
        if snapshot.loadtime > 0.0 {
            inner.system.reset_loadtime(snapshot.loadtime);
        }
    }

    /// Drain the delete-notification queue.
    pub fn take_deleting(&self) -> Vec<RequestMetrics> {
        std::mem::take(&mut self.lock().model.requests_deleting)
    }

    /// Put undelivered delete notifications back for the next cycle.
    pub fn requeue_deleting(&self, batch: Vec<RequestMetrics>) {
        self.lock().model.requests_deleting.extend(batch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> WorkerMetrics {
        WorkerMetrics::new(1, "tok".into(), "0.3.0".into(), "http://w".into())
    }

    #[test]
    fn test_wait_time_empty_working_set() {
        let mut model = ModelMetrics::empty();
        model.max_throughput = 10.0;
        assert_eq!(model.wait_time(), 0.0);
    }

    #[test]
    fn test_wait_time_formula() {
        let m = metrics();
        m.model_loaded(10.0);
        let mut rm = RequestMetrics::new(0, 1, 5.0);
        m.request_start(&mut rm);
        assert!((m.wait_time() - 0.5).abs() < 1e-9);

        let mut rm2 = RequestMetrics::new(1, 2, 15.0);
        m.request_start(&mut rm2);
        assert!((m.wait_time() - 2.0).abs() < 1e-9);

        m.request_end(&mut rm2);
        assert!((m.wait_time() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_wait_time_epsilon_floor() {
        let mut model = ModelMetrics::empty();
        model
            .requests_working
            .insert(1, RequestMetrics::new(0, 1, 1.0));
        // max_throughput still zero: the divisor floors at epsilon
        let wait = model.wait_time();
        assert!(wait.is_finite());
        assert!((wait - 1.0 / THROUGHPUT_EPSILON).abs() < 1.0);
    }

    #[test]
    fn test_model_loaded_floors_throughput_and_clears_error() {
        let m = metrics();
        m.model_errored("boom".into());
        assert_eq!(m.error_msg().as_deref(), Some("boom"));
        m.model_loaded(0.0);
        assert!(m.max_throughput() >= THROUGHPUT_EPSILON);
        assert!(m.error_msg().is_none());
    }

    #[test]
    fn test_lifecycle_success() {
        let m = metrics();
        m.model_loaded(10.0);
        let mut rm = RequestMetrics::new(7, 42, 5.0);
        m.request_start(&mut rm);
        assert_eq!(m.working_len(), 1);
        m.request_success(&mut rm);
        m.request_end(&mut rm);
        assert_eq!(m.working_len(), 0);
        assert_eq!(rm.status, RequestStatus::Ended);

        let snap = m.snapshot();
        assert_eq!(snap.workload_served, 5.0);
        assert_eq!(snap.workload_received, 5.0);
        assert_eq!(snap.num_requests_received, 1);

        let deleting = m.take_deleting();
        assert_eq!(deleting.len(), 1);
        assert_eq!(deleting[0].reqnum, 42);
        assert!(deleting[0].success);
    }

    #[test]
    fn test_lifecycle_cancel() {
        let m = metrics();
        m.model_loaded(10.0);
        let mut rm = RequestMetrics::new(0, 1, 3.0);
        m.request_start(&mut rm);
        m.request_canceled(&mut rm);
        m.request_end(&mut rm);
        let snap = m.snapshot();
        assert_eq!(snap.workload_cancelled, 3.0);
        assert_eq!(snap.workload_served, 0.0);
        assert_eq!(snap.num_requests_working, 0);
    }

    #[test]
    fn test_reject_does_not_enter_working_set() {
        let m = metrics();
        let mut rm = RequestMetrics::new(0, 1, 4.0);
        m.request_reject(&mut rm);
        assert_eq!(m.working_len(), 0);
        let snap = m.snapshot();
        assert_eq!(snap.workload_rejected, 4.0);
        assert_eq!(snap.workload_received, 0.0);
        // never started, so nothing to delete
        assert!(m.take_deleting().is_empty());
    }

    #[test]
    fn test_commit_report_resets_cumulative_only() {
        let m = metrics();
        m.model_loaded(10.0);
        let mut rm = RequestMetrics::new(0, 1, 5.0);
        m.request_start(&mut rm);
        let mut rm2 = RequestMetrics::new(1, 2, 2.0);
        m.request_reject(&mut rm2);

        let snap = m.snapshot();
        assert_eq!(snap.workload_received, 5.0);
        assert_eq!(snap.workload_rejected, 2.0);
        m.commit_report(&snap);

        let after = m.snapshot();
        assert_eq!(after.workload_received, 0.0);
        assert_eq!(after.workload_rejected, 0.0);
        // working set and throughput survive the reset
        assert_eq!(after.num_requests_working, 1);
        assert_eq!(after.max_throughput, 10.0);
    }

    #[test]
    fn test_requeue_deleting() {
        let m = metrics();
        let mut rm = RequestMetrics::new(0, 1, 1.0);
        m.request_start(&mut rm);
        m.request_end(&mut rm);
        let batch = m.take_deleting();
        assert_eq!(batch.len(), 1);
        m.requeue_deleting(batch);
        assert_eq!(m.take_deleting().len(), 1);
    }

    #[test]
    fn test_workload_processing_floor() {
        let m = metrics();
        m.model_loaded(10.0);
        let mut rm = RequestMetrics::new(0, 1, 2.0);
        m.request_start(&mut rm);
        m.request_canceled(&mut rm);
        m.request_end(&mut rm);
        let snapshot = m.snapshot();
        assert_eq!(snapshot.workload_processing(), 0.0);
    }

    #[test]
    fn test_set_errored_resets_counters() {
        let mut model = ModelMetrics::empty();
        model.workload_served = 9.0;
        model.set_errored("bad".into());
        assert_eq!(model.workload_served, 0.0);
        assert_eq!(model.error_msg.as_deref(), Some("bad"));
    }
}
