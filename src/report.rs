//! Autoscaler reporting
//!
//! Two independent loops: a fixed-cadence status report whose cumulative
//! counters are zeroed only after a successful send, and a delete-notification
//! drain that re-queues its batch on failure. Delete delivery is
//! at-least-once; the autoscaler deduplicates by reqnum.

use std::sync::Arc;

use serde::Serialize;

use crate::config::{WorkerConfig, DELETE_RETRY_DELAY, REPORT_INTERVAL};
use crate::error::Result;
use crate::metrics::{MetricsSnapshot, WorkerMetrics};

/// Wire format of the periodic status report.
#[derive(Debug, Clone, Serialize)]
pub struct AutoScalerData {
    pub id: i64,
    pub mtoken: String,
    pub version: String,
    pub loadtime: f64,
    pub cur_load: f64,
    pub rej_load: f64,
    pub new_load: f64,
    pub error_msg: String,
    pub max_perf: f64,
    pub cur_perf: f64,
    pub cur_capacity: f64,
    pub max_capacity: f64,
    pub num_requests_working: usize,
    pub num_requests_received: usize,
    pub additional_disk_usage: f64,
    pub working_request_idxs: Vec<i64>,
    pub url: String,
}

#[derive(Debug, Serialize)]
struct DeleteNotification {
    id: i64,
    mtoken: String,
    reqnums: Vec<i64>,
}

pub struct Reporter {
    metrics: Arc<WorkerMetrics>,
    client: reqwest::Client,
    status_url: String,
    delete_url: String,
    max_wait_time: f64,
}

impl Reporter {
    pub fn new(config: &WorkerConfig, metrics: Arc<WorkerMetrics>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REPORT_INTERVAL * 5)
            .build()?;
        let base = config.report_addr.trim_end_matches('/');
        Ok(Self {
            metrics,
            client,
            status_url: format!("{base}/worker_status/"),
            delete_url: format!("{base}/worker_delete/"),
            max_wait_time: config.max_wait_time,
        })
    }

    /// Periodic status loop. Never returns.
    pub async fn run_status_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(REPORT_INTERVAL).await;
            self.report_once().await;
        }
    }

    async fn report_once(&self) {
        let snapshot = self.metrics.snapshot();
        let data = build_report(&self.metrics, &snapshot, self.max_wait_time);

        match self.client.post(&self.status_url).json(&data).send().await {
            Ok(response) if response.status().is_success() => {
                self.metrics.commit_report(&snapshot);
                tracing::debug!(cur_load = data.cur_load, "Reported worker status");
            }
            Ok(response) => {
                // Counters stay; this cycle's deltas fold into the next one.
                tracing::warn!(status = %response.status(), "Status report rejected");
            }
            Err(err) => {
                tracing::warn!(error = %err, "Status report failed");
            }
        }
    }

    /// Delete-notification drain loop. Never returns.
    pub async fn run_delete_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(DELETE_RETRY_DELAY).await;
            self.drain_deletes_once().await;
        }
    }

    async fn drain_deletes_once(&self) {
        let batch = self.metrics.take_deleting();
        if batch.is_empty() {
            return;
        }

        let notification = DeleteNotification {
            id: self.metrics.id,
            mtoken: self.metrics.mtoken.clone(),
            reqnums: batch.iter().map(|rm| rm.reqnum).collect(),
        };

        match self
            .client
            .post(&self.delete_url)
            .json(&notification)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(count = notification.reqnums.len(), "Delete notifications sent");
            }
            Ok(response) => {
                tracing::warn!(status = %response.status(), "Delete notification rejected, re-queueing");
                self.metrics.requeue_deleting(batch);
            }
            Err(err) => {
                tracing::warn!(error = %err, "Delete notification failed, re-queueing");
                self.metrics.requeue_deleting(batch);
            }
        }
    }
}

/// Assemble the wire report from a snapshot.
///
/// `cur_perf` is the served workload per second since the last committed
/// report. Capacity is expressed in workload units: `max_capacity` is how
/// much this worker can hold before admission starts rejecting, and
/// `cur_capacity` the room left right now.
pub fn build_report(
    metrics: &WorkerMetrics,
    snapshot: &MetricsSnapshot,
    max_wait_time: f64,
) -> AutoScalerData {
    let cur_perf = if snapshot.elapsed > 0.0 {
        snapshot.workload_served / snapshot.elapsed
    } else {
        0.0
    };
    let max_capacity = snapshot.max_throughput * max_wait_time;
    let cur_capacity = (max_capacity - snapshot.cur_load).max(0.0);

    AutoScalerData {
        id: metrics.id,
        mtoken: metrics.mtoken.clone(),
        version: metrics.version.clone(),
        loadtime: snapshot.loadtime,
        cur_load: snapshot.cur_load,
        rej_load: snapshot.workload_rejected,
        new_load: snapshot.workload_processing(),
        error_msg: snapshot.error_msg.clone().unwrap_or_default(),
        max_perf: snapshot.max_throughput,
        cur_perf,
        cur_capacity,
        max_capacity,
        num_requests_working: snapshot.num_requests_working,
        num_requests_received: snapshot.num_requests_received,
        additional_disk_usage: snapshot.additional_disk_usage,
        working_request_idxs: snapshot.working_request_idxs.clone(),
        url: metrics.worker_url.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::RequestMetrics;

    fn metrics() -> Arc<WorkerMetrics> {
        Arc::new(WorkerMetrics::new(
            7,
            "tok".to_string(),
            "0.3.0".to_string(),
            "http://worker:3000".to_string(),
        ))
    }

    #[test]
    fn test_report_identity_and_counters() {
        let metrics = metrics();
        metrics.model_loaded(10.0);
        let mut rm = RequestMetrics::new(1, 100, 5.0);
        metrics.request_start(&mut rm);

        let snapshot = metrics.snapshot();
        let report = build_report(&metrics, &snapshot, 10.0);

        assert_eq!(report.id, 7);
        assert_eq!(report.mtoken, "tok");
        assert_eq!(report.url, "http://worker:3000");
        assert_eq!(report.new_load, 5.0);
        assert_eq!(report.cur_load, 5.0);
        assert_eq!(report.max_perf, 10.0);
        assert_eq!(report.max_capacity, 100.0);
        assert_eq!(report.cur_capacity, 95.0);
        assert_eq!(report.num_requests_working, 1);
        assert_eq!(report.working_request_idxs, vec![1]);
        assert_eq!(report.error_msg, "");
    }

    #[test]
    fn test_rejected_workload_reported_separately() {
        let metrics = metrics();
        metrics.model_loaded(10.0);
        let mut rm = RequestMetrics::new(2, 200, 8.0);
        metrics.request_reject(&mut rm);

        let snapshot = metrics.snapshot();
        let report = build_report(&metrics, &snapshot, 10.0);
        assert_eq!(report.rej_load, 8.0);
        assert_eq!(report.new_load, 0.0);
        assert_eq!(report.num_requests_working, 0);
    }

    #[test]
    fn test_capacity_floor_at_zero() {
        let metrics = metrics();
        metrics.model_loaded(1.0);
        let mut rm = RequestMetrics::new(3, 300, 50.0);
        metrics.request_start(&mut rm);

        let snapshot = metrics.snapshot();
        let report = build_report(&metrics, &snapshot, 10.0);
        assert_eq!(report.max_capacity, 10.0);
        assert_eq!(report.cur_capacity, 0.0);
    }

    #[test]
    fn test_error_msg_serialized_as_empty_string() {
        let metrics = metrics();
        let snapshot = metrics.snapshot();
        let report = build_report(&metrics, &snapshot, 10.0);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["error_msg"], "");
        assert_eq!(json["id"], 7);
    }
}
