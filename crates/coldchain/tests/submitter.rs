//! TxSubmitter worker: one submission in flight at a time, failures dropped without stalling
//! the queue.

use coldchain::{AbiError, OutboundTx, SubmitBackend, SubmitError, TxSubmitter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};

/// Records the execution window of every submission.
#[derive(Clone, Default)]
struct TimingBackend {
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    windows: Arc<Mutex<Vec<(Instant, Instant)>>>,
}

impl SubmitBackend for TimingBackend {
    async fn submit(&self, tx: &OutboundTx) -> Result<String, SubmitError> {
        let start = Instant::now();
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        sleep(Duration::from_millis(15)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.windows.lock().unwrap().push((start, Instant::now()));
        if matches!(tx, OutboundTx::ReportError { reason } if reason == "fail") {
            return Err(SubmitError::Encode(AbiError::Encode {
                function: "reportError",
                reason: "rejected".into(),
            }));
        }
        Ok("0xabc".into())
    }
}

#[tokio::test]
async fn concurrent_submits_never_overlap() {
    let backend = TimingBackend::default();
    let (submitter, worker) = TxSubmitter::spawn(backend.clone());

    let mut producers = Vec::new();
    for i in 0..8u64 {
        let submitter = submitter.clone();
        producers.push(tokio::spawn(async move {
            submitter.submit(OutboundTx::ReportEnergyUsage { wh_centi: i });
            submitter.submit(OutboundTx::UpdateSensorData {
                temp_centi: -(i as i64),
                humidity_centi: i,
                power_centi: i,
            });
        }));
    }
    for p in producers {
        p.await.unwrap();
    }
    drop(submitter);
    timeout(Duration::from_secs(10), worker).await.unwrap().unwrap();

    assert_eq!(backend.max_in_flight.load(Ordering::SeqCst), 1);
    let mut windows = backend.windows.lock().unwrap().clone();
    assert_eq!(windows.len(), 16);
    windows.sort_by_key(|w| w.0);
    for pair in windows.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "submission windows overlap");
    }
}

#[tokio::test]
async fn failed_submission_does_not_block_the_queue() {
    let backend = TimingBackend::default();
    let (submitter, worker) = TxSubmitter::spawn(backend.clone());

    submitter.submit(OutboundTx::ReportError { reason: "fail".into() });
    submitter.submit(OutboundTx::ReportEnergyUsage { wh_centi: 7615 });
    submitter.submit(OutboundTx::ReportError { reason: "fail".into() });
    submitter.submit(OutboundTx::ReportEnergyUsage { wh_centi: 1 });
    drop(submitter);
    timeout(Duration::from_secs(10), worker).await.unwrap().unwrap();

    assert_eq!(backend.windows.lock().unwrap().len(), 4);
}

#[tokio::test]
async fn submit_returns_before_the_backend_finishes() {
    let backend = TimingBackend::default();
    let (submitter, worker) = TxSubmitter::spawn(backend.clone());

    let started = Instant::now();
    for i in 0..20 {
        submitter.submit(OutboundTx::ReportEnergyUsage { wh_centi: i });
    }
    // 20 submissions take at least 300ms in the backend; enqueueing must not wait for them
    assert!(started.elapsed() < Duration::from_millis(100));

    drop(submitter);
    timeout(Duration::from_secs(10), worker).await.unwrap().unwrap();
    assert_eq!(backend.windows.lock().unwrap().len(), 20);
}
