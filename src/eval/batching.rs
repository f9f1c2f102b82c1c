//! Batching collector for leaf evaluations.
//!
//! Search workers publish evaluation requests onto a shared queue; a single
//! collector thread packs them into batches for the backend. Batching
//! policy: up to `max_batch_size` unique fingerprints per computation, and
//! no request waits longer than the batch timeout once it has been picked
//! up. Dedup is collector-wide, not per cycle: a fingerprint stays in the
//! in-flight table from the moment it is admitted until its record lands in
//! the evaluation cache, so a duplicate arriving while the evaluation is
//! still running joins as a waiter instead of costing a second computation.
//! Every result is written to the cache before its waiters are released.

use super::{Computation, EvalError, EvalRecord, Evaluator, MovesLeftFormat, ValueFormat};
use crate::cache::EvalCache;
use crate::encoding::{InputPlanes, POLICY_SIZE};
use crate::position::VerifyKey;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub type EvalReply = Result<Arc<EvalRecord>, EvalError>;

/// One leaf evaluation request.
pub struct EvalRequest {
    pub fingerprint: u64,
    pub planes: InputPlanes,
    pub verify: VerifyKey,
    pub reply: Sender<EvalReply>,
}

impl EvalRequest {
    /// Build a request plus the receiver its result will arrive on.
    pub fn new(fingerprint: u64, planes: InputPlanes, verify: VerifyKey) -> (Self, Receiver<EvalReply>) {
        let (reply, rx) = bounded(1);
        (
            EvalRequest {
                fingerprint,
                planes,
                verify,
                reply,
            },
            rx,
        )
    }
}

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub max_batch_size: usize,
    pub batch_timeout: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        CollectorConfig {
            max_batch_size: 256,
            batch_timeout: Duration::from_micros(500),
        }
    }
}

/// Clonable submission handle held by search workers.
#[derive(Clone)]
pub struct CollectorHandle {
    tx: Sender<EvalRequest>,
}

impl CollectorHandle {
    pub fn submit(&self, request: EvalRequest) -> Result<(), EvalError> {
        self.tx
            .send(request)
            .map_err(|_| EvalError::Backend("collector thread is gone".to_string()))
    }
}

/// Owns the collector thread. Dropping the collector closes the queue and
/// joins the thread.
pub struct BatchCollector {
    handle: CollectorHandle,
    worker: Option<JoinHandle<()>>,
}

impl BatchCollector {
    pub fn spawn(
        evaluator: Arc<dyn Evaluator>,
        cache: Arc<EvalCache>,
        config: CollectorConfig,
        abort: Arc<AtomicBool>,
    ) -> Self {
        let (tx, rx) = unbounded::<EvalRequest>();
        let worker = thread::Builder::new()
            .name("goshawk-collector".to_string())
            .spawn(move || collector_loop(evaluator, cache, config, abort, rx))
            .expect("failed to spawn collector thread");
        BatchCollector {
            handle: CollectorHandle { tx },
            worker: Some(worker),
        }
    }

    pub fn handle(&self) -> CollectorHandle {
        self.handle.clone()
    }
}

impl Drop for BatchCollector {
    fn drop(&mut self) {
        // Closing the channel ends the loop.
        let (dead_tx, _) = unbounded();
        self.handle = CollectorHandle { tx: dead_tx };
        if let Some(worker) = self.worker.take() {
            worker.join().ok();
        }
    }
}

fn collector_loop(
    evaluator: Arc<dyn Evaluator>,
    cache: Arc<EvalCache>,
    config: CollectorConfig,
    abort: Arc<AtomicBool>,
    rx: Receiver<EvalRequest>,
) {
    let caps = evaluator.capabilities();
    let max_batch = config.max_batch_size.max(1);
    // Collector-wide in-flight table: fingerprint -> waiters. An entry
    // lives from admission until its record is cached (or its evaluation
    // fails), so duplicates can never trigger a second computation for
    // work that is already dispatched.
    let mut inflight: HashMap<u64, Vec<Sender<EvalReply>>> = HashMap::new();

    loop {
        let first = match rx.recv() {
            Ok(request) => request,
            Err(_) => break,
        };

        // Unique fingerprints admitted this cycle, in arrival order.
        let mut batch: Vec<(u64, InputPlanes, VerifyKey)> = Vec::with_capacity(max_batch);

        admit(first, &cache, &mut batch, &mut inflight);
        let deadline = Instant::now() + config.batch_timeout;
        while batch.len() < max_batch {
            match rx.recv_deadline(deadline) {
                Ok(request) => admit(request, &cache, &mut batch, &mut inflight),
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if batch.is_empty() {
            // Everything was a cache hit or joined an in-flight entry.
            continue;
        }

        if abort.load(Ordering::Acquire) {
            fail_batch(&mut inflight, &batch, &EvalError::Aborted);
            continue;
        }

        let mut computation = evaluator.new_computation();
        for (_, planes, _) in &batch {
            computation.add_input(planes.clone());
        }
        debug!("dispatching batch of {} unique positions", batch.len());

        if let Err(e) = computation.compute_blocking() {
            warn!("evaluator batch failed: {e}");
            fail_batch(&mut inflight, &batch, &EvalError::Backend(e.to_string()));
            continue;
        }

        if abort.load(Ordering::Acquire) {
            // The computation finished but the search no longer wants it.
            fail_batch(&mut inflight, &batch, &EvalError::Aborted);
            continue;
        }

        for (i, (fingerprint, _, verify)) in batch.into_iter().enumerate() {
            let record = Arc::new(extract_record(&*computation, i, verify, &caps));
            cache.insert(fingerprint, record.clone());
            if let Some(list) = inflight.remove(&fingerprint) {
                for reply in list {
                    reply.send(Ok(record.clone())).ok();
                }
            }
        }
    }

    // Queue closed while entries were still pending: release their waiters.
    for (_, list) in inflight.drain() {
        for reply in list {
            reply.send(Err(EvalError::Aborted)).ok();
        }
    }
}

/// Route one request: answer from cache, join an in-flight evaluation, or
/// open a new batch slot (registering the fingerprint as in flight).
fn admit(
    request: EvalRequest,
    cache: &EvalCache,
    batch: &mut Vec<(u64, InputPlanes, VerifyKey)>,
    inflight: &mut HashMap<u64, Vec<Sender<EvalReply>>>,
) {
    if let Some(record) = cache.lookup(request.fingerprint, &request.verify) {
        request.reply.send(Ok(record)).ok();
        return;
    }
    match inflight.get_mut(&request.fingerprint) {
        Some(list) => list.push(request.reply),
        None => {
            batch.push((request.fingerprint, request.planes, request.verify));
            inflight.insert(request.fingerprint, vec![request.reply]);
        }
    }
}

/// Fail and clear the in-flight entries of one batch; waiters registered
/// for those fingerprints in any cycle are released with the error.
fn fail_batch(
    inflight: &mut HashMap<u64, Vec<Sender<EvalReply>>>,
    batch: &[(u64, InputPlanes, VerifyKey)],
    error: &EvalError,
) {
    for (fingerprint, _, _) in batch {
        if let Some(list) = inflight.remove(fingerprint) {
            for reply in list {
                let e = match error {
                    EvalError::Aborted => EvalError::Aborted,
                    other => EvalError::Backend(other.to_string()),
                };
                reply.send(Err(e)).ok();
            }
        }
    }
}

fn extract_record(
    computation: &dyn Computation,
    i: usize,
    verify: VerifyKey,
    caps: &super::BackendCapabilities,
) -> EvalRecord {
    let (value, wdl) = match caps.value {
        ValueFormat::Wdl => {
            let (w, d, l) = computation.wdl(i);
            (w - l, (w, d, l))
        }
        ValueFormat::Scalar => {
            let v = computation.value(i);
            (v, ((1.0 + v) / 2.0, 0.0, (1.0 - v) / 2.0))
        }
    };
    let moves_left = match caps.moves_left {
        MovesLeftFormat::V1 => computation.moves_left(i),
        MovesLeftFormat::None => 0.0,
    };
    let policy = (0..POLICY_SIZE).map(|j| computation.policy(i, j)).collect();
    EvalRecord {
        value: value.clamp(-1.0, 1.0),
        wdl,
        policy,
        moves_left,
        verify,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::encode_planes;
    use crate::eval::{BackendCapabilities, PolicyFormat};
    use crate::position::Position;
    use std::sync::atomic::AtomicUsize;

    /// Evaluator that counts how many samples it is asked to compute.
    struct CountingEvaluator {
        samples: Arc<AtomicUsize>,
    }

    struct CountingComputation {
        batch: usize,
        samples: Arc<AtomicUsize>,
    }

    impl Evaluator for CountingEvaluator {
        fn new_computation(&self) -> Box<dyn Computation> {
            Box::new(CountingComputation {
                batch: 0,
                samples: self.samples.clone(),
            })
        }

        fn capabilities(&self) -> BackendCapabilities {
            BackendCapabilities {
                policy: PolicyFormat::Classical,
                value: ValueFormat::Scalar,
                moves_left: MovesLeftFormat::None,
                input_planes: crate::encoding::INPUT_PLANES,
            }
        }
    }

    impl Computation for CountingComputation {
        fn add_input(&mut self, _planes: InputPlanes) {
            self.batch += 1;
        }
        fn batch_len(&self) -> usize {
            self.batch
        }
        fn compute_blocking(&mut self) -> Result<(), EvalError> {
            self.samples.fetch_add(self.batch, Ordering::SeqCst);
            Ok(())
        }
        fn value(&self, _i: usize) -> f32 {
            0.25
        }
        fn wdl(&self, _i: usize) -> (f32, f32, f32) {
            (0.5, 0.25, 0.25)
        }
        fn policy(&self, _i: usize, _move_idx: usize) -> f32 {
            0.0
        }
        fn moves_left(&self, _i: usize) -> f32 {
            0.0
        }
    }

    #[test]
    fn duplicate_fingerprints_share_one_evaluation() {
        let samples = Arc::new(AtomicUsize::new(0));
        let cache = Arc::new(EvalCache::new(1024));
        let collector = BatchCollector::spawn(
            Arc::new(CountingEvaluator {
                samples: samples.clone(),
            }),
            cache.clone(),
            CollectorConfig {
                max_batch_size: 8,
                batch_timeout: Duration::from_millis(20),
            },
            Arc::new(AtomicBool::new(false)),
        );

        let pos = Position::startpos();
        let fp = pos.fingerprint();
        let (req_a, rx_a) = EvalRequest::new(fp, encode_planes(&pos), pos.verify_key());
        let (req_b, rx_b) = EvalRequest::new(fp, encode_planes(&pos), pos.verify_key());
        collector.handle().submit(req_a).unwrap();
        collector.handle().submit(req_b).unwrap();

        let a = rx_a.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
        let b = rx_b.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(samples.load(Ordering::SeqCst), 1);
        assert!(cache.lookup(fp, &pos.verify_key()).is_some());
    }

    /// Evaluator whose computations stall long enough for more requests to
    /// arrive while a batch is in flight.
    struct SlowEvaluator {
        samples: Arc<AtomicUsize>,
        delay: Duration,
    }

    struct SlowComputation {
        batch: usize,
        samples: Arc<AtomicUsize>,
        delay: Duration,
    }

    impl Evaluator for SlowEvaluator {
        fn new_computation(&self) -> Box<dyn Computation> {
            Box::new(SlowComputation {
                batch: 0,
                samples: self.samples.clone(),
                delay: self.delay,
            })
        }

        fn capabilities(&self) -> BackendCapabilities {
            BackendCapabilities {
                policy: PolicyFormat::Classical,
                value: ValueFormat::Scalar,
                moves_left: MovesLeftFormat::None,
                input_planes: crate::encoding::INPUT_PLANES,
            }
        }
    }

    impl Computation for SlowComputation {
        fn add_input(&mut self, _planes: InputPlanes) {
            self.batch += 1;
        }
        fn batch_len(&self) -> usize {
            self.batch
        }
        fn compute_blocking(&mut self) -> Result<(), EvalError> {
            std::thread::sleep(self.delay);
            self.samples.fetch_add(self.batch, Ordering::SeqCst);
            Ok(())
        }
        fn value(&self, _i: usize) -> f32 {
            0.0
        }
        fn wdl(&self, _i: usize) -> (f32, f32, f32) {
            (0.5, 0.0, 0.5)
        }
        fn policy(&self, _i: usize, _move_idx: usize) -> f32 {
            0.0
        }
        fn moves_left(&self, _i: usize) -> f32 {
            0.0
        }
    }

    #[test]
    fn duplicate_arriving_mid_computation_does_no_extra_work() {
        let samples = Arc::new(AtomicUsize::new(0));
        let cache = Arc::new(EvalCache::new(1024));
        let collector = BatchCollector::spawn(
            Arc::new(SlowEvaluator {
                samples: samples.clone(),
                delay: Duration::from_millis(150),
            }),
            cache,
            CollectorConfig {
                max_batch_size: 1,
                batch_timeout: Duration::from_micros(1),
            },
            Arc::new(AtomicBool::new(false)),
        );

        let pos = Position::startpos();
        let fp = pos.fingerprint();
        let (req_a, rx_a) = EvalRequest::new(fp, encode_planes(&pos), pos.verify_key());
        collector.handle().submit(req_a).unwrap();
        // Let the first batch dispatch, then duplicate while it computes.
        std::thread::sleep(Duration::from_millis(30));
        let (req_b, rx_b) = EvalRequest::new(fp, encode_planes(&pos), pos.verify_key());
        collector.handle().submit(req_b).unwrap();

        let a = rx_a.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
        let b = rx_b.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(a.value, b.value);
        assert_eq!(samples.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cache_hits_bypass_the_backend() {
        let samples = Arc::new(AtomicUsize::new(0));
        let cache = Arc::new(EvalCache::new(1024));
        let collector = BatchCollector::spawn(
            Arc::new(CountingEvaluator {
                samples: samples.clone(),
            }),
            cache.clone(),
            CollectorConfig::default(),
            Arc::new(AtomicBool::new(false)),
        );

        let pos = Position::startpos();
        let fp = pos.fingerprint();
        let (req, rx) = EvalRequest::new(fp, encode_planes(&pos), pos.verify_key());
        collector.handle().submit(req).unwrap();
        rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(samples.load(Ordering::SeqCst), 1);

        let (req, rx) = EvalRequest::new(fp, encode_planes(&pos), pos.verify_key());
        collector.handle().submit(req).unwrap();
        rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
        // Second request answered from cache; backend untouched.
        assert_eq!(samples.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn abort_fails_pending_requests() {
        let samples = Arc::new(AtomicUsize::new(0));
        let cache = Arc::new(EvalCache::new(1024));
        let abort = Arc::new(AtomicBool::new(true));
        let collector = BatchCollector::spawn(
            Arc::new(CountingEvaluator { samples }),
            cache,
            CollectorConfig {
                max_batch_size: 1,
                batch_timeout: Duration::from_micros(1),
            },
            abort,
        );

        let pos = Position::startpos();
        let (req, rx) = EvalRequest::new(pos.fingerprint(), encode_planes(&pos), pos.verify_key());
        collector.handle().submit(req).unwrap();
        let reply = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(reply, Err(EvalError::Aborted)));
    }
}
