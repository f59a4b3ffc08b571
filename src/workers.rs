//! Background workers and the lock-free handoff to the main loop.
//!
//! Workers own their own state and talk to the fixed-rate loop through two
//! primitives only:
//!
//! | Primitive | Writer | Reader | Semantics |
//! |-----------|--------|--------|-----------|
//! | [`Snapshot`] | worker | main loop | whole-value replacement by pointer swap |
//! | [`TriggerFlag`] | worker | main loop | set by worker, taken (cleared) by loop |
//!
//! A flag raised twice before the loop reads it is seen once.
//!
//! Each worker is a named thread running one iteration per period. A setup
//! or iteration that errors or panics is logged and the worker carries on with
//! its next period. Shutdown signals the thread and waits for it with a
//! bounded timeout.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use bevy::log::{debug, error, info, warn};
use bevy::math::IRect;

use crate::capture::CaptureProvider;
use crate::classify::{detect_background, BackgroundModel};
use crate::error::{TriggerError, WorkerError};

/// Join timeout used when a worker handle is dropped.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Latest published value of type `T`. Cloning shares the slot.
#[derive(Debug)]
pub struct Snapshot<T> {
    slot: Arc<ArcSwap<T>>,
}

impl<T> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Snapshot<T> {
    pub fn new(initial: T) -> Self {
        Self {
            slot: Arc::new(ArcSwap::from_pointee(initial)),
        }
    }

    /// Replace the published value. Readers see either the old or the new one.
    pub fn publish(&self, value: T) {
        self.slot.store(Arc::new(value));
    }

    pub fn load(&self) -> Arc<T> {
        self.slot.load_full()
    }
}

/// Single-writer request flag.
#[derive(Debug, Clone, Default)]
pub struct TriggerFlag(Arc<AtomicBool>);

impl TriggerFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Consume the request: true at most once per raise.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

/// The flags workers can raise.
#[derive(Debug, Clone, Default)]
pub struct Triggers {
    pub beam: TriggerFlag,
    pub flight: TriggerFlag,
}

/// Handle to a running worker thread.
pub struct Worker {
    name: String,
    stop_tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn a worker that builds its state with `init` on its own thread
    /// and then calls the returned task once per `period`.
    ///
    /// `init` runs on the worker thread so the task may hold resources that
    /// are not `Send`. If `init` fails or panics it is retried on the next
    /// period.
    pub fn spawn<I, T>(name: &str, period: Duration, mut init: I) -> io::Result<Worker>
    where
        I: FnMut() -> Result<T, WorkerError> + Send + 'static,
        T: FnMut() -> Result<(), WorkerError> + 'static,
    {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let thread_name = name.to_string();

        let handle = thread::Builder::new().name(name.into()).spawn(move || {
            let mut task: Option<T> = None;
            let mut setup_failures = 0u32;
            loop {
                if task.is_none() {
                    let attempt = panic::catch_unwind(AssertUnwindSafe(&mut init))
                        .unwrap_or_else(|_| Err(WorkerError::Panicked("setup")));
                    match attempt {
                        Ok(t) => {
                            if setup_failures > 0 {
                                info!("worker {thread_name} ready after {setup_failures} retries");
                            }
                            task = Some(t);
                        }
                        Err(e) if setup_failures == 0 => {
                            error!("worker {thread_name}: setup failed, retrying: {e}");
                            setup_failures = 1;
                        }
                        Err(e) => {
                            debug!("worker {thread_name}: setup failed: {e}");
                            setup_failures += 1;
                        }
                    }
                }
                if let Some(run) = task.as_mut() {
                    run_iteration(&thread_name, run);
                }
                match stop_rx.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            info!("worker {thread_name} stopped");
        })?;

        Ok(Worker {
            name: name.to_string(),
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the worker and wait up to `timeout` for it to exit.
    ///
    /// Returns `false` if the thread was still running at the deadline; it
    /// is then left detached. Safe to call more than once.
    pub fn shutdown(&mut self, timeout: Duration) -> bool {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        let Some(handle) = self.handle.take() else {
            return true;
        };

        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!("worker {} did not stop within {timeout:?}", self.name);
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
        if handle.join().is_err() {
            error!("worker {} panicked during shutdown", self.name);
        }
        true
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown(DEFAULT_JOIN_TIMEOUT);
    }
}

fn run_iteration<T>(name: &str, task: &mut T)
where
    T: FnMut() -> Result<(), WorkerError>,
{
    match panic::catch_unwind(AssertUnwindSafe(|| task())) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("worker {name}: {e}"),
        Err(_) => error!("worker {name}: iteration panicked"),
    }
}

/// One ambient sampling pass: capture `world`, detect its dominant colour
/// and publish a model with that reference.
pub fn sample_ambient_color<P: CaptureProvider + ?Sized>(
    provider: &mut P,
    world: IRect,
    base: &BackgroundModel,
    out: &Snapshot<BackgroundModel>,
) -> Result<(), WorkerError> {
    let frame = provider.capture(world)?;
    if let Some(rgb) = detect_background(&frame, base.sample_stride(), base.cluster_distance())? {
        if out.load().reference() != Some(rgb) {
            out.publish(base.with_reference(rgb));
        }
    }
    Ok(())
}

/// An external signal the trigger detector polls.
pub trait TriggerSource {
    fn detect(&mut self) -> Result<bool, TriggerError>;
}

/// One detector pass: raise `flag` when `source` reports a detection.
pub fn poll_trigger<S: TriggerSource + ?Sized>(
    source: &mut S,
    flag: &TriggerFlag,
) -> Result<(), WorkerError> {
    if source.detect()? {
        flag.raise();
    }
    Ok(())
}

/// Root mean square of a block of samples.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
}

/// Peak level shared between an audio callback and a detector.
#[derive(Debug, Clone, Default)]
pub struct LevelMeter(Arc<AtomicU32>);

impl LevelMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the larger of the stored and the new level.
    pub fn record(&self, level: f32) {
        // non-negative floats order the same as their bit patterns
        self.0.fetch_max(level.max(0.0).to_bits(), Ordering::AcqRel);
    }

    /// Peak since the previous call.
    pub fn take(&self) -> f32 {
        f32::from_bits(self.0.swap(0, Ordering::AcqRel))
    }
}

/// Fires when the loudest block since the last poll exceeds `threshold`.
#[derive(Debug, Clone)]
pub struct LoudnessTrigger {
    meter: LevelMeter,
    threshold: f32,
}

impl LoudnessTrigger {
    pub fn new(meter: LevelMeter, threshold: f32) -> Self {
        Self { meter, threshold }
    }
}

impl TriggerSource for LoudnessTrigger {
    fn detect(&mut self) -> Result<bool, TriggerError> {
        Ok(self.meter.take() > self.threshold)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use bevy::math::IVec2;

    use super::*;
    use crate::capture::PixelBuffer;
    use crate::classify::ClassifierConfig;
    use crate::error::CaptureError;

    struct Solid([u8; 3]);

    impl CaptureProvider for Solid {
        fn capture(&mut self, region: IRect) -> Result<PixelBuffer, CaptureError> {
            Ok(PixelBuffer::filled(
                region.width() as u32,
                region.height() as u32,
                region.min,
                self.0,
            ))
        }
    }

    struct Broken;

    impl CaptureProvider for Broken {
        fn capture(&mut self, _region: IRect) -> Result<PixelBuffer, CaptureError> {
            Err(CaptureError::Unavailable("display closed".into()))
        }
    }

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn flag_is_consumed_once() {
        let flag = TriggerFlag::new();
        assert!(!flag.take());
        flag.raise();
        flag.raise();
        assert!(flag.is_raised());
        assert!(flag.take());
        assert!(!flag.take());
    }

    #[test]
    fn snapshot_replaces_whole_value() {
        let snap = Snapshot::new(vec![1, 2, 3]);
        let reader = snap.clone();
        let before = reader.load();
        snap.publish(vec![4]);
        assert_eq!(*before, vec![1, 2, 3]);
        assert_eq!(*reader.load(), vec![4]);
    }

    #[test]
    fn ambient_pass_publishes_detected_colour() {
        let base = BackgroundModel::from_config(&ClassifierConfig::default());
        let out = Snapshot::new(base.clone());
        let world = IRect::new(0, 0, 64, 48);

        sample_ambient_color(&mut Solid([10, 120, 60]), world, &base, &out).unwrap();
        assert_eq!(out.load().reference(), Some([10, 120, 60]));

        let err = sample_ambient_color(&mut Broken, world, &base, &out).unwrap_err();
        assert!(matches!(err, WorkerError::Capture(_)));
        assert_eq!(out.load().reference(), Some([10, 120, 60]));
    }

    #[test]
    fn loudness_trigger_uses_peak_since_last_poll() {
        let meter = LevelMeter::new();
        let mut trigger = LoudnessTrigger::new(meter.clone(), 0.1);
        let flag = TriggerFlag::new();

        meter.record(rms(&[0.01, -0.02, 0.015]));
        poll_trigger(&mut trigger, &flag).unwrap();
        assert!(!flag.is_raised());

        meter.record(rms(&[0.5, -0.5, 0.5, -0.5]));
        meter.record(0.02);
        poll_trigger(&mut trigger, &flag).unwrap();
        assert!(flag.take());

        poll_trigger(&mut trigger, &flag).unwrap();
        assert!(!flag.is_raised());
    }

    #[test]
    fn rms_of_constant_signal() {
        assert_eq!(rms(&[]), 0.0);
        assert!((rms(&[0.5, -0.5]) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn worker_survives_errors_and_panics() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let mut worker = Worker::spawn("flaky", Duration::from_millis(1), move || {
            let counter = Arc::clone(&counter);
            Ok(move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                match n % 3 {
                    0 => Err(WorkerError::Trigger(TriggerError::Source("no mic".into()))),
                    1 => panic!("boom"),
                    _ => Ok(()),
                }
            })
        })
        .unwrap();

        assert!(wait_until(|| runs.load(Ordering::SeqCst) >= 7));
        assert!(worker.is_running());
        assert!(worker.shutdown(Duration::from_secs(2)));
        assert!(!worker.is_running());
        assert!(worker.shutdown(Duration::from_millis(1)));
    }

    #[test]
    fn failed_setup_is_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&attempts);
        let flag = TriggerFlag::new();
        let raised = flag.clone();
        let mut worker = Worker::spawn("late-mic", Duration::from_millis(1), move || {
            if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                return Err(WorkerError::Trigger(TriggerError::Source("busy".into())));
            }
            let flag = raised.clone();
            Ok(move || {
                flag.raise();
                Ok(())
            })
        })
        .unwrap();

        assert!(wait_until(|| flag.is_raised()));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        worker.shutdown(Duration::from_secs(2));
    }

    #[test]
    fn panicking_setup_is_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));
        let (seen, counter) = (Arc::clone(&attempts), Arc::clone(&runs));
        let mut worker = Worker::spawn("device-scan", Duration::from_millis(1), move || {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("device enumeration blew up");
            }
            let counter = Arc::clone(&counter);
            Ok(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
        .unwrap();

        assert!(wait_until(|| runs.load(Ordering::SeqCst) >= 3));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(worker.is_running());
        assert!(worker.shutdown(Duration::from_secs(2)));
    }

    #[test]
    fn world_region_is_whole_desktop() {
        let base = BackgroundModel::from_config(&ClassifierConfig::default());
        let out = Snapshot::new(base.clone());
        let mut provider = Solid([200, 200, 200]);
        let world = IRect::from_corners(IVec2::ZERO, IVec2::new(320, 200));
        sample_ambient_color(&mut provider, world, &base, &out).unwrap();
        assert_eq!(out.load().reference(), Some([200, 200, 200]));
    }
}
