//! The worker half of the control protocol.
//!
//! A worker process dials the supervisor's port, announces which target it
//! loaded, then executes one input per request until told to stop. Coverage is
//! gathered through an injected [`CoverageAgent`]; failures travel back as
//! ordinary data inside an [`ExecutionReport`].

use crate::channel::{ChannelError, Connection, ExecutionReport, Request, WorkerHello};
use crate::coverage::{BranchAnalyzer, CoverageBlob, DescriptorAnalyzer, UnitId};
use crate::failure::RaisedError;
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::fs;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Control channel failed: {0}")]
    Channel(#[from] ChannelError),
    #[error("Unknown target '{target}' (known targets: {known:?})")]
    UnknownTarget { target: String, known: Vec<String> },
    #[error("Failed to set up target '{target}': {reason}")]
    HarnessSetup { target: String, reason: String },
    #[error("Invalid probe descriptor: {0}")]
    Descriptor(String),
    #[error("Usage: <port> <target> [args...] ({0})")]
    Usage(String),
}

/// Reset/snapshot capability over the process's coverage state.
pub trait CoverageAgent: Send {
    fn reset(&mut self);
    fn snapshot(&mut self) -> CoverageBlob;
}

/// Hit flags for one registered unit. Cheap to clone and share with the
/// harness code that records hits.
#[derive(Debug, Clone)]
pub struct UnitProbes {
    id: UnitId,
    name: String,
    probes: Arc<[AtomicBool]>,
}

impl UnitProbes {
    /// Marks probe `index` as hit. Out-of-range indices are ignored.
    pub fn hit(&self, index: usize) {
        if let Some(probe) = self.probes.get(index) {
            probe.store(true, Ordering::Relaxed);
        }
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    fn flags(&self) -> Vec<bool> {
        self.probes.iter().map(|p| p.load(Ordering::Relaxed)).collect()
    }

    fn clear(&self) {
        for probe in self.probes.iter() {
            probe.store(false, Ordering::Relaxed);
        }
    }
}

/// In-process probe recorder: the default [`CoverageAgent`].
#[derive(Debug, Clone, Default)]
pub struct ProbeMap {
    units: Arc<Mutex<Vec<UnitProbes>>>,
}

impl ProbeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a unit from the same descriptor bytes the coverage
    /// calculator reads, so ids line up on both sides.
    pub fn register(&self, descriptor: &[u8]) -> Result<UnitProbes, WorkerError> {
        let analysis = DescriptorAnalyzer
            .analyze(descriptor)
            .map_err(|e| WorkerError::Descriptor(e.to_string()))?;
        Ok(self.register_raw(
            UnitId::of(descriptor),
            analysis.name,
            analysis.probe_branches.len(),
        ))
    }

    pub fn register_raw(&self, id: UnitId, name: impl Into<String>, probe_count: usize) -> UnitProbes {
        let unit = UnitProbes {
            id,
            name: name.into(),
            probes: (0..probe_count).map(|_| AtomicBool::new(false)).collect(),
        };
        lock(&self.units).push(unit.clone());
        unit
    }
}

impl CoverageAgent for ProbeMap {
    fn reset(&mut self) {
        for unit in lock(&self.units).iter() {
            unit.clear();
        }
    }

    fn snapshot(&mut self) -> CoverageBlob {
        let mut blob = CoverageBlob::new();
        for unit in lock(&self.units).iter() {
            blob.record(unit.id, unit.name.clone(), unit.flags());
        }
        blob
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The code under test, invoked once per input.
pub trait Harness: Send {
    fn run(&mut self, data: &[u8]) -> anyhow::Result<()>;
}

impl<F> Harness for F
where
    F: FnMut(&[u8]) -> anyhow::Result<()> + Send,
{
    fn run(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self(data)
    }
}

type HarnessFactory =
    Box<dyn Fn(&ProbeMap, &[String]) -> anyhow::Result<Box<dyn Harness>> + Send + Sync>;

/// Targets compiled into a worker binary, selected by name at launch.
#[derive(Default)]
pub struct HarnessRegistry {
    factories: BTreeMap<String, HarnessFactory>,
}

impl HarnessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&ProbeMap, &[String]) -> anyhow::Result<Box<dyn Harness>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
        self
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn instantiate(
        &self,
        target: &str,
        probes: &ProbeMap,
        args: &[String],
    ) -> Result<Box<dyn Harness>, WorkerError> {
        let factory = self
            .factories
            .get(target)
            .ok_or_else(|| WorkerError::UnknownTarget {
                target: target.to_string(),
                known: self.names(),
            })?;
        factory(probes, args).map_err(|e| WorkerError::HarnessSetup {
            target: target.to_string(),
            reason: format!("{e:#}"),
        })
    }
}

impl std::fmt::Debug for HarnessRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HarnessRegistry")
            .field("targets", &self.names())
            .finish()
    }
}

struct PanicCapture {
    backtrace: Backtrace,
    location: Option<(String, u32)>,
}

static LAST_PANIC: Mutex<Option<PanicCapture>> = Mutex::new(None);
static HOOK: Once = Once::new();

thread_local! {
    static IN_HARNESS: Cell<bool> = const { Cell::new(false) };
}

/// Panics raised while a harness runs are captured quietly with a forced
/// backtrace; every other panic goes to the previously installed hook.
fn install_panic_hook() {
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if IN_HARNESS.with(Cell::get) {
                let location = info
                    .location()
                    .map(|loc| (loc.file().to_string(), loc.line()));
                *lock(&LAST_PANIC) = Some(PanicCapture {
                    backtrace: Backtrace::force_capture(),
                    location,
                });
            } else {
                previous(info);
            }
        }));
    });
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic type".to_string()
    }
}

/// Builds the failure payload. A fault while building it must not cost the
/// coverage half of the report, so it is dropped instead.
fn bundle_failure(build: impl FnOnce() -> RaisedError) -> Option<RaisedError> {
    match catch_unwind(AssertUnwindSafe(build)) {
        Ok(raised) => Some(raised),
        Err(_) => {
            tracing::warn!("Failed to bundle failure report; sending coverage only");
            None
        }
    }
}

/// Runs the harness once, converting a returned error or a panic into a
/// [`RaisedError`].
pub fn run_guarded(harness: &mut dyn Harness, data: &[u8]) -> Option<RaisedError> {
    install_panic_hook();
    *lock(&LAST_PANIC) = None;

    IN_HARNESS.with(|flag| flag.set(true));
    let outcome = catch_unwind(AssertUnwindSafe(|| harness.run(data)));
    IN_HARNESS.with(|flag| flag.set(false));

    match outcome {
        Ok(Ok(())) => None,
        Ok(Err(err)) => bundle_failure(|| RaisedError::from_error(&err)),
        Err(payload) => {
            let capture = lock(&LAST_PANIC).take();
            let message = panic_message(payload.as_ref());
            bundle_failure(|| match capture {
                Some(capture) => {
                    RaisedError::from_panic(message, Some(&capture.backtrace), capture.location)
                }
                None => RaisedError::from_panic(message, None, None),
            })
        }
    }
}

/// Worker side of one control connection.
#[derive(Debug)]
pub struct Worker {
    conn: Connection,
}

impl Worker {
    pub fn connect(port: u16) -> Result<Self, WorkerError> {
        Ok(Self {
            conn: Connection::connect(port)?,
        })
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    pub fn announce(&mut self, target: &str, status: Result<(), String>) -> Result<(), WorkerError> {
        self.conn.send(&WorkerHello {
            target: target.to_string(),
            status,
        })?;
        Ok(())
    }

    /// Serves requests until the shutdown sentinel or EOF. Returns how many
    /// inputs were executed.
    pub fn serve(
        &mut self,
        harness: &mut dyn Harness,
        agent: &mut dyn CoverageAgent,
    ) -> Result<usize, WorkerError> {
        let mut executed = 0;
        loop {
            let request: Request = match self.conn.receive() {
                Ok(request) => request,
                Err(ChannelError::Disconnected) => {
                    tracing::debug!("Supervisor disconnected");
                    break;
                }
                Err(e) => return Err(e.into()),
            };
            match request {
                Request::Shutdown => break,
                Request::Input(path) => {
                    let report = execute_input(&path, harness, agent);
                    self.conn.send(&report)?;
                    executed += 1;
                }
            }
        }
        self.conn.close();
        Ok(executed)
    }
}

fn execute_input(
    path: &Path,
    harness: &mut dyn Harness,
    agent: &mut dyn CoverageAgent,
) -> ExecutionReport {
    agent.reset();
    let failure = match fs::read(path) {
        Ok(data) => run_guarded(harness, &data),
        Err(e) => Some(RaisedError::new(
            "io",
            format!("failed to read input {}: {e}", path.display()),
        )),
    };
    ExecutionReport {
        coverage: agent.snapshot(),
        failure,
    }
}

/// Entry point for worker binaries: `<port> <target> [args...]`.
///
/// Loads `target` from `registry`, reports the outcome to the supervisor and
/// serves inputs until shutdown.
pub fn run_from_args(
    registry: &HarnessRegistry,
    args: impl IntoIterator<Item = String>,
) -> Result<usize, WorkerError> {
    let mut args = args.into_iter();
    let port = args
        .next()
        .ok_or_else(|| WorkerError::Usage("missing port".to_string()))?;
    let port: u16 = port
        .parse()
        .map_err(|_| WorkerError::Usage(format!("invalid port '{port}'")))?;
    let target = args
        .next()
        .ok_or_else(|| WorkerError::Usage("missing target".to_string()))?;
    let extra: Vec<String> = args.collect();

    let mut worker = Worker::connect(port)?;
    let mut probes = ProbeMap::new();
    let mut harness = match registry.instantiate(&target, &probes, &extra) {
        Ok(harness) => harness,
        Err(e) => {
            worker.announce(&target, Err(e.to_string()))?;
            return Err(e);
        }
    };
    worker.announce(&target, Ok(()))?;
    tracing::debug!("Worker serving target '{}'", target);
    worker.serve(harness.as_mut(), &mut probes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, TcpListener};
    use std::path::PathBuf;
    use std::thread;
    use tempfile::tempdir;

    const UNIT: &[u8] = b"name = \"demo.Echo\"\nbranches = [1, 2, 3]\n";

    fn echo_harness(probes: &ProbeMap) -> anyhow::Result<Box<dyn Harness>> {
        let unit = probes.register(UNIT)?;
        Ok(Box::new(move |data: &[u8]| {
            for byte in data {
                unit.hit(usize::from(*byte - b'0'));
            }
            if data.starts_with(b"9") {
                panic!("nine is not allowed");
            }
            if data.is_empty() {
                anyhow::bail!("empty input");
            }
            Ok(())
        }))
    }

    #[derive(Debug)]
    struct UnprintableError;

    impl std::fmt::Display for UnprintableError {
        fn fmt(&self, _f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            panic!("display is broken");
        }
    }

    impl std::error::Error for UnprintableError {}

    fn fragile_harness(probes: &ProbeMap) -> anyhow::Result<Box<dyn Harness>> {
        let unit = probes.register(UNIT)?;
        Ok(Box::new(move |data: &[u8]| {
            unit.hit(0);
            if data == b"bad" {
                return Err(anyhow::Error::new(UnprintableError));
            }
            Ok(())
        }))
    }

    fn registry() -> HarnessRegistry {
        HarnessRegistry::new()
            .register("echo", |probes: &ProbeMap, _args: &[String]| {
                echo_harness(probes)
            })
            .register("fragile", |probes: &ProbeMap, _args: &[String]| {
                fragile_harness(probes)
            })
    }

    fn spawn_worker(target: &str) -> (Connection, thread::JoinHandle<Result<usize, WorkerError>>) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let args = vec![port.to_string(), target.to_string()];
        let handle = thread::spawn(move || run_from_args(&registry(), args));
        let (stream, _) = listener.accept().unwrap();
        (Connection::new(stream).unwrap(), handle)
    }

    fn input(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    fn probes_of(report: &ExecutionReport) -> Vec<bool> {
        report.coverage.units().next().unwrap().probes.clone()
    }

    #[test]
    fn serves_inputs_with_fresh_coverage_each_time() {
        let dir = tempdir().unwrap();
        let (mut conn, handle) = spawn_worker("echo");
        let hello: WorkerHello = conn.receive().unwrap();
        assert_eq!(hello.status, Ok(()));

        conn.send(&Request::Input(input(dir.path(), "a", b"01"))).unwrap();
        let first: ExecutionReport = conn.receive().unwrap();
        assert_eq!(probes_of(&first), vec![true, true, false]);
        assert!(first.failure.is_none());

        conn.send(&Request::Input(input(dir.path(), "b", b"2"))).unwrap();
        let second: ExecutionReport = conn.receive().unwrap();
        assert_eq!(probes_of(&second), vec![false, false, true]);

        conn.send(&Request::Shutdown).unwrap();
        assert_eq!(handle.join().unwrap().unwrap(), 2);
    }

    #[test]
    fn panics_and_errors_become_failures_with_coverage() {
        let dir = tempdir().unwrap();
        let (mut conn, handle) = spawn_worker("echo");
        let _hello: WorkerHello = conn.receive().unwrap();

        conn.send(&Request::Input(input(dir.path(), "p", b"90"))).unwrap();
        let panicked: ExecutionReport = conn.receive().unwrap();
        let failure = panicked.failure.as_ref().expect("panic should be reported");
        assert_eq!(failure.type_name, "panic");
        assert_eq!(failure.message, "nine is not allowed");
        assert!(!failure.frames.is_empty());
        assert_eq!(probes_of(&panicked), vec![true, false, false]);

        conn.send(&Request::Input(input(dir.path(), "e", b""))).unwrap();
        let errored: ExecutionReport = conn.receive().unwrap();
        assert_eq!(errored.failure.unwrap().message, "empty input");

        conn.send(&Request::Input(dir.path().join("missing"))).unwrap();
        let unreadable: ExecutionReport = conn.receive().unwrap();
        assert_eq!(unreadable.failure.unwrap().type_name, "io");

        drop(conn);
        assert_eq!(handle.join().unwrap().unwrap(), 3);
    }

    #[test]
    fn unprintable_error_still_delivers_coverage() {
        let dir = tempdir().unwrap();
        let (mut conn, handle) = spawn_worker("fragile");
        let _hello: WorkerHello = conn.receive().unwrap();

        conn.send(&Request::Input(input(dir.path(), "bad", b"bad"))).unwrap();
        let report: ExecutionReport = conn.receive().unwrap();
        assert!(report.failure.is_none(), "got {:?}", report.failure);
        assert_eq!(probes_of(&report), vec![true, false, false]);

        conn.send(&Request::Input(input(dir.path(), "ok", b"ok"))).unwrap();
        let next: ExecutionReport = conn.receive().unwrap();
        assert!(next.failure.is_none());
        assert_eq!(probes_of(&next), vec![true, false, false]);

        conn.send(&Request::Shutdown).unwrap();
        assert_eq!(handle.join().unwrap().unwrap(), 2);
    }

    #[test]
    fn unknown_target_is_announced_and_returned() {
        let (mut conn, handle) = spawn_worker("nope");
        let hello: WorkerHello = conn.receive().unwrap();
        assert!(hello.status.unwrap_err().contains("Unknown target 'nope'"));
        assert!(matches!(
            handle.join().unwrap(),
            Err(WorkerError::UnknownTarget { .. })
        ));
    }

    #[test]
    fn usage_errors_are_reported_before_connecting() {
        let err = run_from_args(&registry(), vec!["not-a-port".to_string()]).unwrap_err();
        assert!(matches!(err, WorkerError::Usage(_)));
    }

    #[test]
    fn probe_map_reset_clears_hits() {
        let mut probes = ProbeMap::new();
        let unit = probes.register(UNIT).unwrap();
        assert_eq!(unit.len(), 3);
        unit.hit(1);
        unit.hit(17);
        assert_eq!(probes.snapshot().hit_count(), 1);
        probes.reset();
        assert_eq!(probes.snapshot().hit_count(), 0);
        assert!(probes.register(b"not toml [").is_err());
    }
}
