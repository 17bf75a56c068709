//! End-to-end scenarios on a running engine with real workers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Sender};
use parking_lot::Mutex;
use serde_json::json;

use actiontree::action::{Action, ActionFactory, ActionMeta, ActionOutcome, ParseContext};
use actiontree::condition::Condition;
use actiontree::execution::{
    EngineConfig, JobResult, JobStatus, SubmitError, ThreadContext, ThreadEndCode, ThreadState, Waker,
};
use actiontree::workflow::{parse_document, NodeShape, ParseError};
use actiontree::{Engine, Job, JobDefinition, Node};

const TIMEOUT: Duration = Duration::from_secs(10);

fn engine_with(config: EngineConfig) -> Engine {
    Engine::new(config).unwrap()
}

fn engine() -> Engine {
    engine_with(EngineConfig::default().with_workers(4))
}

fn run_yaml(engine: &Engine, yaml: &str) -> Arc<Job> {
    let document = parse_document(yaml).unwrap();
    let job = engine.submit_document(&document, "scenario.yaml").unwrap();
    assert!(job.wait_timeout(TIMEOUT), "job {} did not finish", job.number());
    job
}

fn wait_for<T>(mut check: impl FnMut() -> Option<T>) -> T {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        if let Some(value) = check() {
            return value;
        }
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Suspends once and hands its waker to the test.
#[derive(Debug)]
struct ParkAction {
    meta: Arc<ActionMeta>,
    slot: Arc<Mutex<Option<Waker>>>,
    parked: bool,
}

impl Action for ParkAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn execute(&mut self, ctx: &mut ThreadContext<'_>) -> ActionOutcome {
        if self.parked {
            ctx.pop_action();
            return ActionOutcome::Proceed;
        }
        self.parked = true;
        *self.slot.lock() = Some(ctx.waker());
        ActionOutcome::Suspend
    }

    fn clone_action(&self) -> Box<dyn Action> {
        Box::new(ParkAction {
            meta: Arc::clone(&self.meta),
            slot: Arc::clone(&self.slot),
            parked: false,
        })
    }
}

type Builder = Box<dyn Fn(Arc<ActionMeta>) -> Arc<dyn Action> + Send + Sync>;

/// Registers a childless test element.
struct ElementFactory {
    element: &'static str,
    make: Builder,
}

impl ActionFactory for ElementFactory {
    fn element(&self) -> &str {
        self.element
    }

    fn grammar(&self) -> String {
        NodeShape::new(self.element).grammar()
    }

    fn build(&self, node: &Node, ctx: &ParseContext<'_>) -> Result<Arc<dyn Action>, ParseError> {
        NodeShape::new(self.element).check(node, &ctx.location(node))?;
        Ok((self.make)(ctx.meta(node)))
    }
}

fn register(engine: &Engine, element: &'static str, make: Builder) {
    engine
        .register_factory(Arc::new(ElementFactory { element, make }))
        .unwrap();
}

fn park_engine() -> (Engine, Arc<Mutex<Option<Waker>>>) {
    let engine = engine();
    let slot = Arc::new(Mutex::new(None));
    let shared = Arc::clone(&slot);
    register(
        &engine,
        "park",
        Box::new(move |meta: Arc<ActionMeta>| -> Arc<dyn Action> {
            Arc::new(ParkAction {
                meta,
                slot: Arc::clone(&shared),
                parked: false,
            })
        }),
    );
    (engine, slot)
}

/// Hands several wakers out per cycle and records overlapping runs.
#[derive(Debug)]
struct Storm {
    in_flight: AtomicBool,
    overlaps: AtomicUsize,
    runs: AtomicUsize,
    outbox: Sender<Waker>,
}

const STORM_RUNS: usize = 200;

#[derive(Debug)]
struct StormAction {
    meta: Arc<ActionMeta>,
    storm: Arc<Storm>,
}

impl Action for StormAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn execute(&mut self, ctx: &mut ThreadContext<'_>) -> ActionOutcome {
        let storm = &self.storm;
        if storm.in_flight.swap(true, Ordering::SeqCst) {
            storm.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let runs = storm.runs.fetch_add(1, Ordering::SeqCst) + 1;
        std::thread::yield_now();
        storm.in_flight.store(false, Ordering::SeqCst);

        if runs >= STORM_RUNS {
            ctx.pop_action();
            return ActionOutcome::Proceed;
        }
        for _ in 0..4 {
            let _ = storm.outbox.send(ctx.waker());
        }
        ActionOutcome::Suspend
    }

    fn clone_action(&self) -> Box<dyn Action> {
        Box::new(StormAction {
            meta: Arc::clone(&self.meta),
            storm: Arc::clone(&self.storm),
        })
    }
}

#[derive(Debug)]
struct PanicAction {
    meta: Arc<ActionMeta>,
}

impl Action for PanicAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn execute(&mut self, _ctx: &mut ThreadContext<'_>) -> ActionOutcome {
        panic!("boom");
    }

    fn clone_action(&self) -> Box<dyn Action> {
        Box::new(PanicAction {
            meta: Arc::clone(&self.meta),
        })
    }
}

const PARK: &str = "
element: workflow
children:
  - element: park
  - element: script
    text: \"RESULT = 'woken'\"
";

#[test]
fn empty_root_completes_ok() {
    let engine = engine();
    let job = engine.submit(JobDefinition::new("empty")).unwrap();
    assert!(job.wait_timeout(TIMEOUT));

    let outcome = job.outcome().unwrap();
    assert_eq!(outcome.status, JobStatus::Normal);
    assert_eq!(outcome.end_code, Some(ThreadEndCode::Ok));
    assert!(outcome.unhandled.is_empty());
    assert_eq!(engine.live_threads(), 0);
}

#[test]
fn break_leaves_loop() {
    let engine = engine();
    let job = run_yaml(
        &engine,
        r#"
element: workflow
children:
  - element: script
    text: "count = 0"
  - element: loop
    attributes: { var: i, to: 100 }
    children:
      - element: sequence
        children:
          - element: script
            text: "count = count + 1"
          - element: if
            attributes: { expr: "count == 3" }
            children:
              - element: break
  - element: script
    text: "RESULT = count"
"#,
    );

    let outcome = job.outcome().unwrap();
    assert_eq!(outcome.status, JobStatus::Normal);
    assert_eq!(outcome.result, json!(3));
}

#[test]
fn woken_thread_resumes() {
    let (engine, slot) = park_engine();
    let job = engine
        .submit_document(&parse_document(PARK).unwrap(), "park.yaml")
        .unwrap();

    let waker = wait_for(|| slot.lock().take());
    assert!(waker.wake());
    assert!(job.wait_timeout(TIMEOUT));
    assert_eq!(job.outcome().unwrap().result, json!("woken"));
}

#[test]
fn terminated_thread_ignores_stale_wake() {
    let (engine, slot) = park_engine();
    let job = engine
        .submit_document(&parse_document(PARK).unwrap(), "park.yaml")
        .unwrap();

    let waker = wait_for(|| slot.lock().take());
    let root = job.root().unwrap();
    wait_for(|| (root.state() == ThreadState::Suspended).then_some(()));

    root.terminate(ThreadEndCode::StoppedByParent);
    assert!(!waker.wake());
    assert!(job.wait_timeout(TIMEOUT));

    let outcome = job.outcome().unwrap();
    assert_eq!(outcome.end_code, Some(ThreadEndCode::StoppedByParent));
    assert_eq!(outcome.status, JobStatus::Abnormal);
    assert_eq!(outcome.result, json!(null));
}

#[test]
fn capacity_ceiling_rejects_next_job() {
    let engine = engine_with(EngineConfig::default().with_workers(2).with_max_live_threads(2));
    let sleeper = parse_document(
        "
element: workflow
children:
  - element: delay
    attributes: { duration: \"'1h'\" }
",
    )
    .unwrap();

    let first = engine.submit_document(&sleeper, "sleep.yaml").unwrap();
    let second = engine.submit_document(&sleeper, "sleep.yaml").unwrap();
    let err = engine.submit_document(&sleeper, "sleep.yaml").unwrap_err();
    assert!(matches!(err, SubmitError::Capacity { limit: 2 }));
    assert_eq!(err.status_code(), 58);
    assert!(err.payload().is_none());
    assert_eq!(engine.jobs(), vec![first.number(), second.number()]);

    first.terminate();
    second.terminate();
    assert!(first.wait_timeout(TIMEOUT));
    assert!(second.wait_timeout(TIMEOUT));
    assert_eq!(first.outcome().unwrap().status, JobStatus::Terminated);

    wait_for(|| (engine.live_threads() == 0).then_some(()));
    let third = engine.submit(JobDefinition::new("after")).unwrap();
    assert!(third.wait_timeout(TIMEOUT));
}

#[test]
fn try_catch_by_prefix() {
    let engine = engine();
    let job = run_yaml(
        &engine,
        r#"
element: workflow
children:
  - element: try
    children:
      - element: throw
        attributes: { exception: "'Net.Timeout'", data: "{'host': 'db1'}" }
      - element: catch
        attributes: { exception: "'Disk'" }
        children:
          - element: script
            text: "RESULT = 'wrong handler'"
      - element: catch
        attributes: { exception: "'Net'", var: err }
        children:
          - element: script
            text: "RESULT = err['host']"
"#,
    );

    let outcome = job.outcome().unwrap();
    assert_eq!(outcome.status, JobStatus::Normal);
    assert_eq!(outcome.result, json!("db1"));
}

#[test]
fn parallel_branches_join() {
    let engine = engine();
    let job = run_yaml(
        &engine,
        r#"
element: workflow
children:
  - element: paralleliterate
    attributes: { var: n, in: "[1, 2, 3, 4, 5, 6, 7, 8]" }
    children:
      - element: delay
        attributes: { duration: 10 }
  - element: script
    text: "RESULT = 'joined'"
"#,
    );

    let outcome = job.outcome().unwrap();
    assert_eq!(outcome.status, JobStatus::Normal);
    assert_eq!(outcome.result, json!("joined"));
    assert_eq!(job.timeline().durations().len(), 9);
    assert_eq!(engine.live_threads(), 0);
}

#[test]
fn parallel_failure_stops_siblings() {
    let engine = engine();
    let started = Instant::now();
    let job = run_yaml(
        &engine,
        r#"
element: workflow
children:
  - element: parallel
    children:
      - element: delay
        attributes: { duration: "'1h'" }
      - element: sequence
        children:
          - element: delay
            attributes: { duration: 10 }
          - element: throw
            attributes: { exception: "'Branch.Failed'" }
"#,
    );

    let outcome = job.outcome().unwrap();
    assert_eq!(outcome.status, JobStatus::Abnormal);
    assert_eq!(outcome.unhandled.len(), 1);
    assert_eq!(outcome.unhandled[0].exception_info().unwrap().name, "Branch.Failed");
    assert!(started.elapsed() < TIMEOUT);
    assert_eq!(engine.live_threads(), 0);
}

#[test]
fn timer_expiry_interrupts_body() {
    let engine = engine();
    let job = run_yaml(
        &engine,
        r#"
element: workflow
children:
  - element: timer
    attributes: { duration: 50 }
    children:
      - element: delay
        attributes: { duration: "'1h'" }
  - element: script
    text: "RESULT = RC"
"#,
    );
    assert_eq!(job.outcome().unwrap().result, json!(1));
}

#[test]
fn signal_handler_runs() {
    let engine = engine();
    let job = run_yaml(
        &engine,
        r#"
element: workflow
children:
  - element: signalhandler
    attributes: { signal: "'Reload'" }
    children:
      - element: script
        text: "RESULT = 'reloaded'"
  - element: raise
    attributes: { signal: "'Reload'" }
"#,
    );

    let outcome = job.outcome().unwrap();
    assert_eq!(outcome.status, JobStatus::Normal);
    assert_eq!(outcome.result, json!("reloaded"));
}

#[test]
fn reentrant_signal_stops_thread() {
    let engine = engine();
    let job = run_yaml(
        &engine,
        r#"
element: workflow
children:
  - element: signalhandler
    attributes: { signal: "'Loop'" }
    children:
      - element: raise
        attributes: { signal: "'Loop'" }
  - element: raise
    attributes: { signal: "'Loop'" }
"#,
    );

    let outcome = job.outcome().unwrap();
    assert_eq!(outcome.status, JobStatus::Abnormal);
    assert_eq!(outcome.end_code, Some(ThreadEndCode::DuplicateSignal));
}

#[test]
fn start_function_returns_result() {
    let engine = engine();
    let job = run_yaml(
        &engine,
        r#"
element: workflow
attributes: { name: summing, start: main, args: "[1, 2, 3]" }
children:
  - element: function
    attributes: { name: main }
    children:
      - element: sequence
        children:
          - element: script
            text: "total = 0"
          - element: iterate
            attributes: { var: n, in: ARGS }
            children:
              - element: script
                text: "total = total + n"
          - element: return
            attributes: { value: total }
"#,
    );

    assert_eq!(job.name(), "summing");
    let outcome = job.outcome().unwrap();
    assert_eq!(outcome.status, JobStatus::Normal);
    assert_eq!(outcome.result, json!(6));
}

#[test]
fn unknown_start_function_is_rejected() {
    let engine = engine();
    let document = parse_document(
        "
element: workflow
attributes: { start: missing }
",
    )
    .unwrap();
    let err = engine.submit_document(&document, "bad.yaml").unwrap_err();
    assert_eq!(err.status_code(), 48);
    let payload = err.payload().unwrap();
    assert!(payload.error_message.contains("missing"));
    assert_eq!(engine.live_threads(), 0);
}

#[test]
fn malformed_document_is_rejected() {
    let engine = engine();
    let document = parse_document("element: workflow\nchildren:\n  - element: bogus\n").unwrap();
    let err = engine.submit_document(&document, "bad.yaml").unwrap_err();
    assert_eq!(err.status_code(), 47);
    assert!(err.job_number().is_some());
    assert_eq!(engine.live_threads(), 0);
}

#[test]
fn hold_parks_until_release() {
    let engine = engine();
    let document = parse_document(
        r#"
element: workflow
children:
  - element: delay
    attributes: { duration: 30 }
  - element: script
    text: "RESULT = 'released'"
"#,
    )
    .unwrap();
    let job = engine.submit_document(&document, "hold.yaml").unwrap();
    assert!(job.hold(1));

    assert!(!job.wait_timeout(Duration::from_millis(200)));
    assert!(job.release(1));
    assert!(job.wait_timeout(TIMEOUT));
    assert_eq!(job.outcome().unwrap().result, json!("released"));
}

#[test]
fn completion_listeners_fire_once() {
    let engine = engine();
    let fired = Arc::new(AtomicUsize::new(0));
    let document = parse_document(
        r#"
element: workflow
children:
  - element: parallel
    children:
      - element: nop
      - element: nop
      - element: nop
"#,
    )
    .unwrap();

    let jobs: Vec<Arc<Job>> = (0..25)
        .map(|_| {
            let job = engine.submit_document(&document, "many.yaml").unwrap();
            let counter = Arc::clone(&fired);
            job.add_completion_notifiee(Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
            job
        })
        .collect();

    for job in &jobs {
        assert!(job.wait_timeout(TIMEOUT));
        assert_eq!(job.outcome().unwrap().status, JobStatus::Normal);
    }
    assert_eq!(fired.load(Ordering::SeqCst), 25);

    let late = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&late);
    jobs[0].add_completion_notifiee(Box::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    assert_eq!(late.load(Ordering::SeqCst), 1);
    assert_eq!(fired.load(Ordering::SeqCst), 25);
}

#[test]
fn result_is_saved() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(
        EngineConfig::default()
            .with_workers(2)
            .with_result_dir(dir.path()),
    );
    let job = run_yaml(
        &engine,
        r#"
element: workflow
attributes: { name: saved }
children:
  - element: script
    text: "RESULT = [1, 2]"
"#,
    );

    let record = JobResult::load(dir.path(), job.number()).unwrap();
    assert_eq!(record.job_name, "saved");
    assert_eq!(record.status, JobStatus::Normal);
    assert_eq!(record.result, json!([1, 2]));
    assert!(record.thread_durations_ms.contains_key("T1"));
}

#[test]
fn concurrent_wakes_never_overlap() {
    let engine = engine_with(EngineConfig::default().with_workers(8));
    let (outbox, inbox) = unbounded();
    let storm = Arc::new(Storm {
        in_flight: AtomicBool::new(false),
        overlaps: AtomicUsize::new(0),
        runs: AtomicUsize::new(0),
        outbox,
    });
    let shared = Arc::clone(&storm);
    register(
        &engine,
        "storm",
        Box::new(move |meta: Arc<ActionMeta>| -> Arc<dyn Action> {
            Arc::new(StormAction {
                meta,
                storm: Arc::clone(&shared),
            })
        }),
    );

    let wakers: Vec<_> = (0..4)
        .map(|_| {
            let inbox = inbox.clone();
            std::thread::spawn(move || {
                while let Ok(waker) = inbox.recv_timeout(Duration::from_millis(500)) {
                    waker.wake();
                }
            })
        })
        .collect();

    let job = run_yaml(&engine, "element: workflow\nchildren:\n  - element: storm\n");
    for handle in wakers {
        handle.join().unwrap();
    }

    assert_eq!(job.outcome().unwrap().status, JobStatus::Normal);
    assert_eq!(storm.overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(storm.runs.load(Ordering::SeqCst), STORM_RUNS);
}

#[test]
fn panicking_action_fails_job() {
    let engine = engine();
    register(
        &engine,
        "explode",
        Box::new(|meta: Arc<ActionMeta>| -> Arc<dyn Action> { Arc::new(PanicAction { meta }) }),
    );

    let job = run_yaml(
        &engine,
        r#"
element: workflow
children:
  - element: script
    text: "RESULT = 'before'"
  - element: explode
  - element: script
    text: "RESULT = 'after'"
"#,
    );

    let outcome = job.outcome().unwrap();
    assert_eq!(outcome.status, JobStatus::Abnormal);
    assert_eq!(outcome.result, json!("before"));
    assert_eq!(outcome.unhandled[0].exception_info().unwrap().name, "ActionPanicked");
    assert_eq!(engine.live_threads(), 0);
}

const SLEEPER: &str = "
element: workflow
children:
  - element: delay
    attributes: { duration: \"'1h'\" }
";

fn count_completions(job: &Arc<Job>) -> Arc<AtomicUsize> {
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    job.add_completion_notifiee(Box::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    fired
}

#[test]
fn shutdown_terminates_running_jobs() {
    let engine = engine();
    let job = engine
        .submit_document(&parse_document(SLEEPER).unwrap(), "sleeper.yaml")
        .unwrap();
    let fired = count_completions(&job);
    let root = job.root().unwrap();
    wait_for(|| (root.state() == ThreadState::Suspended).then_some(()));

    engine.shutdown();
    assert!(job.wait_timeout(Duration::from_secs(2)));
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    let outcome = job.outcome().unwrap();
    assert_eq!(outcome.status, JobStatus::Terminated);
    assert_eq!(outcome.end_code, Some(ThreadEndCode::StoppedByParent));
    assert!(engine.jobs().is_empty());
    assert_eq!(engine.live_threads(), 0);
}

#[test]
fn shutdown_completes_jobs_that_do_not_stop() {
    let engine = engine_with(
        EngineConfig::default()
            .with_workers(2)
            .with_shutdown_grace(Duration::from_millis(100)),
    );
    let job = engine
        .submit_document(&parse_document(SLEEPER).unwrap(), "sleeper.yaml")
        .unwrap();
    let fired = count_completions(&job);
    let root = job.root().unwrap();
    wait_for(|| (root.state() == ThreadState::Suspended).then_some(()));
    assert!(job.hold(root.id()));

    let started = Instant::now();
    engine.shutdown();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(job.wait_timeout(Duration::from_secs(2)));
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    let outcome = job.outcome().unwrap();
    assert_eq!(outcome.status, JobStatus::Terminated);
    assert_eq!(outcome.end_code, None);
    assert!(!root.is_complete());
    assert_eq!(engine.live_threads(), 0);
}

#[test]
fn hold_keeps_stopped_thread_parked_until_release() {
    for exception_first in [true, false] {
        let (engine, slot) = park_engine();
        let job = engine
            .submit_document(&parse_document(PARK).unwrap(), "park.yaml")
            .unwrap();
        let _waker = wait_for(|| slot.lock().take());
        let root = job.root().unwrap();
        wait_for(|| (root.state() == ThreadState::Suspended).then_some(()));

        assert!(job.hold(root.id()));
        let raise = || {
            root.add_condition(Condition::exception("Injected", json!(null), vec![], "scenario"));
            root.schedule();
        };
        if exception_first {
            raise();
            assert!(job.terminate_thread(root.id()));
        } else {
            assert!(job.terminate_thread(root.id()));
            raise();
        }

        assert!(!job.wait_timeout(Duration::from_millis(200)));
        assert_eq!(root.state(), ThreadState::Suspended);
        assert!(root.conditions()[0].kind().is_hold());

        assert!(job.release(root.id()));
        assert!(job.wait_timeout(TIMEOUT));
        let outcome = job.outcome().unwrap();
        assert_eq!(outcome.end_code, Some(ThreadEndCode::StoppedByParent));
        assert_eq!(outcome.status, JobStatus::Abnormal);
        assert_eq!(outcome.result, json!(null));
    }
}
