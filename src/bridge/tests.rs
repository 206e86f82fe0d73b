use super::*;
use crate::config::{DeliveryMode, ProgressPolicy};
use crate::cookies::{CookieJar, DefaultCookieJar};
use crate::dispatch::frame::{Frame, FrameBuffer, MAX_FRAME_DIMENSION};
use crate::engine::headless::HeadlessEngineFactory;
use crate::engine::{KeyEvent, NavigationState, TouchKind};
use crate::script::{ScriptError, ScriptResult};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn wait_for(cond: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < WAIT {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// Engine double driven by the test through its event sink.
#[derive(Default)]
struct ManualState {
    sink: Mutex<Option<EventSink>>,
    scripts: Mutex<Vec<ScriptRequest>>,
    loads: Mutex<Vec<String>>,
    shutdowns: AtomicUsize,
    /// Answer scripts with `null` from inside `execute_javascript`
    auto_answer: AtomicBool,
    cookies: Mutex<DefaultCookieJar>,
    settings: Mutex<EngineSettings>,
}

impl ManualState {
    fn sink(&self) -> EventSink {
        self.sink.lock().clone().expect("engine created")
    }

    fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

struct ManualEngine(Arc<ManualState>);

impl Engine for ManualEngine {
    fn name(&self) -> &str {
        "manual"
    }
    fn load_url(&self, url: &str) {
        self.0.loads.lock().push(url.to_string());
    }
    fn go_back(&self) {}
    fn go_forward(&self) {}
    fn reload(&self) {}
    fn stop_loading(&self) {}
    fn execute_javascript(&self, request: ScriptRequest) {
        if self.0.auto_answer.load(Ordering::SeqCst) {
            self.0.sink().script_result(request.id, Ok(serde_json::Value::Null));
        }
        self.0.scripts.lock().push(request);
    }
    fn send_touch_event(&self, _event: TouchEvent) {}
    fn send_key_event(&self, _event: KeyEvent) {}
    fn set_viewport_size(&self, _width: u32, _height: u32) {}
    fn set_cookie(&self, cookie: Cookie) {
        self.0.cookies.lock().set_cookie(cookie);
    }
    fn cookies_for(&self, domain: &str) -> Vec<Cookie> {
        self.0.cookies.lock().cookies_for(domain)
    }
    fn clear_cookies(&self) {
        self.0.cookies.lock().clear();
    }
    fn set_user_agent(&self, user_agent: &str) {
        self.0.settings.lock().user_agent = user_agent.to_string();
    }
    fn set_javascript_enabled(&self, enabled: bool) {
        self.0.settings.lock().javascript_enabled = enabled;
    }
    fn set_images_enabled(&self, enabled: bool) {
        self.0.settings.lock().images_enabled = enabled;
    }
    fn settings(&self) -> EngineSettings {
        self.0.settings.lock().clone()
    }
    fn shutdown(&self) {
        self.0.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    bridge: Arc<Bridge>,
    engines: Arc<Mutex<Vec<Arc<ManualState>>>>,
}

impl Harness {
    fn new(config: BridgeConfig) -> Self {
        init_logging();
        let engines: Arc<Mutex<Vec<Arc<ManualState>>>> = Arc::default();
        let created = engines.clone();
        let factory = move |sink: EventSink, settings: &EngineSettings| -> anyhow::Result<Arc<dyn Engine>> {
            let state = Arc::new(ManualState::default());
            *state.sink.lock() = Some(sink);
            *state.settings.lock() = settings.clone();
            created.lock().push(state.clone());
            Ok(Arc::new(ManualEngine(state)))
        };
        let bridge = Bridge::new(Some(config), Box::new(factory)).unwrap();
        Self { bridge: Arc::new(bridge), engines }
    }

    fn create(&self) -> (EngineHandle, Arc<ManualState>) {
        let h = self.bridge.create().unwrap();
        let state = self.engines.lock().last().cloned().unwrap();
        (h, state)
    }
}

fn config() -> BridgeConfig {
    BridgeConfig::builder().dispatch_threads(2).build().unwrap()
}

fn headless_bridge(config: BridgeConfig) -> Bridge {
    init_logging();
    let factory = HeadlessEngineFactory { step_delay: Duration::from_millis(1), viewport: (8, 6) };
    Bridge::new(Some(config), Box::new(factory)).unwrap()
}

#[derive(Debug, Clone, PartialEq)]
enum Ev {
    Loading(bool),
    Progress(f32),
    Url(String),
    Title(String),
    Nav(NavigationState),
    Frame(u32, u32),
    Script(ScriptResult),
}

struct Recorder(Mutex<mpsc::Sender<Ev>>);

impl Recorder {
    fn install(bridge: &Bridge, h: EngineHandle) -> mpsc::Receiver<Ev> {
        let (tx, rx) = mpsc::channel();
        bridge.set_observer(h, Arc::new(Recorder(Mutex::new(tx)))).unwrap();
        rx
    }

    fn push(&self, ev: Ev) {
        let _ = self.0.lock().send(ev);
    }
}

impl EngineObserver for Recorder {
    fn on_loading(&self, is_loading: bool) {
        self.push(Ev::Loading(is_loading));
    }
    fn on_progress(&self, progress: f32) {
        self.push(Ev::Progress(progress));
    }
    fn on_url_changed(&self, url: &str) {
        self.push(Ev::Url(url.to_string()));
    }
    fn on_title_changed(&self, title: &str) {
        self.push(Ev::Title(title.to_string()));
    }
    fn on_navigation_state(&self, state: NavigationState) {
        self.push(Ev::Nav(state));
    }
    fn on_frame(&self, frame: &Frame<'_>) {
        self.push(Ev::Frame(frame.width, frame.height));
    }
    fn on_script_result(&self, result: &ScriptResult) {
        self.push(Ev::Script(result.clone()));
    }
}

/// Collects events up to and including the first one matching `last`.
fn collect_until(rx: &mpsc::Receiver<Ev>, last: impl Fn(&Ev) -> bool) -> Vec<Ev> {
    let mut events = Vec::new();
    loop {
        let ev = rx.recv_timeout(WAIT).expect("event");
        let done = last(&ev);
        events.push(ev);
        if done {
            return events;
        }
    }
}

fn load_and_wait(bridge: &Bridge, h: EngineHandle, rx: &mpsc::Receiver<Ev>, url: &str) -> Vec<Ev> {
    bridge.load_url(h, url).unwrap();
    collect_until(rx, |e| *e == Ev::Loading(false))
}

/// Blocks a callback until the test opens the gate.
struct Gate {
    entered_tx: Mutex<mpsc::Sender<()>>,
    open_rx: Mutex<mpsc::Receiver<()>>,
}

impl Gate {
    fn new() -> (Arc<Gate>, mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (open_tx, open_rx) = mpsc::channel();
        let gate = Arc::new(Gate { entered_tx: Mutex::new(entered_tx), open_rx: Mutex::new(open_rx) });
        (gate, entered_rx, open_tx)
    }

    fn pass(&self) {
        let _ = self.entered_tx.lock().send(());
        let _ = self.open_rx.lock().recv_timeout(WAIT);
    }
}

#[test]
fn use_after_destroy_is_invalid_handle() {
    let harness = Harness::new(config());
    let bridge = &harness.bridge;
    let (h, engine) = harness.create();
    assert!(bridge.is_live(h));
    assert_eq!(bridge.len(), 1);

    bridge.destroy(h).unwrap();
    assert_eq!(engine.shutdowns(), 1);
    assert!(!bridge.is_live(h));
    assert!(bridge.is_empty());

    assert!(matches!(bridge.destroy(h), Err(BridgeError::InvalidHandle)));
    assert!(matches!(bridge.load_url(h, "https://example.com"), Err(BridgeError::InvalidHandle)));
    assert!(matches!(bridge.go_back(h), Err(BridgeError::InvalidHandle)));
    assert!(matches!(bridge.execute_javascript(h, "1", None), Err(BridgeError::InvalidHandle)));
    assert!(matches!(bridge.set_loading_callback(h, None), Err(BridgeError::InvalidHandle)));
    assert!(matches!(bridge.get_cookies(h, "example.com"), Err(BridgeError::InvalidHandle)));
    assert!(matches!(bridge.settings(h), Err(BridgeError::InvalidHandle)));
    assert_eq!(engine.shutdowns(), 1);

    // A handle created later never answers to the stale token
    let (h2, _) = harness.create();
    assert_ne!(h, h2);
    assert!(matches!(bridge.reload(h), Err(BridgeError::InvalidHandle)));
    assert!(bridge.reload(h2).is_ok());
}

#[test]
fn events_after_destroy_are_dropped() {
    let harness = Harness::new(config());
    let (h, engine) = harness.create();
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    harness
        .bridge
        .set_loading_callback(
            h,
            Some(Arc::new(move |_: bool| {
                c.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

    let sink = engine.sink();
    harness.bridge.destroy(h).unwrap();
    assert!(!sink.is_live());
    sink.loading_changed(true);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn concurrent_destroy_exactly_one_succeeds() {
    let harness = Harness::new(config());
    for _ in 0..10 {
        let (h, engine) = harness.create();
        let ok: usize = (0..6)
            .map(|_| {
                let bridge = harness.bridge.clone();
                thread::spawn(move || bridge.destroy(h))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|t| match t.join().unwrap() {
                Ok(()) => 1,
                Err(BridgeError::InvalidHandle) => 0,
                Err(e) => panic!("unexpected error {e}"),
            })
            .sum();
        assert_eq!(ok, 1);
        assert_eq!(engine.shutdowns(), 1);
    }
}

#[test]
fn concurrent_calls_during_destroy_never_use_freed_state() {
    let harness = Harness::new(config());
    let handles: Vec<_> = (0..4).map(|_| harness.create()).collect();
    for (_, engine) in &handles {
        engine.auto_answer.store(true, Ordering::SeqCst);
    }
    let ids: Arc<Vec<EngineHandle>> = Arc::new(handles.iter().map(|(h, _)| *h).collect());

    let callers: Vec<_> = (0..4)
        .map(|_| {
            let bridge = harness.bridge.clone();
            let ids = ids.clone();
            thread::spawn(move || {
                let mut rng = rand::rng();
                for _ in 0..300 {
                    let h = ids[rng.random_range(0..ids.len())];
                    let res = match rng.random_range(0..6) {
                        0 => bridge.load_url(h, "https://example.com"),
                        1 => bridge.execute_javascript(h, "1", None).map(|_| ()),
                        2 => bridge.set_progress_callback(h, Some(Arc::new(|_: f32| {}))),
                        3 => bridge.set_cookie(h, "example.com", "a", "1"),
                        4 => bridge.send_touch_event(h, TouchEvent { kind: TouchKind::Down, x: 1.0, y: 1.0 }),
                        _ => {
                            if rng.random_range(0..40) == 0 {
                                bridge.destroy(h)
                            } else {
                                Ok(())
                            }
                        }
                    };
                    assert!(matches!(res, Ok(()) | Err(BridgeError::InvalidHandle)), "{res:?}");
                }
            })
        })
        .collect();

    let emitters: Vec<_> = handles
        .iter()
        .map(|(_, engine)| {
            let sink = engine.sink();
            thread::spawn(move || {
                for i in 0..300 {
                    sink.progress(i as f32 / 300.0);
                    sink.title_changed(format!("t{i}"));
                }
            })
        })
        .collect();

    for t in callers.into_iter().chain(emitters) {
        t.join().unwrap();
    }
    for h in ids.iter() {
        let _ = harness.bridge.destroy(*h);
    }
    for (_, engine) in &handles {
        assert!(wait_for(|| engine.shutdowns() == 1));
    }
    assert!(harness.bridge.is_empty());
}

#[test]
fn replaced_progress_callback_never_fires() {
    let harness = Harness::new(config());
    let (h, engine) = harness.create();

    let first = Arc::new(AtomicUsize::new(0));
    let f = first.clone();
    harness
        .bridge
        .set_progress_callback(
            h,
            Some(Arc::new(move |_: f32| {
                f.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    harness
        .bridge
        .set_progress_callback(
            h,
            Some(Arc::new(move |p: f32| {
                let _ = tx.lock().send(p);
            })),
        )
        .unwrap();

    engine.sink().progress(0.5);
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 0.5);
    assert_eq!(first.load(Ordering::SeqCst), 0);
}

#[test]
fn progress_is_clamped_and_nan_dropped() {
    let harness = Harness::new(config());
    let (h, engine) = harness.create();
    let rx = Recorder::install(&harness.bridge, h);

    let sink = engine.sink();
    sink.progress(f32::NAN);
    sink.progress(-1.0);
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), Ev::Progress(0.0));
    sink.progress(7.0);
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), Ev::Progress(1.0));
}

#[test]
fn queued_delivery_is_ordered_and_never_overlaps() {
    let harness = Harness::new(config());
    let (h, engine) = harness.create();

    let busy = Arc::new(AtomicBool::new(false));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel::<String>();
    let tx = Arc::new(Mutex::new(tx));

    let guard = |busy: Arc<AtomicBool>, overlaps: Arc<AtomicUsize>| {
        move || {
            if busy.swap(true, Ordering::SeqCst) {
                overlaps.fetch_add(1, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_micros(200));
            busy.store(false, Ordering::SeqCst);
        }
    };

    let (b, o, t) = (busy.clone(), overlaps.clone(), tx.clone());
    let check = guard(b, o);
    harness
        .bridge
        .set_title_callback(
            h,
            Some(Arc::new(move |title: &str| {
                check();
                let _ = t.lock().send(title.to_string());
            })),
        )
        .unwrap();
    let (b, o, t) = (busy.clone(), overlaps.clone(), tx.clone());
    let check = guard(b, o);
    harness
        .bridge
        .set_url_callback(
            h,
            Some(Arc::new(move |url: &str| {
                check();
                let _ = t.lock().send(url.to_string());
            })),
        )
        .unwrap();

    let producers: Vec<_> = ["a", "b"]
        .into_iter()
        .map(|prefix| {
            let sink = engine.sink();
            thread::spawn(move || {
                for i in 0..50 {
                    sink.title_changed(format!("{prefix}-title-{i}"));
                    sink.url_changed(format!("{prefix}-url-{i}"));
                }
            })
        })
        .collect();
    for p in producers {
        p.join().unwrap();
    }

    let received: Vec<String> = (0..200).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);

    // Each producer's events arrive in production order
    for prefix in ["a", "b"] {
        let mine: Vec<&String> = received.iter().filter(|s| s.starts_with(prefix)).collect();
        let expected: Vec<String> = (0..50)
            .flat_map(|i| [format!("{prefix}-title-{i}"), format!("{prefix}-url-{i}")])
            .collect();
        assert_eq!(mine, expected.iter().collect::<Vec<_>>());
    }
}

fn blocked_progress_run(policy: ProgressPolicy) -> Vec<f32> {
    let harness = Harness::new(BridgeConfig::builder().dispatch_threads(2).progress_policy(policy).build().unwrap());
    let (h, engine) = harness.create();

    let (gate, entered, open) = Gate::new();
    harness.bridge.set_loading_callback(h, Some(Arc::new(move |_: bool| gate.pass()))).unwrap();
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    harness
        .bridge
        .set_progress_callback(
            h,
            Some(Arc::new(move |p: f32| {
                let _ = tx.lock().send(p);
            })),
        )
        .unwrap();

    let sink = engine.sink();
    sink.loading_changed(true);
    entered.recv_timeout(WAIT).unwrap();
    for i in 1..=10 {
        sink.progress(i as f32 / 10.0);
    }
    sink.loading_changed(false);
    open.send(()).unwrap();
    open.send(()).unwrap();

    harness.bridge.destroy(h).unwrap();
    rx.try_iter().collect()
}

#[test]
fn progress_coalesces_while_delivery_is_blocked() {
    let delivered = blocked_progress_run(ProgressPolicy::CoalesceLatest);
    assert_eq!(delivered, vec![1.0]);
}

#[test]
fn every_update_policy_delivers_all_progress() {
    let delivered = blocked_progress_run(ProgressPolicy::EveryUpdate);
    let expected: Vec<f32> = (1..=10).map(|i| i as f32 / 10.0).collect();
    assert_eq!(delivered, expected);
}

#[test]
fn coalesced_progress_keeps_its_place_among_other_events() {
    let harness = Harness::new(config());
    let (h, engine) = harness.create();

    let (gate, entered, open) = Gate::new();
    let (tx, rx) = mpsc::channel();
    let loading_tx = Mutex::new(tx.clone());
    let first = AtomicBool::new(true);
    harness
        .bridge
        .set_loading_callback(
            h,
            Some(Arc::new(move |is_loading: bool| {
                let _ = loading_tx.lock().send(Ev::Loading(is_loading));
                if first.swap(false, Ordering::SeqCst) {
                    gate.pass();
                }
            })),
        )
        .unwrap();
    let progress_tx = Mutex::new(tx);
    harness
        .bridge
        .set_progress_callback(
            h,
            Some(Arc::new(move |p: f32| {
                let _ = progress_tx.lock().send(Ev::Progress(p));
            })),
        )
        .unwrap();

    // One load finishes and the next starts while delivery is blocked
    let sink = engine.sink();
    sink.loading_changed(true);
    entered.recv_timeout(WAIT).unwrap();
    sink.progress(0.5);
    sink.progress(1.0);
    sink.loading_changed(false);
    sink.loading_changed(true);
    sink.progress(0.1);
    sink.progress(0.4);
    open.send(()).unwrap();

    let delivered: Vec<Ev> = (0..5).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
    assert_eq!(
        delivered,
        vec![Ev::Loading(true), Ev::Progress(1.0), Ev::Loading(false), Ev::Loading(true), Ev::Progress(0.4)]
    );
    harness.bridge.destroy(h).unwrap();
    assert!(rx.try_iter().next().is_none());
}

#[test]
fn script_results_are_delivered_exactly_once() {
    let bridge = headless_bridge(config());
    let h = bridge.create().unwrap();
    let rx = Recorder::install(&bridge, h);
    load_and_wait(&bridge, h, &rx, "https://example.com/page");

    let ok = bridge.execute_javascript(h, "document.title", None).unwrap();
    let thrown = bridge.execute_javascript(h, "throw \"boom\"", None).unwrap();

    let mut results = Vec::new();
    while results.len() < 2 {
        if let Ev::Script(r) = rx.recv_timeout(WAIT).unwrap() {
            results.push(r);
        }
    }
    let by_id = |id| results.iter().filter(|r| r.id == id).collect::<Vec<_>>();
    assert_eq!(by_id(ok).len(), 1);
    assert_eq!(by_id(ok)[0].outcome, Ok(serde_json::json!("example.com")));
    assert_eq!(by_id(thrown).len(), 1);
    assert_eq!(by_id(thrown)[0].outcome, Err(ScriptError::Exception("Uncaught boom".into())));
    assert!(by_id(thrown)[0].to_payload().contains("\"kind\":\"exception\""));

    thread::sleep(Duration::from_millis(20));
    assert!(rx.try_iter().all(|e| !matches!(e, Ev::Script(_))));
}

#[test]
fn completion_takes_precedence_over_script_callback() {
    let harness = Harness::new(config());
    let (h, engine) = harness.create();
    let rx = Recorder::install(&harness.bridge, h);

    let (tx, done) = mpsc::channel();
    let id = harness
        .bridge
        .execute_javascript(
            h,
            "1 + 1",
            Some(Box::new(move |r: &ScriptResult| {
                let _ = tx.send(r.clone());
            })),
        )
        .unwrap();

    engine.sink().script_result(id, Ok(serde_json::json!(2)));
    assert_eq!(done.recv_timeout(WAIT).unwrap().outcome, Ok(serde_json::json!(2)));
    thread::sleep(Duration::from_millis(20));
    assert!(rx.try_iter().next().is_none());
}

#[test]
fn script_result_survives_navigation_and_duplicates_are_dropped() {
    let harness = Harness::new(config());
    let (h, engine) = harness.create();
    let rx = Recorder::install(&harness.bridge, h);

    let id = harness.bridge.execute_javascript(h, "location.href", None).unwrap();
    let sink = engine.sink();
    sink.loading_changed(true);
    sink.url_changed("https://other.example/");
    sink.script_result(id, Ok(serde_json::json!("https://example.com/")));
    sink.script_result(id, Ok(serde_json::json!("https://other.example/")));
    sink.loading_changed(false);

    let events = collect_until(&rx, |e| *e == Ev::Loading(false));
    let scripts: Vec<_> = events.iter().filter(|e| matches!(e, Ev::Script(_))).collect();
    assert_eq!(scripts.len(), 1);
    assert_eq!(
        scripts[0],
        &Ev::Script(ScriptResult { id, outcome: Ok(serde_json::json!("https://example.com/")) })
    );
}

#[test]
fn silent_engine_resolves_with_timeout() {
    let harness = Harness::new(
        BridgeConfig::builder().dispatch_threads(2).script_timeout(Some(Duration::from_millis(30))).build().unwrap(),
    );
    let (h, engine) = harness.create();
    let rx = Recorder::install(&harness.bridge, h);

    let id = harness.bridge.execute_javascript(h, "while(true){}", None).unwrap();
    assert_eq!(
        rx.recv_timeout(WAIT).unwrap(),
        Ev::Script(ScriptResult { id, outcome: Err(ScriptError::TimedOut(Duration::from_millis(30))) })
    );

    // The late answer is dropped
    engine.sink().script_result(id, Ok(serde_json::Value::Null));
    thread::sleep(Duration::from_millis(20));
    assert!(rx.try_iter().next().is_none());
}

#[test]
fn answered_scripts_do_not_leave_timers_behind() {
    let harness = Harness::new(
        BridgeConfig::builder().dispatch_threads(2).script_timeout(Some(Duration::from_secs(600))).build().unwrap(),
    );
    let (h, engine) = harness.create();
    let metrics = harness.bridge.runtime.metrics();
    let idle_tasks = metrics.num_alive_tasks();

    let unanswered = harness.bridge.execute_javascript(h, "1", None).unwrap();
    assert!(wait_for(|| metrics.num_alive_tasks() == idle_tasks + 1));

    engine.auto_answer.store(true, Ordering::SeqCst);
    for _ in 0..100 {
        harness.bridge.execute_javascript(h, "null", None).unwrap();
    }
    assert!(wait_for(|| metrics.num_alive_tasks() == idle_tasks + 1), "{} tasks", metrics.num_alive_tasks());

    engine.sink().script_result(unanswered, Ok(serde_json::json!(1)));
    assert!(wait_for(|| metrics.num_alive_tasks() == idle_tasks));
}

#[test]
fn destroy_resolves_pending_scripts() {
    for mode in [DeliveryMode::Queued, DeliveryMode::Direct] {
        let harness = Harness::new(BridgeConfig::builder().dispatch_threads(2).delivery_mode(mode).build().unwrap());
        let (h, engine) = harness.create();

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        harness
            .bridge
            .set_script_callback(
                h,
                Some(Arc::new(move |r: &ScriptResult| {
                    let _ = tx.lock().send(r.clone());
                })),
            )
            .unwrap();

        let a = harness.bridge.execute_javascript(h, "1", None).unwrap();
        let b = harness.bridge.execute_javascript(h, "2", None).unwrap();
        let sink = engine.sink();
        harness.bridge.destroy(h).unwrap();
        sink.script_result(a, Ok(serde_json::json!(1)));

        let mut results: Vec<ScriptResult> = rx.try_iter().collect();
        results.sort_by_key(|r| r.id);
        let mut expected = vec![
            ScriptResult { id: a, outcome: Err(ScriptError::HandleDestroyed) },
            ScriptResult { id: b, outcome: Err(ScriptError::HandleDestroyed) },
        ];
        expected.sort_by_key(|r| r.id);
        assert_eq!(results, expected, "{mode:?}");
    }
}

#[test]
fn render_buffer_is_recycled_only_after_the_callback_returns() {
    let harness = Harness::new(config());
    let (h, engine) = harness.create();
    let sink = engine.sink();

    let (gate, entered, open) = Gate::new();
    let (tx, intact) = mpsc::channel();
    let tx = Mutex::new(tx);
    harness
        .bridge
        .set_render_callback(
            h,
            Some(Arc::new(move |frame: &Frame<'_>| {
                gate.pass();
                let _ = tx.lock().send((frame.pixels.iter().all(|b| *b == 0xAA), frame.pixels.as_ptr() as usize));
            })),
        )
        .unwrap();

    let mut loaned = sink.frame_buffer(4, 4).unwrap();
    loaned.as_mut_slice().fill(0xAA);
    let loaned_ptr = loaned.as_ptr() as usize;
    sink.render_frame(loaned, 4, 4);
    entered.recv_timeout(WAIT).unwrap();

    // While the loan is out the engine gets a different buffer and scribbles on it
    let mut other = sink.frame_buffer(4, 4).unwrap();
    assert_ne!(other.as_ptr() as usize, loaned_ptr);
    other.as_mut_slice().fill(0x55);
    open.send(()).unwrap();

    let (was_intact, seen_ptr) = intact.recv_timeout(WAIT).unwrap();
    assert!(was_intact);
    assert_eq!(seen_ptr, loaned_ptr);

    let entry = harness.bridge.registry.get(h).unwrap();
    assert!(wait_for(|| entry.frames.available() == 1));
    assert_eq!(sink.frame_buffer(4, 4).unwrap().as_ptr() as usize, loaned_ptr);
}

#[test]
fn short_frames_are_dropped() {
    let harness = Harness::new(config());
    let (h, engine) = harness.create();
    let rx = Recorder::install(&harness.bridge, h);

    let sink = engine.sink();
    sink.render_frame(FrameBuffer::new(10), 4, 4);
    assert!(sink.frame_buffer(u32::MAX, u32::MAX).is_none());
    sink.render_frame(FrameBuffer::new(16), u32::MAX, 2);
    sink.render_frame(sink.frame_buffer(2, 2).unwrap(), 2, 2);
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), Ev::Frame(2, 2));
}

#[test]
fn drain_timeout_defers_release() {
    let harness =
        Harness::new(BridgeConfig::builder().dispatch_threads(2).drain_timeout(Duration::from_millis(50)).build().unwrap());
    let (h, engine) = harness.create();

    let (gate, entered, open) = Gate::new();
    harness.bridge.set_loading_callback(h, Some(Arc::new(move |_: bool| gate.pass()))).unwrap();
    engine.sink().loading_changed(true);
    entered.recv_timeout(WAIT).unwrap();

    let res = harness.bridge.destroy(h);
    assert!(matches!(res, Err(BridgeError::Timeout(t)) if t == Duration::from_millis(50)));
    assert!(!harness.bridge.is_live(h));
    assert!(matches!(harness.bridge.load_url(h, "https://example.com"), Err(BridgeError::InvalidHandle)));
    assert_eq!(engine.shutdowns(), 0);

    open.send(()).unwrap();
    assert!(wait_for(|| engine.shutdowns() == 1));
}

#[test]
fn destroy_from_inside_a_callback_returns_ok() {
    for mode in [DeliveryMode::Queued, DeliveryMode::Direct] {
        let harness = Harness::new(BridgeConfig::builder().dispatch_threads(2).delivery_mode(mode).build().unwrap());
        let (h, engine) = harness.create();

        let weak = Arc::downgrade(&harness.bridge);
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        harness
            .bridge
            .set_loading_callback(
                h,
                Some(Arc::new(move |_: bool| {
                    if let Some(bridge) = weak.upgrade() {
                        let first = bridge.destroy(h);
                        let nested = bridge.destroy(h);
                        let _ = tx.lock().send((first.is_ok(), matches!(nested, Err(BridgeError::InvalidHandle))));
                    }
                })),
            )
            .unwrap();

        engine.sink().loading_changed(true);
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), (true, true), "{mode:?}");
        assert!(wait_for(|| engine.shutdowns() == 1), "{mode:?}");
        assert!(!harness.bridge.is_live(h));
    }
}

#[test]
fn delivery_thread_origin() {
    for (mode, expected) in [(DeliveryMode::Direct, "engine-thread"), (DeliveryMode::Queued, "webengine-dispatch")] {
        let harness = Harness::new(BridgeConfig::builder().dispatch_threads(2).delivery_mode(mode).build().unwrap());
        let (h, engine) = harness.create();

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        harness
            .bridge
            .set_loading_callback(
                h,
                Some(Arc::new(move |_: bool| {
                    let name = thread::current().name().unwrap_or_default().to_string();
                    let _ = tx.lock().send(name);
                })),
            )
            .unwrap();

        let sink = engine.sink();
        thread::Builder::new()
            .name("engine-thread".into())
            .spawn(move || sink.loading_changed(true))
            .unwrap()
            .join()
            .unwrap();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), expected, "{mode:?}");
    }
}

#[test]
fn direct_mode_leaves_serialization_to_the_host() {
    let harness =
        Harness::new(BridgeConfig::builder().dispatch_threads(2).delivery_mode(DeliveryMode::Direct).build().unwrap());
    let (h, engine) = harness.create();

    let (gate, entered, open) = Gate::new();
    harness.bridge.set_loading_callback(h, Some(Arc::new(move |_: bool| gate.pass()))).unwrap();
    let (tx, rx) = mpsc::channel();
    let url_tx = Mutex::new(tx.clone());
    harness
        .bridge
        .set_url_callback(
            h,
            Some(Arc::new(move |url: &str| {
                let _ = url_tx.lock().send(url.to_string());
            })),
        )
        .unwrap();
    let script_tx = Mutex::new(tx);
    harness
        .bridge
        .set_script_callback(
            h,
            Some(Arc::new(move |_: &ScriptResult| {
                let _ = script_tx.lock().send(thread::current().name().unwrap_or_default().to_string());
            })),
        )
        .unwrap();

    // A second engine thread delivers while the first is still inside a callback
    let sink = engine.sink();
    let blocked = thread::spawn(move || sink.loading_changed(true));
    entered.recv_timeout(WAIT).unwrap();
    let sink = engine.sink();
    thread::spawn(move || sink.url_changed("https://example.com/")).join().unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "https://example.com/");
    open.send(()).unwrap();
    blocked.join().unwrap();

    // Pending scripts resolve on the destroying thread
    harness.bridge.execute_javascript(h, "1", None).unwrap();
    let bridge = harness.bridge.clone();
    thread::Builder::new()
        .name("host-destroy".into())
        .spawn(move || bridge.destroy(h).unwrap())
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "host-destroy");
}

#[test]
fn panicking_callback_does_not_stop_delivery() {
    let harness = Harness::new(config());
    let (h, engine) = harness.create();
    let rx = Recorder::install(&harness.bridge, h);
    harness.bridge.set_loading_callback(h, Some(Arc::new(|_: bool| panic!("host bug")))).unwrap();

    let sink = engine.sink();
    sink.loading_changed(true);
    sink.title_changed("still here");
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), Ev::Title("still here".into()));
}

#[test]
fn factory_failure_and_handle_limit_are_allocation_failures() {
    init_logging();
    let failing = |_: EventSink, _: &EngineSettings| -> anyhow::Result<Arc<dyn Engine>> {
        Err(anyhow::anyhow!("no GPU"))
    };
    let bridge = Bridge::new(None, Box::new(failing)).unwrap();
    assert!(matches!(bridge.create(), Err(BridgeError::AllocationFailure(msg)) if msg.contains("no GPU")));
    assert!(bridge.is_empty());

    let harness = Harness::new(BridgeConfig::builder().max_handles(1).build().unwrap());
    let (h, _) = harness.create();
    assert!(matches!(harness.bridge.create(), Err(BridgeError::AllocationFailure(_))));
    harness.bridge.destroy(h).unwrap();
    assert!(harness.bridge.create().is_ok());
}

#[test]
fn invalid_config_is_rejected() {
    let cfg = BridgeConfig { max_handles: 0, ..Default::default() };
    let res = Bridge::new(Some(cfg), Box::new(HeadlessEngineFactory::default()));
    assert!(matches!(res, Err(BridgeError::Config(_))));
}

#[test]
fn dropping_the_bridge_destroys_live_handles() {
    let harness = Harness::new(config());
    let (_, a) = harness.create();
    let (_, b) = harness.create();
    let Harness { bridge, engines } = harness;
    drop(bridge);
    assert_eq!(a.shutdowns(), 1);
    assert_eq!(b.shutdowns(), 1);
    assert_eq!(engines.lock().len(), 2);
}

#[test]
fn cookies_round_trip_and_truncate() {
    let bridge = headless_bridge(config());
    let h = bridge.create().unwrap();

    bridge.set_cookie(h, "example.com", "a", "1").unwrap();
    bridge.set_cookie(h, "example.com", "b", "2").unwrap();
    bridge.set_cookie(h, "other.org", "c", "3").unwrap();
    assert_eq!(bridge.get_cookies(h, "example.com").unwrap(), "a=1; b=2");
    assert_eq!(bridge.get_cookies(h, "www.example.com").unwrap(), "a=1; b=2");

    let mut buf = [0xffu8; 16];
    assert_eq!(bridge.copy_cookies(h, "example.com", &mut buf).unwrap(), 8);
    assert_eq!(&buf[..9], b"a=1; b=2\0");

    let mut small = [0xffu8; 5];
    let err = bridge.copy_cookies(h, "example.com", &mut small).unwrap_err();
    assert!(matches!(err, BridgeError::BufferTooSmall { required: 9, capacity: 5 }));
    assert_eq!(&small, b"a=1;\0");

    let mut empty: [u8; 0] = [];
    assert!(matches!(
        bridge.copy_cookies(h, "example.com", &mut empty),
        Err(BridgeError::BufferTooSmall { required: 9, capacity: 0 })
    ));

    assert!(matches!(bridge.set_cookie(h, "", "a", "1"), Err(BridgeError::InvalidArgument(_))));
    assert!(matches!(bridge.set_cookie(h, "example.com", "a=b", "1"), Err(BridgeError::InvalidArgument(_))));

    bridge.clear_cookies(h).unwrap();
    assert_eq!(bridge.get_cookies(h, "example.com").unwrap(), "");
}

#[test]
fn headless_load_reports_events_in_order() {
    let bridge = headless_bridge(config());
    let h = bridge.create().unwrap();
    let rx = Recorder::install(&bridge, h);

    let events = load_and_wait(&bridge, h, &rx, "https://example.com");

    assert_eq!(events.first(), Some(&Ev::Loading(true)));
    let tail = &events[events.len() - 5..];
    assert_eq!(
        tail,
        &[
            Ev::Url("https://example.com/".into()),
            Ev::Title("example.com".into()),
            Ev::Nav(NavigationState { can_go_back: false, can_go_forward: false }),
            Ev::Frame(8, 6),
            Ev::Loading(false),
        ]
    );

    let progress: Vec<f32> = events[1..events.len() - 5]
        .iter()
        .map(|e| match e {
            Ev::Progress(p) => *p,
            other => panic!("unexpected {other:?} before commit"),
        })
        .collect();
    assert!(!progress.is_empty());
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(progress.last(), Some(&1.0));
}

#[test]
fn headless_invalid_url_reports_a_failed_load() {
    let bridge = headless_bridge(config());
    let h = bridge.create().unwrap();
    let rx = Recorder::install(&bridge, h);

    let events = load_and_wait(&bridge, h, &rx, "not a url");
    assert_eq!(events, vec![Ev::Loading(true), Ev::Loading(false)]);
}

#[test]
fn headless_stop_loading_cancels_the_load() {
    init_logging();
    let factory = HeadlessEngineFactory { step_delay: Duration::from_millis(50), viewport: (8, 6) };
    let bridge = Bridge::new(Some(config()), Box::new(factory)).unwrap();
    let h = bridge.create().unwrap();
    let rx = Recorder::install(&bridge, h);

    bridge.load_url(h, "https://example.com").unwrap();
    bridge.stop_loading(h).unwrap();
    let events = collect_until(&rx, |e| *e == Ev::Loading(false));
    assert!(events.iter().all(|e| matches!(e, Ev::Loading(_) | Ev::Progress(_))), "{events:?}");

    thread::sleep(Duration::from_millis(150));
    assert!(rx.try_iter().next().is_none());

    // Stopping an idle engine is a no-op
    bridge.stop_loading(h).unwrap();
}

#[test]
fn headless_back_and_forward() {
    let bridge = headless_bridge(config());
    let h = bridge.create().unwrap();
    let rx = Recorder::install(&bridge, h);

    load_and_wait(&bridge, h, &rx, "https://a.example/");
    let events = load_and_wait(&bridge, h, &rx, "https://b.example/");
    assert!(events.contains(&Ev::Nav(NavigationState { can_go_back: true, can_go_forward: false })));

    bridge.go_back(h).unwrap();
    let events = collect_until(&rx, |e| *e == Ev::Loading(false));
    assert!(events.contains(&Ev::Url("https://a.example/".into())));
    assert!(events.contains(&Ev::Nav(NavigationState { can_go_back: false, can_go_forward: true })));

    bridge.go_forward(h).unwrap();
    let events = collect_until(&rx, |e| *e == Ev::Loading(false));
    assert!(events.contains(&Ev::Url("https://b.example/".into())));
    assert!(events.contains(&Ev::Nav(NavigationState { can_go_back: true, can_go_forward: false })));

    // A new navigation drops the forward entries
    bridge.go_back(h).unwrap();
    collect_until(&rx, |e| *e == Ev::Loading(false));
    let events = load_and_wait(&bridge, h, &rx, "https://c.example/");
    assert!(events.contains(&Ev::Nav(NavigationState { can_go_back: true, can_go_forward: false })));
}

#[test]
fn headless_settings_apply_to_later_loads_only() {
    let bridge = headless_bridge(config());
    let h = bridge.create().unwrap();
    let rx = Recorder::install(&bridge, h);
    load_and_wait(&bridge, h, &rx, "https://a.example/");

    bridge.enable_javascript(h, false).unwrap();
    bridge.set_user_agent(h, "Custom/2.0").unwrap();
    let settings = bridge.settings(h).unwrap();
    assert!(!settings.javascript_enabled);
    assert_eq!(settings.user_agent, "Custom/2.0");

    let script = |src: &str| {
        let id = bridge.execute_javascript(h, src, None).unwrap();
        loop {
            if let Ev::Script(r) = rx.recv_timeout(WAIT).unwrap() {
                assert_eq!(r.id, id);
                return r.outcome;
            }
        }
    };

    // The loaded document keeps what it was loaded with
    assert_eq!(script("document.title"), Ok(serde_json::json!("a.example")));
    assert_ne!(script("navigator.userAgent"), Ok(serde_json::json!("Custom/2.0")));

    load_and_wait(&bridge, h, &rx, "https://b.example/");
    assert_eq!(script("document.title"), Err(ScriptError::JavaScriptDisabled));
}

#[test]
fn headless_touch_and_resize_rerender() {
    let bridge = headless_bridge(config());
    let h = bridge.create().unwrap();
    let rx = Recorder::install(&bridge, h);
    load_and_wait(&bridge, h, &rx, "https://example.com/");

    bridge.set_viewport_size(h, 4, 2).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), Ev::Frame(4, 2));
    bridge.send_touch_event(h, TouchEvent { kind: TouchKind::Down, x: 1.0, y: 1.0 }).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), Ev::Frame(4, 2));
    bridge.send_key_event(h, KeyEvent::new(13, true)).unwrap();

    let err = bridge.send_touch_event(h, TouchEvent { kind: TouchKind::Move, x: f32::NAN, y: 0.0 });
    assert!(matches!(err, Err(BridgeError::InvalidArgument(_))));
}

#[test]
fn oversized_viewport_is_rejected_and_the_engine_keeps_running() {
    let bridge = headless_bridge(config());
    let h = bridge.create().unwrap();
    let rx = Recorder::install(&bridge, h);
    load_and_wait(&bridge, h, &rx, "https://example.com/");

    for (w, ht) in [(u32::MAX, u32::MAX), (100_000, 100_000), (MAX_FRAME_DIMENSION + 1, 1)] {
        assert!(matches!(bridge.set_viewport_size(h, w, ht), Err(BridgeError::InvalidArgument(_))));
    }
    bridge.set_viewport_size(h, MAX_FRAME_DIMENSION, 1).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), Ev::Frame(MAX_FRAME_DIMENSION, 1));

    let events = load_and_wait(&bridge, h, &rx, "https://b.example/");
    assert!(events.contains(&Ev::Url("https://b.example/".into())));
    bridge.destroy(h).unwrap();
}

#[test]
fn headless_engine_skips_frames_it_cannot_size() {
    init_logging();
    let factory = HeadlessEngineFactory { step_delay: Duration::from_millis(1), viewport: (u32::MAX, 2) };
    let bridge = Bridge::new(Some(config()), Box::new(factory)).unwrap();
    let h = bridge.create().unwrap();
    let rx = Recorder::install(&bridge, h);

    let events = load_and_wait(&bridge, h, &rx, "https://example.com/");
    assert!(!events.iter().any(|e| matches!(e, Ev::Frame(..))), "{events:?}");

    bridge.set_viewport_size(h, 4, 2).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), Ev::Frame(4, 2));
}
