//! Reference engine that simulates page loads without rendering anything real.
//!
//! Each instance runs on its own OS thread with a current-thread tokio
//! runtime. Commands from the bridge arrive over a channel; loads advance one
//! step per `step_delay` so that progress, stop and navigation races can be
//! observed. A committed load reports, in this order: URL, title, navigation
//! state, a solid-color frame and finally `Loading(false)`.

mod script_eval;

use crate::config::EngineSettings;
use crate::cookies::{format_cookie_header, Cookie, CookieJarHandle, DefaultCookieJar};
use crate::dispatch::EventSink;
use crate::engine::{Engine, EngineFactory, KeyEvent, NavigationState, TouchEvent, TouchKind};
use crate::script::{ScriptError, ScriptRequest};
use log::{debug, error, trace, warn};
use parking_lot::{Mutex, RwLock};
use script_eval::{evaluate, ScriptScope};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use url::Url;

pub const DEFAULT_VIEWPORT: (u32, u32) = (320, 240);
pub const DEFAULT_STEP_DELAY: Duration = Duration::from_millis(5);

/// Progress reported at each load step; the load commits after the last one.
const LOAD_STEPS: [f32; 4] = [0.1, 0.4, 0.7, 1.0];

#[derive(Debug)]
enum Command {
    Load(String),
    Back,
    Forward,
    Reload,
    Stop,
    Script(ScriptRequest),
    Touch(TouchEvent),
    Key(KeyEvent),
    Resize(u32, u32),
    Shutdown,
}

/// Creates [`HeadlessEngine`]s.
#[derive(Debug, Clone)]
pub struct HeadlessEngineFactory {
    /// Delay between load steps
    pub step_delay: Duration,
    /// Initial viewport
    pub viewport: (u32, u32),
}

impl Default for HeadlessEngineFactory {
    fn default() -> Self {
        Self { step_delay: DEFAULT_STEP_DELAY, viewport: DEFAULT_VIEWPORT }
    }
}

impl EngineFactory for HeadlessEngineFactory {
    fn create(&self, sink: EventSink, settings: &EngineSettings) -> anyhow::Result<Arc<dyn Engine>> {
        let engine = HeadlessEngine::spawn(sink, settings.clone(), self.step_delay, self.viewport)?;
        Ok(Arc::new(engine))
    }
}

pub struct HeadlessEngine {
    cmd_tx: mpsc::UnboundedSender<Command>,
    settings: Arc<RwLock<EngineSettings>>,
    cookie_jar: CookieJarHandle,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl HeadlessEngine {
    pub fn spawn(
        sink: EventSink,
        settings: EngineSettings,
        step_delay: Duration,
        viewport: (u32, u32),
    ) -> anyhow::Result<Self> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let settings = Arc::new(RwLock::new(settings));
        let cookie_jar: CookieJarHandle = DefaultCookieJar::new().into();

        let runtime = tokio::runtime::Builder::new_current_thread().enable_time().build()?;
        let worker = HeadlessWorker {
            sink: sink.clone(),
            cmd_rx,
            settings: settings.clone(),
            cookie_jar: cookie_jar.clone(),
            step_delay,
            viewport,
            history: Vec::new(),
            current: None,
            document: None,
            load: None,
        };

        let thread = std::thread::Builder::new()
            .name(format!("headless-{}", sink.handle()))
            .spawn(move || runtime.block_on(worker.run()))?;
        let thread_id = thread.thread().id();

        Ok(Self { cmd_tx, settings, cookie_jar, thread: Mutex::new(Some(thread)), thread_id })
    }

    fn send(&self, cmd: Command) {
        if self.cmd_tx.send(cmd).is_err() {
            trace!("Headless engine thread already stopped");
        }
    }
}

impl Engine for HeadlessEngine {
    fn name(&self) -> &str {
        "headless"
    }

    fn load_url(&self, url: &str) {
        self.send(Command::Load(url.to_string()));
    }

    fn go_back(&self) {
        self.send(Command::Back);
    }

    fn go_forward(&self) {
        self.send(Command::Forward);
    }

    fn reload(&self) {
        self.send(Command::Reload);
    }

    fn stop_loading(&self) {
        self.send(Command::Stop);
    }

    fn execute_javascript(&self, request: ScriptRequest) {
        self.send(Command::Script(request));
    }

    fn send_touch_event(&self, event: TouchEvent) {
        self.send(Command::Touch(event));
    }

    fn send_key_event(&self, event: KeyEvent) {
        self.send(Command::Key(event));
    }

    fn set_viewport_size(&self, width: u32, height: u32) {
        self.send(Command::Resize(width, height));
    }

    fn set_cookie(&self, cookie: Cookie) {
        self.cookie_jar.write().set_cookie(cookie);
    }

    fn cookies_for(&self, domain: &str) -> Vec<Cookie> {
        self.cookie_jar.read().cookies_for(domain)
    }

    fn clear_cookies(&self) {
        self.cookie_jar.write().clear();
    }

    fn set_user_agent(&self, user_agent: &str) {
        self.settings.write().user_agent = user_agent.to_string();
    }

    fn set_javascript_enabled(&self, enabled: bool) {
        self.settings.write().javascript_enabled = enabled;
    }

    fn set_images_enabled(&self, enabled: bool) {
        self.settings.write().images_enabled = enabled;
    }

    fn settings(&self) -> EngineSettings {
        self.settings.read().clone()
    }

    fn shutdown(&self) {
        self.send(Command::Shutdown);

        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            if std::thread::current().id() == self.thread_id {
                // Called from one of our own callbacks; the loop exits after this command
                return;
            }
            if thread.join().is_err() {
                error!("Headless engine thread panicked");
            }
        }
    }
}

impl Drop for HeadlessEngine {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }
}

/// A committed page.
struct Document {
    url: Url,
    title: String,
    /// Settings in effect when the load started
    settings: EngineSettings,
}

enum HistoryAction {
    /// New navigation: drop forward entries and append
    Push,
    /// Move to an existing entry
    Traverse(usize),
    Reload,
}

struct PendingLoad {
    url: Url,
    action: HistoryAction,
    settings: EngineSettings,
    step: usize,
    next_step: Instant,
}

struct HeadlessWorker {
    sink: EventSink,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    settings: Arc<RwLock<EngineSettings>>,
    cookie_jar: CookieJarHandle,
    step_delay: Duration,
    viewport: (u32, u32),
    history: Vec<Url>,
    current: Option<usize>,
    document: Option<Document>,
    load: Option<PendingLoad>,
}

impl HeadlessWorker {
    async fn run(mut self) {
        debug!("Headless engine for {} started", self.sink.handle());

        loop {
            let deadline = self.load.as_ref().map(|l| l.next_step);

            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Shutdown) | None => break,
                        Some(cmd) => self.handle_command(cmd),
                    }
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.step();
                }
            }
        }

        debug!("Headless engine for {} stopped", self.sink.handle());
    }

    fn handle_command(&mut self, cmd: Command) {
        trace!("{}: {:?}", self.sink.handle(), cmd);

        match cmd {
            Command::Load(raw) => match Url::parse(&raw) {
                Ok(url) => self.start_load(url, HistoryAction::Push),
                Err(e) => {
                    debug!("{}: cannot load {raw:?}: {e}", self.sink.handle());
                    self.cancel_load();
                    self.sink.loading_changed(true);
                    self.sink.loading_changed(false);
                }
            },
            Command::Back => {
                if let Some(index) = self.current.and_then(|c| c.checked_sub(1)) {
                    let url = self.history[index].clone();
                    self.start_load(url, HistoryAction::Traverse(index));
                }
            }
            Command::Forward => {
                if let Some(index) = self.current.map(|c| c + 1).filter(|i| *i < self.history.len()) {
                    let url = self.history[index].clone();
                    self.start_load(url, HistoryAction::Traverse(index));
                }
            }
            Command::Reload => {
                if let Some(doc) = &self.document {
                    let url = doc.url.clone();
                    self.start_load(url, HistoryAction::Reload);
                }
            }
            Command::Stop => self.cancel_load(),
            Command::Script(request) => self.run_script(request),
            Command::Touch(event) => {
                if matches!(event.kind, TouchKind::Down | TouchKind::Up) {
                    self.render();
                }
            }
            Command::Key(event) => {
                trace!("{}: key {} {}", self.sink.handle(), event.code, if event.pressed { "down" } else { "up" });
            }
            Command::Resize(width, height) => {
                self.viewport = (width, height);
                self.render();
            }
            Command::Shutdown => {}
        }
    }

    fn start_load(&mut self, url: Url, action: HistoryAction) {
        let already_loading = self.load.is_some();
        self.load = Some(PendingLoad {
            url,
            action,
            settings: self.settings.read().clone(),
            step: 0,
            next_step: Instant::now() + self.step_delay,
        });

        if !already_loading {
            self.sink.loading_changed(true);
        }
        self.sink.progress(LOAD_STEPS[0]);
    }

    fn cancel_load(&mut self) {
        if self.load.take().is_some() {
            self.sink.loading_changed(false);
        }
    }

    fn step(&mut self) {
        let Some(load) = self.load.as_mut() else {
            return;
        };

        load.step += 1;
        if let Some(progress) = LOAD_STEPS.get(load.step) {
            load.next_step += self.step_delay;
            self.sink.progress(*progress);
            return;
        }

        if let Some(load) = self.load.take() {
            self.commit(load);
        }
    }

    fn commit(&mut self, load: PendingLoad) {
        match load.action {
            HistoryAction::Push => {
                let next = self.current.map_or(0, |c| c + 1);
                self.history.truncate(next);
                self.history.push(load.url.clone());
                self.current = Some(next);
            }
            HistoryAction::Traverse(index) => self.current = Some(index),
            HistoryAction::Reload => {}
        }

        let title = title_for(&load.url);
        self.sink.url_changed(load.url.as_str());
        self.sink.title_changed(title.clone());
        self.sink.navigation_state(self.navigation_state());
        self.document = Some(Document { url: load.url, title, settings: load.settings });
        self.render();
        self.sink.loading_changed(false);
    }

    fn navigation_state(&self) -> NavigationState {
        match self.current {
            Some(c) => NavigationState { can_go_back: c > 0, can_go_forward: c + 1 < self.history.len() },
            None => NavigationState::default(),
        }
    }

    fn run_script(&mut self, request: ScriptRequest) {
        let outcome = match self.document.as_mut() {
            Some(doc) if !doc.settings.javascript_enabled => Err(ScriptError::JavaScriptDisabled),
            Some(doc) => {
                let cookies = doc
                    .url
                    .host_str()
                    .map(|host| {
                        let visible: Vec<Cookie> =
                            self.cookie_jar.read().cookies_for(host).into_iter().filter(|c| !c.http_only).collect();
                        format_cookie_header(&visible)
                    })
                    .unwrap_or_default();
                let scope = ScriptScope {
                    url: doc.url.as_str(),
                    title: &doc.title,
                    user_agent: &doc.settings.user_agent,
                    cookie: &cookies,
                };
                match evaluate(&request.source, &scope) {
                    Ok(eval) => {
                        if let Some(title) = eval.new_title {
                            doc.title = title.clone();
                            self.sink.title_changed(title);
                        }
                        Ok(eval.value)
                    }
                    Err(e) => Err(e),
                }
            }
            None => {
                let settings = self.settings.read().clone();
                if settings.javascript_enabled {
                    let scope = ScriptScope { url: "about:blank", title: "", user_agent: &settings.user_agent, cookie: "" };
                    evaluate(&request.source, &scope).map(|eval| eval.value)
                } else {
                    Err(ScriptError::JavaScriptDisabled)
                }
            }
        };

        self.sink.script_result(request.id, outcome);
    }

    fn render(&self) {
        let Some(doc) = &self.document else {
            return;
        };
        let (width, height) = self.viewport;
        if width == 0 || height == 0 {
            return;
        }

        let color = if doc.settings.images_enabled { color_for(&doc.url) } else { [0x80, 0x80, 0x80, 0xff] };
        let Some(mut buffer) = self.sink.frame_buffer(width, height) else {
            warn!("{}: cannot render a {width}x{height} viewport", self.sink.handle());
            return;
        };
        for px in buffer.as_mut_slice().chunks_exact_mut(4) {
            px.copy_from_slice(&color);
        }
        self.sink.render_frame(buffer, width, height);
    }
}

/// Title of a page: the host for web URLs, the whole URL otherwise.
fn title_for(url: &Url) -> String {
    match (url.scheme(), url.host_str()) {
        ("http" | "https", Some(host)) => host.to_string(),
        _ => url.to_string(),
    }
}

/// Opaque RGBA color derived from the URL, stable within a process.
fn color_for(url: &Url) -> [u8; 4] {
    let mut hasher = DefaultHasher::new();
    url.as_str().hash(&mut hasher);
    let [r, g, b, ..] = hasher.finish().to_le_bytes();
    [r, g, b, 0xff]
}
