use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use webengine_bridge::engine::headless::HeadlessEngineFactory;
use webengine_bridge::{Bridge, BridgeConfig, BridgeError, DeliveryMode, EngineObserver, Frame, NavigationState, ScriptResult};

/// Prints every event and signals when a load finished.
struct Printer {
    idle_tx: Mutex<mpsc::Sender<()>>,
}

impl EngineObserver for Printer {
    fn on_loading(&self, is_loading: bool) {
        println!("loading: {is_loading}");
        if !is_loading {
            let _ = self.idle_tx.lock().map(|tx| tx.send(()));
        }
    }

    fn on_progress(&self, progress: f32) {
        println!("progress: {:.0}%", progress * 100.0);
    }

    fn on_url_changed(&self, url: &str) {
        println!("url: {url}");
    }

    fn on_title_changed(&self, title: &str) {
        println!("title: {title}");
    }

    fn on_navigation_state(&self, state: NavigationState) {
        println!("back: {}, forward: {}", state.can_go_back, state.can_go_forward);
    }

    fn on_frame(&self, frame: &Frame<'_>) {
        println!("frame: {}x{}, top-left pixel {:?}", frame.width, frame.height, frame.pixel(0, 0));
    }

    fn on_script_result(&self, result: &ScriptResult) {
        println!("script {}: {}", result.id, result.to_payload());
    }
}

fn main() -> Result<(), BridgeError> {
    env_logger::init();

    // Set up the bridge through the config builder. Callbacks are delivered on
    // the bridge's own delivery workers.
    let config = BridgeConfig::builder()
        .delivery_mode(DeliveryMode::Queued)
        .drain_timeout(Duration::from_secs(2))
        .user_agent("HeadlessDemo/1.0")
        .build()?;

    let factory = HeadlessEngineFactory { step_delay: Duration::from_millis(20), viewport: (64, 48) };
    let bridge = Bridge::new(Some(config), Box::new(factory))?;

    let handle = bridge.create()?;
    println!("created {handle}");

    let (idle_tx, idle_rx) = mpsc::channel();
    bridge.set_observer(handle, Arc::new(Printer { idle_tx: Mutex::new(idle_tx) }))?;

    let wait_idle = || {
        let _ = idle_rx.recv_timeout(Duration::from_secs(5));
    };

    bridge.load_url(handle, "https://example.com/")?;
    wait_idle();
    bridge.load_url(handle, "https://www.rust-lang.org/")?;
    wait_idle();

    bridge.execute_javascript(handle, "document.title", None)?;
    bridge.execute_javascript(handle, "navigator.userAgent", None)?;
    bridge.execute_javascript(handle, "throw \"demo error\"", None)?;

    bridge.go_back(handle)?;
    wait_idle();

    bridge.set_cookie(handle, "example.com", "session", "42")?;
    bridge.set_cookie(handle, "example.com", "theme", "dark")?;
    println!("cookies: {}", bridge.get_cookies(handle, "www.example.com")?);

    let mut buf = [0u8; 12];
    match bridge.copy_cookies(handle, "example.com", &mut buf) {
        Ok(n) => println!("copied {n} bytes"),
        Err(e) => println!("truncated copy: {e}"),
    }

    bridge.destroy(handle)?;
    println!("destroyed {handle}");

    Ok(())
}
