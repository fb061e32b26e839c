//! IRIS content script
//!
//! Boots one overlay engine per page:
//!
//! 1. install logging (`dioxus-logger`)
//! 2. load config (embedded TOML + `window.__IRIS_CONFIG__`)
//! 3. build the engine over [`WebHost`] and [`FetchBackend`]
//! 4. subscribe to page mutations, image loads and resizes
//! 5. arm the initial scan
//!
//! Nothing here may throw into the host page: every failure is logged and
//! ends at this engine instance.

pub mod backend;
pub mod config;
pub mod host;
pub mod observer;

use std::cell::RefCell;

use dioxus_logger::tracing::Level;
use iris_core::{EngineError, HostPage};
use iris_overlay::Engine;
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;

pub use backend::FetchBackend;
pub use host::{PageNode, WebHost};
pub use observer::{PageEngine, PageObserver, observe_page};

struct Running {
    engine: PageEngine,
    _observer: PageObserver,
}

thread_local! {
    static RUNNING: RefCell<Option<Running>> = const { RefCell::new(None) };
}

#[wasm_bindgen(start)]
pub fn main() {
    let config = match config::load_config() {
        Ok(config) => config,
        Err(err) => {
            init_logging(false);
            tracing::error!(error = %err, "[IRIS] Invalid configuration, engine not started");
            return;
        }
    };
    init_logging(config.debug_logging);

    if let Err(err) = boot(config) {
        tracing::error!(error = %err, "[IRIS] Engine failed to start");
    }
}

fn init_logging(debug: bool) {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    // A second init (script injected twice) keeps the first subscriber
    let _ = dioxus_logger::init(level);
}

fn boot(config: iris_types::EngineConfig) -> Result<(), EngineError> {
    if RUNNING.with(|r| r.borrow().is_some()) {
        tracing::info!("[IRIS] Engine already running on this page");
        return Ok(());
    }

    let host = WebHost::new()?;
    let backend = FetchBackend::new(config.clone());
    let engine = Engine::new(host, backend, config)?;

    let observer = observe_page(&engine)?;
    listen_for_image_loads(&engine);
    listen_for_resize(&engine);
    engine.start()?;

    RUNNING.with(|r| {
        *r.borrow_mut() = Some(Running {
            engine,
            _observer: observer,
        })
    });
    Ok(())
}

/// Images often get their real size only once loaded. `load` does not
/// bubble, so listen in the capture phase on the document.
fn listen_for_image_loads(engine: &PageEngine) {
    let handler = engine.clone();
    let closure = Closure::<dyn Fn(web_sys::Event)>::new(move |event: web_sys::Event| {
        let Some(element) = event
            .target()
            .and_then(|t| t.dyn_into::<web_sys::Element>().ok())
        else {
            return;
        };
        let image = handler.host().wrap(element);
        if handler.host().is_image(&image) {
            handler.notice_image(&image);
        }
    });

    match engine.host().document().add_event_listener_with_callback_and_bool(
        "load",
        closure.as_ref().unchecked_ref(),
        true,
    ) {
        Ok(()) => closure.forget(),
        Err(err) => {
            tracing::warn!(error = %host::js_message(&err), "[IRIS] Image load listener not installed");
        }
    }
}

fn listen_for_resize(engine: &PageEngine) {
    let handler = engine.clone();
    let closure = Closure::wrap(Box::new(move || {
        handler.refresh_layout();
    }) as Box<dyn Fn()>);

    match engine
        .host()
        .window()
        .add_event_listener_with_callback("resize", closure.as_ref().unchecked_ref())
    {
        Ok(()) => closure.forget(),
        Err(err) => {
            tracing::warn!(error = %host::js_message(&err), "[IRIS] Resize listener not installed");
        }
    }
}

/// Drop every cached lookup. Exposed for the extension popup.
#[wasm_bindgen(js_name = clearCache)]
pub fn clear_cache() {
    RUNNING.with(|r| {
        if let Some(running) = r.borrow().as_ref() {
            running.engine.clear_cache();
        }
    });
}

/// Engine counters as a plain JS object, for debugging from the console.
#[wasm_bindgen(js_name = engineStats)]
pub fn engine_stats() -> JsValue {
    RUNNING.with(|r| {
        let Some(stats) = r.borrow().as_ref().map(|running| running.engine.stats()) else {
            return JsValue::NULL;
        };
        let obj = js_sys::Object::new();
        for (key, value) in [
            ("overlays", stats.overlays as f64),
            ("pending", stats.pending as f64),
            ("inFlight", stats.in_flight as f64),
            ("cached", stats.cached as f64),
            ("requests", stats.requests as f64),
            ("flushes", stats.flushes as f64),
            ("discarded", stats.discarded as f64),
            ("slides", stats.slides as f64),
        ] {
            let _ = js_sys::Reflect::set(&obj, &JsValue::from_str(key), &JsValue::from_f64(value));
        }
        obj.into()
    })
}
