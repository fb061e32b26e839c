//! Page-wide change observation
//!
//! One `MutationObserver` on the body for the lifetime of the page. Raw JS
//! records are reduced to `iris_core::MutationRecord`s here and nowhere
//! else; text and comment nodes are dropped on the way.

use iris_core::{EngineError, HostPage, MutationRecord, SOURCE_ATTRIBUTES};
use iris_overlay::Engine;
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;
use web_sys::{Element, MutationObserver, MutationObserverInit, NodeList};

use crate::backend::FetchBackend;
use crate::host::{PageNode, WebHost, js_message};

pub type PageEngine = Engine<WebHost, FetchBackend>;

/// Keeps the observer and its callback alive. Dropping it stops observation.
pub struct PageObserver {
    observer: MutationObserver,
    _callback: Closure<dyn FnMut(js_sys::Array, MutationObserver)>,
}

impl Drop for PageObserver {
    fn drop(&mut self) {
        self.observer.disconnect();
    }
}

/// Subscribe `engine` to structural and source-attribute changes under the
/// document body.
pub fn observe_page(engine: &PageEngine) -> Result<PageObserver, EngineError> {
    let host = engine.host().clone();
    let root = host.root().ok_or(EngineError::DocumentNotReady)?;

    let handler = engine.clone();
    let callback = Closure::<dyn FnMut(js_sys::Array, MutationObserver)>::new(
        move |records: js_sys::Array, _observer: MutationObserver| {
            let records = translate(handler.host(), &records);
            if !records.is_empty() {
                handler.handle_mutations(&records);
            }
        },
    );

    let observer = MutationObserver::new(callback.as_ref().unchecked_ref())
        .map_err(|e| iris_core::HostError::op("MutationObserver", js_message(&e)))?;

    let filter: js_sys::Array = SOURCE_ATTRIBUTES
        .iter()
        .map(|a| JsValue::from_str(a))
        .collect();
    let init = MutationObserverInit::new();
    init.set_child_list(true);
    init.set_subtree(true);
    init.set_attributes(true);
    init.set_attribute_filter(&filter);
    observer
        .observe_with_options(root.element(), &init)
        .map_err(|e| iris_core::HostError::op("observe", js_message(&e)))?;

    tracing::info!("[OBSERVER] Watching document body");
    Ok(PageObserver {
        observer,
        _callback: callback,
    })
}

fn translate(host: &WebHost, records: &js_sys::Array) -> Vec<MutationRecord<PageNode>> {
    records
        .iter()
        .filter_map(|r| r.dyn_into::<web_sys::MutationRecord>().ok())
        .filter_map(|record| match record.type_().as_str() {
            "childList" => {
                let added = elements(host, &record.added_nodes());
                let removed = elements(host, &record.removed_nodes());
                (!added.is_empty() || !removed.is_empty())
                    .then_some(MutationRecord::ChildList { added, removed })
            }
            "attributes" => {
                let target = record.target()?.dyn_into::<Element>().ok()?;
                let name = record.attribute_name()?;
                Some(MutationRecord::attribute(host.wrap(target), name))
            }
            _ => None,
        })
        .collect()
}

fn elements(host: &WebHost, nodes: &NodeList) -> Vec<PageNode> {
    (0..nodes.length())
        .filter_map(|i| nodes.item(i))
        .filter_map(|n| n.dyn_into::<Element>().ok())
        .map(|el| host.wrap(el))
        .collect()
}
