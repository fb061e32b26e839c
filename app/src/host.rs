//! `HostPage` over the live browser document
//!
//! Element identity comes from a `WeakMap` on the JS side: each element is
//! assigned a numeric id the first time the engine sees it, and the map
//! holds the element only weakly, so our bookkeeping never keeps a node
//! alive after the page drops it.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::time::Duration;

use gloo_timers::callback::Timeout;
use hashbrown::HashMap;
use iris_core::{ClickHandler, HostError, HostPage, LocalTask, ObserverHandle, Rect};
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;
use web_sys::{Document, Element, HtmlElement, HtmlImageElement, MutationObserver, Window};

/// Best-effort message from a thrown JS value
pub fn js_message(value: &JsValue) -> String {
    value.as_string().unwrap_or_else(|| format!("{:?}", value))
}

// ─────────────────────────────────────────────────────────────────────────────
// Node identity
// ─────────────────────────────────────────────────────────────────────────────

/// A DOM element with a stable identity for hashing.
#[derive(Clone)]
pub struct PageNode {
    id: u32,
    element: Element,
}

impl PageNode {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn element(&self) -> &Element {
        &self.element
    }
}

impl PartialEq for PageNode {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PageNode {}

impl Hash for PageNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for PageNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}#{}>", self.element.tag_name().to_ascii_lowercase(), self.id)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Observers and listeners
// ─────────────────────────────────────────────────────────────────────────────

type ObserverCallback = Closure<dyn FnMut(js_sys::Array, MutationObserver)>;

/// Attribute observer scoped to one element. Disconnects on drop so the
/// closure is never invoked after it is freed.
pub struct WebObserver {
    observer: MutationObserver,
    _callback: ObserverCallback,
}

impl ObserverHandle for WebObserver {
    fn disconnect(&self) {
        self.observer.disconnect();
    }
}

impl Drop for WebObserver {
    fn drop(&mut self) {
        self.observer.disconnect();
    }
}

struct ClickListener {
    target: Element,
    callback: Closure<dyn FnMut(web_sys::Event)>,
}

impl ClickListener {
    fn unregister(&self) {
        let _ = self
            .target
            .remove_event_listener_with_callback("click", self.callback.as_ref().unchecked_ref());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// WebHost
// ─────────────────────────────────────────────────────────────────────────────

struct HostInner {
    window: Window,
    document: Document,
    ids: js_sys::WeakMap,
    next_id: Cell<u32>,
    click_listeners: RefCell<HashMap<u32, ClickListener>>,
}

#[derive(Clone)]
pub struct WebHost {
    inner: Rc<HostInner>,
}

impl WebHost {
    pub fn new() -> Result<Self, HostError> {
        let window = web_sys::window().ok_or(HostError::DocumentNotReady)?;
        let document = window.document().ok_or(HostError::DocumentNotReady)?;
        Ok(Self {
            inner: Rc::new(HostInner {
                window,
                document,
                ids: js_sys::WeakMap::new(),
                next_id: Cell::new(0),
                click_listeners: RefCell::new(HashMap::new()),
            }),
        })
    }

    pub fn window(&self) -> &Window {
        &self.inner.window
    }

    pub fn document(&self) -> &Document {
        &self.inner.document
    }

    /// Identity handle for `element`, assigning an id on first sight
    pub fn wrap(&self, element: Element) -> PageNode {
        let key: &js_sys::Object = element.as_ref();
        let id = match self.inner.ids.get(key).as_f64() {
            Some(id) => id as u32,
            None => {
                let id = self.inner.next_id.get().wrapping_add(1);
                self.inner.next_id.set(id);
                self.inner.ids.set(key, &JsValue::from(id));
                id
            }
        };
        PageNode { id, element }
    }

    fn wrap_node(&self, node: web_sys::Node) -> Option<PageNode> {
        node.dyn_into::<Element>().ok().map(|el| self.wrap(el))
    }
}

/// Only absolute http(s) sources are worth a lookup; `data:` and `blob:`
/// placeholders are what lazy loaders show before the real image.
fn is_fetchable(src: &str) -> bool {
    src.starts_with("https://") || src.starts_with("http://")
}

/// Element a click landed on (text node clicks resolve to their parent)
fn event_element(event: &web_sys::Event) -> Option<Element> {
    let target = event.target()?;
    if let Some(element) = target.dyn_ref::<Element>() {
        return Some(element.clone());
    }
    target.dyn_ref::<web_sys::Node>()?.parent_element()
}

impl HostPage for WebHost {
    type Node = PageNode;
    type Observer = WebObserver;

    fn root(&self) -> Option<PageNode> {
        let body: HtmlElement = self.inner.document.body()?;
        Some(self.wrap(body.into()))
    }

    fn is_image(&self, node: &PageNode) -> bool {
        node.element.tag_name().eq_ignore_ascii_case("img")
    }

    fn image_source(&self, node: &PageNode) -> Option<String> {
        let img = node.element.dyn_ref::<HtmlImageElement>()?;
        [
            img.current_src(),
            img.src(),
            node.element.get_attribute("data-src").unwrap_or_default(),
        ]
        .into_iter()
        .map(|s| s.trim().to_string())
        .find(|s| is_fetchable(s))
    }

    fn images_within(&self, node: &PageNode) -> Vec<PageNode> {
        let mut images = Vec::new();
        if self.is_image(node) {
            images.push(node.clone());
        }
        if let Ok(list) = node.element.query_selector_all("img") {
            for i in 0..list.length() {
                if let Some(img) = list.item(i).and_then(|n| self.wrap_node(n)) {
                    images.push(img);
                }
            }
        }
        images
    }

    fn parent(&self, node: &PageNode) -> Option<PageNode> {
        node.element.parent_element().map(|el| self.wrap(el))
    }

    fn is_connected(&self, node: &PageNode) -> bool {
        node.element.is_connected()
    }

    fn rendered_box(&self, node: &PageNode) -> Rect {
        let r = node.element.get_bounding_client_rect();
        Rect::new(r.left(), r.top(), r.width(), r.height())
    }

    fn box_within(&self, node: &PageNode, container: &PageNode) -> Rect {
        let inner = self.rendered_box(node);
        let outer = self.rendered_box(container);
        let c = &container.element;
        Rect::new(
            inner.left - outer.left - f64::from(c.client_left()) + f64::from(c.scroll_left()),
            inner.top - outer.top - f64::from(c.client_top()) + f64::from(c.scroll_top()),
            inner.width,
            inner.height,
        )
    }

    fn computed_style(&self, node: &PageNode, property: &str) -> Option<String> {
        self.inner
            .window
            .get_computed_style(&node.element)
            .ok()
            .flatten()?
            .get_property_value(property)
            .ok()
            .filter(|v| !v.is_empty())
    }

    fn has_class(&self, node: &PageNode, class: &str) -> bool {
        node.element.class_list().contains(class)
    }

    fn attribute(&self, node: &PageNode, name: &str) -> Option<String> {
        node.element.get_attribute(name)
    }

    fn create_element(&self, tag: &str) -> Result<PageNode, HostError> {
        let element = self
            .inner
            .document
            .create_element(tag)
            .map_err(|e| HostError::op("create_element", js_message(&e)))?;
        Ok(self.wrap(element))
    }

    fn append_child(&self, parent: &PageNode, child: &PageNode) -> Result<(), HostError> {
        parent
            .element
            .append_child(&child.element)
            .map(|_| ())
            .map_err(|e| HostError::op("append_child", js_message(&e)))
    }

    fn detach(&self, node: &PageNode) {
        let listener = self.inner.click_listeners.borrow_mut().remove(&node.id);
        if let Some(listener) = listener {
            listener.unregister();
        }
        node.element.remove();
    }

    fn set_style(&self, node: &PageNode, property: &str, value: &str) {
        if let Some(el) = node.element.dyn_ref::<HtmlElement>() {
            let _ = el.style().set_property(property, value);
        }
    }

    fn add_class(&self, node: &PageNode, class: &str) {
        let _ = node.element.class_list().add_1(class);
    }

    fn remove_class(&self, node: &PageNode, class: &str) {
        let _ = node.element.class_list().remove_1(class);
    }

    fn set_attribute(&self, node: &PageNode, name: &str, value: &str) {
        let _ = node.element.set_attribute(name, value);
    }

    fn set_text(&self, node: &PageNode, text: &str) {
        node.element.set_text_content(Some(text));
    }

    fn on_click(&self, node: &PageNode, mut handler: ClickHandler<PageNode>) -> Result<(), HostError> {
        // Weak: the listener table lives inside the host it would point back to
        let host = Rc::downgrade(&self.inner);
        let callback = Closure::<dyn FnMut(web_sys::Event)>::new(move |event: web_sys::Event| {
            let Some(inner) = host.upgrade() else {
                return;
            };
            if let Some(target) = event_element(&event) {
                handler(&WebHost { inner }.wrap(target));
            }
        });

        node.element
            .add_event_listener_with_callback("click", callback.as_ref().unchecked_ref())
            .map_err(|e| HostError::op("on_click", js_message(&e)))?;

        let replaced = self.inner.click_listeners.borrow_mut().insert(
            node.id,
            ClickListener {
                target: node.element.clone(),
                callback,
            },
        );
        if let Some(old) = replaced {
            old.unregister();
        }
        Ok(())
    }

    fn observe_attributes(
        &self,
        node: &PageNode,
        attributes: &[&str],
        mut on_change: Box<dyn FnMut()>,
    ) -> Result<WebObserver, HostError> {
        let callback = ObserverCallback::new(move |_records: js_sys::Array, _observer: MutationObserver| {
            on_change();
        });
        let observer = MutationObserver::new(callback.as_ref().unchecked_ref())
            .map_err(|e| HostError::op("observe_attributes", js_message(&e)))?;

        let filter: js_sys::Array = attributes.iter().map(|a| JsValue::from_str(a)).collect();
        let init = web_sys::MutationObserverInit::new();
        init.set_attributes(true);
        init.set_attribute_filter(&filter);
        observer
            .observe_with_options(&node.element, &init)
            .map_err(|e| HostError::op("observe_attributes", js_message(&e)))?;

        Ok(WebObserver {
            observer,
            _callback: callback,
        })
    }

    fn now_ms(&self) -> f64 {
        self.inner
            .window
            .performance()
            .map(|p| p.now())
            .unwrap_or_else(js_sys::Date::now)
    }

    fn set_timeout(&self, delay: Duration, callback: Box<dyn FnOnce()>) {
        let millis = u32::try_from(delay.as_millis()).unwrap_or(u32::MAX);
        Timeout::new(millis, callback).forget();
    }

    fn spawn(&self, task: LocalTask) {
        wasm_bindgen_futures::spawn_local(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_network_sources_are_fetchable() {
        assert!(is_fetchable("https://shop.example/a.jpg"));
        assert!(is_fetchable("http://shop.example/a.jpg"));
        assert!(!is_fetchable("data:image/gif;base64,R0lGODlhAQABAAAAACw="));
        assert!(!is_fetchable("blob:https://shop.example/1234"));
        assert!(!is_fetchable("/relative/a.jpg"));
        assert!(!is_fetchable(""));
    }
}
