//! In-memory host page and scripted backend for tests.
//!
//! `TestHost` models just enough of a document for the engine: a node tree
//! with attributes, inline and computed styles, layout boxes, mutation
//! records, attribute observers, click bubbling, a manual clock with timers,
//! and a local task queue polled on demand.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use hashbrown::HashMap;
use tokio::sync::watch;

use crate::error::{HostError, LookupError};
use crate::host::{ClickHandler, HostPage, LocalTask, ObserverHandle, Rect};
use crate::lookup::DetectionBackend;
use crate::watcher::MutationRecord;

/// Body returned by [`TestBackend`] for URLs with no scripted response
pub const UNKNOWN_IMAGE: &str =
    r#"{"exists": false, "has_product_detections": false, "detections": []}"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TestNode(pub usize);

type SharedClick = Rc<RefCell<ClickHandler<TestNode>>>;
type SharedCallback = Rc<RefCell<Box<dyn FnMut()>>>;

struct NodeData {
    tag: String,
    parent: Option<usize>,
    children: Vec<usize>,
    attrs: BTreeMap<String, String>,
    styles: BTreeMap<String, String>,
    computed: BTreeMap<String, String>,
    rect: Rect,
    text: String,
    click_handlers: Vec<SharedClick>,
}

impl NodeData {
    fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            parent: None,
            children: Vec::new(),
            attrs: BTreeMap::new(),
            styles: BTreeMap::new(),
            computed: BTreeMap::new(),
            rect: Rect::default(),
            text: String::new(),
            click_handlers: Vec::new(),
        }
    }

    fn has_class(&self, class: &str) -> bool {
        self.attrs
            .get("class")
            .is_some_and(|list| list.split_whitespace().any(|c| c == class))
    }
}

struct ObserverEntry {
    node: usize,
    attributes: Vec<String>,
    callback: SharedCallback,
    active: Rc<Cell<bool>>,
}

struct Timer {
    due: f64,
    seq: u64,
    callback: Box<dyn FnOnce()>,
}

struct Dom {
    nodes: Vec<NodeData>,
    records: Vec<MutationRecord<TestNode>>,
    observers: Vec<ObserverEntry>,
    queued: Vec<usize>,
    timers: Vec<Timer>,
    timer_seq: u64,
    now: f64,
}

impl Dom {
    fn new() -> Self {
        let mut body = NodeData::new("body");
        body.computed.insert("display".to_string(), "block".to_string());
        Self {
            nodes: vec![body],
            records: Vec::new(),
            observers: Vec::new(),
            queued: Vec::new(),
            timers: Vec::new(),
            timer_seq: 0,
            now: 0.0,
        }
    }

    fn create(&mut self, tag: &str) -> usize {
        self.nodes.push(NodeData::new(tag));
        self.nodes.len() - 1
    }

    fn connected(&self, id: usize) -> bool {
        let mut current = id;
        loop {
            if current == 0 {
                return true;
            }
            match self.nodes[current].parent {
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }

    fn is_ancestor_or_self(&self, ancestor: usize, id: usize) -> bool {
        let mut current = Some(id);
        while let Some(n) = current {
            if n == ancestor {
                return true;
            }
            current = self.nodes[n].parent;
        }
        false
    }

    fn subtree(&self, id: usize, out: &mut Vec<usize>) {
        out.push(id);
        for &child in &self.nodes[id].children {
            self.subtree(child, out);
        }
    }

    fn unlink(&mut self, id: usize) {
        if let Some(parent) = self.nodes[id].parent.take() {
            let was_connected = self.connected(parent);
            self.nodes[parent].children.retain(|&c| c != id);
            if was_connected {
                self.records.push(MutationRecord::removed(vec![TestNode(id)]));
            }
        }
    }

    fn insert(&mut self, parent: usize, child: usize) {
        self.unlink(child);
        self.nodes[child].parent = Some(parent);
        self.nodes[parent].children.push(child);
        if self.connected(parent) {
            self.records.push(MutationRecord::added(vec![TestNode(child)]));
        }
    }

    fn write_attr(&mut self, id: usize, name: &str, value: Option<&str>) {
        let name = name.to_ascii_lowercase();
        match value {
            Some(v) => {
                self.nodes[id].attrs.insert(name.clone(), v.to_string());
            }
            None => {
                self.nodes[id].attrs.remove(&name);
            }
        }

        if self.connected(id) {
            self.records
                .push(MutationRecord::attribute(TestNode(id), name.clone()));
        }

        for (idx, observer) in self.observers.iter().enumerate() {
            if observer.node == id
                && observer.active.get()
                && observer.attributes.iter().any(|a| a.eq_ignore_ascii_case(&name))
                && !self.queued.contains(&idx)
            {
                self.queued.push(idx);
            }
        }
    }
}

/// In-memory document. Clones share the same tree.
#[derive(Clone)]
pub struct TestHost {
    dom: Rc<RefCell<Dom>>,
    tasks: Rc<RefCell<Vec<LocalTask>>>,
}

impl Default for TestHost {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHost {
    pub fn new() -> Self {
        Self {
            dom: Rc::new(RefCell::new(Dom::new())),
            tasks: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn body(&self) -> TestNode {
        TestNode(0)
    }

    /// New detached element
    pub fn element(&self, tag: &str) -> TestNode {
        TestNode(self.dom.borrow_mut().create(tag))
    }

    /// New detached `<img>` with a source and a laid-out size
    pub fn image(&self, src: &str, width: f64, height: f64) -> TestNode {
        let mut dom = self.dom.borrow_mut();
        let id = dom.create("img");
        dom.nodes[id].attrs.insert("src".to_string(), src.to_string());
        dom.nodes[id].rect = Rect::new(0.0, 0.0, width, height);
        TestNode(id)
    }

    pub fn append(&self, parent: &TestNode, child: &TestNode) {
        self.dom.borrow_mut().insert(parent.0, child.0);
    }

    /// Page-side removal. Listeners stay attached, as they would in a browser.
    pub fn remove(&self, node: &TestNode) {
        self.dom.borrow_mut().unlink(node.0);
    }

    pub fn set_attr(&self, node: &TestNode, name: &str, value: &str) {
        self.dom.borrow_mut().write_attr(node.0, name, Some(value));
    }

    pub fn remove_attr(&self, node: &TestNode, name: &str) {
        self.dom.borrow_mut().write_attr(node.0, name, None);
    }

    pub fn set_rect(&self, node: &TestNode, rect: Rect) {
        self.dom.borrow_mut().nodes[node.0].rect = rect;
    }

    pub fn set_computed(&self, node: &TestNode, property: &str, value: &str) {
        self.dom.borrow_mut().nodes[node.0]
            .computed
            .insert(property.to_string(), value.to_string());
    }

    /// Drain mutation records produced since the last call
    pub fn take_records(&self) -> Vec<MutationRecord<TestNode>> {
        std::mem::take(&mut self.dom.borrow_mut().records)
    }

    /// Invoke attribute observers with queued changes. Returns how many ran.
    pub fn deliver_observers(&self) -> usize {
        let callbacks: Vec<SharedCallback> = {
            let mut dom = self.dom.borrow_mut();
            let queued = std::mem::take(&mut dom.queued);
            queued
                .into_iter()
                .filter_map(|idx| dom.observers.get(idx))
                .filter(|o| o.active.get())
                .map(|o| Rc::clone(&o.callback))
                .collect()
        };
        for callback in &callbacks {
            (&mut *callback.borrow_mut())();
        }
        callbacks.len()
    }

    /// Move the clock forward, firing due timers in order.
    pub fn advance(&self, ms: f64) {
        let target = self.dom.borrow().now + ms;
        loop {
            let next = {
                let mut dom = self.dom.borrow_mut();
                let idx = dom
                    .timers
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.due <= target)
                    .min_by(|(_, a), (_, b)| a.due.total_cmp(&b.due).then(a.seq.cmp(&b.seq)))
                    .map(|(i, _)| i);
                match idx {
                    Some(i) => {
                        let timer = dom.timers.remove(i);
                        dom.now = dom.now.max(timer.due);
                        Some(timer.callback)
                    }
                    None => {
                        dom.now = target;
                        None
                    }
                }
            };
            match next {
                Some(callback) => callback(),
                None => break,
            }
        }
    }

    pub fn pending_timers(&self) -> usize {
        self.dom.borrow().timers.len()
    }

    /// Poll spawned tasks until none of them can make progress.
    pub fn run_until_idle(&self) {
        let mut cx = Context::from_waker(Waker::noop());
        loop {
            let batch = std::mem::take(&mut *self.tasks.borrow_mut());
            if batch.is_empty() {
                return;
            }
            let polled = batch.len();
            let mut still_pending = Vec::new();
            for mut task in batch {
                if task.as_mut().poll(&mut cx) == Poll::Pending {
                    still_pending.push(task);
                }
            }
            let stalled = still_pending.len() == polled && self.tasks.borrow().is_empty();
            self.tasks.borrow_mut().extend(still_pending);
            if stalled {
                return;
            }
        }
    }

    pub fn pending_tasks(&self) -> usize {
        self.tasks.borrow().len()
    }

    /// Dispatch a click on `target`, bubbling through its ancestors.
    pub fn click(&self, target: &TestNode) {
        let handlers: Vec<SharedClick> = {
            let dom = self.dom.borrow();
            let mut out = Vec::new();
            let mut current = Some(target.0);
            while let Some(id) = current {
                out.extend(dom.nodes[id].click_handlers.iter().map(Rc::clone));
                current = dom.nodes[id].parent;
            }
            out
        };
        for handler in handlers {
            (&mut *handler.borrow_mut())(target);
        }
    }

    /// Connected nodes carrying `class`, in document order
    pub fn find_by_class(&self, class: &str) -> Vec<TestNode> {
        let dom = self.dom.borrow();
        let mut all = Vec::new();
        dom.subtree(0, &mut all);
        all.into_iter()
            .filter(|&id| dom.nodes[id].has_class(class))
            .map(TestNode)
            .collect()
    }

    pub fn children(&self, node: &TestNode) -> Vec<TestNode> {
        self.dom.borrow().nodes[node.0]
            .children
            .iter()
            .copied()
            .map(TestNode)
            .collect()
    }

    /// Inline style value
    pub fn style(&self, node: &TestNode, property: &str) -> Option<String> {
        self.dom.borrow().nodes[node.0].styles.get(property).cloned()
    }

    pub fn tag(&self, node: &TestNode) -> String {
        self.dom.borrow().nodes[node.0].tag.clone()
    }

    pub fn text(&self, node: &TestNode) -> String {
        self.dom.borrow().nodes[node.0].text.clone()
    }

    pub fn active_observers(&self) -> usize {
        self.dom
            .borrow()
            .observers
            .iter()
            .filter(|o| o.active.get())
            .count()
    }
}

pub struct TestObserver {
    active: Rc<Cell<bool>>,
}

impl ObserverHandle for TestObserver {
    fn disconnect(&self) {
        self.active.set(false);
    }
}

fn default_display(tag: &str) -> &'static str {
    match tag {
        "img" | "a" | "span" | "picture" | "em" | "strong" => "inline",
        "li" => "list-item",
        _ => "block",
    }
}

impl HostPage for TestHost {
    type Node = TestNode;
    type Observer = TestObserver;

    fn root(&self) -> Option<TestNode> {
        Some(TestNode(0))
    }

    fn is_image(&self, node: &TestNode) -> bool {
        self.dom.borrow().nodes[node.0].tag == "img"
    }

    fn image_source(&self, node: &TestNode) -> Option<String> {
        let dom = self.dom.borrow();
        let data = &dom.nodes[node.0];
        if data.tag != "img" {
            return None;
        }
        data.attrs
            .get("src")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    fn images_within(&self, node: &TestNode) -> Vec<TestNode> {
        let dom = self.dom.borrow();
        let mut all = Vec::new();
        dom.subtree(node.0, &mut all);
        all.into_iter()
            .filter(|&id| dom.nodes[id].tag == "img")
            .map(TestNode)
            .collect()
    }

    fn parent(&self, node: &TestNode) -> Option<TestNode> {
        self.dom.borrow().nodes[node.0].parent.map(TestNode)
    }

    fn is_connected(&self, node: &TestNode) -> bool {
        self.dom.borrow().connected(node.0)
    }

    fn rendered_box(&self, node: &TestNode) -> Rect {
        self.dom.borrow().nodes[node.0].rect
    }

    fn box_within(&self, node: &TestNode, container: &TestNode) -> Rect {
        let dom = self.dom.borrow();
        let inner = dom.nodes[node.0].rect;
        let outer = dom.nodes[container.0].rect;
        Rect::new(
            inner.left - outer.left,
            inner.top - outer.top,
            inner.width,
            inner.height,
        )
    }

    fn computed_style(&self, node: &TestNode, property: &str) -> Option<String> {
        let dom = self.dom.borrow();
        let data = &dom.nodes[node.0];
        if let Some(v) = data.styles.get(property).or_else(|| data.computed.get(property)) {
            return Some(v.clone());
        }
        match property {
            "display" => Some(default_display(&data.tag).to_string()),
            "position" => Some("static".to_string()),
            _ => None,
        }
    }

    fn has_class(&self, node: &TestNode, class: &str) -> bool {
        self.dom.borrow().nodes[node.0].has_class(class)
    }

    fn attribute(&self, node: &TestNode, name: &str) -> Option<String> {
        self.dom.borrow().nodes[node.0]
            .attrs
            .get(&name.to_ascii_lowercase())
            .cloned()
    }

    fn create_element(&self, tag: &str) -> Result<TestNode, HostError> {
        Ok(self.element(tag))
    }

    fn append_child(&self, parent: &TestNode, child: &TestNode) -> Result<(), HostError> {
        let mut dom = self.dom.borrow_mut();
        if dom.is_ancestor_or_self(child.0, parent.0) {
            return Err(HostError::op("append_child", "would create a cycle"));
        }
        dom.insert(parent.0, child.0);
        Ok(())
    }

    fn detach(&self, node: &TestNode) {
        let mut dom = self.dom.borrow_mut();
        dom.unlink(node.0);
        let mut subtree = Vec::new();
        dom.subtree(node.0, &mut subtree);
        for id in subtree {
            dom.nodes[id].click_handlers.clear();
        }
    }

    fn set_style(&self, node: &TestNode, property: &str, value: &str) {
        self.dom.borrow_mut().nodes[node.0]
            .styles
            .insert(property.to_string(), value.to_string());
    }

    fn add_class(&self, node: &TestNode, class: &str) {
        let mut dom = self.dom.borrow_mut();
        if dom.nodes[node.0].has_class(class) {
            return;
        }
        let list = match dom.nodes[node.0].attrs.get("class") {
            Some(existing) if !existing.trim().is_empty() => format!("{} {class}", existing.trim()),
            _ => class.to_string(),
        };
        dom.write_attr(node.0, "class", Some(&list));
    }

    fn remove_class(&self, node: &TestNode, class: &str) {
        let mut dom = self.dom.borrow_mut();
        if !dom.nodes[node.0].has_class(class) {
            return;
        }
        let list = dom.nodes[node.0]
            .attrs
            .get("class")
            .map(|existing| {
                existing
                    .split_whitespace()
                    .filter(|c| *c != class)
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();
        dom.write_attr(node.0, "class", Some(&list));
    }

    fn set_attribute(&self, node: &TestNode, name: &str, value: &str) {
        self.dom.borrow_mut().write_attr(node.0, name, Some(value));
    }

    fn set_text(&self, node: &TestNode, text: &str) {
        self.dom.borrow_mut().nodes[node.0].text = text.to_string();
    }

    fn on_click(&self, node: &TestNode, handler: ClickHandler<TestNode>) -> Result<(), HostError> {
        self.dom.borrow_mut().nodes[node.0]
            .click_handlers
            .push(Rc::new(RefCell::new(handler)));
        Ok(())
    }

    fn observe_attributes(
        &self,
        node: &TestNode,
        attributes: &[&str],
        on_change: Box<dyn FnMut()>,
    ) -> Result<TestObserver, HostError> {
        let active = Rc::new(Cell::new(true));
        self.dom.borrow_mut().observers.push(ObserverEntry {
            node: node.0,
            attributes: attributes.iter().map(|a| a.to_string()).collect(),
            callback: Rc::new(RefCell::new(on_change)),
            active: Rc::clone(&active),
        });
        Ok(TestObserver { active })
    }

    fn now_ms(&self) -> f64 {
        self.dom.borrow().now
    }

    fn set_timeout(&self, delay: Duration, callback: Box<dyn FnOnce()>) {
        let mut dom = self.dom.borrow_mut();
        let due = dom.now + delay.as_millis() as f64;
        let seq = dom.timer_seq;
        dom.timer_seq += 1;
        dom.timers.push(Timer { due, seq, callback });
    }

    fn spawn(&self, task: LocalTask) {
        self.tasks.borrow_mut().push(task);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scripted backend
// ─────────────────────────────────────────────────────────────────────────────

struct BackendState {
    responses: RefCell<HashMap<String, Result<String, LookupError>>>,
    calls: RefCell<Vec<String>>,
    gate: watch::Sender<bool>,
}

/// Backend with per-URL scripted responses. Clones share state.
#[derive(Clone)]
pub struct TestBackend {
    state: Rc<BackendState>,
}

impl Default for TestBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl TestBackend {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            state: Rc::new(BackendState {
                responses: RefCell::new(HashMap::new()),
                calls: RefCell::new(Vec::new()),
                gate,
            }),
        }
    }

    pub fn respond(&self, image_url: &str, body: &str) {
        self.state
            .responses
            .borrow_mut()
            .insert(image_url.to_string(), Ok(body.to_string()));
    }

    pub fn fail(&self, image_url: &str, err: LookupError) {
        self.state
            .responses
            .borrow_mut()
            .insert(image_url.to_string(), Err(err));
    }

    /// Park every request until [`TestBackend::release`]
    pub fn hold(&self) {
        self.state.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.state.gate.send_replace(true);
    }

    /// Image URLs requested so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.state.calls.borrow().clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.calls.borrow().len()
    }
}

impl DetectionBackend for TestBackend {
    async fn fetch_detections(&self, image_url: &str) -> Result<String, LookupError> {
        self.state.calls.borrow_mut().push(image_url.to_string());
        let mut gate = self.state.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        self.state
            .responses
            .borrow()
            .get(image_url)
            .cloned()
            .unwrap_or_else(|| Ok(UNKNOWN_IMAGE.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connected_tracking() {
        let host = TestHost::new();
        let body = host.body();
        let outer = host.element("div");
        let img = host.image("https://shop.example/a.jpg", 10.0, 10.0);
        host.append(&outer, &img);
        assert!(!host.is_connected(&img));

        host.append(&body, &outer);
        assert!(host.is_connected(&img));
        assert_eq!(host.take_records().len(), 1);

        host.remove(&outer);
        assert!(!host.is_connected(&img));
    }

    #[test]
    fn test_timers_fire_in_due_order() {
        let host = TestHost::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        for (label, ms) in [("late", 300), ("early", 100), ("mid", 200)] {
            let log = Rc::clone(&log);
            host.set_timeout(
                Duration::from_millis(ms),
                Box::new(move || log.borrow_mut().push(label)),
            );
        }

        host.advance(150.0);
        assert_eq!(*log.borrow(), vec!["early"]);
        host.advance(1000.0);
        assert_eq!(*log.borrow(), vec!["early", "mid", "late"]);
        assert_eq!(host.pending_timers(), 0);
        assert_eq!(host.now_ms(), 1150.0);
    }

    #[test]
    fn test_disconnected_observer_is_silent() {
        let host = TestHost::new();
        let body = host.body();
        let slide = host.element("div");
        host.append(&body, &slide);

        let hits = Rc::new(Cell::new(0));
        let counter = Rc::clone(&hits);
        let observer = host
            .observe_attributes(&slide, &["class"], Box::new(move || counter.set(counter.get() + 1)))
            .unwrap();

        host.add_class(&slide, "active");
        assert_eq!(host.deliver_observers(), 1);
        assert_eq!(hits.get(), 1);

        observer.disconnect();
        host.remove_class(&slide, "active");
        assert_eq!(host.deliver_observers(), 0);
        assert_eq!(hits.get(), 1);
        assert_eq!(host.active_observers(), 0);
    }

    #[test]
    fn test_click_bubbles_to_ancestors() {
        let host = TestHost::new();
        let body = host.body();
        let list = host.element("ul");
        let item = host.element("li");
        host.append(&list, &item);
        host.append(&body, &list);

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        host.on_click(&list, Box::new(move |target| sink.borrow_mut().push(*target)))
            .unwrap();

        host.click(&item);
        assert_eq!(*seen.borrow(), vec![item]);

        host.detach(&list);
        host.click(&item);
        assert_eq!(seen.borrow().len(), 1);
    }
}
