//! The seam between the engine and a live document.
//!
//! `HostPage` is the only way the engine touches the page. The browser
//! integration implements it over `web-sys`; tests use the in-memory
//! `TestHost` from the `testing` module. Keeping every DOM capability behind
//! this trait keeps the watcher, scheduler and overlay logic free of raw
//! observer records and JS values.

use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::time::Duration;

use crate::error::HostError;

/// A locally spawned, non-`Send` task.
pub type LocalTask = Pin<Box<dyn Future<Output = ()>>>;

/// Delegated click handler. Receives the node that was actually clicked.
pub type ClickHandler<N> = Box<dyn FnMut(&N)>;

/// Rectangle in CSS pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Rect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub const fn new(left: f64, top: f64, width: f64, height: f64) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    /// True when both dimensions reach `floor`
    pub fn reaches(&self, floor: f64) -> bool {
        self.width >= floor && self.height >= floor
    }
}

/// Handle to an attribute observer created by [`HostPage::observe_attributes`].
pub trait ObserverHandle {
    /// Stop delivering notifications. Idempotent.
    fn disconnect(&self);
}

/// Capabilities the engine needs from a host document.
///
/// All methods take `&self`. Implementations are cheap handles (`Clone`) over
/// shared page state and must never invoke engine callbacks re-entrantly from
/// inside one of these calls.
pub trait HostPage: Clone + 'static {
    /// Element identity. Equality is element identity, not structural equality.
    type Node: Clone + Eq + Hash + fmt::Debug + 'static;
    type Observer: ObserverHandle + 'static;

    // --- Queries ---

    /// Root all scans start from (the document body)
    fn root(&self) -> Option<Self::Node>;
    fn is_image(&self, node: &Self::Node) -> bool;
    /// Resolved source URL of an image element, if it has a usable one
    fn image_source(&self, node: &Self::Node) -> Option<String>;
    /// Every image element in the subtree rooted at `node`, `node` included
    fn images_within(&self, node: &Self::Node) -> Vec<Self::Node>;
    fn parent(&self, node: &Self::Node) -> Option<Self::Node>;
    fn is_connected(&self, node: &Self::Node) -> bool;
    /// Rendered border box in viewport coordinates
    fn rendered_box(&self, node: &Self::Node) -> Rect;
    /// Border box of `node` in the padding-box coordinate space of `container`
    fn box_within(&self, node: &Self::Node, container: &Self::Node) -> Rect;
    fn computed_style(&self, node: &Self::Node, property: &str) -> Option<String>;
    fn has_class(&self, node: &Self::Node, class: &str) -> bool;
    fn attribute(&self, node: &Self::Node, name: &str) -> Option<String>;

    // --- Mutation ---

    fn create_element(&self, tag: &str) -> Result<Self::Node, HostError>;
    fn append_child(&self, parent: &Self::Node, child: &Self::Node) -> Result<(), HostError>;
    /// Remove `node` from the tree and release any listeners registered on it
    fn detach(&self, node: &Self::Node);
    fn set_style(&self, node: &Self::Node, property: &str, value: &str);
    fn add_class(&self, node: &Self::Node, class: &str);
    fn remove_class(&self, node: &Self::Node, class: &str);
    fn set_attribute(&self, node: &Self::Node, name: &str, value: &str);
    fn set_text(&self, node: &Self::Node, text: &str);

    // --- Events ---

    /// Register one click listener on `node`. Clicks on descendants bubble to it.
    fn on_click(&self, node: &Self::Node, handler: ClickHandler<Self::Node>)
    -> Result<(), HostError>;

    /// Observe changes to the named attributes of `node` only.
    fn observe_attributes(
        &self,
        node: &Self::Node,
        attributes: &[&str],
        on_change: Box<dyn FnMut()>,
    ) -> Result<Self::Observer, HostError>;

    // --- Scheduling ---

    /// Monotonic milliseconds
    fn now_ms(&self) -> f64;
    fn set_timeout(&self, delay: Duration, callback: Box<dyn FnOnce()>);
    fn spawn(&self, task: LocalTask);

    // --- Provided ---

    /// Nearest ancestor (or self) carrying any of `classes`
    fn closest_with_class(&self, node: &Self::Node, classes: &[&str]) -> Option<Self::Node> {
        let mut current = Some(node.clone());
        while let Some(n) = current {
            if classes.iter().any(|c| self.has_class(&n, c)) {
                return Some(n);
            }
            current = self.parent(&n);
        }
        None
    }
}

/// Future factory that completes once the given duration has elapsed.
pub type DeadlineTimer = Box<dyn Fn(Duration) -> LocalTask>;

/// Deadlines driven by the host's own timers.
pub fn deadline_timer<H: HostPage>(host: &H) -> DeadlineTimer {
    let host = host.clone();
    Box::new(move |delay| {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        host.set_timeout(
            delay,
            Box::new(move || {
                let _ = tx.send(());
            }),
        );
        Box::pin(async move {
            // A timer dropped without firing is no deadline at all
            if rx.await.is_err() {
                std::future::pending::<()>().await;
            }
        })
    })
}
