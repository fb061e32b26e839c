//! Engine: the reactive pipeline for one page
//!
//! ```text
//!  handle_mutations ──► classify ──┬─► Removed ───► OverlayManager::on_removed
//!                                  │               (+ cancel pending, drop ticket)
//!                                  └─► Candidate ─► BatchScheduler ─(timer)─► flush
//!                                                                              │
//!        OverlayManager::on_resolved ◄── ticket still current? ◄── resolve ◄───┘
//! ```
//!
//! Everything runs on the page's single thread. Each lookup started by a
//! flush carries a ticket; removal or a newer lookup for the same element
//! invalidates it, and a response whose ticket is gone is dropped.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use hashbrown::HashMap;
use iris_core::{
    BatchScheduler, DetectionBackend, EngineError, HostPage, LookupClient, LookupOptions,
    LookupResult, MutationRecord, WatchEvent, classify, deadline_timer,
};
use iris_types::EngineConfig;

use crate::manager::{OverlayManager, RenderOutcome};

/// Snapshot of engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Live overlays
    pub overlays: usize,
    /// Candidates waiting for the next flush
    pub pending: usize,
    /// Elements with a lookup in flight
    pub in_flight: usize,
    /// Cache entries, pending markers included
    pub cached: usize,
    /// Backend requests issued
    pub requests: u64,
    pub flushes: u64,
    /// Responses dropped because their element was removed or re-targeted
    pub discarded: u64,
    /// Carousel slides under observation
    pub slides: usize,
}

struct Ticket {
    generation: u64,
    cache_key: String,
}

struct Inner<H: HostPage, B> {
    host: H,
    config: EngineConfig,
    lookup: LookupClient<B>,
    scheduler: RefCell<BatchScheduler<H::Node>>,
    overlays: RefCell<OverlayManager<H>>,
    in_flight: RefCell<HashMap<H::Node, Ticket>>,
    next_generation: Cell<u64>,
    discarded: Cell<u64>,
    started: Cell<bool>,
}

/// Handle to one engine instance. Clones share the instance.
pub struct Engine<H: HostPage, B> {
    inner: Rc<Inner<H, B>>,
}

impl<H: HostPage, B> Clone for Engine<H, B> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<H: HostPage, B: DetectionBackend> Engine<H, B> {
    pub fn new(host: H, backend: B, config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;

        let clock = host.clone();
        let lookup = LookupClient::new(
            backend,
            LookupOptions::from(&config),
            Box::new(move || clock.now_ms()),
        )
        .with_timer(deadline_timer(&host));

        Ok(Self {
            inner: Rc::new(Inner {
                scheduler: RefCell::new(BatchScheduler::new(config.debounce())),
                overlays: RefCell::new(OverlayManager::new(host.clone(), config.min_image_size)),
                host,
                config,
                lookup,
                in_flight: RefCell::new(HashMap::new()),
                next_generation: Cell::new(0),
                discarded: Cell::new(0),
                started: Cell::new(false),
            }),
        })
    }

    /// Arm the initial full-document scan. Calling it again is a no-op.
    pub fn start(&self) -> Result<(), EngineError> {
        if self.inner.started.get() {
            return Ok(());
        }
        if self.inner.host.root().is_none() {
            return Err(EngineError::DocumentNotReady);
        }
        self.inner.started.set(true);

        let engine = Rc::downgrade(&self.inner);
        self.inner.host.set_timeout(
            self.inner.config.initial_delay(),
            Box::new(move || {
                if let Some(inner) = engine.upgrade() {
                    Engine { inner }.scan_document();
                }
            }),
        );

        tracing::info!(
            backend = %self.inner.config.base_url,
            db_name = %self.inner.config.db_name,
            debounce_ms = self.inner.config.debounce_ms,
            "[ENGINE] Started"
        );
        Ok(())
    }

    /// Queue every image currently in the document. Returns how many.
    pub fn scan_document(&self) -> usize {
        let Some(root) = self.inner.host.root() else {
            return 0;
        };
        let images: Vec<H::Node> = self
            .inner
            .host
            .images_within(&root)
            .into_iter()
            .filter(|img| !iris_core::watcher::is_engine_owned(&self.inner.host, img))
            .collect();
        let count = images.len();
        for image in images {
            self.enqueue(image);
        }
        tracing::debug!(images = count, "[ENGINE] Document scanned");
        count
    }

    /// Entry point for the page observer.
    pub fn handle_mutations(&self, records: &[MutationRecord<H::Node>]) {
        for event in classify(&self.inner.host, records) {
            match event {
                WatchEvent::Removed(image) => self.remove(&image),
                WatchEvent::Candidate(image) => self.enqueue(image),
            }
        }
    }

    /// Queue an image noticed outside the mutation stream, e.g. after it
    /// finished loading and got its real size.
    pub fn notice_image(&self, image: &H::Node) {
        if self.inner.host.is_image(image)
            && self.inner.host.is_connected(image)
            && !iris_core::watcher::is_engine_owned(&self.inner.host, image)
        {
            self.enqueue(image.clone());
        }
    }

    /// Process every pending candidate now. Normally driven by the debounce
    /// timer. Returns the batch size.
    pub fn flush(&self) -> usize {
        let batch = self.inner.scheduler.borrow_mut().flush();
        {
            let mut overlays = self.inner.overlays.borrow_mut();
            overlays.sweep();
            overlays.prune_slides();
        }

        for image in &batch {
            self.dispatch(image);
        }

        if !batch.is_empty() {
            tracing::debug!(candidates = batch.len(), "[ENGINE] Batch flushed");
        }
        batch.len()
    }

    /// Forget every cached lookup. Existing overlays stay until their image
    /// is seen again.
    pub fn clear_cache(&self) {
        self.inner.lookup.clear_cache();
    }

    /// Realign overlays after a layout change (resize, zoom).
    pub fn refresh_layout(&self) -> usize {
        self.inner.overlays.borrow().reposition_all()
    }

    pub fn overlay_count(&self) -> usize {
        self.inner.overlays.borrow().len()
    }

    pub fn has_overlay(&self, image: &H::Node) -> bool {
        self.inner.overlays.borrow().binding(image).is_some()
    }

    /// Overlay element bound to `image`
    pub fn overlay_for(&self, image: &H::Node) -> Option<H::Node> {
        self.inner
            .overlays
            .borrow()
            .binding(image)
            .map(|b| b.overlay.clone())
    }

    pub fn stats(&self) -> EngineStats {
        let scheduler = self.inner.scheduler.borrow();
        let overlays = self.inner.overlays.borrow();
        EngineStats {
            overlays: overlays.len(),
            pending: scheduler.pending_len(),
            in_flight: self.inner.in_flight.borrow().len(),
            cached: self.inner.lookup.cached_len(),
            requests: self.inner.lookup.requests_issued(),
            flushes: scheduler.flush_count(),
            discarded: self.inner.discarded.get(),
            slides: overlays.slide_count(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn host(&self) -> &H {
        &self.inner.host
    }

    fn enqueue(&self, image: H::Node) {
        let arm = self.inner.scheduler.borrow_mut().push(image);
        if let Some(delay) = arm {
            let engine = Rc::downgrade(&self.inner);
            self.inner.host.set_timeout(
                delay,
                Box::new(move || {
                    if let Some(inner) = engine.upgrade() {
                        Engine { inner }.flush();
                    }
                }),
            );
        }
    }

    /// Removal is immediate: overlay, pending candidate and ticket all go.
    fn remove(&self, image: &H::Node) {
        let had_overlay = self.inner.overlays.borrow_mut().on_removed(image);
        self.inner.scheduler.borrow_mut().cancel(image);
        self.inner.in_flight.borrow_mut().remove(image);
        if had_overlay {
            tracing::debug!(?image, "[ENGINE] Image removed, overlay detached");
        }
    }

    fn dispatch(&self, image: &H::Node) {
        let inner = &self.inner;
        if !inner.host.is_connected(image) {
            return;
        }

        let Some(url) = inner.host.image_source(image) else {
            // Source cleared: whatever we showed no longer applies
            inner.overlays.borrow_mut().on_removed(image);
            inner.in_flight.borrow_mut().remove(image);
            return;
        };
        let cache_key = inner.lookup.cache_key(&url);

        if inner
            .in_flight
            .borrow()
            .get(image)
            .is_some_and(|t| t.cache_key == cache_key)
        {
            tracing::debug!(url = %url, "[ENGINE] Lookup already in flight");
            return;
        }

        if let Some(result) = inner.lookup.peek(&url) {
            // A lookup for a previous source of this element is now stale
            inner.in_flight.borrow_mut().remove(image);
            self.apply(image, &url, &result);
            return;
        }

        let generation = inner.next_generation.get() + 1;
        inner.next_generation.set(generation);
        inner.in_flight.borrow_mut().insert(
            image.clone(),
            Ticket {
                generation,
                cache_key,
            },
        );

        let engine = self.clone();
        let image = image.clone();
        inner.host.spawn(Box::pin(async move {
            let ticket = TicketGuard {
                engine: engine.clone(),
                image: image.clone(),
                generation,
            };
            let result = engine.inner.lookup.resolve(&url).await;
            if ticket.is_current() {
                engine.apply(&image, &url, &result);
            } else {
                engine.inner.discarded.set(engine.inner.discarded.get() + 1);
                tracing::debug!(url = %url, "[ENGINE] Discarding response for stale element");
            }
        }));
    }

    fn apply(&self, image: &H::Node, url: &str, result: &LookupResult) {
        if !self.inner.host.is_connected(image) {
            return;
        }
        let outcome = self
            .inner
            .overlays
            .borrow_mut()
            .on_resolved(image, url, result);
        match outcome {
            Ok(RenderOutcome::Rendered { links }) => {
                tracing::debug!(url = %url, links, "[ENGINE] Overlay rendered");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(url = %url, error = %err, "[ENGINE] Overlay rendering failed");
            }
        }
    }
}

/// Releases the element's ticket when the lookup task ends, completed or
/// dropped, unless a newer ticket has replaced it.
struct TicketGuard<H: HostPage, B> {
    engine: Engine<H, B>,
    image: H::Node,
    generation: u64,
}

impl<H: HostPage, B> TicketGuard<H, B> {
    fn is_current(&self) -> bool {
        self.engine
            .inner
            .in_flight
            .borrow()
            .get(&self.image)
            .is_some_and(|t| t.generation == self.generation)
    }
}

impl<H: HostPage, B> Drop for TicketGuard<H, B> {
    fn drop(&mut self) {
        let Ok(mut in_flight) = self.engine.inner.in_flight.try_borrow_mut() else {
            return;
        };
        if in_flight
            .get(&self.image)
            .is_some_and(|t| t.generation == self.generation)
        {
            in_flight.remove(&self.image);
        }
    }
}
