//! Carousel visibility
//!
//! Sliders keep inactive slides in the tree and hide them with CSS, so an
//! overlay on an off-screen slide would otherwise keep showing hotspots.
//! For each slide that hosts an overlay we register one narrow `class`
//! observer and mirror the slide's active state onto its overlays.
//!
//! Observers are created the first time a slide is seen and disconnected
//! when the slide leaves the tree or loses its last overlay.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use hashbrown::HashMap;
use iris_core::{HostError, HostPage, ObserverHandle};

/// Marker classes of slide containers in common carousel libraries
pub const SLIDE_CLASSES: &[&str] = &[
    "swiper-slide",
    "slick-slide",
    "carousel-item",
    "splide__slide",
    "glide__slide",
];

/// Classes that mark a slide as shown or adjacent to the shown one
pub const ACTIVE_SLIDE_CLASSES: &[&str] = &[
    "swiper-slide-active",
    "swiper-slide-next",
    "swiper-slide-prev",
    "slick-active",
    "slick-current",
    "active",
    "is-active",
    "is-visible",
];

pub const HIDDEN_CLASS: &str = "iris-overlay--hidden";

struct SlideWatch<H: HostPage> {
    observer: H::Observer,
    overlays: Vec<H::Node>,
}

type SlideMap<H> = HashMap<<H as HostPage>::Node, SlideWatch<H>>;

pub struct VisibilityAdapter<H: HostPage> {
    host: H,
    slides: Rc<RefCell<SlideMap<H>>>,
}

impl<H: HostPage> VisibilityAdapter<H> {
    pub fn new(host: H) -> Self {
        Self {
            host,
            slides: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    /// Start mirroring the slide state of `image` onto `overlay`.
    ///
    /// Returns `Ok(false)` when the image is not inside a slide.
    pub fn track(&self, image: &H::Node, overlay: &H::Node) -> Result<bool, HostError> {
        let Some(slide) = self.host.closest_with_class(image, SLIDE_CLASSES) else {
            return Ok(false);
        };

        let known = self.slides.borrow().contains_key(&slide);
        if !known {
            let observer = self.host.observe_attributes(
                &slide,
                &["class"],
                on_slide_change(self.host.clone(), Rc::downgrade(&self.slides), slide.clone()),
            )?;
            self.slides.borrow_mut().insert(
                slide.clone(),
                SlideWatch {
                    observer,
                    overlays: Vec::new(),
                },
            );
            tracing::debug!(?slide, "[VISIBILITY] Watching slide");
        }

        if let Some(watch) = self.slides.borrow_mut().get_mut(&slide)
            && !watch.overlays.contains(overlay)
        {
            watch.overlays.push(overlay.clone());
        }
        apply(&self.host, &slide, std::slice::from_ref(overlay));
        Ok(true)
    }

    /// Stop tracking `overlay`. The slide's observer goes with its last overlay.
    pub fn untrack(&self, overlay: &H::Node) {
        let mut slides = self.slides.borrow_mut();
        let Some(slide) = slides
            .iter()
            .find(|(_, watch)| watch.overlays.contains(overlay))
            .map(|(slide, _)| slide.clone())
        else {
            return;
        };

        let emptied = slides.get_mut(&slide).is_some_and(|watch| {
            watch.overlays.retain(|o| o != overlay);
            watch.overlays.is_empty()
        });
        if emptied && let Some(watch) = slides.remove(&slide) {
            watch.observer.disconnect();
        }
    }

    /// Disconnect observers of slides that left the tree. Returns how many.
    pub fn prune(&self) -> usize {
        let mut slides = self.slides.borrow_mut();
        let gone: Vec<H::Node> = slides
            .keys()
            .filter(|slide| !self.host.is_connected(slide))
            .cloned()
            .collect();
        for slide in &gone {
            if let Some(watch) = slides.remove(slide) {
                watch.observer.disconnect();
            }
        }
        if !gone.is_empty() {
            tracing::debug!(count = gone.len(), "[VISIBILITY] Pruned detached slides");
        }
        gone.len()
    }

    pub fn slide_count(&self) -> usize {
        self.slides.borrow().len()
    }
}

pub fn is_slide_visible<H: HostPage>(host: &H, slide: &H::Node) -> bool {
    ACTIVE_SLIDE_CLASSES.iter().any(|c| host.has_class(slide, c))
}

fn apply<H: HostPage>(host: &H, slide: &H::Node, overlays: &[H::Node]) {
    let visible = is_slide_visible(host, slide);
    for overlay in overlays {
        if visible {
            host.remove_class(overlay, HIDDEN_CLASS);
        } else {
            host.add_class(overlay, HIDDEN_CLASS);
        }
    }
}

fn on_slide_change<H: HostPage>(
    host: H,
    slides: Weak<RefCell<SlideMap<H>>>,
    slide: H::Node,
) -> Box<dyn FnMut()> {
    Box::new(move || {
        let Some(slides) = slides.upgrade() else {
            return;
        };
        let overlays = match slides.borrow().get(&slide) {
            Some(watch) => watch.overlays.clone(),
            None => return,
        };
        apply(&host, &slide, &overlays);
    })
}
