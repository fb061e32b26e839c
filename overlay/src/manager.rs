//! Overlay Lifecycle Manager
//!
//! Owns the association from live image elements to the overlays rendered
//! for them. The table is keyed by element identity and never consulted to
//! keep an image alive: entries are dropped explicitly on removal or by the
//! sweep that runs before every batch.

use hashbrown::HashMap;
use iris_core::{HostError, HostPage, LookupResult};

use crate::render::{self, EMPTY_CLASS, OverlayState};
use crate::visibility::VisibilityAdapter;

/// One rendered overlay and the image it belongs to.
#[derive(Debug, Clone)]
pub struct OverlayBinding<N> {
    pub overlay: N,
    /// Positioning ancestor the overlay is appended to
    pub container: N,
    pub source_url: String,
    pub state: OverlayState,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RenderOutcome {
    /// Overlay with `links` hotspots
    Rendered { links: usize },
    /// Overlay in the no-products state
    Empty,
    TooSmall { width: f64, height: f64 },
    NoContainer,
    /// Image left the tree; nothing rendered
    Detached,
}

pub struct OverlayManager<H: HostPage> {
    host: H,
    min_size: f64,
    bindings: HashMap<H::Node, OverlayBinding<H::Node>>,
    visibility: VisibilityAdapter<H>,
}

impl<H: HostPage> OverlayManager<H> {
    pub fn new(host: H, min_image_size: u32) -> Self {
        Self {
            visibility: VisibilityAdapter::new(host.clone()),
            host,
            min_size: f64::from(min_image_size),
            bindings: HashMap::new(),
        }
    }

    /// Render `result` over `image`, replacing any overlay it already has.
    pub fn on_resolved(
        &mut self,
        image: &H::Node,
        source_url: &str,
        result: &LookupResult,
    ) -> Result<RenderOutcome, HostError> {
        self.remove_binding(image);

        if !self.host.is_connected(image) {
            return Ok(RenderOutcome::Detached);
        }

        let frame = self.host.rendered_box(image);
        if !frame.reaches(self.min_size) {
            tracing::debug!(
                url = %source_url,
                width = frame.width,
                height = frame.height,
                "[OVERLAY] Below size floor"
            );
            return Ok(RenderOutcome::TooSmall {
                width: frame.width,
                height: frame.height,
            });
        }

        let Some(container) = self.positioning_container(image) else {
            tracing::warn!(url = %source_url, "[OVERLAY] No positioning container, skipping");
            return Ok(RenderOutcome::NoContainer);
        };

        let position = self.host.computed_style(&container, "position");
        if matches!(position.as_deref(), None | Some("static") | Some("")) {
            self.host.set_style(&container, "position", "relative");
        }

        let state = OverlayState::of(result);
        let overlay = render::create_overlay(
            &self.host,
            self.host.box_within(image, &container),
            state,
        )?;

        let links = match self.fill(&overlay, result) {
            Ok(links) => links,
            Err(err) => {
                // Never leave a half-built overlay or its listener behind
                self.host.detach(&overlay);
                return Err(err);
            }
        };
        if let Err(err) = self.host.append_child(&container, &overlay) {
            self.host.detach(&overlay);
            return Err(err);
        }

        if let Err(err) = self.visibility.track(image, &overlay) {
            tracing::warn!(url = %source_url, error = %err, "[OVERLAY] Slide observer unavailable");
        }

        self.bindings.insert(
            image.clone(),
            OverlayBinding {
                overlay,
                container,
                source_url: source_url.to_string(),
                state,
            },
        );

        tracing::debug!(url = %source_url, links, state = state.as_str(), "[OVERLAY] Rendered");
        Ok(if links == 0 {
            RenderOutcome::Empty
        } else {
            RenderOutcome::Rendered { links }
        })
    }

    /// Detach the overlay bound to `image`, if any.
    pub fn on_removed(&mut self, image: &H::Node) -> bool {
        self.remove_binding(image)
    }

    /// Drop bindings whose image or overlay is no longer in the tree.
    pub fn sweep(&mut self) -> usize {
        let stale: Vec<H::Node> = self
            .bindings
            .iter()
            .filter(|(image, binding)| {
                !self.host.is_connected(image) || !self.host.is_connected(&binding.overlay)
            })
            .map(|(image, _)| image.clone())
            .collect();
        for image in &stale {
            self.remove_binding(image);
        }
        if !stale.is_empty() {
            tracing::debug!(count = stale.len(), "[OVERLAY] Swept stale bindings");
        }
        stale.len()
    }

    /// Realign every overlay with its image's current box.
    pub fn reposition_all(&self) -> usize {
        for (image, binding) in &self.bindings {
            let frame = self.host.box_within(image, &binding.container);
            render::place_box(&self.host, &binding.overlay, frame);
        }
        self.bindings.len()
    }

    pub fn prune_slides(&self) -> usize {
        self.visibility.prune()
    }

    pub fn slide_count(&self) -> usize {
        self.visibility.slide_count()
    }

    pub fn binding(&self, image: &H::Node) -> Option<&OverlayBinding<H::Node>> {
        self.bindings.get(image)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    fn fill(&self, overlay: &H::Node, result: &LookupResult) -> Result<usize, HostError> {
        if result.detections.is_empty() {
            self.host.add_class(overlay, EMPTY_CLASS);
            return Ok(0);
        }
        for detection in &result.detections {
            render::render_hotspot(&self.host, overlay, detection)?;
        }
        render::install_click_retarget(&self.host, overlay)?;
        Ok(result.detections.len())
    }

    /// Nearest ancestor that generates its own box. `display: contents`
    /// wrappers and inline elements are walked past.
    fn positioning_container(&self, image: &H::Node) -> Option<H::Node> {
        let mut current = self.host.parent(image);
        while let Some(node) = current {
            let display = self.host.computed_style(&node, "display");
            match display.as_deref() {
                Some("contents") | Some("inline") => current = self.host.parent(&node),
                _ => return Some(node),
            }
        }
        None
    }

    fn remove_binding(&mut self, image: &H::Node) -> bool {
        match self.bindings.remove(image) {
            Some(binding) => {
                self.visibility.untrack(&binding.overlay);
                self.host.detach(&binding.overlay);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{HOTSPOT_CLASS, STATE_ATTRIBUTE};
    use iris_core::testing::{TestHost, TestNode};
    use iris_core::{Detection, LookupError, OVERLAY_CLASS, Point, ProductPrediction, Rect};

    const SRC: &str = "https://shop.example/a.jpg";

    fn shoe_result() -> LookupResult {
        LookupResult {
            exists: true,
            has_product_detections: true,
            detections: vec![Detection {
                point: Point { x: 0.2, y: 0.8 },
                product_predictions: vec![ProductPrediction {
                    product_url: "/p/1".to_string(),
                    product_title: "Shoe".to_string(),
                    product_price: "$50".to_string(),
                    ..ProductPrediction::default()
                }],
            }],
            error: None,
        }
    }

    fn mounted_image(host: &TestHost, width: f64, height: f64) -> (TestNode, TestNode) {
        let card = host.element("div");
        let img = host.image(SRC, width, height);
        host.append(&card, &img);
        host.append(&host.body(), &card);
        (card, img)
    }

    #[test]
    fn test_resolving_twice_replaces_overlay() {
        let host = TestHost::new();
        let (card, img) = mounted_image(&host, 800.0, 600.0);
        let mut manager = OverlayManager::new(host.clone(), 256);

        let first = manager.on_resolved(&img, SRC, &shoe_result()).unwrap();
        let second = manager.on_resolved(&img, SRC, &shoe_result()).unwrap();

        assert_eq!(first, RenderOutcome::Rendered { links: 1 });
        assert_eq!(second, RenderOutcome::Rendered { links: 1 });
        assert_eq!(host.find_by_class(OVERLAY_CLASS).len(), 1);
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.binding(&img).map(|b| b.container), Some(card));
    }

    #[test]
    fn test_overlay_covers_image_box() {
        let host = TestHost::new();
        let (card, img) = mounted_image(&host, 800.0, 600.0);
        host.set_rect(&card, Rect::new(100.0, 50.0, 1000.0, 800.0));
        host.set_rect(&img, Rect::new(120.0, 70.0, 800.0, 600.0));
        let mut manager = OverlayManager::new(host.clone(), 256);

        manager.on_resolved(&img, SRC, &shoe_result()).unwrap();

        let overlay = manager.binding(&img).unwrap().overlay;
        assert_eq!(host.style(&overlay, "left").as_deref(), Some("20px"));
        assert_eq!(host.style(&overlay, "top").as_deref(), Some("20px"));
        assert_eq!(host.style(&overlay, "width").as_deref(), Some("800px"));
        assert_eq!(host.style(&overlay, "height").as_deref(), Some("600px"));
        assert_eq!(host.style(&card, "position").as_deref(), Some("relative"));
    }

    #[test]
    fn test_positioned_container_is_left_alone() {
        let host = TestHost::new();
        let (card, img) = mounted_image(&host, 800.0, 600.0);
        host.set_computed(&card, "position", "absolute");
        let mut manager = OverlayManager::new(host.clone(), 256);

        manager.on_resolved(&img, SRC, &shoe_result()).unwrap();
        assert_eq!(host.style(&card, "position"), None);
    }

    #[test]
    fn test_small_image_is_skipped() {
        let host = TestHost::new();
        let (_, img) = mounted_image(&host, 100.0, 100.0);
        let mut manager = OverlayManager::new(host.clone(), 256);

        let outcome = manager.on_resolved(&img, SRC, &shoe_result()).unwrap();
        assert_eq!(
            outcome,
            RenderOutcome::TooSmall {
                width: 100.0,
                height: 100.0
            }
        );
        assert!(host.find_by_class(OVERLAY_CLASS).is_empty());
        assert!(manager.is_empty());
    }

    #[test]
    fn test_shrunk_image_loses_previous_overlay() {
        let host = TestHost::new();
        let (_, img) = mounted_image(&host, 800.0, 600.0);
        let mut manager = OverlayManager::new(host.clone(), 256);
        manager.on_resolved(&img, SRC, &shoe_result()).unwrap();

        host.set_rect(&img, Rect::new(0.0, 0.0, 120.0, 90.0));
        manager.on_resolved(&img, SRC, &shoe_result()).unwrap();
        assert!(host.find_by_class(OVERLAY_CLASS).is_empty());
    }

    #[test]
    fn test_contents_and_inline_wrappers_are_skipped() {
        let host = TestHost::new();
        let card = host.element("div");
        let wrapper = host.element("div");
        host.set_computed(&wrapper, "display", "contents");
        let link = host.element("a");
        let img = host.image(SRC, 800.0, 600.0);
        host.append(&link, &img);
        host.append(&wrapper, &link);
        host.append(&card, &wrapper);
        host.append(&host.body(), &card);
        let mut manager = OverlayManager::new(host.clone(), 256);

        manager.on_resolved(&img, SRC, &shoe_result()).unwrap();

        let overlay = manager.binding(&img).unwrap().overlay;
        assert_eq!(host.parent(&overlay), Some(card));
    }

    #[test]
    fn test_no_container_is_skipped() {
        let host = TestHost::new();
        host.set_computed(&host.body(), "display", "contents");
        let img = host.image(SRC, 800.0, 600.0);
        host.append(&host.body(), &img);
        let mut manager = OverlayManager::new(host.clone(), 256);

        let outcome = manager.on_resolved(&img, SRC, &shoe_result()).unwrap();
        assert_eq!(outcome, RenderOutcome::NoContainer);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_detached_image_is_not_rendered() {
        let host = TestHost::new();
        let img = host.image(SRC, 800.0, 600.0);
        let mut manager = OverlayManager::new(host.clone(), 256);

        let outcome = manager.on_resolved(&img, SRC, &shoe_result()).unwrap();
        assert_eq!(outcome, RenderOutcome::Detached);
    }

    #[test]
    fn test_no_product_states() {
        let host = TestHost::new();
        let (_, img) = mounted_image(&host, 800.0, 600.0);
        let mut manager = OverlayManager::new(host.clone(), 256);

        let cases = [
            (
                LookupResult {
                    exists: true,
                    ..LookupResult::default()
                },
                "empty",
            ),
            (LookupResult::default(), "unknown"),
            (LookupResult::failure(&LookupError::Status(500)), "failed"),
        ];
        for (result, expected) in cases {
            let outcome = manager.on_resolved(&img, SRC, &result).unwrap();
            assert_eq!(outcome, RenderOutcome::Empty);

            let overlay = manager.binding(&img).unwrap().overlay;
            assert!(host.has_class(&overlay, EMPTY_CLASS));
            assert_eq!(host.attribute(&overlay, STATE_ATTRIBUTE).as_deref(), Some(expected));
            assert!(host.find_by_class(HOTSPOT_CLASS).is_empty());
        }
    }

    #[test]
    fn test_ready_overlay_has_no_empty_marker() {
        let host = TestHost::new();
        let (_, img) = mounted_image(&host, 800.0, 600.0);
        let mut manager = OverlayManager::new(host.clone(), 256);
        manager.on_resolved(&img, SRC, &shoe_result()).unwrap();

        let overlay = manager.binding(&img).unwrap().overlay;
        assert!(!host.has_class(&overlay, EMPTY_CLASS));
        assert_eq!(host.attribute(&overlay, STATE_ATTRIBUTE).as_deref(), Some("ready"));
    }

    #[test]
    fn test_removal_and_sweep() {
        let host = TestHost::new();
        let (card, img) = mounted_image(&host, 800.0, 600.0);
        let (_, other) = mounted_image(&host, 800.0, 600.0);
        let mut manager = OverlayManager::new(host.clone(), 256);
        manager.on_resolved(&img, SRC, &shoe_result()).unwrap();
        manager.on_resolved(&other, SRC, &shoe_result()).unwrap();

        assert!(manager.on_removed(&other));
        assert!(!manager.on_removed(&other));
        assert_eq!(host.find_by_class(OVERLAY_CLASS).len(), 1);

        host.remove(&card);
        assert_eq!(manager.sweep(), 1);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_reposition_follows_image() {
        let host = TestHost::new();
        let (_, img) = mounted_image(&host, 800.0, 600.0);
        let mut manager = OverlayManager::new(host.clone(), 256);
        manager.on_resolved(&img, SRC, &shoe_result()).unwrap();

        host.set_rect(&img, Rect::new(0.0, 10.0, 400.0, 300.0));
        assert_eq!(manager.reposition_all(), 1);

        let overlay = manager.binding(&img).unwrap().overlay;
        assert_eq!(host.style(&overlay, "top").as_deref(), Some("10px"));
        assert_eq!(host.style(&overlay, "width").as_deref(), Some("400px"));
    }
}
