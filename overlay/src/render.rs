//! Overlay markup
//!
//! Pure presentation: everything here builds or updates engine-owned nodes
//! and never looks at bindings or lookup state.
//!
//! ```text
//! div.iris-overlay[data-iris-state]          absolute, covers the image
//! └── a.iris-hotspot                         left/top = point * 100%
//!     └── ul.iris-hotspot__products
//!         └── li.iris-product[data-product-url]
//!             ├── img.iris-product__image
//!             ├── span.iris-product__title
//!             └── span.iris-product__price
//! ```

use iris_core::{Detection, HostError, HostPage, LookupResult, OVERLAY_CLASS, ProductPrediction, Rect};
use iris_types::formatting::{format_percent, format_price, format_px, truncate_title};

pub const EMPTY_CLASS: &str = "iris-overlay--empty";
pub const HOTSPOT_CLASS: &str = "iris-hotspot";
pub const PRODUCT_LIST_CLASS: &str = "iris-hotspot__products";
pub const PRODUCT_CLASS: &str = "iris-product";
pub const STATE_ATTRIBUTE: &str = "data-iris-state";
pub const PRODUCT_URL_ATTRIBUTE: &str = "data-product-url";

const TITLE_MAX_CHARS: usize = 60;

/// What an overlay is showing, exposed on `data-iris-state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayState {
    /// At least one detection rendered
    Ready,
    /// Known image with nothing detected
    Empty,
    /// Backend has never seen this image
    Unknown,
    /// Lookup failed
    Failed,
}

impl OverlayState {
    /// Any detection means hotspots render, so the overlay is ready even if
    /// the payload also carried an `error`.
    pub fn of(result: &LookupResult) -> Self {
        if !result.detections.is_empty() {
            Self::Ready
        } else if result.is_failure() {
            Self::Failed
        } else if !result.exists {
            Self::Unknown
        } else {
            Self::Empty
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Empty => "empty",
            Self::Unknown => "unknown",
            Self::Failed => "failed",
        }
    }
}

/// Create a detached overlay box covering `frame`.
pub fn create_overlay<H: HostPage>(
    host: &H,
    frame: Rect,
    state: OverlayState,
) -> Result<H::Node, HostError> {
    let overlay = host.create_element("div")?;
    host.add_class(&overlay, OVERLAY_CLASS);
    host.set_attribute(&overlay, STATE_ATTRIBUTE, state.as_str());
    host.set_style(&overlay, "position", "absolute");
    // The box itself must not swallow clicks meant for the host image
    host.set_style(&overlay, "pointer-events", "none");
    place_box(host, &overlay, frame);
    Ok(overlay)
}

pub fn place_box<H: HostPage>(host: &H, overlay: &H::Node, frame: Rect) {
    host.set_style(overlay, "left", &format_px(frame.left));
    host.set_style(overlay, "top", &format_px(frame.top));
    host.set_style(overlay, "width", &format_px(frame.width));
    host.set_style(overlay, "height", &format_px(frame.height));
}

/// Append one hotspot for `detection` to `overlay`.
pub fn render_hotspot<H: HostPage>(
    host: &H,
    overlay: &H::Node,
    detection: &Detection,
) -> Result<H::Node, HostError> {
    let hotspot = host.create_element("a")?;
    host.add_class(&hotspot, HOTSPOT_CLASS);
    host.set_style(&hotspot, "position", "absolute");
    host.set_style(&hotspot, "left", &format_percent(detection.point.x));
    host.set_style(&hotspot, "top", &format_percent(detection.point.y));
    host.set_style(&hotspot, "pointer-events", "auto");
    if let Some(primary) = detection.primary() {
        host.set_attribute(&hotspot, "href", &primary.product_url);
    }
    host.set_attribute(&hotspot, "target", "_blank");
    host.set_attribute(&hotspot, "rel", "noopener noreferrer");

    if !detection.product_predictions.is_empty() {
        let list = host.create_element("ul")?;
        host.add_class(&list, PRODUCT_LIST_CLASS);
        for product in &detection.product_predictions {
            let item = render_product(host, product)?;
            host.append_child(&list, &item)?;
        }
        host.append_child(&hotspot, &list)?;
    }

    host.append_child(overlay, &hotspot)?;
    Ok(hotspot)
}

fn render_product<H: HostPage>(host: &H, product: &ProductPrediction) -> Result<H::Node, HostError> {
    let item = host.create_element("li")?;
    host.add_class(&item, PRODUCT_CLASS);
    host.set_attribute(&item, PRODUCT_URL_ATTRIBUTE, &product.product_url);

    if !product.product_image.is_empty() {
        let thumb = host.create_element("img")?;
        host.add_class(&thumb, "iris-product__image");
        host.set_attribute(&thumb, "src", &product.product_image);
        host.set_attribute(&thumb, "alt", "");
        host.append_child(&item, &thumb)?;
    }

    let title = host.create_element("span")?;
    host.add_class(&title, "iris-product__title");
    host.set_text(&title, &truncate_title(&product.product_title, TITLE_MAX_CHARS));
    host.append_child(&item, &title)?;

    if !product.product_price.is_empty() {
        let price = host.create_element("span")?;
        host.add_class(&price, "iris-product__price");
        host.set_text(&price, &format_price(&product.product_price));
        host.append_child(&item, &price)?;
    }

    Ok(item)
}

/// One delegated listener per overlay: a click inside a product item points
/// the enclosing hotspot at that product before the anchor navigates.
pub fn install_click_retarget<H: HostPage>(host: &H, overlay: &H::Node) -> Result<(), HostError> {
    let page = host.clone();
    host.on_click(
        overlay,
        Box::new(move |target| {
            let Some(item) = page.closest_with_class(target, &[PRODUCT_CLASS]) else {
                return;
            };
            let Some(url) = page.attribute(&item, PRODUCT_URL_ATTRIBUTE) else {
                return;
            };
            if let Some(hotspot) = page.closest_with_class(&item, &[HOTSPOT_CLASS]) {
                page.set_attribute(&hotspot, "href", &url);
            }
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use iris_core::testing::TestHost;
    use iris_core::{LookupError, Point};

    fn product(url: &str, title: &str, price: &str) -> ProductPrediction {
        ProductPrediction {
            product_url: url.to_string(),
            product_title: title.to_string(),
            product_price: price.to_string(),
            ..ProductPrediction::default()
        }
    }

    #[test]
    fn test_overlay_state_of_result() {
        let ready = LookupResult {
            exists: true,
            has_product_detections: true,
            detections: vec![Detection::default()],
            error: None,
        };
        assert_eq!(OverlayState::of(&ready), OverlayState::Ready);

        let empty = LookupResult {
            exists: true,
            ..LookupResult::default()
        };
        assert_eq!(OverlayState::of(&empty), OverlayState::Empty);
        assert_eq!(OverlayState::of(&LookupResult::default()), OverlayState::Unknown);
        assert_eq!(
            OverlayState::of(&LookupResult::failure(&LookupError::Status(502))),
            OverlayState::Failed
        );

        let partial = LookupResult {
            error: Some("ranking service degraded".to_string()),
            ..ready
        };
        assert!(partial.is_failure());
        assert_eq!(OverlayState::of(&partial), OverlayState::Ready);
    }

    #[test]
    fn test_hotspot_placement_and_products() {
        let host = TestHost::new();
        let overlay = create_overlay(&host, Rect::new(0.0, 0.0, 800.0, 600.0), OverlayState::Ready).unwrap();
        let detection = Detection {
            point: Point { x: 0.5, y: 0.25 },
            product_predictions: vec![product("/p/1", "Shoe", "$50"), product("/p/2", "Boot", "80")],
        };

        let hotspot = render_hotspot(&host, &overlay, &detection).unwrap();
        assert_eq!(host.style(&hotspot, "left").as_deref(), Some("50%"));
        assert_eq!(host.style(&hotspot, "top").as_deref(), Some("25%"));
        assert_eq!(host.attribute(&hotspot, "href").as_deref(), Some("/p/1"));

        let list = host.children(&hotspot)[0];
        let items = host.children(&list);
        assert_eq!(items.len(), 2);
        let texts: Vec<_> = host.children(&items[1]).iter().map(|n| host.text(n)).collect();
        assert_eq!(texts, ["Boot", "80.00"]);
    }

    #[test]
    fn test_click_on_product_retargets_hotspot() {
        let host = TestHost::new();
        let overlay = create_overlay(&host, Rect::new(0.0, 0.0, 400.0, 400.0), OverlayState::Ready).unwrap();
        let detection = Detection {
            point: Point { x: 0.1, y: 0.1 },
            product_predictions: vec![product("/p/1", "Shoe", ""), product("/p/2", "Boot", "")],
        };
        let hotspot = render_hotspot(&host, &overlay, &detection).unwrap();
        install_click_retarget(&host, &overlay).unwrap();

        let list = host.children(&hotspot)[0];
        let second = host.children(&list)[1];
        let title = host.children(&second)[0];
        host.click(&title);
        assert_eq!(host.attribute(&hotspot, "href").as_deref(), Some("/p/2"));

        // A click on the bare hotspot leaves the current target alone
        host.click(&hotspot);
        assert_eq!(host.attribute(&hotspot, "href").as_deref(), Some("/p/2"));
    }
}
