//! Backend payload adapter.
//!
//! Backend versions disagree on field names for the same concepts:
//! - `detections` vs legacy `masks`
//! - `product_predictions: [...]` vs a single `product: {...}` vs product
//!   fields flattened onto the detection itself
//! - `point` as `{x, y}` or `[x, y]`
//! - prices as text or as bare numbers
//!
//! All of them are accepted here and normalized into [`crate::model`].

use serde::Deserialize;

use crate::error::LookupError;
use crate::model::{Detection, LookupResult, Point, ProductPrediction};

#[derive(Debug, Deserialize)]
struct WirePayload {
    exists: bool,
    #[serde(default)]
    has_product_detections: Option<bool>,
    #[serde(default)]
    detections: Option<Vec<WireDetection>>,
    #[serde(default)]
    masks: Option<Vec<WireDetection>>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireDetection {
    point: WirePoint,
    #[serde(default)]
    product_predictions: Option<Vec<WireProduct>>,
    #[serde(default)]
    product: Option<WireProduct>,
    #[serde(flatten)]
    inline: WireProduct,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WirePoint {
    Object { x: f64, y: f64 },
    Pair([f64; 2]),
}

#[derive(Debug, Default, Deserialize)]
struct WireProduct {
    #[serde(default)]
    product_url: Option<String>,
    #[serde(default)]
    product_title: Option<String>,
    #[serde(default)]
    product_image: Option<String>,
    #[serde(default)]
    product_price: Option<WireText>,
    #[serde(default)]
    score: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireText {
    Text(String),
    Number(f64),
}

impl WireText {
    fn into_string(self) -> String {
        match self {
            WireText::Text(s) => s,
            WireText::Number(n) => n.to_string(),
        }
    }
}

impl WireProduct {
    fn is_present(&self) -> bool {
        self.product_url.is_some() || self.product_title.is_some()
    }

    fn into_prediction(self) -> ProductPrediction {
        ProductPrediction {
            product_url: self.product_url.unwrap_or_default(),
            product_title: self.product_title.unwrap_or_default(),
            product_image: self.product_image.unwrap_or_default(),
            product_price: self
                .product_price
                .map(WireText::into_string)
                .unwrap_or_default(),
            score: self.score,
        }
    }
}

impl WireDetection {
    fn into_detection(self) -> Detection {
        let point = match self.point {
            WirePoint::Object { x, y } => Point::normalized(x, y),
            WirePoint::Pair([x, y]) => Point::normalized(x, y),
        };

        let product_predictions = if let Some(list) = self.product_predictions {
            list.into_iter().map(WireProduct::into_prediction).collect()
        } else if let Some(single) = self.product {
            vec![single.into_prediction()]
        } else if self.inline.is_present() {
            vec![self.inline.into_prediction()]
        } else {
            Vec::new()
        };

        Detection {
            point,
            product_predictions,
        }
    }
}

/// Parse a detection response body into a normalized result.
pub fn parse_payload(body: &str) -> Result<LookupResult, LookupError> {
    let payload: WirePayload =
        serde_json::from_str(body).map_err(|e| LookupError::Malformed(e.to_string()))?;

    let detections: Vec<Detection> = payload
        .detections
        .or(payload.masks)
        .unwrap_or_default()
        .into_iter()
        .map(WireDetection::into_detection)
        .collect();

    let derived = detections
        .iter()
        .any(|d| !d.product_predictions.is_empty());

    Ok(LookupResult {
        exists: payload.exists,
        has_product_detections: payload.has_product_detections.unwrap_or(derived),
        detections,
        error: payload.error,
    })
}
