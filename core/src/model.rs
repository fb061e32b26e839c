//! Normalized detection model.
//!
//! These are the shapes the overlay manager consumes. Backend payload
//! variance is absorbed in [`crate::wire`] and never reaches this module.

use serde::{Deserialize, Serialize};

use crate::error::LookupError;

/// Image-relative position, both axes in `[0, 1]`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    /// Build a point, clamping both axes into the unit square
    pub fn normalized(x: f64, y: f64) -> Self {
        Self {
            x: unit(x),
            y: unit(y),
        }
    }
}

fn unit(v: f64) -> f64 {
    if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 }
}

/// One product match, in backend relevance order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductPrediction {
    pub product_url: String,
    pub product_title: String,
    pub product_image: String,
    pub product_price: String,
    pub score: Option<f64>,
}

/// A located product candidate inside an image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub point: Point,
    pub product_predictions: Vec<ProductPrediction>,
}

impl Detection {
    /// Most relevant prediction (the first one received)
    pub fn primary(&self) -> Option<&ProductPrediction> {
        self.product_predictions.first()
    }
}

/// Outcome of resolving one image URL. Produced once per URL per cache lifetime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LookupResult {
    pub exists: bool,
    pub has_product_detections: bool,
    pub detections: Vec<Detection>,
    pub error: Option<String>,
}

impl LookupResult {
    /// Synthesized result for a failed lookup
    pub fn failure(err: &LookupError) -> Self {
        Self {
            exists: false,
            has_product_detections: false,
            detections: Vec::new(),
            error: Some(err.to_string()),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_is_clamped() {
        assert_eq!(Point::normalized(0.5, 0.25), Point { x: 0.5, y: 0.25 });
        assert_eq!(Point::normalized(-1.0, 3.0), Point { x: 0.0, y: 1.0 });
        assert_eq!(Point::normalized(f64::NAN, 0.1), Point { x: 0.0, y: 0.1 });
    }

    #[test]
    fn test_failure_result() {
        let result = LookupResult::failure(&LookupError::Status(500));
        assert!(!result.exists);
        assert!(result.detections.is_empty());
        assert!(result.is_failure());
        assert_eq!(result.error.as_deref(), Some("backend returned HTTP 500"));
    }
}
