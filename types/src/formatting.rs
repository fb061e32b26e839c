//! Centralized display formatting for overlay rendering.
//!
//! Every CSS length and every piece of product text the overlay writes into
//! the host page goes through here, so layout strings are produced the same
//! way everywhere.

/// Format a normalized coordinate (0..=1) as a CSS percentage.
///
/// Values are clamped and rounded to three decimals so float noise such as
/// `0.2 * 100.0 == 20.000000000000004` never leaks into a style string.
///
/// # Examples
/// ```
/// use iris_types::formatting::format_percent;
/// assert_eq!(format_percent(0.5), "50%");
/// assert_eq!(format_percent(0.2), "20%");
/// assert_eq!(format_percent(0.125), "12.5%");
/// assert_eq!(format_percent(1.7), "100%");
/// ```
pub fn format_percent(fraction: f64) -> String {
    let clamped = if fraction.is_finite() {
        fraction.clamp(0.0, 1.0)
    } else {
        0.0
    };
    format!("{}%", round3(clamped * 100.0))
}

/// Format a pixel length for a CSS property.
///
/// # Examples
/// ```
/// use iris_types::formatting::format_px;
/// assert_eq!(format_px(800.0), "800px");
/// assert_eq!(format_px(12.3456), "12.346px");
/// ```
pub fn format_px(value: f64) -> String {
    let value = if value.is_finite() { value } else { 0.0 };
    format!("{}px", round3(value))
}

#[inline]
fn round3(v: f64) -> f64 {
    let r = (v * 1000.0).round() / 1000.0;
    // Avoid rendering "-0px"
    if r == 0.0 { 0.0 } else { r }
}

/// Truncate a string to max_chars, adding "..." if truncated
pub fn truncate_title(title: &str, max_chars: usize) -> String {
    let title = title.trim();
    if title.chars().count() <= max_chars {
        title.to_string()
    } else {
        let truncated: String = title.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", truncated.trim_end())
    }
}

/// Price text for display.
///
/// Backends send prices as free text (`"$50"`, `"49,90 €"`) or as bare
/// numbers. Either way the text is shown as received, only trimmed.
pub fn format_price(raw: &str) -> String {
    raw.trim().to_string()
}
