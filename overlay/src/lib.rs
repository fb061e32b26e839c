//! Overlay side of the IRIS engine.
//!
//! ```text
//!   Engine ──► OverlayManager ──► render (markup)
//!                    │
//!                    └──────────► VisibilityAdapter (carousel slides)
//! ```
//!
//! [`Engine`] composes the pipeline from `iris-core` with the overlay
//! bookkeeping here. Browser bindings construct one engine per page.

pub mod engine;
pub mod manager;
pub mod render;
pub mod visibility;


pub use engine::{Engine, EngineStats};
pub use manager::{OverlayBinding, OverlayManager, RenderOutcome};
pub use render::OverlayState;
pub use visibility::VisibilityAdapter;
