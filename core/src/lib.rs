//! Change watching, batching and detection lookup for the IRIS overlay engine.
//!
//! ```text
//!  host observer ──► watcher::classify ──┬─► Removed ──────────────► overlay manager
//!                                        └─► Candidate ─► scheduler ─► lookup ─► overlay manager
//! ```
//!
//! This crate owns everything up to a resolved [`LookupResult`]. Rendering
//! and overlay bookkeeping live in `iris-overlay`.

pub mod error;
pub mod host;
pub mod lookup;
pub mod model;
pub mod scheduler;
pub mod watcher;
pub mod wire;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use error::{EngineError, HostError, LookupError};
pub use host::{
    ClickHandler, DeadlineTimer, HostPage, LocalTask, ObserverHandle, Rect, deadline_timer,
};
pub use lookup::{DetectionBackend, LookupClient, LookupOptions, detection_request_url};
pub use model::{Detection, LookupResult, Point, ProductPrediction};
pub use scheduler::BatchScheduler;
pub use watcher::{MutationRecord, OVERLAY_CLASS, SOURCE_ATTRIBUTES, WatchEvent, classify};
