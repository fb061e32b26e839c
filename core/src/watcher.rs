//! Change Watcher: raw mutation records to semantic events
//!
//! The host's observer hands over batches of [`MutationRecord`]s. Most of
//! that volume on a real page is noise (text nodes, style churn, widgets
//! re-rendering). [`classify`] reduces a batch to the two events the rest of
//! the engine understands:
//!
//! - [`WatchEvent::Candidate`]: an image that may need a (re)lookup
//! - [`WatchEvent::Removed`]: an image that left the tree; handled immediately
//!
//! Events keep record order, so a removal that follows an insertion in the
//! same batch is seen after it and wins.

use crate::host::HostPage;

/// Attributes whose changes can alter an image's resolved source
pub const SOURCE_ATTRIBUTES: &[&str] = &["src", "srcset", "data-src", "data-srcset"];

/// Marker class on every overlay root the engine inserts
pub const OVERLAY_CLASS: &str = "iris-overlay";

/// One observed change, already reduced to element nodes.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationRecord<N> {
    ChildList { added: Vec<N>, removed: Vec<N> },
    Attribute { target: N, name: String },
}

impl<N> MutationRecord<N> {
    pub fn added(nodes: Vec<N>) -> Self {
        Self::ChildList {
            added: nodes,
            removed: Vec::new(),
        }
    }

    pub fn removed(nodes: Vec<N>) -> Self {
        Self::ChildList {
            added: Vec::new(),
            removed: nodes,
        }
    }

    pub fn attribute(target: N, name: impl Into<String>) -> Self {
        Self::Attribute {
            target,
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent<N> {
    Candidate(N),
    Removed(N),
}

/// True for attribute names that can change an image's source
pub fn is_source_attribute(name: &str) -> bool {
    SOURCE_ATTRIBUTES
        .iter()
        .any(|attr| attr.eq_ignore_ascii_case(name))
}

/// True if `node` is, or lives inside, an engine-owned overlay
pub fn is_engine_owned<H: HostPage>(host: &H, node: &H::Node) -> bool {
    host.closest_with_class(node, &[OVERLAY_CLASS]).is_some()
}

/// Classify a batch of records into candidate and removal events.
pub fn classify<H: HostPage>(host: &H, records: &[MutationRecord<H::Node>]) -> Vec<WatchEvent<H::Node>> {
    let mut events = Vec::new();

    for record in records {
        match record {
            MutationRecord::ChildList { added, removed } => {
                for node in removed {
                    // Detached overlays carry only product thumbnails
                    if host.has_class(node, OVERLAY_CLASS) {
                        continue;
                    }
                    events.extend(
                        host.images_within(node)
                            .into_iter()
                            .filter(|img| !is_engine_owned(host, img))
                            .map(WatchEvent::Removed),
                    );
                }
                for node in added {
                    // Inserted and removed again before we got to look
                    if !host.is_connected(node) || is_engine_owned(host, node) {
                        continue;
                    }
                    events.extend(
                        host.images_within(node)
                            .into_iter()
                            .filter(|img| host.is_connected(img) && !is_engine_owned(host, img))
                            .map(WatchEvent::Candidate),
                    );
                }
            }
            MutationRecord::Attribute { target, name } => {
                if !is_source_attribute(name)
                    || !host.is_image(target)
                    || !host.is_connected(target)
                    || is_engine_owned(host, target)
                {
                    continue;
                }
                events.push(WatchEvent::Candidate(target.clone()));
            }
        }
    }

    events
}
