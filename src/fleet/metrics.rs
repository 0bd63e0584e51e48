//! Fleet membership statistics
//!
//! A grouped counter of live endpoints, keyed by component kind and the
//! serialized form of their external label sets. Rebuilt wholesale on every
//! membership update so it can never drift from the live view.

use crate::fleet::endpoint::EndpointRef;
use crate::labels::LabelSet;

use std::collections::HashMap;
use std::sync::Arc;

/// Byte budget for one serialized label-set group key.
pub const DEFAULT_LABEL_REPR_LIMIT: usize = 1000;

/// Live endpoint counts grouped by kind × serialized external labels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointStats {
    groups: HashMap<String, HashMap<String, usize>>,
}

impl EndpointStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from the current queryable refs.
    pub(crate) fn rebuild(refs: &[Arc<EndpointRef>], label_repr_limit: usize) -> Self {
        let mut stats = Self::new();
        for er in refs {
            let kind = er.component_type().unwrap_or_default();
            let repr = truncate_label_repr(&serialize_label_sets(&er.label_sets()), label_repr_limit);
            *stats
                .groups
                .entry(kind)
                .or_default()
                .entry(repr)
                .or_default() += 1;
        }
        stats
    }

    /// Count for one kind and serialized label-set key.
    pub fn count(&self, kind: &str, labels_repr: &str) -> usize {
        self.groups
            .get(kind)
            .and_then(|g| g.get(labels_repr))
            .copied()
            .unwrap_or(0)
    }

    /// Total live endpoints of one kind.
    pub fn count_by_kind(&self, kind: &str) -> usize {
        self.groups
            .get(kind)
            .map(|g| g.values().sum())
            .unwrap_or(0)
    }

    /// Total live endpoints.
    pub fn total(&self) -> usize {
        self.groups.values().flat_map(|g| g.values()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Iterate `(kind, labels_repr, count)` groups.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, usize)> {
        self.groups.iter().flat_map(|(kind, g)| {
            g.iter()
                .map(move |(repr, count)| (kind.as_str(), repr.as_str(), *count))
        })
    }
}

/// Deterministic serialization of a list of label sets: each set rendered
/// `{name="value", ...}` in name order, sets joined with `,`.
pub fn serialize_label_sets(sets: &[LabelSet]) -> String {
    sets.iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Right-truncate a serialized label-set key to at most `max_len` bytes,
/// cutting at a character boundary and closing the brace so the result
/// stays readable.
pub fn truncate_label_repr(s: &str, max_len: usize) -> String {
    if s.len() <= max_len || max_len == 0 {
        return s.to_string();
    }
    let mut cut = max_len - 1;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}}}", &s[..cut])
}
