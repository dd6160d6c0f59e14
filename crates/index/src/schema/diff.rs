//! Mapping diff and migration classification.
//!
//! [`diff`] structurally compares the mapping stored by the backend with the
//! mapping derived from a descriptor. It is built on JSON Patch generation, so
//! object keys are compared regardless of order while arrays are compared
//! position by position.
//!
//! [`MigrationPlan`] then sorts the changed paths into those that can be
//! applied to a live index and those that need a reindex.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;

use json_patch::PatchOperation;
use regex::Regex;
use serde_json::Value;

/// Matches a sub-field added under an existing field's `fields` block.
static FIELD_ALIAS_CHANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^properties(/[a-zA-Z0-9_]+)+/fields(/[a-zA-Z0-9_]+)?$")
        .expect("field alias pattern is a valid regex")
});

/// The kind of a single mapping difference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChangeKind {
    /// Present in the desired mapping only.
    Added,
    /// Relocated to another position.
    Moved,
    /// Present in both with a different value.
    Replaced,
}

impl ChangeKind {
    /// Moves and replacements can never be applied to existing data.
    pub fn is_breaking(self) -> bool {
        !matches!(self, ChangeKind::Added)
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Added => write!(f, "added"),
            ChangeKind::Moved => write!(f, "moved"),
            ChangeKind::Replaced => write!(f, "replaced"),
        }
    }
}

/// A changed path between two mapping trees.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MappingChange {
    /// Slash-separated path, e.g. `properties/term/fields/exact`.
    pub field_path: String,
    /// How the path changed.
    pub kind: ChangeKind,
}

impl MappingChange {
    /// A change of `kind` at `field_path`.
    pub fn new(field_path: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            field_path: field_path.into(),
            kind,
        }
    }
}

/// Compares the current mapping against the desired one.
///
/// Paths that exist only in `current` are not reported: the backend never
/// drops mapped fields and data stored under them stays readable. The result
/// is sorted by path.
pub fn diff(current: &Value, desired: &Value) -> Vec<MappingChange> {
    let patch = json_patch::diff(current, desired);
    let mut changes: Vec<MappingChange> = patch
        .0
        .into_iter()
        .filter_map(|op| match op {
            PatchOperation::Add(op) => Some(MappingChange::new(
                field_path(&op.path.to_string()),
                ChangeKind::Added,
            )),
            PatchOperation::Replace(op) => Some(MappingChange::new(
                field_path(&op.path.to_string()),
                ChangeKind::Replaced,
            )),
            PatchOperation::Move(op) => Some(MappingChange::new(
                field_path(&op.path.to_string()),
                ChangeKind::Moved,
            )),
            PatchOperation::Remove(_) | PatchOperation::Copy(_) | PatchOperation::Test(_) => None,
        })
        .collect();
    changes.sort();
    changes.dedup();
    changes
}

fn field_path(pointer: &str) -> String {
    pointer.trim_start_matches('/').to_string()
}

/// Returns true if the path adds a new sub-field view of an existing field.
pub fn is_field_alias_change(field_path: &str) -> bool {
    FIELD_ALIAS_CHANGE.is_match(field_path)
}

/// The migration decision for one stored mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationPlan {
    /// Paths that can be applied to the live index.
    pub additive: BTreeSet<String>,
    /// Paths that require a reindex.
    pub breaking: BTreeSet<String>,
}

impl MigrationPlan {
    /// Classifies a list of changes.
    pub fn from_changes(changes: &[MappingChange]) -> Self {
        let mut plan = Self::default();
        for change in changes {
            if change.kind.is_breaking() {
                plan.breaking.insert(change.field_path.clone());
            } else {
                plan.additive.insert(change.field_path.clone());
            }
        }
        plan
    }

    /// Diffs and classifies in one step.
    pub fn between(current: &Value, desired: &Value) -> Self {
        Self::from_changes(&diff(current, desired))
    }

    /// No differences at all.
    pub fn is_empty(&self) -> bool {
        self.additive.is_empty() && self.breaking.is_empty()
    }

    /// Whether any change needs a reindex.
    pub fn is_breaking(&self) -> bool {
        !self.breaking.is_empty()
    }

    /// Whether applying the additive changes requires revisiting stored
    /// documents so new sub-fields get populated.
    pub fn has_field_alias_change(&self) -> bool {
        self.additive.iter().any(|p| is_field_alias_change(p))
    }
}
