//! Collections manifest and key validation.
//!
//! The manifest is the authoritative list of open collections plus the
//! current separator for a vBucket. It is persisted as JSON in the reserved
//! local document `_local/collections_manifest`; the store derives an
//! in-memory view from it to gate reads of collection keys.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::item::{DocKey, DocNamespace};

pub const DEFAULT_SEPARATOR: &str = "::";
pub const DEFAULT_COLLECTION: &str = "$default";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("manifest separator must not be empty")]
    EmptySeparator,
}

/// Persisted manifest form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub revision: u64,
    pub separator: String,
    pub collections: Vec<String>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            revision: 0,
            separator: DEFAULT_SEPARATOR.to_string(),
            collections: vec![DEFAULT_COLLECTION.to_string()],
        }
    }
}

impl Manifest {
    pub fn from_json(buf: &[u8]) -> Result<Self, ManifestError> {
        let manifest: Self = serde_json::from_slice(buf)?;
        if manifest.separator.is_empty() {
            return Err(ManifestError::EmptySeparator);
        }
        Ok(manifest)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("manifest serializes")
    }
}

/// In-memory view of the open collections, derived from the persisted
/// manifest.
#[derive(Debug, Clone)]
pub struct CollectionsView {
    revision: u64,
    separator: String,
    open: BTreeSet<String>,
}

impl Default for CollectionsView {
    fn default() -> Self {
        Self::from_manifest(&Manifest::default())
    }
}

impl CollectionsView {
    pub fn from_manifest(manifest: &Manifest) -> Self {
        Self {
            revision: manifest.revision,
            separator: manifest.separator.clone(),
            open: manifest.collections.iter().cloned().collect(),
        }
    }

    /// Replace the view with a newer manifest. The revision never goes
    /// backwards; a stale update is dropped with a warning.
    pub fn apply(&mut self, manifest: &Manifest) {
        if manifest.revision < self.revision {
            warn!(
                current = self.revision,
                offered = manifest.revision,
                "ignoring manifest with lower revision"
            );
            return;
        }
        *self = Self::from_manifest(manifest);
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    pub fn is_open(&self, collection: &str) -> bool {
        self.open.contains(collection)
    }

    /// Validity of a key under this manifest.
    ///
    /// A Collections-namespace key validates iff the bytes up to the first
    /// separator name an open collection. Default-namespace keys require
    /// `$default` to be open; system keys always validate.
    pub fn does_key_contain_valid_collection(&self, key: &DocKey) -> bool {
        match key.namespace() {
            DocNamespace::System => true,
            DocNamespace::DefaultCollection => self.is_open(DEFAULT_COLLECTION),
            DocNamespace::Collections => match self.split_collection(key.bytes()) {
                Some(name) => self.is_open(name),
                None => false,
            },
        }
    }

    fn split_collection<'a>(&self, key: &'a [u8]) -> Option<&'a str> {
        let key = std::str::from_utf8(key).ok()?;
        let (name, _) = key.split_once(self.separator.as_str())?;
        Some(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(json: &str) -> Manifest {
        Manifest::from_json(json.as_bytes()).expect("valid manifest")
    }

    #[test]
    fn json_round_trip_preserves_fields() {
        let m = manifest(r#"{"revision":1,"separator":"::","collections":["$default","meat"]}"#);
        let back = Manifest::from_json(m.to_json().as_bytes()).expect("reparse");
        assert_eq!(m, back);
    }

    #[test]
    fn empty_separator_is_rejected() {
        let err = Manifest::from_json(
            br#"{"revision":1,"separator":"","collections":["$default"]}"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn collection_keys_validate_against_open_set() {
        let view = CollectionsView::from_manifest(&manifest(
            r#"{"revision":1,"separator":"::","collections":["$default","meat"]}"#,
        ));

        let beef = DocKey::new("meat::beef", DocNamespace::Collections);
        assert!(view.does_key_contain_valid_collection(&beef));

        let milk = DocKey::new("dairy::milk", DocNamespace::Collections);
        assert!(!view.does_key_contain_valid_collection(&milk));

        // No separator at all: not a valid collection key.
        let bare = DocKey::new("meat", DocNamespace::Collections);
        assert!(!view.does_key_contain_valid_collection(&bare));

        let default = DocKey::new("anything", DocNamespace::DefaultCollection);
        assert!(view.does_key_contain_valid_collection(&default));

        let system = DocKey::new("$collections::create:meat", DocNamespace::System);
        assert!(view.does_key_contain_valid_collection(&system));
    }

    #[test]
    fn separator_change_applies_to_validation() {
        let mut view = CollectionsView::from_manifest(&manifest(
            r#"{"revision":1,"separator":"::","collections":["$default","meat"]}"#,
        ));
        view.apply(&manifest(
            r#"{"revision":2,"separator":",","collections":["$default","meat"]}"#,
        ));

        assert!(view
            .does_key_contain_valid_collection(&DocKey::new("meat,bacon", DocNamespace::Collections)));
        assert!(!view
            .does_key_contain_valid_collection(&DocKey::new("meat::bacon", DocNamespace::Collections)));
    }

    #[test]
    fn stale_revision_is_ignored() {
        let mut view = CollectionsView::from_manifest(&manifest(
            r#"{"revision":5,"separator":"::","collections":["$default"]}"#,
        ));
        view.apply(&manifest(
            r#"{"revision":4,"separator":"::","collections":["$default","meat"]}"#,
        ));
        assert_eq!(5, view.revision());
        assert!(!view.is_open("meat"));
    }
}
