//! System event construction and per-batch flush policy.
//!
//! A system event is an item whose key encodes a collection-lifecycle
//! transition. During a flush each queued event updates the pending
//! manifest; some events additionally persist a marker document visible to
//! downstream readers, others are manifest-only.

use bytes::Bytes;

use crate::item::{DocKey, DocNamespace, Item, Operation, SystemEvent};

pub const CREATE_EVENT_KEY: &str = "$collections::create:";
pub const DELETE_EVENT_KEY: &str = "$collections::delete:";
pub const SEPARATOR_CHANGED_KEY: &str = "$collections::separator";

/// Disposition of a queued item against the flush (or replication) policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Keep the item in the stream.
    Continue,
    /// Drop the item from the stream (policy side effects still apply).
    Skip,
}

pub struct SystemEventFactory;

impl SystemEventFactory {
    /// Derive the marker-document key for an event.
    ///
    /// Both delete variants intentionally share the create key: deleting a
    /// collection tombstones the marker its creation wrote. Separator
    /// changes use a fixed key so successive changes collapse into one
    /// document.
    pub fn make_key(event: SystemEvent, key_extra: &str) -> String {
        match event {
            SystemEvent::CreateCollection => format!("{CREATE_EVENT_KEY}{key_extra}"),
            SystemEvent::BeginDeleteCollection => format!("{DELETE_EVENT_KEY}{key_extra}"),
            SystemEvent::DeleteCollectionHard | SystemEvent::DeleteCollectionSoft => {
                format!("{CREATE_EVENT_KEY}{key_extra}")
            }
            SystemEvent::CollectionsSeparatorChanged => SEPARATOR_CHANGED_KEY.to_string(),
        }
    }

    /// Build a system item for `event`. The event code is mirrored into the
    /// flags field, which is what the persisted marker document carries.
    pub fn make(
        event: SystemEvent,
        key_extra: &str,
        value: impl Into<Bytes>,
        seqno: Option<u64>,
    ) -> Item {
        let key = DocKey::new(Self::make_key(event, key_extra), DocNamespace::System);
        let mut item = Item::new(key, event as u32, 0, value);
        item.operation = Operation::SystemEvent(event);
        if let Some(seqno) = seqno {
            item.by_seqno = seqno;
        }
        item
    }
}

/// Per-batch flush policy for system events.
///
/// Drive `process` over every queued item while draining a batch; items
/// answered `Continue` are persisted as documents, `Skip` items are
/// manifest-only. The highest-seqno event seen becomes the manifest update
/// handed to commit.
#[derive(Debug, Default)]
pub struct SystemEventFlush {
    manifest_item: Option<Item>,
}

impl SystemEventFlush {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process(&mut self, item: &Item) -> ProcessStatus {
        let Some(event) = item.system_event() else {
            return ProcessStatus::Continue;
        };

        match event {
            SystemEvent::CreateCollection
            | SystemEvent::DeleteCollectionHard
            | SystemEvent::DeleteCollectionSoft
            | SystemEvent::CollectionsSeparatorChanged => {
                self.save_manifest_item(item);
                ProcessStatus::Continue
            }
            SystemEvent::BeginDeleteCollection => {
                self.save_manifest_item(item);
                ProcessStatus::Skip
            }
        }
    }

    /// Whether a persisted item is an upsert (as opposed to a tombstone).
    ///
    /// Only events that survive `process` may be asked; BeginDelete never
    /// reaches the document stream.
    pub fn is_upsert(item: &Item) -> bool {
        match item.system_event() {
            Some(SystemEvent::CreateCollection)
            | Some(SystemEvent::CollectionsSeparatorChanged) => true,
            Some(SystemEvent::DeleteCollectionHard) | Some(SystemEvent::DeleteCollectionSoft) => {
                false
            }
            Some(SystemEvent::BeginDeleteCollection) => {
                panic!("SystemEventFlush::is_upsert: BeginDeleteCollection neither deletes nor upserts")
            }
            None => !item.is_deleted(),
        }
    }

    /// The manifest update to persist with the batch, if any.
    pub fn collections_manifest_item(&self) -> Option<&Item> {
        self.manifest_item.as_ref()
    }

    pub fn into_collections_manifest_item(self) -> Option<Item> {
        self.manifest_item
    }

    // Only the highest event in a batch writes the manifest.
    fn save_manifest_item(&mut self, item: &Item) {
        let keep = match &self.manifest_item {
            Some(current) => item.by_seqno > current.by_seqno,
            None => true,
        };
        if keep {
            self.manifest_item = Some(item.clone());
        }
    }
}

/// Replication filter: which items are forwarded to replicas.
pub struct SystemEventReplicate;

impl SystemEventReplicate {
    pub fn process(item: &Item) -> ProcessStatus {
        match item.system_event() {
            None => ProcessStatus::Continue,
            Some(SystemEvent::CreateCollection)
            | Some(SystemEvent::BeginDeleteCollection)
            | Some(SystemEvent::CollectionsSeparatorChanged) => ProcessStatus::Continue,
            Some(SystemEvent::DeleteCollectionHard)
            | Some(SystemEvent::DeleteCollectionSoft) => ProcessStatus::Skip,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_variants_share_the_create_key() {
        let create = SystemEventFactory::make_key(SystemEvent::CreateCollection, "meat");
        let hard = SystemEventFactory::make_key(SystemEvent::DeleteCollectionHard, "meat");
        let soft = SystemEventFactory::make_key(SystemEvent::DeleteCollectionSoft, "meat");
        assert_eq!(create, hard);
        assert_eq!(create, soft);
        assert_eq!("$collections::create:meat", create);

        let begin = SystemEventFactory::make_key(SystemEvent::BeginDeleteCollection, "meat");
        assert_eq!("$collections::delete:meat", begin);
    }

    #[test]
    fn separator_changes_collapse_to_one_key() {
        let a = SystemEventFactory::make_key(SystemEvent::CollectionsSeparatorChanged, "@@");
        let b = SystemEventFactory::make_key(SystemEvent::CollectionsSeparatorChanged, ",");
        assert_eq!(a, b);
        assert_eq!(SEPARATOR_CHANGED_KEY, a);
    }

    #[test]
    fn flush_policy_table() {
        let mut flush = SystemEventFlush::new();
        let mk = |event, seqno| SystemEventFactory::make(event, "meat", "", Some(seqno));

        assert_eq!(
            ProcessStatus::Continue,
            flush.process(&mk(SystemEvent::CreateCollection, 1))
        );
        assert_eq!(
            ProcessStatus::Skip,
            flush.process(&mk(SystemEvent::BeginDeleteCollection, 2))
        );
        assert_eq!(
            ProcessStatus::Continue,
            flush.process(&mk(SystemEvent::DeleteCollectionSoft, 3))
        );
        assert_eq!(
            ProcessStatus::Continue,
            flush.process(&mk(SystemEvent::DeleteCollectionHard, 4))
        );
        assert_eq!(
            ProcessStatus::Continue,
            flush.process(&mk(SystemEvent::CollectionsSeparatorChanged, 5))
        );

        // Non-system items pass through without touching the manifest.
        let mut quiet = SystemEventFlush::new();
        let item = Item::new(
            DocKey::new("key", crate::item::DocNamespace::DefaultCollection),
            0,
            0,
            "value",
        );
        assert_eq!(ProcessStatus::Continue, quiet.process(&item));
        assert!(quiet.collections_manifest_item().is_none());
    }

    #[test]
    fn highest_seqno_event_wins_the_manifest() {
        let mut flush = SystemEventFlush::new();
        let mk = |event, seqno| SystemEventFactory::make(event, "meat", "", Some(seqno));

        flush.process(&mk(SystemEvent::CreateCollection, 5));
        flush.process(&mk(SystemEvent::BeginDeleteCollection, 3));
        assert_eq!(
            5,
            flush.collections_manifest_item().expect("manifest").by_seqno
        );

        flush.process(&mk(SystemEvent::DeleteCollectionHard, 9));
        assert_eq!(
            9,
            flush.collections_manifest_item().expect("manifest").by_seqno
        );
    }

    #[test]
    fn upsert_classification() {
        let mk = |event| SystemEventFactory::make(event, "meat", "", None);
        assert!(SystemEventFlush::is_upsert(&mk(SystemEvent::CreateCollection)));
        assert!(SystemEventFlush::is_upsert(&mk(
            SystemEvent::CollectionsSeparatorChanged
        )));
        assert!(!SystemEventFlush::is_upsert(&mk(
            SystemEvent::DeleteCollectionHard
        )));
        assert!(!SystemEventFlush::is_upsert(&mk(
            SystemEvent::DeleteCollectionSoft
        )));
    }

    #[test]
    #[should_panic(expected = "neither deletes nor upserts")]
    fn upsert_of_begin_delete_is_a_logic_error() {
        let item = SystemEventFactory::make(SystemEvent::BeginDeleteCollection, "meat", "", None);
        SystemEventFlush::is_upsert(&item);
    }

    #[test]
    fn replication_filter_table() {
        let mk = |event| SystemEventFactory::make(event, "meat", "", None);
        assert_eq!(
            ProcessStatus::Continue,
            SystemEventReplicate::process(&mk(SystemEvent::CreateCollection))
        );
        assert_eq!(
            ProcessStatus::Continue,
            SystemEventReplicate::process(&mk(SystemEvent::BeginDeleteCollection))
        );
        assert_eq!(
            ProcessStatus::Continue,
            SystemEventReplicate::process(&mk(SystemEvent::CollectionsSeparatorChanged))
        );
        assert_eq!(
            ProcessStatus::Skip,
            SystemEventReplicate::process(&mk(SystemEvent::DeleteCollectionHard))
        );
        assert_eq!(
            ProcessStatus::Skip,
            SystemEventReplicate::process(&mk(SystemEvent::DeleteCollectionSoft))
        );
    }
}
