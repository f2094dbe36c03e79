//! Collections overlay: manifest persistence, key gating, system-event
//! flush policy, separator changes.

use tempfile::TempDir;

use vbstore::collections::Manifest;
use vbstore::systemevent::{ProcessStatus, SystemEventFactory, SystemEventFlush};
use vbstore::{
    BucketState, CouchKVStore, DocKey, DocNamespace, Item, KVStore, KVStoreConfig, Status,
    SystemEvent, VBucketState,
};
use vbstore::kvstore::VBStatePersist;

fn config(dir: &TempDir) -> KVStoreConfig {
    KVStoreConfig::new(dir.path(), 1024, 0)
}

fn setup(dir: &TempDir) -> anyhow::Result<CouchKVStore> {
    let store = CouchKVStore::new(config(dir))?;
    store.increment_revision(0);
    assert!(store.snapshot_vbucket(
        0,
        &VBucketState::new(BucketState::Active),
        VBStatePersist::PersistWithoutCommit
    ));
    Ok(store)
}

fn manifest_json(revision: u64, separator: &str, collections: &[&str]) -> String {
    Manifest {
        revision,
        separator: separator.to_string(),
        collections: collections.iter().map(|c| c.to_string()).collect(),
    }
    .to_json()
}

fn event(kind: SystemEvent, name: &str, manifest: &str, seqno: u64) -> Item {
    SystemEventFactory::make(kind, name, manifest.to_string(), Some(seqno))
}

/// Emulates the flusher draining a checkpoint: run the flush policy over
/// every queued item, persist the survivors, hand the retained manifest
/// update to commit.
fn flush(store: &CouchKVStore, items: Vec<Item>) {
    let mut policy = SystemEventFlush::new();
    store.begin();
    for item in items {
        if policy.process(&item) == ProcessStatus::Skip {
            continue;
        }
        if item.is_deleted() || (item.system_event().is_some() && !SystemEventFlush::is_upsert(&item))
        {
            store.del(item, Box::new(|_| {}));
        } else {
            store.set(item, Box::new(|_| {}));
        }
    }
    let manifest = policy.into_collections_manifest_item();
    assert!(store.commit(manifest.as_ref()));
}

#[test]
fn namespace_separation() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = setup(&dir)?;

    // A user document whose text happens to collide with a system key.
    let user = Item::new(
        DocKey::new("$collections::create:meat1", DocNamespace::DefaultCollection),
        0,
        0,
        "value",
    )
    .with_seqno(1);
    let create = event(
        SystemEvent::CreateCollection,
        "meat",
        &manifest_json(1, "::", &["$default", "meat"]),
        2,
    );
    flush(&store, vec![user, create]);

    // Both the system event and the user item were persisted.
    assert_eq!(Some(2), store.get_stat("lastCommitDocs"));

    let value = store.get(
        &DocKey::new("$collections::create:meat1", DocNamespace::DefaultCollection),
        0,
        false,
    );
    assert_eq!(Status::Success, value.status);
    assert_eq!(&b"value"[..], &value.item.expect("item").value);

    // The system-namespace marker is a distinct document.
    let marker = store.get(
        &DocKey::new("$collections::create:meat", DocNamespace::System),
        0,
        false,
    );
    assert_eq!(Status::Success, marker.status);
    assert_eq!(
        Some(SystemEvent::CreateCollection),
        marker.item.expect("item").system_event()
    );
    Ok(())
}

#[test]
fn collection_write_gate() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = setup(&dir)?;

    // Before the collection exists, meat keys do not validate.
    let beef = DocKey::new("meat::beef", DocNamespace::Collections);
    assert!(!store
        .collections_view(0)
        .does_key_contain_valid_collection(&beef));

    flush(
        &store,
        vec![event(
            SystemEvent::CreateCollection,
            "meat",
            &manifest_json(1, "::", &["$default", "meat"]),
            1,
        )],
    );
    assert!(store
        .collections_view(0)
        .does_key_contain_valid_collection(&beef));

    flush(
        &store,
        vec![Item::new(beef.clone(), 0, 0, "value").with_seqno(2)],
    );
    assert_eq!(Status::Success, store.get(&beef, 0, false).status);

    // A key in meat that does not exist.
    let sausage = DocKey::new("meat::sausage", DocNamespace::Collections);
    assert_eq!(Status::KeyNotFound, store.get(&sausage, 0, false).status);

    // Begin deleting the collection: nothing is flushed as a document,
    // only the manifest moves.
    flush(
        &store,
        vec![event(
            SystemEvent::BeginDeleteCollection,
            "meat",
            &manifest_json(2, "::", &["$default"]),
            3,
        )],
    );
    assert_eq!(Some(0), store.get_stat("lastCommitDocs"));

    // Access denied, although the document still exists on disk.
    assert_eq!(Status::UnknownCollection, store.get(&beef, 0, false).status);
    Ok(())
}

#[test]
fn manifest_round_trips_through_reopen() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    {
        let store = setup(&dir)?;
        flush(
            &store,
            vec![event(
                SystemEvent::CreateCollection,
                "meat",
                &manifest_json(1, "::", &["$default", "meat"]),
                1,
            )],
        );
    }

    let store = CouchKVStore::new(config(&dir))?;
    let persisted = Manifest::from_json(store.get_collections_manifest(0).as_bytes())?;
    assert_eq!(1, persisted.revision);
    assert_eq!("::", persisted.separator);
    assert_eq!(vec!["$default", "meat"], persisted.collections);

    // The gate derives from the reloaded manifest.
    assert!(store.collections_view(0).does_key_contain_valid_collection(
        &DocKey::new("meat::beef", DocNamespace::Collections)
    ));
    Ok(())
}

#[test]
fn manifest_missing_reads_as_empty_string() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = setup(&dir)?;
    assert_eq!("", store.get_collections_manifest(0));
    Ok(())
}

#[test]
fn highest_seqno_event_writes_the_manifest() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = setup(&dir)?;

    // Create and begin-delete land in the same batch; the delete carries
    // the higher seqno so its manifest wins.
    flush(
        &store,
        vec![
            event(
                SystemEvent::CreateCollection,
                "meat",
                &manifest_json(1, "::", &["$default", "meat"]),
                1,
            ),
            event(
                SystemEvent::BeginDeleteCollection,
                "meat",
                &manifest_json(2, "::", &["$default"]),
                2,
            ),
        ],
    );

    let persisted = Manifest::from_json(store.get_collections_manifest(0).as_bytes())?;
    assert_eq!(2, persisted.revision);
    assert!(!persisted.collections.contains(&"meat".to_string()));
    Ok(())
}

#[test]
fn separator_changes_collapse_to_one_marker() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = setup(&dir)?;

    flush(
        &store,
        vec![event(
            SystemEvent::CollectionsSeparatorChanged,
            "@@",
            &manifest_json(1, "@@", &["$default"]),
            1,
        )],
    );
    flush(
        &store,
        vec![event(
            SystemEvent::CollectionsSeparatorChanged,
            ":",
            &manifest_json(2, ":", &["$default"]),
            2,
        )],
    );
    flush(
        &store,
        vec![event(
            SystemEvent::CollectionsSeparatorChanged,
            ",",
            &manifest_json(3, ",", &["$default"]),
            3,
        )],
    );
    flush(
        &store,
        vec![event(
            SystemEvent::CreateCollection,
            "meat",
            &manifest_json(4, ",", &["$default", "meat"]),
            4,
        )],
    );

    let persisted = Manifest::from_json(store.get_collections_manifest(0).as_bytes())?;
    assert_eq!(",", persisted.separator);

    let view = store.collections_view(0);
    assert!(view.does_key_contain_valid_collection(&DocKey::new(
        "meat,bacon",
        DocNamespace::Collections
    )));
    assert!(!view.does_key_contain_valid_collection(&DocKey::new(
        "meat::bacon",
        DocNamespace::Collections
    )));

    // Successive separator changes share one fixed-key marker document, so
    // only two system documents exist: the separator marker and the
    // collection create marker.
    assert_eq!(2, store.get_item_count(0).expect("count"));
    Ok(())
}

#[test]
fn separator_changes_collapse_within_one_batch() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = setup(&dir)?;

    flush(
        &store,
        vec![
            event(
                SystemEvent::CollectionsSeparatorChanged,
                "@@",
                &manifest_json(1, "@@", &["$default"]),
                1,
            ),
            event(
                SystemEvent::CollectionsSeparatorChanged,
                ",",
                &manifest_json(2, ",", &["$default"]),
                2,
            ),
        ],
    );

    let persisted = Manifest::from_json(store.get_collections_manifest(0).as_bytes())?;
    assert_eq!(2, persisted.revision);
    assert_eq!(",", persisted.separator);
    assert_eq!(1, store.get_item_count(0).expect("count"));
    Ok(())
}

#[test]
fn collection_lifecycle_create_delete_complete_recreate() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = setup(&dir)?;
    let meat_key = DocKey::new("meat::0", DocNamespace::Collections);
    let can_write =
        |store: &CouchKVStore| store.collections_view(0).does_key_contain_valid_collection(&meat_key);

    // Create + 2 items.
    flush(
        &store,
        vec![
            event(
                SystemEvent::CreateCollection,
                "meat",
                &manifest_json(1, "::", &["$default", "meat"]),
                1,
            ),
            Item::new(DocKey::new("meat::0", DocNamespace::Collections), 0, 0, "value")
                .with_seqno(2),
            Item::new(DocKey::new("meat::1", DocNamespace::Collections), 0, 0, "value")
                .with_seqno(3),
        ],
    );
    let manifest_1 = store.get_collections_manifest(0);
    assert_eq!(Some(3), store.get_stat("lastCommitDocs"));
    assert!(can_write(&store));

    // Begin delete: manifest only.
    flush(
        &store,
        vec![event(
            SystemEvent::BeginDeleteCollection,
            "meat",
            &manifest_json(2, "::", &["$default"]),
            4,
        )],
    );
    let manifest_2 = store.get_collections_manifest(0);
    assert_ne!(manifest_1, manifest_2);
    assert!(!can_write(&store));

    // Complete the deletion: the hard-delete event tombstones the create
    // marker.
    flush(
        &store,
        vec![event(
            SystemEvent::DeleteCollectionHard,
            "meat",
            &manifest_json(3, "::", &["$default"]),
            5,
        )],
    );
    let manifest_3 = store.get_collections_manifest(0);
    assert_ne!(manifest_2, manifest_3);
    assert!(!can_write(&store));
    assert_eq!(
        Status::KeyNotFound,
        store
            .get(
                &DocKey::new("$collections::create:meat", DocNamespace::System),
                0,
                false
            )
            .status
    );

    // Re-create: the marker document comes back over its tombstone.
    flush(
        &store,
        vec![event(
            SystemEvent::CreateCollection,
            "meat",
            &manifest_json(4, "::", &["$default", "meat"]),
            6,
        )],
    );
    assert!(can_write(&store));
    assert_eq!(
        Status::Success,
        store
            .get(
                &DocKey::new("$collections::create:meat", DocNamespace::System),
                0,
                false
            )
            .status
    );
    Ok(())
}

#[test]
fn soft_delete_also_tombstones_the_create_marker() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = setup(&dir)?;

    flush(
        &store,
        vec![event(
            SystemEvent::CreateCollection,
            "meat",
            &manifest_json(1, "::", &["$default", "meat"]),
            1,
        )],
    );
    flush(
        &store,
        vec![event(
            SystemEvent::DeleteCollectionSoft,
            "meat",
            &manifest_json(2, "::", &["$default"]),
            2,
        )],
    );

    assert_eq!(
        Status::KeyNotFound,
        store
            .get(
                &DocKey::new("$collections::create:meat", DocNamespace::System),
                0,
                false
            )
            .status
    );
    Ok(())
}

#[test]
fn scan_sees_create_before_collection_items() -> anyhow::Result<()> {
    use std::sync::Arc;
    use vbstore::kvstore::{
        CacheLookupStatus, DocumentFilter, ScanCallbackStatus, ScanStatus, ValueFilter,
    };

    let dir = TempDir::new()?;
    let store = setup(&dir)?;

    flush(
        &store,
        vec![
            event(
                SystemEvent::CreateCollection,
                "meat",
                &manifest_json(1, "::", &["$default", "meat"]),
                1,
            ),
            Item::new(DocKey::new("meat::a", DocNamespace::Collections), 0, 0, "value")
                .with_seqno(2),
            Item::new(DocKey::new("meat::b", DocNamespace::Collections), 0, 0, "value")
                .with_seqno(3),
        ],
    );

    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let order_in_cb = order.clone();
    let mut ctx = store
        .init_scan_context(
            Box::new(move |value| {
                let item = value.item.expect("item");
                order_in_cb
                    .lock()
                    .push((item.by_seqno, item.key.namespace()));
                ScanCallbackStatus::Continue
            }),
            Box::new(|_| CacheLookupStatus::Miss),
            0,
            0,
            DocumentFilter::All,
            ValueFilter::ValuesCompressed,
        )
        .expect("scan context");
    assert_eq!(ScanStatus::Success, store.scan(&mut ctx));
    store.destroy_scan_context(ctx);

    let order = order.lock();
    assert_eq!(3, order.len());
    // The create event is strictly first in seqno order.
    assert_eq!((1, DocNamespace::System), order[0]);
    assert!(order[1..]
        .iter()
        .all(|(_, ns)| *ns == DocNamespace::Collections));
    Ok(())
}

#[test]
fn persist_manifest_item_outside_a_batch() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = setup(&dir)?;

    let item = event(
        SystemEvent::CreateCollection,
        "dairy",
        &manifest_json(1, "::", &["$default", "dairy"]),
        1,
    );
    assert!(store.persist_collections_manifest_item(0, &item));

    let persisted = Manifest::from_json(store.get_collections_manifest(0).as_bytes())?;
    assert!(persisted.collections.contains(&"dairy".to_string()));
    Ok(())
}
