//! Items: the unit of work handed to the store by the engine.
//!
//! Keys carry a namespace tag which is persisted as a single leading byte,
//! so identical textual keys in different namespaces are distinct
//! documents on disk.

use bytes::{BufMut, Bytes, BytesMut};

pub type VBucketId = u16;

/// Datatype bitmask carried per document.
pub mod datatype {
    pub const RAW: u8 = 0x0;
    pub const JSON: u8 = 0x1;
    /// Value is a zstd frame in its stored form.
    pub const COMPRESSED: u8 = 0x2;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum DocNamespace {
    DefaultCollection = 0,
    Collections = 1,
    System = 2,
}

impl DocNamespace {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(DocNamespace::DefaultCollection),
            1 => Some(DocNamespace::Collections),
            2 => Some(DocNamespace::System),
            _ => None,
        }
    }
}

/// A namespaced document key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocKey {
    ns: DocNamespace,
    key: Bytes,
}

impl DocKey {
    pub fn new(key: impl Into<Bytes>, ns: DocNamespace) -> Self {
        Self {
            ns,
            key: key.into(),
        }
    }

    pub fn namespace(&self) -> DocNamespace {
        self.ns
    }

    pub fn bytes(&self) -> &[u8] {
        &self.key
    }

    /// On-disk form: namespace tag byte followed by the raw key bytes.
    pub fn tagged(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.key.len());
        buf.put_u8(self.ns as u8);
        buf.put_slice(&self.key);
        buf.freeze()
    }

    pub fn from_tagged(buf: &[u8]) -> Option<Self> {
        let (&tag, rest) = buf.split_first()?;
        Some(Self {
            ns: DocNamespace::from_tag(tag)?,
            key: Bytes::copy_from_slice(rest),
        })
    }
}

/// Collection-lifecycle transitions carried by system items.
///
/// The discriminant doubles as the wire value mirrored into `Item::flags`
/// for persisted marker documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SystemEvent {
    CreateCollection = 0,
    BeginDeleteCollection = 1,
    CollectionsSeparatorChanged = 2,
    DeleteCollectionHard = 3,
    DeleteCollectionSoft = 4,
}

impl SystemEvent {
    pub fn from_flags(flags: u32) -> Option<Self> {
        match flags {
            0 => Some(SystemEvent::CreateCollection),
            1 => Some(SystemEvent::BeginDeleteCollection),
            2 => Some(SystemEvent::CollectionsSeparatorChanged),
            3 => Some(SystemEvent::DeleteCollectionHard),
            4 => Some(SystemEvent::DeleteCollectionSoft),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Mutation,
    Deletion,
    SystemEvent(SystemEvent),
}

/// A mutation, deletion or system event queued for persistence.
///
/// Buffers referenced by an item must stay valid until the commit that
/// persists it completes; the store takes ownership for exactly that span.
#[derive(Debug, Clone)]
pub struct Item {
    pub key: DocKey,
    pub value: Bytes,
    pub vbucket: VBucketId,
    pub cas: u64,
    pub expiry: u32,
    pub flags: u32,
    pub datatype: u8,
    pub by_seqno: u64,
    pub operation: Operation,
}

impl Item {
    pub fn new(key: DocKey, flags: u32, expiry: u32, value: impl Into<Bytes>) -> Self {
        Self {
            key,
            value: value.into(),
            vbucket: 0,
            cas: 0,
            expiry,
            flags,
            datatype: datatype::RAW,
            by_seqno: 0,
            operation: Operation::Mutation,
        }
    }

    pub fn deletion(key: DocKey, by_seqno: u64) -> Self {
        Self {
            key,
            value: Bytes::new(),
            vbucket: 0,
            cas: 0,
            expiry: 0,
            flags: 0,
            datatype: datatype::RAW,
            by_seqno,
            operation: Operation::Deletion,
        }
    }

    pub fn with_vbucket(mut self, vbucket: VBucketId) -> Self {
        self.vbucket = vbucket;
        self
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn with_datatype(mut self, datatype: u8) -> Self {
        self.datatype = datatype;
        self
    }

    pub fn with_seqno(mut self, by_seqno: u64) -> Self {
        self.by_seqno = by_seqno;
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.operation == Operation::Deletion
    }

    pub fn is_compressed(&self) -> bool {
        self.datatype & datatype::COMPRESSED != 0
    }

    /// The system event carried by this item, if it is one.
    pub fn system_event(&self) -> Option<SystemEvent> {
        match self.operation {
            Operation::SystemEvent(se) => Some(se),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_keys_separate_namespaces() {
        let user = DocKey::new("$collections::create:meat1", DocNamespace::DefaultCollection);
        let system = DocKey::new("$collections::create:meat1", DocNamespace::System);
        assert_ne!(user.tagged(), system.tagged());

        let decoded = DocKey::from_tagged(&user.tagged()).expect("tag round trip");
        assert_eq!(decoded, user);
    }

    #[test]
    fn tagged_rejects_unknown_namespace() {
        assert!(DocKey::from_tagged(&[9, b'k']).is_none());
        assert!(DocKey::from_tagged(&[]).is_none());
    }

    #[test]
    fn system_event_flags_round_trip() {
        for se in [
            SystemEvent::CreateCollection,
            SystemEvent::BeginDeleteCollection,
            SystemEvent::CollectionsSeparatorChanged,
            SystemEvent::DeleteCollectionHard,
            SystemEvent::DeleteCollectionSoft,
        ] {
            assert_eq!(SystemEvent::from_flags(se as u32), Some(se));
        }
        assert_eq!(SystemEvent::from_flags(5), None);
    }
}
