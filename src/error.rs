//! Engine-visible status codes.
//!
//! The store logs raw I/O errors internally and translates them to one of
//! these codes before they cross the KVStore boundary. Callers never see
//! filesystem-layer vocabulary.

/// Outcome of a KVStore operation as seen by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    /// The document (or vBucket file content) does not exist. Not logged.
    KeyNotFound,
    /// The key names a collection that is not open in the current manifest.
    UnknownCollection,
    /// The item must be fetched in the background before it can be served.
    WouldBlock,
    /// On-disk metadata was malformed; retrying after repair may succeed.
    TempFail,
    /// The backing file is missing (the vBucket was never persisted or was
    /// deleted underneath us).
    SystemError,
    /// Unrecoverable I/O failure. Details are in the log.
    IoError,
}

impl Status {
    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Success => "success",
            Status::KeyNotFound => "key not found",
            Status::UnknownCollection => "unknown collection",
            Status::WouldBlock => "would block",
            Status::TempFail => "temporary failure",
            Status::SystemError => "no such file",
            Status::IoError => "io error",
        };
        f.write_str(s)
    }
}
