//! Per-document metadata codec.
//!
//! Three on-disk layouts exist:
//! ```text
//! V0 (16 bytes): [cas u64 BE][expiry u32 BE][flags u32]
//! V1 (18 bytes): V0 + [flex code u8][datatype u8]
//! V2 (19 bytes): V1 + [legacy conflict-resolution u8]
//! ```
//! CAS and expiry are big-endian on disk and host-endian in memory; flags
//! are stored exactly as the engine supplied them. Reads accept all three
//! layouts (the V2 trailing byte is dropped, V0 gains a default extension).
//! Writes always emit V1.

use thiserror::Error;

/// Marker byte stored in the first extension slot of V1 metadata.
pub const FLEX_META_CODE: u8 = 0x01;

#[derive(Debug, Error)]
pub enum MetaDataError {
    #[error("metadata buffer of {0} bytes matches no known layout")]
    BadSize(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    V0,
    V1,
    V2,
}

impl Version {
    pub const fn size(self) -> usize {
        match self {
            Version::V0 => 16,
            Version::V1 => 18,
            Version::V2 => 19,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaData {
    cas: u64,
    expiry: u32,
    flags: u32,
    flex_code: u8,
    datatype: u8,
    initialised_from: Version,
}

impl MetaData {
    pub fn new(cas: u64, expiry: u32, flags: u32, datatype: u8) -> Self {
        Self {
            cas,
            expiry,
            flags,
            flex_code: FLEX_META_CODE,
            datatype,
            initialised_from: Version::V1,
        }
    }

    /// Classify a raw buffer by size and decode it.
    ///
    /// A 16-byte buffer is upgraded to V1 in memory (default extension,
    /// datatype raw); a 19-byte buffer is read as V1 with the legacy byte
    /// ignored. Every other size is malformed.
    pub fn decode(buf: &[u8]) -> Result<Self, MetaDataError> {
        let version = match buf.len() {
            16 => Version::V0,
            18 => Version::V1,
            19 => Version::V2,
            n => return Err(MetaDataError::BadSize(n)),
        };

        let cas = u64::from_be_bytes(buf[0..8].try_into().unwrap());
        let expiry = u32::from_be_bytes(buf[8..12].try_into().unwrap());
        let flags = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        let (flex_code, datatype) = match version {
            Version::V0 => (FLEX_META_CODE, 0),
            Version::V1 | Version::V2 => (buf[16], buf[17]),
        };

        Ok(Self {
            cas,
            expiry,
            flags,
            flex_code,
            datatype,
            // V2 carries nothing we keep beyond V1.
            initialised_from: if version == Version::V2 {
                Version::V1
            } else {
                version
            },
        })
    }

    /// Project to the on-disk form. Always V1.
    pub fn encode(&self) -> [u8; 18] {
        let mut out = [0u8; 18];
        out[0..8].copy_from_slice(&self.cas.to_be_bytes());
        out[8..12].copy_from_slice(&self.expiry.to_be_bytes());
        out[12..16].copy_from_slice(&self.flags.to_le_bytes());
        out[16] = self.flex_code;
        out[17] = self.datatype;
        out
    }

    pub fn cas(&self) -> u64 {
        self.cas
    }

    pub fn expiry(&self) -> u32 {
        self.expiry
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn flex_code(&self) -> u8 {
        self.flex_code
    }

    pub fn datatype(&self) -> u8 {
        self.datatype
    }

    pub fn version_initialised_from(&self) -> Version {
        self.initialised_from
    }

    pub fn set_cas(&mut self, cas: u64) {
        self.cas = cas;
    }

    pub fn set_expiry(&mut self, expiry: u32) {
        self.expiry = expiry;
    }

    pub fn set_flags(&mut self, flags: u32) {
        self.flags = flags;
    }

    pub fn set_datatype(&mut self, datatype: u8) {
        self.flex_code = FLEX_META_CODE;
        self.datatype = datatype;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_locked_down() {
        assert_eq!(16, Version::V0.size());
        assert_eq!(16 + 2, Version::V1.size());
        assert_eq!(16 + 2 + 1, Version::V2.size());
    }

    #[test]
    fn classify_by_size() {
        let meta = MetaData::decode(&[0u8; 16]).expect("v0");
        assert_eq!(Version::V0, meta.version_initialised_from());

        let meta = MetaData::decode(&[0u8; 18]).expect("v1");
        assert_eq!(Version::V1, meta.version_initialised_from());

        // A 19-byte buffer decodes, but the result is V1.
        let meta = MetaData::decode(&[0u8; 19]).expect("v2");
        assert_eq!(Version::V1, meta.version_initialised_from());

        assert!(MetaData::decode(&[0u8; 15]).is_err());
        assert!(MetaData::decode(&[0u8; 17]).is_err());
        assert!(MetaData::decode(&[0u8; 20]).is_err());
    }

    #[test]
    fn v0_upgrades_with_default_extension() {
        let mut buf = [0u8; 16];
        buf[0..8].copy_from_slice(&0xf00f_cafe_1122_5566u64.to_be_bytes());
        buf[8..12].copy_from_slice(&0xaa00_bb11u32.to_be_bytes());
        buf[12..16].copy_from_slice(&0x0102_0304u32.to_le_bytes());

        let meta = MetaData::decode(&buf).expect("decode");
        assert_eq!(0xf00f_cafe_1122_5566, meta.cas());
        assert_eq!(0xaa00_bb11, meta.expiry());
        assert_eq!(0x0102_0304, meta.flags());
        assert_eq!(FLEX_META_CODE, meta.flex_code());
        assert_eq!(0, meta.datatype());
    }

    #[test]
    fn cas_is_byteswapped_from_native_order_bytes() {
        // A buffer that was memcpy'd from little-endian host integers reads
        // back byteswapped for the big-endian fields and untouched for
        // flags.
        let cas = 0xf00f_cafe_1122_5566u64;
        let expiry = 0xaa00_bb11u32;
        let flags = 0x0102_0304u32;
        let mut buf = [0u8; 16];
        buf[0..8].copy_from_slice(&cas.to_le_bytes());
        buf[8..12].copy_from_slice(&expiry.to_le_bytes());
        buf[12..16].copy_from_slice(&flags.to_le_bytes());

        let meta = MetaData::decode(&buf).expect("decode");
        assert_eq!(cas.swap_bytes(), meta.cas());
        assert_eq!(expiry.swap_bytes(), meta.expiry());
        assert_eq!(flags, meta.flags());
    }

    #[test]
    fn encode_round_trip_is_v1() {
        let meta = MetaData::new(0xf00f00, 0xcafe1234, 0xc0115511, 0x1);
        let buf = meta.encode();
        assert_eq!(Version::V1.size(), buf.len());

        let back = MetaData::decode(&buf).expect("decode");
        assert_eq!(Version::V1, back.version_initialised_from());
        assert_eq!(meta.cas(), back.cas());
        assert_eq!(meta.expiry(), back.expiry());
        assert_eq!(meta.flags(), back.flags());
        assert_eq!(FLEX_META_CODE, back.flex_code());
        assert_eq!(0x1, back.datatype());
    }

    #[test]
    fn v2_legacy_byte_is_dropped() {
        let mut buf = [0u8; 19];
        buf[0..8].copy_from_slice(&0xf00f_cafe_1122_5566u64.to_be_bytes());
        buf[8..12].copy_from_slice(&0xaa00_bb11u32.to_be_bytes());
        buf[12..16].copy_from_slice(&0x0102_0304u32.to_le_bytes());
        buf[16] = FLEX_META_CODE;
        buf[17] = 0x21;
        buf[18] = 0x01; // legacy deleted marker

        let meta = MetaData::decode(&buf).expect("decode");
        assert_eq!(0x21, meta.datatype());
        assert_eq!(Version::V1, meta.version_initialised_from());
        // Re-encoding emits 18 bytes; the legacy byte is gone for good.
        assert_eq!(18, meta.encode().len());
    }

    #[test]
    fn mutation_keeps_flex_code_current() {
        let mut meta = MetaData::decode(&[0u8; 16]).expect("v0");
        meta.set_cas(0xf00f00);
        meta.set_expiry(0xcafe1234);
        meta.set_flags(0xc0115511);
        meta.set_datatype(0x1);

        assert_eq!(0xf00f00, meta.cas());
        assert_eq!(0xcafe1234, meta.expiry());
        assert_eq!(0xc0115511, meta.flags());
        assert_eq!(FLEX_META_CODE, meta.flex_code());
        assert_eq!(0x1, meta.datatype());
    }
}
