//! File Delivery Table.
//!
//! An FDT instance is a versioned snapshot describing the objects of a
//! session.  It travels as the payload of TOI 0 and is serialized as JSON,
//! using the attribute names of RFC 6726.  Instance ids are 20 bits wide
//! (EXT_FDT) and wrap around, so ordering uses serial-number arithmetic.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

use crate::cenc::ContentEncoding;
use crate::oti::{Oti, OtiError};

pub const FDT_INSTANCE_ID_MASK: u32 = 0x000F_FFFF;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
pub const NTP_UNIX_OFFSET: i64 = 2_208_988_800;

#[derive(Error, Debug)]
pub enum FdtError {
    #[error("FDT serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("FDT entry uses reserved TOI 0")]
    ReservedToi,
    #[error("FDT lists TOI {0} twice")]
    DuplicateToi(u64),
    #[error("FDT entry for TOI {toi}: {source}")]
    Oti { toi: u64, source: OtiError },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FdtFile {
    #[serde(rename = "TOI")]
    pub toi:              u64,
    #[serde(rename = "Content-Location")]
    pub content_location: String,
    #[serde(rename = "Content-Type", default)]
    pub content_type:     String,
    /// Size of the object before content encoding.
    #[serde(rename = "Content-Length")]
    pub content_length:   u64,
    /// Bytes actually transmitted; equals `content_length` without content encoding.
    #[serde(rename = "Transfer-Length")]
    pub transfer_length:  u64,
    #[serde(rename = "Content-Encoding", default, skip_serializing_if = "ContentEncoding::is_null")]
    pub content_encoding: ContentEncoding,
    #[serde(rename = "FEC-OTI", default, skip_serializing_if = "Option::is_none")]
    pub oti:              Option<Oti>,
    /// BLAKE3 of the object before content encoding, hex encoded.
    #[serde(rename = "Content-Digest", default, skip_serializing_if = "Option::is_none")]
    pub content_digest:   Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FdtInstance {
    #[serde(rename = "FDT-Instance-ID")]
    pub instance_id: u32,
    /// Expiry as NTP seconds.
    #[serde(rename = "Expires")]
    pub expires:     u64,
    #[serde(rename = "Complete", default, skip_serializing_if = "std::ops::Not::not")]
    pub complete:    bool,
    #[serde(rename = "File", default)]
    pub files:       Vec<FdtFile>,
}

impl FdtInstance {
    pub fn new(instance_id: u32, expires: DateTime<Utc>) -> Self {
        Self {
            instance_id: instance_id & FDT_INSTANCE_ID_MASK,
            expires: to_ntp_seconds(expires),
            complete: false,
            files: Vec::new(),
        }
    }

    pub fn get(&self, toi: u64) -> Option<&FdtFile> {
        self.files.iter().find(|f| f.toi == toi)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        to_ntp_seconds(now) > self.expires
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        from_ntp_seconds(self.expires)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, FdtError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FdtError> {
        let fdt: FdtInstance = serde_json::from_slice(bytes)?;
        fdt.check()?;
        Ok(fdt)
    }

    fn check(&self) -> Result<(), FdtError> {
        let mut seen = HashSet::with_capacity(self.files.len());
        for file in &self.files {
            if file.toi == 0 {
                return Err(FdtError::ReservedToi);
            }
            if !seen.insert(file.toi) {
                return Err(FdtError::DuplicateToi(file.toi));
            }
            if let Some(oti) = &file.oti {
                oti.validate().map_err(|source| FdtError::Oti { toi: file.toi, source })?;
            }
        }
        Ok(())
    }
}

// ── Instance id arithmetic ───────────────────────────────────────────────────

pub fn next_instance_id(id: u32) -> u32 {
    id.wrapping_add(1) & FDT_INSTANCE_ID_MASK
}

/// True when `a` follows `b` in the 20-bit instance id space.
pub fn is_newer(a: u32, b: u32) -> bool {
    let diff = a.wrapping_sub(b) & FDT_INSTANCE_ID_MASK;
    diff != 0 && diff < (FDT_INSTANCE_ID_MASK + 1) / 2
}

// ── NTP time ─────────────────────────────────────────────────────────────────

pub fn to_ntp_seconds(t: DateTime<Utc>) -> u64 {
    (t.timestamp() + NTP_UNIX_OFFSET).max(0) as u64
}

pub fn from_ntp_seconds(ntp: u64) -> Option<DateTime<Utc>> {
    let unix = i64::try_from(ntp).ok()? - NTP_UNIX_OFFSET;
    Utc.timestamp_opt(unix, 0).single()
}

/// Expiry stamp for an instance sealed at `now` and valid for `ttl`.
pub fn expiry_after(now: DateTime<Utc>, ttl: std::time::Duration) -> DateTime<Utc> {
    now + Duration::from_std(ttl).unwrap_or_else(|_| Duration::days(365))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(toi: u64) -> FdtFile {
        FdtFile {
            toi,
            content_location: format!("file:///obj{toi}"),
            content_type: "application/octet-stream".into(),
            content_length: 10,
            transfer_length: 10,
            content_encoding: ContentEncoding::Null,
            oti: Some(Oti::no_code(1400, 64).with_transfer_length(10)),
            content_digest: None,
        }
    }

    #[test]
    fn test_bytes_roundtrip() {
        let mut fdt = FdtInstance::new(7, Utc::now());
        fdt.files.push(entry(1));
        fdt.files.push(entry(2));
        let bytes = fdt.to_bytes().unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("\"Content-Location\":\"file:///obj1\""));
        assert!(!text.contains("Complete"));
        assert!(!text.contains("Content-Encoding"));
        assert_eq!(FdtInstance::from_bytes(&bytes).unwrap(), fdt);

        fdt.files[0].content_encoding = ContentEncoding::Gzip;
        let bytes = fdt.to_bytes().unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains("\"Content-Encoding\":\"gzip\""));
        assert_eq!(FdtInstance::from_bytes(&bytes).unwrap(), fdt);
        assert_eq!(fdt.get(2).unwrap().toi, 2);
        assert!(fdt.get(3).is_none());
    }

    #[test]
    fn test_rejects_bad_entries() {
        let mut fdt = FdtInstance::new(1, Utc::now());
        fdt.files.push(entry(0));
        let bytes = fdt.to_bytes().unwrap();
        assert!(matches!(FdtInstance::from_bytes(&bytes), Err(FdtError::ReservedToi)));

        let mut fdt = FdtInstance::new(1, Utc::now());
        fdt.files.push(entry(4));
        fdt.files.push(entry(4));
        let bytes = fdt.to_bytes().unwrap();
        assert!(matches!(FdtInstance::from_bytes(&bytes), Err(FdtError::DuplicateToi(4))));

        assert!(matches!(FdtInstance::from_bytes(b"<FDT-Instance/>"), Err(FdtError::Json(_))));
    }

    #[test]
    fn test_instance_id_wraps() {
        assert_eq!(next_instance_id(FDT_INSTANCE_ID_MASK), 0);
        assert!(is_newer(0, FDT_INSTANCE_ID_MASK));
        assert!(is_newer(5, 4));
        assert!(!is_newer(4, 5));
        assert!(!is_newer(4, 4));
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let fdt = FdtInstance::new(1, expiry_after(now, std::time::Duration::from_secs(60)));
        assert!(!fdt.is_expired(now));
        assert!(fdt.is_expired(now + Duration::seconds(120)));
        let expires = fdt.expires_at().unwrap();
        assert_eq!(expires.timestamp(), now.timestamp() + 60);
    }
}
