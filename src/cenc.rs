//! Content encoding of transport objects (RFC 6726 §3.4.1).
//!
//! An object may be compressed before FEC encoding.  The FDT entry names the
//! encoding in `Content-Encoding`; packets may repeat it in EXT_CENC.
//! `Content-Length` is the original size and `Transfer-Length` the encoded
//! one.

use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use flate2::write::{DeflateEncoder, GzEncoder, ZlibEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use thiserror::Error;

use crate::lct::{HeaderExtension, EXT_CENC};

#[derive(Error, Debug)]
pub enum CencError {
    #[error("Content encoding IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Unknown content encoding id {0}")]
    UnknownId(u8),
    #[error("Malformed EXT_CENC")]
    MalformedExtension,
    #[error("Decoded content exceeds {0} bytes")]
    TooLarge(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentEncoding {
    #[default]
    Null,
    Zlib,
    Deflate,
    Gzip,
}

impl ContentEncoding {
    pub fn id(self) -> u8 {
        match self {
            ContentEncoding::Null    => 0,
            ContentEncoding::Zlib    => 1,
            ContentEncoding::Deflate => 2,
            ContentEncoding::Gzip    => 3,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(ContentEncoding::Null),
            1 => Some(ContentEncoding::Zlib),
            2 => Some(ContentEncoding::Deflate),
            3 => Some(ContentEncoding::Gzip),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ContentEncoding::Null    => "null",
            ContentEncoding::Zlib    => "zlib",
            ContentEncoding::Deflate => "deflate",
            ContentEncoding::Gzip    => "gzip",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "null" | "none" => Some(ContentEncoding::Null),
            "zlib"          => Some(ContentEncoding::Zlib),
            "deflate"       => Some(ContentEncoding::Deflate),
            "gzip"          => Some(ContentEncoding::Gzip),
            _               => None,
        }
    }

    pub fn is_null(&self) -> bool {
        *self == ContentEncoding::Null
    }

    pub fn encode(self, data: &[u8]) -> Result<Vec<u8>, CencError> {
        let level = Compression::default();
        let out = match self {
            ContentEncoding::Null => return Ok(data.to_vec()),
            ContentEncoding::Zlib => {
                let mut enc = ZlibEncoder::new(Vec::new(), level);
                enc.write_all(data)?;
                enc.finish()?
            }
            ContentEncoding::Deflate => {
                let mut enc = DeflateEncoder::new(Vec::new(), level);
                enc.write_all(data)?;
                enc.finish()?
            }
            ContentEncoding::Gzip => {
                let mut enc = GzEncoder::new(Vec::new(), level);
                enc.write_all(data)?;
                enc.finish()?
            }
        };
        Ok(out)
    }

    /// Decode at most `limit` bytes.  Longer output is an error.
    pub fn decode(self, data: &[u8], limit: u64) -> Result<Vec<u8>, CencError> {
        let reader: Box<dyn Read + '_> = match self {
            ContentEncoding::Null    => Box::new(data),
            ContentEncoding::Zlib    => Box::new(ZlibDecoder::new(data)),
            ContentEncoding::Deflate => Box::new(DeflateDecoder::new(data)),
            ContentEncoding::Gzip    => Box::new(GzDecoder::new(data)),
        };
        let mut out = Vec::new();
        reader.take(limit.saturating_add(1)).read_to_end(&mut out)?;
        if out.len() as u64 > limit {
            return Err(CencError::TooLarge(limit));
        }
        Ok(out)
    }
}

// ── EXT_CENC ─────────────────────────────────────────────────────────────────

/// EXT_CENC: the encoding id followed by 16 reserved bits.
pub fn cenc_extension(cenc: ContentEncoding) -> HeaderExtension {
    HeaderExtension::new(EXT_CENC, vec![cenc.id(), 0, 0])
}

pub fn parse_cenc(ext: &HeaderExtension) -> Result<ContentEncoding, CencError> {
    let id = *ext.content.first().ok_or(CencError::MalformedExtension)?;
    ContentEncoding::from_id(id).ok_or(CencError::UnknownId(id))
}
