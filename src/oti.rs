//! Object Transmission Information: how an object is cut into source blocks
//! and encoding symbols, and which FEC scheme protects them.
//!
//! # Identity rules
//! The FEC encoding id is the value written into the LCT codepoint and into
//! the FDT.  Ids are assigned by IANA (RFC 5052 registry) and never reused.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest value of the 48-bit transfer length field in EXT_FTI.
pub const MAX_TRANSFER_LENGTH: u64 = 0xFFFF_FFFF_FFFF;

/// RS over GF(2^8) cannot address more than 255 symbols per block.
pub const RS_GF28_MAX_BLOCK_SYMBOLS: u32 = 255;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OtiError {
    #[error("Invalid OTI: {0}")]
    InvalidOti(String),
}

// ── FecEncodingId ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FecEncodingId {
    /// Compact No-Code (RFC 5445): symbols are sent verbatim.
    NoCode,
    /// Reed-Solomon over GF(2^8) (RFC 5510).
    ReedSolomonGf28,
}

impl FecEncodingId {
    #[inline]
    pub fn id(self) -> u8 {
        match self {
            FecEncodingId::NoCode          => 0,
            FecEncodingId::ReedSolomonGf28 => 5,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(FecEncodingId::NoCode),
            5 => Some(FecEncodingId::ReedSolomonGf28),
            _ => None,
        }
    }

    /// Human-readable name (for diagnostics and the CLI).
    pub fn name(self) -> &'static str {
        match self {
            FecEncodingId::NoCode          => "nocode",
            FecEncodingId::ReedSolomonGf28 => "rs28",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "nocode" | "none" => Some(FecEncodingId::NoCode),
            "rs28" | "rs"     => Some(FecEncodingId::ReedSolomonGf28),
            _                 => None,
        }
    }

    /// Upper bound on source blocks per object, set by the SBN width of the
    /// scheme's FEC payload id.
    pub fn max_source_blocks(self) -> u64 {
        match self {
            FecEncodingId::NoCode          => 1 << 16,
            FecEncodingId::ReedSolomonGf28 => 1 << 24,
        }
    }
}

// ── Oti ──────────────────────────────────────────────────────────────────────

fn default_inband_fti() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Oti {
    pub fec_encoding_id:              FecEncodingId,
    pub transfer_length:              u64,
    pub encoding_symbol_length:       u16,
    /// Source symbols per block.
    pub max_source_block_length:      u32,
    pub max_number_of_parity_symbols: u16,
    /// Data packets carry EXT_FTI so receivers can start without the FDT.
    #[serde(default = "default_inband_fti")]
    pub inband_fti:                   bool,
}

impl Oti {
    pub fn no_code(encoding_symbol_length: u16, max_source_block_length: u32) -> Self {
        Self {
            fec_encoding_id: FecEncodingId::NoCode,
            transfer_length: 0,
            encoding_symbol_length,
            max_source_block_length,
            max_number_of_parity_symbols: 0,
            inband_fti: true,
        }
    }

    pub fn reed_solomon_gf28(
        encoding_symbol_length:  u16,
        max_source_block_length: u8,
        parity_symbols:          u8,
    ) -> Self {
        Self {
            fec_encoding_id: FecEncodingId::ReedSolomonGf28,
            transfer_length: 0,
            encoding_symbol_length,
            max_source_block_length: max_source_block_length as u32,
            max_number_of_parity_symbols: parity_symbols as u16,
            inband_fti: true,
        }
    }

    /// Same parameters, bound to a concrete object length.
    pub fn with_transfer_length(mut self, transfer_length: u64) -> Self {
        self.transfer_length = transfer_length;
        self
    }

    /// Largest object these parameters can describe.
    pub fn max_transfer_length(&self) -> u64 {
        let per_block = self.max_source_block_length as u64 * self.encoding_symbol_length as u64;
        per_block
            .saturating_mul(self.fec_encoding_id.max_source_blocks())
            .min(MAX_TRANSFER_LENGTH)
    }

    pub fn validate(&self) -> Result<(), OtiError> {
        if self.encoding_symbol_length == 0 {
            return Err(OtiError::InvalidOti("encoding symbol length is 0".into()));
        }
        if self.max_source_block_length == 0 {
            return Err(OtiError::InvalidOti("maximum source block length is 0".into()));
        }
        match self.fec_encoding_id {
            FecEncodingId::NoCode => {
                if self.max_number_of_parity_symbols != 0 {
                    return Err(OtiError::InvalidOti(format!(
                        "no-code scheme cannot carry {} parity symbols",
                        self.max_number_of_parity_symbols
                    )));
                }
                if self.max_source_block_length > 1 << 16 {
                    return Err(OtiError::InvalidOti(format!(
                        "no-code ESI is 16 bits, block length {} too large",
                        self.max_source_block_length
                    )));
                }
            }
            FecEncodingId::ReedSolomonGf28 => {
                let n = self.max_source_block_length + self.max_number_of_parity_symbols as u32;
                if n > RS_GF28_MAX_BLOCK_SYMBOLS {
                    return Err(OtiError::InvalidOti(format!(
                        "RS GF(2^8) block of {n} symbols exceeds {RS_GF28_MAX_BLOCK_SYMBOLS}"
                    )));
                }
            }
        }
        if self.transfer_length > self.max_transfer_length() {
            return Err(OtiError::InvalidOti(format!(
                "transfer length {} exceeds maximum {}",
                self.transfer_length,
                self.max_transfer_length()
            )));
        }
        Ok(())
    }
}
