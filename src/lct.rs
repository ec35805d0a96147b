//! LCT header codec (RFC 5651).
//!
//! # Wire layout
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   V   | C |PSI|S| O |H|Res|A|B|   HDR_LEN     | Codepoint (CP)|
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | Congestion Control Information (CCI, length = 32*(C+1) bits)  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Transport Session Identifier (TSI, length = 32*S+16*H bits)  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Transport Object Identifier (TOI, length = 32*O+16*H bits)  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                Header Extensions (if applicable)              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! # Endianness
//! Every multi-byte field is big-endian (network order).  Receivers from
//! independent implementations must read exactly these bits.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Write};
use thiserror::Error;

/// The only LCT version this codec reads or writes.
pub const LCT_VERSION: u8 = 1;

/// FLUTE version written into EXT_FDT (RFC 6726).
pub const FLUTE_VERSION: u8 = 2;

// ── Header extension types ───────────────────────────────────────────────────

/// No-operation extension.
pub const EXT_NOP:  u8 = 0;
/// Packet authentication extension.
pub const EXT_AUTH: u8 = 1;
/// Sender time extension.
pub const EXT_TIME: u8 = 2;
/// FEC Object Transmission Information.
pub const EXT_FTI:  u8 = 64;
/// FDT instance header (FLUTE).
pub const EXT_FDT:  u8 = 192;
/// FDT content encoding (FLUTE).
pub const EXT_CENC: u8 = 193;

const FDT_INSTANCE_ID_MASK: u32 = 0x000F_FFFF;
const MAX_TSI: u64 = 0xFFFF_FFFF_FFFF;

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum LctError {
    #[error("Malformed LCT header: {0}")]
    MalformedHeader(String),
    #[error("Unsupported LCT version: {0}")]
    UnsupportedVersion(u8),
    #[error("{0} does not fit its wire width")]
    FieldOverflow(&'static str),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

fn truncated(_: io::Error) -> LctError {
    LctError::MalformedHeader("truncated header".into())
}

// ── Header extension ─────────────────────────────────────────────────────────

/// A raw header extension.  `content` excludes the HET (and HEL) bytes.
///
/// HET ≥ 128 marks a fixed-size extension of one 32-bit word, so `content`
/// is exactly 3 bytes.  Below 128 the HEL byte gives the size in words and
/// `content.len() + 2` must be a multiple of 4.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderExtension {
    pub het:     u8,
    pub content: Vec<u8>,
}

impl HeaderExtension {
    pub fn new(het: u8, content: Vec<u8>) -> Self {
        Self { het, content }
    }

    /// Encoded size in bytes, HET and HEL included.
    pub fn wire_len(&self) -> usize {
        if self.het >= 128 { 4 } else { 2 + self.content.len() }
    }

    fn check(&self) -> Result<(), LctError> {
        if self.het == EXT_FDT {
            return Err(LctError::MalformedHeader(
                "EXT_FDT is written from fdt_instance_id, not as a raw extension".into(),
            ));
        }
        let ok = if self.het >= 128 {
            self.content.len() == 3
        } else {
            let len = self.wire_len();
            len % 4 == 0 && len / 4 <= u8::MAX as usize
        };
        if ok {
            Ok(())
        } else {
            Err(LctError::MalformedHeader(format!(
                "extension HET={} has invalid length {}", self.het, self.content.len()
            )))
        }
    }
}

// ── LctHeader ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LctHeader {
    pub version:                 u8,
    /// C flag: the CCI field spans `32 * (C + 1)` bits.
    pub congestion_control_flag: u8,
    pub psi:                     u8,
    pub codepoint:               u8,
    pub cci:                     u128,
    pub tsi:                     u64,
    pub toi:                     u64,
    pub close_object:            bool,
    pub close_session:           bool,
    /// Carried in EXT_FDT; only present on FDT instance packets.
    pub fdt_instance_id:         Option<u32>,
    /// Every extension except EXT_FDT, in wire order.
    pub extensions:              Vec<HeaderExtension>,
}

/// Fields the demultiplexer needs without touching header extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LctSummary {
    pub tsi:           u64,
    pub toi:           u64,
    pub close_session: bool,
}

/// Smallest byte width usable for a TSI or TOI value (at least 16 bits).
fn field_width(value: u64) -> usize {
    match value {
        0..=0xFFFF                 => 2,
        0x1_0000..=0xFFFF_FFFF     => 4,
        0x1_0000_0000..=MAX_TSI    => 6,
        _                          => 8,
    }
}

impl LctHeader {
    pub fn new(tsi: u64, toi: u64, codepoint: u8) -> Self {
        Self {
            version: LCT_VERSION,
            congestion_control_flag: 0,
            psi: 0,
            codepoint,
            cci: 0,
            tsi,
            toi,
            close_object: false,
            close_session: false,
            fdt_instance_id: None,
            extensions: Vec::new(),
        }
    }

    /// Look up the first extension with the given HET.
    pub fn extension(&self, het: u8) -> Option<&HeaderExtension> {
        self.extensions.iter().find(|e| e.het == het)
    }

    fn cci_len(&self) -> usize {
        4 * (self.congestion_control_flag as usize + 1)
    }

    /// Returns `(s, o, h)` and the byte widths of TSI and TOI.
    fn id_layout(&self) -> (u32, u32, u32, usize, usize) {
        let tsi_len = field_width(self.tsi);
        let toi_len = field_width(self.toi);
        let h = (tsi_len % 4 == 2 || toi_len % 4 == 2) as u32;
        let pad = |len: usize| if h == 1 && len % 4 == 0 { len + 2 } else { len };
        let (tsi_len, toi_len) = (pad(tsi_len), pad(toi_len));
        let s = (tsi_len / 4) as u32;
        let o = (toi_len / 4) as u32;
        (s, o, h, tsi_len, toi_len)
    }

    /// Header length in 32-bit words, extensions included.
    pub fn header_length(&self) -> usize {
        let (_, _, _, tsi_len, toi_len) = self.id_layout();
        let ext: usize = self.extensions.iter().map(HeaderExtension::wire_len).sum::<usize>()
            + if self.fdt_instance_id.is_some() { 4 } else { 0 };
        (4 + self.cci_len() + tsi_len + toi_len + ext) / 4
    }

    pub fn write<W: Write>(&self, mut writer: W) -> Result<(), LctError> {
        if self.version > 0xF {
            return Err(LctError::FieldOverflow("version"));
        }
        if self.congestion_control_flag > 3 {
            return Err(LctError::FieldOverflow("congestion control flag"));
        }
        if self.psi > 3 {
            return Err(LctError::FieldOverflow("PSI"));
        }
        if self.tsi > MAX_TSI {
            return Err(LctError::FieldOverflow("TSI"));
        }
        let cci_len = self.cci_len();
        if cci_len < 16 && self.cci >> (cci_len * 8) != 0 {
            return Err(LctError::FieldOverflow("CCI"));
        }
        if let Some(id) = self.fdt_instance_id {
            if id > FDT_INSTANCE_ID_MASK {
                return Err(LctError::FieldOverflow("FDT instance id"));
            }
        }
        for ext in &self.extensions {
            ext.check()?;
        }
        let hdr_len = self.header_length();
        if hdr_len > u8::MAX as usize {
            return Err(LctError::FieldOverflow("header length"));
        }

        let (s, o, h, tsi_len, toi_len) = self.id_layout();
        let word = (self.version as u32) << 28
            | (self.congestion_control_flag as u32) << 26
            | (self.psi as u32) << 24
            | s << 23
            | o << 21
            | h << 20
            | (self.close_session as u32) << 17
            | (self.close_object as u32) << 16
            | (hdr_len as u32) << 8
            | self.codepoint as u32;
        writer.write_u32::<BigEndian>(word)?;
        writer.write_uint128::<BigEndian>(self.cci, cci_len)?;
        write_id(&mut writer, self.tsi, tsi_len)?;
        write_id(&mut writer, self.toi, toi_len)?;

        if let Some(id) = self.fdt_instance_id {
            writer.write_u8(EXT_FDT)?;
            writer.write_u24::<BigEndian>((FLUTE_VERSION as u32) << 20 | id)?;
        }
        for ext in &self.extensions {
            writer.write_u8(ext.het)?;
            if ext.het < 128 {
                writer.write_u8((ext.wire_len() / 4) as u8)?;
            }
            writer.write_all(&ext.content)?;
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>, LctError> {
        let mut out = Vec::with_capacity(self.header_length() * 4);
        self.write(&mut out)?;
        Ok(out)
    }

    /// Decode a header from the start of `data`.
    ///
    /// Returns the header and its length in bytes; the FEC payload id starts
    /// right after it.
    pub fn decode(data: &[u8]) -> Result<(Self, usize), LctError> {
        let fixed = parse_fixed(data)?;
        let hdr_bytes = fixed.hdr_len * 4;
        let mut header = LctHeader {
            version:                 fixed.version,
            congestion_control_flag: fixed.c,
            psi:                     fixed.psi,
            codepoint:               fixed.codepoint,
            cci:                     fixed.cci,
            tsi:                     fixed.tsi,
            toi:                     fixed.toi,
            close_object:            fixed.close_object,
            close_session:           fixed.close_session,
            fdt_instance_id:         None,
            extensions:              Vec::new(),
        };

        let mut pos = fixed.consumed;
        while pos < hdr_bytes {
            let het = data[pos];
            let len = if het >= 128 {
                4
            } else {
                let hel = *data.get(pos + 1).ok_or_else(|| {
                    LctError::MalformedHeader("truncated extension".into())
                })? as usize;
                if hel == 0 {
                    return Err(LctError::MalformedHeader(format!("extension HET={het} has HEL=0")));
                }
                hel * 4
            };
            if pos + len > hdr_bytes {
                return Err(LctError::MalformedHeader(format!(
                    "extension HET={het} overruns header length"
                )));
            }
            let content = &data[pos + if het >= 128 { 1 } else { 2 }..pos + len];
            if het == EXT_FDT {
                if header.fdt_instance_id.is_some() {
                    return Err(LctError::MalformedHeader("duplicate EXT_FDT".into()));
                }
                let value = (&content[..]).read_u24::<BigEndian>().map_err(truncated)?;
                let flute_version = (value >> 20) as u8;
                if flute_version != 1 && flute_version != FLUTE_VERSION {
                    return Err(LctError::MalformedHeader(format!(
                        "unknown FLUTE version {flute_version} in EXT_FDT"
                    )));
                }
                header.fdt_instance_id = Some(value & FDT_INSTANCE_ID_MASK);
            } else {
                header.extensions.push(HeaderExtension::new(het, content.to_vec()));
            }
            pos += len;
        }
        Ok((header, hdr_bytes))
    }
}

/// Read TSI, TOI and the close-session flag without parsing extensions.
pub fn peek(data: &[u8]) -> Result<LctSummary, LctError> {
    let fixed = parse_fixed(data)?;
    Ok(LctSummary {
        tsi:           fixed.tsi,
        toi:           fixed.toi,
        close_session: fixed.close_session,
    })
}

// ── helpers ──────────────────────────────────────────────────────────────────

struct FixedFields {
    version:       u8,
    c:             u8,
    psi:           u8,
    codepoint:     u8,
    hdr_len:       usize,
    cci:           u128,
    tsi:           u64,
    toi:           u64,
    close_object:  bool,
    close_session: bool,
    consumed:      usize,
}

fn parse_fixed(data: &[u8]) -> Result<FixedFields, LctError> {
    let mut rd = data;
    let word = rd.read_u32::<BigEndian>().map_err(truncated)?;
    let version = (word >> 28) as u8;
    if version != LCT_VERSION {
        return Err(LctError::UnsupportedVersion(version));
    }
    let c = ((word >> 26) & 0x3) as u8;
    let psi = ((word >> 24) & 0x3) as u8;
    let s = ((word >> 23) & 0x1) as usize;
    let o = ((word >> 21) & 0x3) as usize;
    let h = ((word >> 20) & 0x1) as usize;
    let hdr_len = ((word >> 8) & 0xFF) as usize;

    let cci_len = 4 * (c as usize + 1);
    let tsi_len = 4 * s + 2 * h;
    let toi_len = 4 * o + 2 * h;
    let consumed = 4 + cci_len + tsi_len + toi_len;
    if hdr_len * 4 < consumed {
        return Err(LctError::MalformedHeader(format!(
            "HDR_LEN {hdr_len} shorter than the {consumed} bytes of fixed fields"
        )));
    }
    if data.len() < hdr_len * 4 {
        return Err(LctError::MalformedHeader(format!(
            "packet of {} bytes shorter than HDR_LEN {hdr_len}", data.len()
        )));
    }

    let cci = rd.read_uint128::<BigEndian>(cci_len).map_err(truncated)?;
    let tsi = read_id(&mut rd, tsi_len, "TSI")?;
    let toi = read_id(&mut rd, toi_len, "TOI")?;

    Ok(FixedFields {
        version,
        c,
        psi,
        codepoint: (word & 0xFF) as u8,
        hdr_len,
        cci,
        tsi,
        toi,
        close_object:  (word >> 16) & 0x1 == 1,
        close_session: (word >> 17) & 0x1 == 1,
        consumed,
    })
}

fn read_id(rd: &mut &[u8], len: usize, what: &str) -> Result<u64, LctError> {
    if len == 0 {
        return Ok(0);
    }
    let value = rd.read_uint128::<BigEndian>(len).map_err(truncated)?;
    u64::try_from(value)
        .map_err(|_| LctError::MalformedHeader(format!("{what} wider than 64 bits")))
}

fn write_id<W: Write>(writer: &mut W, value: u64, len: usize) -> io::Result<()> {
    writer.write_uint128::<BigEndian>(value as u128, len)
}
