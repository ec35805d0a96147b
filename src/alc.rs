//! ALC packet = LCT header + FEC payload id + encoding symbol.
//!
//! The LCT codepoint carries the FEC encoding id, which selects both the
//! FEC payload id layout and the EXT_FTI layout:
//!
//! | Scheme                 | Payload id           | EXT_FTI (after HET/HEL)              |
//! |------------------------|----------------------|--------------------------------------|
//! | No-Code (RFC 5445)     | SBN u16, ESI u16     | L u48, reserved u16, E u16, B u32    |
//! | RS GF(2^8) (RFC 5510)  | SBN u24, ESI u8      | L u48, E u16, B u8, max_n u8         |

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Write};
use thiserror::Error;

use crate::cenc::{parse_cenc, CencError, ContentEncoding};
use crate::lct::{HeaderExtension, LctError, LctHeader, EXT_CENC, EXT_FTI};
use crate::oti::{FecEncodingId, Oti, MAX_TRANSFER_LENGTH};

#[derive(Error, Debug)]
pub enum AlcError {
    #[error(transparent)]
    Lct(#[from] LctError),
    #[error("Unknown FEC encoding id {0} in codepoint")]
    UnknownCodepoint(u8),
    #[error("Malformed ALC packet: {0}")]
    Malformed(String),
    #[error("{0} does not fit the FEC payload id")]
    FieldOverflow(&'static str),
    #[error(transparent)]
    Cenc(#[from] CencError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlcPacket {
    pub lct:     LctHeader,
    pub sbn:     u32,
    pub esi:     u32,
    pub payload: Vec<u8>,
}

impl AlcPacket {
    pub fn fec_encoding_id(&self) -> Result<FecEncodingId, AlcError> {
        FecEncodingId::from_id(self.lct.codepoint)
            .ok_or(AlcError::UnknownCodepoint(self.lct.codepoint))
    }

    pub fn write<W: Write>(&self, mut writer: W) -> Result<(), AlcError> {
        let fec = self.fec_encoding_id()?;
        self.lct.write(&mut writer)?;
        match fec {
            FecEncodingId::NoCode => {
                let sbn = u16::try_from(self.sbn).map_err(|_| AlcError::FieldOverflow("SBN"))?;
                let esi = u16::try_from(self.esi).map_err(|_| AlcError::FieldOverflow("ESI"))?;
                writer.write_u16::<BigEndian>(sbn)?;
                writer.write_u16::<BigEndian>(esi)?;
            }
            FecEncodingId::ReedSolomonGf28 => {
                if self.sbn > 0xFF_FFFF {
                    return Err(AlcError::FieldOverflow("SBN"));
                }
                let esi = u8::try_from(self.esi).map_err(|_| AlcError::FieldOverflow("ESI"))?;
                writer.write_u24::<BigEndian>(self.sbn)?;
                writer.write_u8(esi)?;
            }
        }
        writer.write_all(&self.payload)?;
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>, AlcError> {
        let mut out = Vec::with_capacity(self.lct.header_length() * 4 + 4 + self.payload.len());
        self.write(&mut out)?;
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self, AlcError> {
        let (lct, hdr_len) = LctHeader::decode(data)?;
        let fec = FecEncodingId::from_id(lct.codepoint)
            .ok_or(AlcError::UnknownCodepoint(lct.codepoint))?;
        let mut rd = &data[hdr_len..];
        let short = |_: io::Error| AlcError::Malformed("truncated FEC payload id".into());
        let (sbn, esi) = match fec {
            FecEncodingId::NoCode => (
                rd.read_u16::<BigEndian>().map_err(short)? as u32,
                rd.read_u16::<BigEndian>().map_err(short)? as u32,
            ),
            FecEncodingId::ReedSolomonGf28 => (
                rd.read_u24::<BigEndian>().map_err(short)?,
                rd.read_u8().map_err(short)? as u32,
            ),
        };
        Ok(Self { lct, sbn, esi, payload: rd.to_vec() })
    }

    /// The OTI announced in EXT_FTI, if the packet carries one.
    pub fn fti(&self) -> Result<Option<Oti>, AlcError> {
        match self.lct.extension(EXT_FTI) {
            Some(ext) => parse_fti(self.fec_encoding_id()?, ext).map(Some),
            None => Ok(None),
        }
    }

    /// The content encoding announced in EXT_CENC, if present.
    pub fn cenc(&self) -> Result<Option<ContentEncoding>, AlcError> {
        match self.lct.extension(EXT_CENC) {
            Some(ext) => Ok(Some(parse_cenc(ext)?)),
            None => Ok(None),
        }
    }
}

// ── EXT_FTI ──────────────────────────────────────────────────────────────────

pub fn fti_extension(oti: &Oti) -> Result<HeaderExtension, AlcError> {
    if oti.transfer_length > MAX_TRANSFER_LENGTH {
        return Err(AlcError::FieldOverflow("transfer length"));
    }
    let mut content = Vec::with_capacity(14);
    content.write_u48::<BigEndian>(oti.transfer_length)?;
    match oti.fec_encoding_id {
        FecEncodingId::NoCode => {
            content.write_u16::<BigEndian>(0)?;
            content.write_u16::<BigEndian>(oti.encoding_symbol_length)?;
            content.write_u32::<BigEndian>(oti.max_source_block_length)?;
        }
        FecEncodingId::ReedSolomonGf28 => {
            let b = u8::try_from(oti.max_source_block_length)
                .map_err(|_| AlcError::FieldOverflow("max source block length"))?;
            let max_n = u8::try_from(oti.max_source_block_length + oti.max_number_of_parity_symbols as u32)
                .map_err(|_| AlcError::FieldOverflow("max encoding symbols"))?;
            content.write_u16::<BigEndian>(oti.encoding_symbol_length)?;
            content.write_u8(b)?;
            content.write_u8(max_n)?;
        }
    }
    Ok(HeaderExtension::new(EXT_FTI, content))
}

pub fn parse_fti(fec: FecEncodingId, ext: &HeaderExtension) -> Result<Oti, AlcError> {
    let malformed = |_: io::Error| AlcError::Malformed(format!("EXT_FTI too short for {}", fec.name()));
    let mut rd = &ext.content[..];
    let transfer_length = rd.read_u48::<BigEndian>().map_err(malformed)?;
    let oti = match fec {
        FecEncodingId::NoCode => {
            let _reserved = rd.read_u16::<BigEndian>().map_err(malformed)?;
            let e = rd.read_u16::<BigEndian>().map_err(malformed)?;
            let b = rd.read_u32::<BigEndian>().map_err(malformed)?;
            Oti::no_code(e, b)
        }
        FecEncodingId::ReedSolomonGf28 => {
            let e = rd.read_u16::<BigEndian>().map_err(malformed)?;
            let b = rd.read_u8().map_err(malformed)?;
            let max_n = rd.read_u8().map_err(malformed)?;
            let parity = max_n.checked_sub(b).ok_or_else(|| {
                AlcError::Malformed(format!("EXT_FTI max_n {max_n} below block length {b}"))
            })?;
            Oti::reed_solomon_gf28(e, b, parity)
        }
    };
    Ok(oti.with_transfer_length(transfer_length))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nocode_packet_layout() {
        let oti = Oti::no_code(1400, 64).with_transfer_length(5);
        let mut lct = LctHeader::new(1, 3, FecEncodingId::NoCode.id());
        lct.extensions.push(fti_extension(&oti).unwrap());
        let pkt = AlcPacket { lct, sbn: 0x0102, esi: 0x0304, payload: b"hello".to_vec() };
        let bytes = pkt.encode().unwrap();
        // 12 bytes of LCT, 16 of EXT_FTI, 4 of payload id
        assert_eq!(&bytes[12..14], &[EXT_FTI, 4]);
        assert_eq!(&bytes[28..32], &[1, 2, 3, 4]);
        assert_eq!(&bytes[32..], b"hello");

        let decoded = AlcPacket::decode(&bytes).unwrap();
        assert_eq!(decoded, pkt);
        assert_eq!(decoded.fti().unwrap(), Some(oti));
    }

    #[test]
    fn test_rs_payload_id_and_fti() {
        let oti = Oti::reed_solomon_gf28(512, 50, 10).with_transfer_length(123_456);
        let mut lct = LctHeader::new(1, 3, FecEncodingId::ReedSolomonGf28.id());
        let ext = fti_extension(&oti).unwrap();
        assert_eq!(ext.wire_len(), 12);
        lct.extensions.push(ext);
        let pkt = AlcPacket { lct, sbn: 0x0A0B0C, esi: 59, payload: vec![9; 512] };
        let decoded = AlcPacket::decode(&pkt.encode().unwrap()).unwrap();
        assert_eq!(decoded.sbn, 0x0A0B0C);
        assert_eq!(decoded.esi, 59);
        assert_eq!(decoded.fti().unwrap(), Some(oti));
    }

    #[test]
    fn test_cenc_extension() {
        let mut lct = LctHeader::new(1, 3, FecEncodingId::NoCode.id());
        let pkt = AlcPacket { lct: lct.clone(), sbn: 0, esi: 0, payload: vec![1] };
        assert_eq!(pkt.cenc().unwrap(), None);

        lct.extensions.push(crate::cenc::cenc_extension(ContentEncoding::Deflate));
        let bytes = AlcPacket { lct, sbn: 0, esi: 0, payload: vec![1] }.encode().unwrap();
        assert_eq!(&bytes[12..16], &[EXT_CENC, 2, 0, 0]);
        let decoded = AlcPacket::decode(&bytes).unwrap();
        assert_eq!(decoded.cenc().unwrap(), Some(ContentEncoding::Deflate));

        let mut bad = bytes.clone();
        bad[13] = 9;
        assert!(matches!(
            AlcPacket::decode(&bad).unwrap().cenc(),
            Err(AlcError::Cenc(CencError::UnknownId(9)))
        ));
    }

    #[test]
    fn test_payload_id_overflow() {
        let lct = LctHeader::new(1, 3, FecEncodingId::ReedSolomonGf28.id());
        let pkt = AlcPacket { lct, sbn: 0, esi: 256, payload: Vec::new() };
        assert!(matches!(pkt.encode(), Err(AlcError::FieldOverflow("ESI"))));
    }

    #[test]
    fn test_unknown_codepoint() {
        let bytes = LctHeader::new(1, 3, 42).encode().unwrap();
        assert!(matches!(AlcPacket::decode(&bytes), Err(AlcError::UnknownCodepoint(42))));
    }

    #[test]
    fn test_truncated_payload_id() {
        let mut bytes = LctHeader::new(1, 3, 0).encode().unwrap();
        bytes.extend_from_slice(&[0, 1]);
        assert!(matches!(AlcPacket::decode(&bytes), Err(AlcError::Malformed(_))));
    }
}
