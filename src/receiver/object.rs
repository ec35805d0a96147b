//! Per-TOI reassembly state.
//!
//! Symbols are stored by `(sbn, esi)` as they arrive, in any order.  A block
//! is handed to its FEC codec as soon as the codec reports it decodable; the
//! object completes once every block is decoded.  Packets that arrive before
//! the object's OTI is known are parked and replayed when it is.
//!
//! Block buffers are allocated when the block's first symbol arrives.  The
//! worst-case footprint of an OTI is checked against a byte limit before
//! anything is allocated for it.

use std::collections::HashMap;
use std::mem::size_of;
use std::sync::Arc;
use std::time::Instant;

use super::PacketError;
use crate::alc::AlcPacket;
use crate::cenc::ContentEncoding;
use crate::fec::{FecCodec, FecRegistry};
use crate::oti::Oti;
use crate::partition::{partition, BlockDescriptor, Layout};

const SLOT_BYTES:  u64 = size_of::<Option<Vec<u8>>>() as u64;
const BLOCK_BYTES: u64 = (size_of::<BlockDescriptor>() + size_of::<BlockState>()) as u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SymbolOutcome {
    Stored,
    Duplicate,
    /// Parked until the OTI is known.
    Pending,
    BlockDecoded,
    ObjectComplete,
    Rejected(String),
}

struct BlockState {
    /// Indexed by ESI: source symbols then repair symbols.
    symbols:  Vec<Option<Vec<u8>>>,
    received: usize,
    decoded:  Option<Vec<u8>>,
}

struct Decoder {
    oti:    Oti,
    layout: Layout,
    codec:  Arc<dyn FecCodec>,
    blocks: HashMap<u32, BlockState>,
}

/// Upper bound of the memory needed to reassemble an object with `oti`.
fn footprint(oti: &Oti) -> u64 {
    let e = oti.encoding_symbol_length.max(1) as u64;
    let symbols = oti.transfer_length.div_ceil(e).max(1);
    let blocks = symbols.div_ceil(oti.max_source_block_length.max(1) as u64);
    let slots = symbols.saturating_add(blocks.saturating_mul(oti.max_number_of_parity_symbols as u64));
    slots
        .saturating_mul(e + SLOT_BYTES)
        .saturating_add(blocks.saturating_mul(BLOCK_BYTES))
}

pub(crate) struct ObjectReceiver {
    pub toi:           u64,
    /// Content encoding announced by EXT_CENC on the object's packets.
    pub cenc:          Option<ContentEncoding>,
    decoder:           Option<Decoder>,
    pending:           Vec<AlcPacket>,
    max_pending:       usize,
    max_bytes:         u64,
    nb_decoded:        usize,
    pub last_activity: Instant,
}

impl ObjectReceiver {
    pub fn new(toi: u64, max_pending: usize, max_bytes: u64) -> Self {
        Self {
            toi,
            cenc: None,
            decoder: None,
            pending: Vec::new(),
            max_pending,
            max_bytes,
            nb_decoded: 0,
            last_activity: Instant::now(),
        }
    }

    pub fn oti(&self) -> Option<&Oti> {
        self.decoder.as_ref().map(|d| &d.oti)
    }

    pub fn is_complete(&self) -> bool {
        self.decoder.as_ref().is_some_and(|d| self.nb_decoded == d.layout.nb_blocks())
    }

    /// Fix the OTI and replay parked packets.  A second call is a no-op.
    pub fn set_oti(&mut self, oti: Oti, registry: &FecRegistry) -> Result<(), PacketError> {
        if self.decoder.is_some() {
            return Ok(());
        }
        oti.validate()?;
        let needed = footprint(&oti);
        if needed > self.max_bytes {
            return Err(PacketError::ObjectTooLarge { toi: self.toi, needed, limit: self.max_bytes });
        }
        let layout = partition(oti.transfer_length, &oti)?;
        let codec = registry.get(oti.fec_encoding_id);
        self.decoder = Some(Decoder { oti, layout, codec, blocks: HashMap::new() });

        for pkt in std::mem::take(&mut self.pending) {
            if let SymbolOutcome::Rejected(reason) = self.push(pkt) {
                tracing::debug!(toi = self.toi, reason = %reason, "parked packet rejected");
            }
        }
        Ok(())
    }

    pub fn push(&mut self, pkt: AlcPacket) -> SymbolOutcome {
        self.last_activity = Instant::now();
        let Some(dec) = self.decoder.as_mut() else {
            if self.pending.iter().any(|p| p.sbn == pkt.sbn && p.esi == pkt.esi) {
                return SymbolOutcome::Duplicate;
            }
            if self.pending.len() >= self.max_pending {
                return SymbolOutcome::Rejected(format!(
                    "{} packets already parked without OTI", self.pending.len()
                ));
            }
            self.pending.push(pkt);
            return SymbolOutcome::Pending;
        };

        let Some(block) = dec.layout.block(pkt.sbn).copied() else {
            return SymbolOutcome::Rejected(format!("SBN {} out of range", pkt.sbn));
        };
        let nb_slots = block.symbol_count + dec.codec.nb_repair_symbols(&block, &dec.oti);
        if pkt.esi >= nb_slots {
            return SymbolOutcome::Rejected(format!("ESI {} out of range in block {}", pkt.esi, pkt.sbn));
        }
        let max_len = dec.oti.encoding_symbol_length as usize;
        match dec.codec.symbol_len(&block, pkt.esi, &dec.oti) {
            Some(len) if pkt.payload.len() != len => {
                return SymbolOutcome::Rejected(format!(
                    "symbol ({}, {}) has {} bytes, expected {len}", pkt.sbn, pkt.esi, pkt.payload.len()
                ));
            }
            None if pkt.payload.len() > max_len => {
                return SymbolOutcome::Rejected(format!(
                    "symbol of {} bytes exceeds {max_len}", pkt.payload.len()
                ));
            }
            _ => {}
        }

        let state = dec.blocks.entry(pkt.sbn).or_insert_with(|| BlockState {
            symbols:  vec![None; nb_slots as usize],
            received: 0,
            decoded:  None,
        });
        if state.decoded.is_some() {
            return SymbolOutcome::Duplicate;
        }
        let slot = &mut state.symbols[pkt.esi as usize];
        if slot.is_some() {
            return SymbolOutcome::Duplicate;
        }
        *slot = Some(pkt.payload);
        state.received += 1;

        if !dec.codec.is_decodable(&state.symbols, &block) {
            return SymbolOutcome::Stored;
        }
        match dec.codec.decode(state.symbols.clone(), &block, &dec.oti) {
            Ok(data) => {
                state.decoded = Some(data);
                state.symbols = Vec::new();
                self.nb_decoded += 1;
                if self.is_complete() {
                    SymbolOutcome::ObjectComplete
                } else {
                    SymbolOutcome::BlockDecoded
                }
            }
            Err(e) => {
                tracing::debug!(
                    toi = self.toi, sbn = block.sbn, received = state.received, err = %e,
                    "block decode failed, discarding its symbols"
                );
                state.symbols.iter_mut().for_each(|s| *s = None);
                state.received = 0;
                SymbolOutcome::Stored
            }
        }
    }

    /// Concatenate decoded blocks.  `None` until the object is complete.
    pub fn take_data(&mut self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        let dec = self.decoder.as_mut()?;
        let mut out = Vec::with_capacity(dec.layout.transfer_length as usize);
        for sbn in 0..dec.layout.nb_blocks() as u32 {
            out.extend_from_slice(&dec.blocks.get_mut(&sbn)?.decoded.take()?);
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fec::{FecError, NoCodeCodec};
    use crate::lct::LctHeader;
    use crate::oti::FecEncodingId;
    use std::sync::atomic::{AtomicBool, Ordering};

    const LIMIT: u64 = 1 << 30;

    fn packet(sbn: u32, esi: u32, payload: &[u8]) -> AlcPacket {
        AlcPacket { lct: LctHeader::new(1, 5, 0), sbn, esi, payload: payload.to_vec() }
    }

    #[test]
    fn test_out_of_order_completion() {
        let registry = FecRegistry::new();
        let oti = Oti::no_code(2, 2).with_transfer_length(7);
        let mut obj = ObjectReceiver::new(5, 16, LIMIT);
        obj.set_oti(oti, &registry).unwrap();
        // blocks: [ab cd] [ef g]
        assert_eq!(obj.push(packet(1, 1, b"g")), SymbolOutcome::Stored);
        assert_eq!(obj.push(packet(0, 0, b"ab")), SymbolOutcome::Stored);
        assert_eq!(obj.push(packet(0, 0, b"ab")), SymbolOutcome::Duplicate);
        assert_eq!(obj.push(packet(1, 0, b"ef")), SymbolOutcome::BlockDecoded);
        assert_eq!(obj.push(packet(1, 0, b"ef")), SymbolOutcome::Duplicate);
        assert!(obj.take_data().is_none());
        assert_eq!(obj.push(packet(0, 1, b"cd")), SymbolOutcome::ObjectComplete);
        assert_eq!(obj.take_data().unwrap(), b"abcdefg");
    }

    #[test]
    fn test_parked_until_oti() {
        let registry = FecRegistry::new();
        let mut obj = ObjectReceiver::new(5, 1, LIMIT);
        assert_eq!(obj.push(packet(0, 0, b"hi")), SymbolOutcome::Pending);
        assert_eq!(obj.push(packet(0, 0, b"hi")), SymbolOutcome::Duplicate);
        assert!(matches!(obj.push(packet(0, 1, b"!")), SymbolOutcome::Rejected(_)));
        obj.set_oti(Oti::no_code(4, 4).with_transfer_length(2), &registry).unwrap();
        assert!(obj.is_complete());
        assert_eq!(obj.take_data().unwrap(), b"hi");
    }

    #[test]
    fn test_rejects_out_of_range() {
        let registry = FecRegistry::new();
        let mut obj = ObjectReceiver::new(5, 1, LIMIT);
        obj.set_oti(Oti::no_code(4, 4).with_transfer_length(8), &registry).unwrap();
        assert!(matches!(obj.push(packet(1, 0, b"xxxx")), SymbolOutcome::Rejected(_)));
        assert!(matches!(obj.push(packet(0, 2, b"xxxx")), SymbolOutcome::Rejected(_)));
        assert!(matches!(obj.push(packet(0, 0, b"xxxxx")), SymbolOutcome::Rejected(_)));
    }

    #[test]
    fn test_short_symbol_rejected_then_recovered() {
        let registry = FecRegistry::new();
        let mut obj = ObjectReceiver::new(5, 1, LIMIT);
        obj.set_oti(Oti::no_code(4, 4).with_transfer_length(6), &registry).unwrap();
        assert!(matches!(obj.push(packet(0, 0, b"abc")), SymbolOutcome::Rejected(_)));
        assert!(matches!(obj.push(packet(0, 1, b"e")), SymbolOutcome::Rejected(_)));
        assert_eq!(obj.push(packet(0, 0, b"abcd")), SymbolOutcome::Stored);
        assert_eq!(obj.push(packet(0, 1, b"ef")), SymbolOutcome::ObjectComplete);
        assert_eq!(obj.take_data().unwrap(), b"abcdef");
    }

    #[test]
    fn test_footprint_over_limit_rejected() {
        let registry = FecRegistry::new();
        let mut obj = ObjectReceiver::new(5, 1, 1 << 20);
        let oti = Oti::no_code(1, 65536).with_transfer_length(1 << 24);
        assert!(footprint(&oti) > 1 << 24);
        assert!(matches!(
            obj.set_oti(oti, &registry),
            Err(PacketError::ObjectTooLarge { toi: 5, limit, .. }) if limit == 1 << 20
        ));
        assert!(obj.oti().is_none());
    }

    #[test]
    fn test_blocks_allocated_on_first_symbol() {
        let registry = FecRegistry::new();
        let mut obj = ObjectReceiver::new(5, 1, LIMIT);
        obj.set_oti(Oti::no_code(1, 65536).with_transfer_length(1 << 24), &registry).unwrap();
        assert!(obj.decoder.as_ref().unwrap().blocks.is_empty());
        assert_eq!(obj.push(packet(3, 0, b"z")), SymbolOutcome::Stored);
        let blocks = &obj.decoder.as_ref().unwrap().blocks;
        assert_eq!(blocks.len(), 1);
        assert!(blocks.contains_key(&3));
    }

    /// Fails its first decode, then behaves like the no-code codec.
    struct FailOnce(AtomicBool);
    impl FecCodec for FailOnce {
        fn encoding_id(&self) -> FecEncodingId { FecEncodingId::NoCode }
        fn nb_repair_symbols(&self, b: &BlockDescriptor, o: &Oti) -> u32 { NoCodeCodec.nb_repair_symbols(b, o) }
        fn encode(&self, d: &[u8], b: &BlockDescriptor, o: &Oti) -> Result<Vec<Vec<u8>>, FecError> {
            NoCodeCodec.encode(d, b, o)
        }
        fn is_decodable(&self, s: &[Option<Vec<u8>>], b: &BlockDescriptor) -> bool {
            NoCodeCodec.is_decodable(s, b)
        }
        fn decode(&self, s: Vec<Option<Vec<u8>>>, b: &BlockDescriptor, o: &Oti) -> Result<Vec<u8>, FecError> {
            if self.0.swap(false, Ordering::SeqCst) {
                return Err(FecError::Decode("corrupt symbol".into()));
            }
            NoCodeCodec.decode(s, b, o)
        }
    }

    #[test]
    fn test_failed_decode_clears_block() {
        let mut registry = FecRegistry::new();
        registry.register(Arc::new(FailOnce(AtomicBool::new(true))));
        let mut obj = ObjectReceiver::new(5, 1, LIMIT);
        obj.set_oti(Oti::no_code(2, 4).with_transfer_length(4), &registry).unwrap();
        assert_eq!(obj.push(packet(0, 0, b"ab")), SymbolOutcome::Stored);
        assert_eq!(obj.push(packet(0, 1, b"cd")), SymbolOutcome::Stored);
        // both slots were emptied, so a repeat is not a duplicate
        assert_eq!(obj.push(packet(0, 0, b"ab")), SymbolOutcome::Stored);
        assert_eq!(obj.push(packet(0, 1, b"cd")), SymbolOutcome::ObjectComplete);
        assert_eq!(obj.take_data().unwrap(), b"abcd");
    }
}
