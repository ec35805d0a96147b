//! Systematic Reed-Solomon over GF(2^8) (RFC 5510).
//!
//! Source symbols are zero-padded to the encoding symbol length so every
//! shard has the same size; the padding is cut again on decode.

use reed_solomon_erasure::galois_8::ReedSolomon;

use super::{join_source, source_symbol_len, split_symbols, FecCodec, FecError};
use crate::oti::{FecEncodingId, Oti};
use crate::partition::BlockDescriptor;

pub struct ReedSolomonGf28Codec;

impl ReedSolomonGf28Codec {
    fn instance(block: &BlockDescriptor, parity: usize) -> Result<ReedSolomon, String> {
        ReedSolomon::new(block.symbol_count as usize, parity).map_err(|e| {
            tracing::debug!(
                sbn = block.sbn,
                num_data = block.symbol_count,
                num_coding = parity,
                err = ?e,
                "FEC: failed to create ReedSolomon instance"
            );
            format!("{e:?}")
        })
    }
}

impl FecCodec for ReedSolomonGf28Codec {
    fn encoding_id(&self) -> FecEncodingId { FecEncodingId::ReedSolomonGf28 }

    fn nb_repair_symbols(&self, block: &BlockDescriptor, oti: &Oti) -> u32 {
        if block.block_byte_length == 0 { 0 } else { oti.max_number_of_parity_symbols as u32 }
    }

    fn encode(&self, data: &[u8], block: &BlockDescriptor, oti: &Oti) -> Result<Vec<Vec<u8>>, FecError> {
        let parity = self.nb_repair_symbols(block, oti) as usize;
        let e = oti.encoding_symbol_length as usize;
        let mut shards = split_symbols(data, oti);
        if parity == 0 {
            return Ok(shards);
        }
        for shard in shards.iter_mut() {
            shard.resize(e, 0);
        }
        shards.extend((0..parity).map(|_| vec![0u8; e]));
        let rs = Self::instance(block, parity).map_err(FecError::Encode)?;
        rs.encode(&mut shards).map_err(|e| FecError::Encode(format!("{e:?}")))?;
        Ok(shards)
    }

    fn is_decodable(&self, symbols: &[Option<Vec<u8>>], block: &BlockDescriptor) -> bool {
        symbols.iter().filter(|s| s.is_some()).count() >= block.symbol_count as usize
    }

    /// Without parity the block travels unpadded, like the no-code scheme.
    fn symbol_len(&self, block: &BlockDescriptor, esi: u32, oti: &Oti) -> Option<usize> {
        if self.nb_repair_symbols(block, oti) == 0 {
            source_symbol_len(block, esi, oti)
        } else {
            Some(oti.encoding_symbol_length as usize)
        }
    }

    fn decode(&self, mut symbols: Vec<Option<Vec<u8>>>, block: &BlockDescriptor, oti: &Oti)
        -> Result<Vec<u8>, FecError>
    {
        let k = block.symbol_count as usize;
        if symbols.len() >= k && symbols[..k].iter().all(Option::is_some) {
            return join_source(&symbols, block);
        }
        if !self.is_decodable(&symbols, block) {
            return Err(FecError::NotDecodable { sbn: block.sbn });
        }

        let parity = symbols.len().saturating_sub(k);
        let e = oti.encoding_symbol_length as usize;
        for shard in symbols.iter_mut().flatten() {
            shard.resize(e, 0);
        }
        let rs = Self::instance(block, parity).map_err(FecError::Decode)?;
        if let Err(err) = rs.reconstruct_data(&mut symbols) {
            tracing::debug!(
                sbn = block.sbn,
                num_data = k,
                num_coding = parity,
                err = ?err,
                "FEC: RS reconstruction failed"
            );
            return Err(FecError::Decode(format!("{err:?}")));
        }
        join_source(&symbols, block)
    }
}
