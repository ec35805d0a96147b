//! FEC codec registry.
//!
//! A codec turns one source block into its encoding symbols (source symbols
//! first, then repair symbols) and rebuilds the block from any sufficient
//! subset.  The scheme is selected by [`FecEncodingId`]; the no-code scheme
//! is always available.
//!
//! # Symbol indexing
//! Symbol slices passed to [`FecCodec::decode`] are indexed by ESI and are
//! `symbol_count + nb_repair_symbols` long; missing symbols are `None`.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::oti::{FecEncodingId, Oti};
use crate::partition::BlockDescriptor;

mod reed_solomon;

pub use reed_solomon::ReedSolomonGf28Codec;

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum FecError {
    #[error("FEC encoding error: {0}")]
    Encode(String),
    #[error("FEC decoding error: {0}")]
    Decode(String),
    #[error("Block {sbn} does not hold enough symbols to decode")]
    NotDecodable { sbn: u32 },
}

// ── Codec trait ──────────────────────────────────────────────────────────────

pub trait FecCodec: Send + Sync {
    fn encoding_id(&self) -> FecEncodingId;

    /// Repair symbols sent after the source symbols of `block`.
    fn nb_repair_symbols(&self, block: &BlockDescriptor, oti: &Oti) -> u32;

    fn encode(&self, data: &[u8], block: &BlockDescriptor, oti: &Oti)
        -> Result<Vec<Vec<u8>>, FecError>;

    fn is_decodable(&self, symbols: &[Option<Vec<u8>>], block: &BlockDescriptor) -> bool;

    /// Exact length of symbol `esi` on the wire.  `None` accepts any length
    /// up to the encoding symbol length.
    fn symbol_len(&self, _block: &BlockDescriptor, _esi: u32, _oti: &Oti) -> Option<usize> {
        None
    }

    /// Rebuild the block; the result is exactly `block_byte_length` bytes.
    fn decode(&self, symbols: Vec<Option<Vec<u8>>>, block: &BlockDescriptor, oti: &Oti)
        -> Result<Vec<u8>, FecError>;
}

/// Split a block into symbols of `encoding_symbol_length` bytes.  An empty
/// block still yields one zero-length symbol.
pub(crate) fn split_symbols(data: &[u8], oti: &Oti) -> Vec<Vec<u8>> {
    if data.is_empty() {
        return vec![Vec::new()];
    }
    data.chunks(oti.encoding_symbol_length as usize).map(<[u8]>::to_vec).collect()
}

/// Length of unpadded source symbol `esi`: `E` except for the block's last
/// symbol, which holds the remainder.
pub(crate) fn source_symbol_len(block: &BlockDescriptor, esi: u32, oti: &Oti) -> Option<usize> {
    if esi >= block.symbol_count {
        return None;
    }
    let e = oti.encoding_symbol_length as u64;
    let start = esi as u64 * e;
    Some(e.min(block.block_byte_length.saturating_sub(start)) as usize)
}

/// Concatenate the source symbols of a block, truncated to its byte length.
pub(crate) fn join_source(symbols: &[Option<Vec<u8>>], block: &BlockDescriptor)
    -> Result<Vec<u8>, FecError>
{
    let mut out = Vec::with_capacity(block.block_byte_length as usize);
    for (esi, symbol) in symbols.iter().take(block.symbol_count as usize).enumerate() {
        match symbol {
            Some(s) => out.extend_from_slice(s),
            None => return Err(FecError::Decode(format!(
                "block {} missing source symbol {esi}", block.sbn
            ))),
        }
    }
    if (out.len() as u64) < block.block_byte_length {
        return Err(FecError::Decode(format!(
            "block {} rebuilt {} of {} bytes", block.sbn, out.len(), block.block_byte_length
        )));
    }
    out.truncate(block.block_byte_length as usize);
    Ok(out)
}

// ── Built-in codec implementations ──────────────────────────────────────────

pub struct NoCodeCodec;
impl FecCodec for NoCodeCodec {
    fn encoding_id(&self) -> FecEncodingId { FecEncodingId::NoCode }

    fn nb_repair_symbols(&self, _: &BlockDescriptor, _: &Oti) -> u32 { 0 }

    fn encode(&self, data: &[u8], _: &BlockDescriptor, oti: &Oti) -> Result<Vec<Vec<u8>>, FecError> {
        Ok(split_symbols(data, oti))
    }

    fn is_decodable(&self, symbols: &[Option<Vec<u8>>], block: &BlockDescriptor) -> bool {
        symbols.len() >= block.symbol_count as usize
            && symbols[..block.symbol_count as usize].iter().all(Option::is_some)
    }

    fn symbol_len(&self, block: &BlockDescriptor, esi: u32, oti: &Oti) -> Option<usize> {
        source_symbol_len(block, esi, oti)
    }

    fn decode(&self, symbols: Vec<Option<Vec<u8>>>, block: &BlockDescriptor, _: &Oti)
        -> Result<Vec<u8>, FecError>
    {
        join_source(&symbols, block)
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

/// Resolve an encoding id to a built-in codec.
pub fn get_codec(id: FecEncodingId) -> Arc<dyn FecCodec> {
    match id {
        FecEncodingId::NoCode          => Arc::new(NoCodeCodec),
        FecEncodingId::ReedSolomonGf28 => Arc::new(ReedSolomonGf28Codec),
    }
}

/// Table of codecs keyed by encoding id.  Starts with the built-ins;
/// [`FecRegistry::register`] swaps in another implementation of a scheme.
#[derive(Clone)]
pub struct FecRegistry {
    codecs: HashMap<FecEncodingId, Arc<dyn FecCodec>>,
}

impl FecRegistry {
    pub fn new() -> Self {
        let codecs = [FecEncodingId::NoCode, FecEncodingId::ReedSolomonGf28]
            .into_iter()
            .map(|id| (id, get_codec(id)))
            .collect();
        Self { codecs }
    }

    /// Install `codec` for its encoding id, returning the one it replaces.
    pub fn register(&mut self, codec: Arc<dyn FecCodec>) -> Option<Arc<dyn FecCodec>> {
        self.codecs.insert(codec.encoding_id(), codec)
    }

    pub fn get(&self, id: FecEncodingId) -> Arc<dyn FecCodec> {
        self.codecs.get(&id).cloned().unwrap_or_else(|| get_codec(id))
    }
}

impl Default for FecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.codecs.keys().map(|id| id.name()).collect();
        names.sort_unstable();
        f.debug_struct("FecRegistry").field("codecs", &names).finish()
    }
}
