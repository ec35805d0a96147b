//! Block partitioning (RFC 5052 §9.1).
//!
//! An object of `L` bytes is cut into `N = ceil(L / E)` source symbols which
//! are spread over `B = ceil(N / max_source_block_length)` blocks.  Block
//! sizes differ by at most one symbol; the larger blocks come first.  Sender
//! and receiver run the same arithmetic, so the layout is never transmitted.

use crate::oti::{Oti, OtiError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockDescriptor {
    pub sbn:               u32,
    /// Source symbols in this block.
    pub symbol_count:      u32,
    pub block_byte_length: u64,
    /// Offset of the block's first byte within the object.
    pub offset:            u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub transfer_length:        u64,
    pub encoding_symbol_length: u16,
    pub blocks:                 Vec<BlockDescriptor>,
}

pub fn partition(transfer_length: u64, oti: &Oti) -> Result<Layout, OtiError> {
    let e = oti.encoding_symbol_length as u64;
    let max_block = oti.max_source_block_length as u64;
    if e == 0 || max_block == 0 {
        return Err(OtiError::InvalidOti(format!(
            "cannot partition with symbol length {e} and block length {max_block}"
        )));
    }

    if transfer_length == 0 {
        return Ok(Layout {
            transfer_length,
            encoding_symbol_length: oti.encoding_symbol_length,
            blocks: vec![BlockDescriptor { sbn: 0, symbol_count: 1, block_byte_length: 0, offset: 0 }],
        });
    }

    let nb_symbols = transfer_length.div_ceil(e);
    let nb_blocks = nb_symbols.div_ceil(max_block);
    if nb_blocks > oti.fec_encoding_id.max_source_blocks() {
        return Err(OtiError::InvalidOti(format!(
            "{nb_blocks} source blocks exceed the {} scheme limit",
            oti.fec_encoding_id.name()
        )));
    }

    let large = nb_symbols.div_ceil(nb_blocks);
    let small = nb_symbols / nb_blocks;
    let nb_large = nb_symbols - small * nb_blocks;

    let mut blocks = Vec::with_capacity(nb_blocks as usize);
    let mut offset = 0u64;
    for sbn in 0..nb_blocks {
        let symbol_count = if sbn < nb_large { large } else { small };
        let block_byte_length = (symbol_count * e).min(transfer_length - offset);
        blocks.push(BlockDescriptor {
            sbn: sbn as u32,
            symbol_count: symbol_count as u32,
            block_byte_length,
            offset,
        });
        offset += block_byte_length;
    }

    Ok(Layout { transfer_length, encoding_symbol_length: oti.encoding_symbol_length, blocks })
}

impl Layout {
    pub fn block(&self, sbn: u32) -> Option<&BlockDescriptor> {
        self.blocks.get(sbn as usize)
    }

    pub fn nb_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Total number of source symbols.
    pub fn nb_symbols(&self) -> u64 {
        self.blocks.iter().map(|b| b.symbol_count as u64).sum()
    }

    /// Byte range `(offset, len)` of a source symbol within the object.
    pub fn symbol_range(&self, sbn: u32, esi: u32) -> Option<(u64, usize)> {
        let block = self.block(sbn)?;
        if esi >= block.symbol_count {
            return None;
        }
        let e = self.encoding_symbol_length as u64;
        let start = block.offset + esi as u64 * e;
        let end = (start + e).min(block.offset + block.block_byte_length);
        Some((start, (end - start) as usize))
    }

    pub fn symbol_len(&self, sbn: u32, esi: u32) -> Option<usize> {
        self.symbol_range(sbn, esi).map(|(_, len)| len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_small_object() {
        let layout = partition(5, &Oti::no_code(1400, 64)).unwrap();
        assert_eq!(layout.nb_blocks(), 1);
        assert_eq!(layout.blocks[0].symbol_count, 1);
        assert_eq!(layout.symbol_len(0, 0), Some(5));
        assert_eq!(layout.symbol_len(0, 1), None);
    }

    #[test]
    fn test_empty_object() {
        let layout = partition(0, &Oti::no_code(1400, 64)).unwrap();
        assert_eq!(layout.blocks, vec![BlockDescriptor {
            sbn: 0, symbol_count: 1, block_byte_length: 0, offset: 0,
        }]);
        assert_eq!(layout.symbol_len(0, 0), Some(0));
    }

    #[test]
    fn test_even_distribution_large_first() {
        // 10 symbols, at most 4 per block -> 3 blocks of 4, 3, 3
        let layout = partition(10 * 100 - 30, &Oti::no_code(100, 4)).unwrap();
        let counts: Vec<u32> = layout.blocks.iter().map(|b| b.symbol_count).collect();
        assert_eq!(counts, vec![4, 3, 3]);
        assert_eq!(layout.blocks[1].offset, 400);
        assert_eq!(layout.blocks[2].block_byte_length, 270);
        assert_eq!(layout.symbol_len(2, 2), Some(70));
        assert_eq!(layout.nb_symbols(), 10);
    }

    #[test]
    fn test_rejects_degenerate_oti() {
        assert!(partition(10, &Oti::no_code(0, 4)).is_err());
        assert!(partition(10, &Oti::no_code(4, 0)).is_err());
    }

    #[test]
    fn test_rejects_too_many_blocks() {
        assert!(partition((1 << 16) + 1, &Oti::no_code(1, 1)).is_err());
    }
}
