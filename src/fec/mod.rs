#[cfg(test)]
mod fec_test;

use std::sync::Arc;

use bytes::Bytes;
use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::config::{MAX_CHUNK_SIZE, MAX_FEC_SHARDS};
use crate::error::{Error, Result};

/// ChunkLayout is the arithmetic core of the chunk codec: it maps an object
/// of `total_size` bytes onto the dense global chunk-id space.
///
/// Data chunks are numbered in object order; each group of K consecutive data
/// chunks forms an FEC block whose R parity chunks take the ids immediately
/// after the block's data ids. The final data chunk may be short, and the
/// final block may hold fewer than K data chunks; its missing shards are
/// conceptual zero padding that is never transmitted and never requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChunkLayout {
    pub(crate) total_size: u64,
    pub(crate) chunk_size: u32,
    pub(crate) fec_k: u8,
    pub(crate) fec_r: u8,
    pub(crate) data_chunks: u32,
    pub(crate) blocks: u32,
    pub(crate) total_chunks: u32,
}

/// Chunk-id geometry of one FEC block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockSpan {
    pub(crate) block: u32,
    /// First data chunk id of the block.
    pub(crate) data_start_id: u32,
    /// Real data chunks in the block (K except possibly the final block).
    pub(crate) data_count: u32,
    /// First parity chunk id of the block.
    pub(crate) parity_start_id: u32,
    pub(crate) parity_count: u32,
    /// Global data ordinal of the block's first data chunk (block * K).
    pub(crate) first_data_index: u32,
}

impl BlockSpan {
    /// Number of valid real chunks required before the block can be decoded:
    /// the conceptual pad shards are known zeros on both sides, so only the
    /// real data shards need recovering.
    pub(crate) fn decode_threshold(&self) -> u32 {
        self.data_count
    }

    pub(crate) fn end_id(&self) -> u32 {
        self.parity_start_id + self.parity_count
    }

    pub(crate) fn contains(&self, chunk_id: u32) -> bool {
        chunk_id >= self.data_start_id && chunk_id < self.end_id()
    }
}

impl ChunkLayout {
    pub(crate) fn new(total_size: u64, chunk_size: u32, fec_k: u8, fec_r: u8) -> Result<Self> {
        if total_size == 0 {
            return Err(Error::ErrInvalidArgument("total_size"));
        }
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::ErrInvalidArgument("chunk_size"));
        }
        if fec_k == 0 || u16::from(fec_k) + u16::from(fec_r) > MAX_FEC_SHARDS {
            return Err(Error::ErrInvalidArgument("fec parameters"));
        }

        let data_chunks = (total_size - 1) / u64::from(chunk_size) + 1;
        let blocks = (data_chunks - 1) / u64::from(fec_k) + 1;
        let total_chunks = data_chunks + blocks * u64::from(fec_r);
        if total_chunks > u64::from(u32::MAX) {
            return Err(Error::ErrObjectTooLarge);
        }

        Ok(ChunkLayout {
            total_size,
            chunk_size,
            fec_k,
            fec_r,
            data_chunks: data_chunks as u32,
            blocks: blocks as u32,
            total_chunks: total_chunks as u32,
        })
    }

    fn group(&self) -> u32 {
        u32::from(self.fec_k) + u32::from(self.fec_r)
    }

    pub(crate) fn block_of(&self, chunk_id: u32) -> u32 {
        debug_assert!(chunk_id < self.total_chunks);
        (chunk_id / self.group()).min(self.blocks - 1)
    }

    pub(crate) fn block_span(&self, block: u32) -> BlockSpan {
        debug_assert!(block < self.blocks);
        let data_start_id = block * self.group();
        let first_data_index = block * u32::from(self.fec_k);
        let data_count = if block + 1 == self.blocks {
            self.data_chunks - first_data_index
        } else {
            u32::from(self.fec_k)
        };
        BlockSpan {
            block,
            data_start_id,
            data_count,
            parity_start_id: data_start_id + data_count,
            parity_count: u32::from(self.fec_r),
            first_data_index,
        }
    }

    pub(crate) fn is_parity(&self, chunk_id: u32) -> bool {
        let span = self.block_span(self.block_of(chunk_id));
        chunk_id >= span.parity_start_id
    }

    /// Global data ordinal of a data chunk id.
    pub(crate) fn data_index(&self, chunk_id: u32) -> u32 {
        let span = self.block_span(self.block_of(chunk_id));
        debug_assert!(chunk_id < span.parity_start_id);
        span.first_data_index + (chunk_id - span.data_start_id)
    }

    /// Chunk id of a global data ordinal.
    pub(crate) fn data_id_of_index(&self, data_index: u32) -> u32 {
        debug_assert!(data_index < self.data_chunks);
        let block = data_index / u32::from(self.fec_k);
        let span = self.block_span(block);
        span.data_start_id + (data_index - span.first_data_index)
    }

    /// Byte range of a data chunk within the object.
    pub(crate) fn data_range(&self, chunk_id: u32) -> (u64, u64) {
        let index = u64::from(self.data_index(chunk_id));
        let start = index * u64::from(self.chunk_size);
        let end = (start + u64::from(self.chunk_size)).min(self.total_size);
        (start, end)
    }

    /// On-wire length of a chunk. Parity chunks are always full size; the
    /// final data chunk may be short.
    pub(crate) fn chunk_len(&self, chunk_id: u32) -> u32 {
        if self.is_parity(chunk_id) {
            return self.chunk_size;
        }
        let (start, end) = self.data_range(chunk_id);
        (end - start) as u32
    }
}

/// Builds the block coder shared by a Surface and its Receptions. `None` when
/// R = 0 (no parity, blocks complete only on full data).
pub(crate) fn new_block_coder(fec_k: u8, fec_r: u8) -> Result<Option<Arc<ReedSolomon>>> {
    if fec_r == 0 {
        return Ok(None);
    }
    let rs = ReedSolomon::new(usize::from(fec_k), usize::from(fec_r))
        .map_err(|e| Error::Other(format!("reed-solomon init: {e}")))?;
    Ok(Some(Arc::new(rs)))
}

/// Slice of the object backing a data chunk, at its exact on-wire length.
pub(crate) fn data_chunk(object: &Bytes, layout: &ChunkLayout, chunk_id: u32) -> Bytes {
    let (start, end) = layout.data_range(chunk_id);
    object.slice(start as usize..end as usize)
}

/// Data shard `data_index` of the object zero-padded to chunk_size; indexes
/// past the object's data chunks yield the conceptual all-zero pad shard.
pub(crate) fn padded_data_shard(object: &Bytes, layout: &ChunkLayout, data_index: u32) -> Vec<u8> {
    let mut shard = vec![0u8; layout.chunk_size as usize];
    if data_index < layout.data_chunks {
        let start = u64::from(data_index) * u64::from(layout.chunk_size);
        let end = (start + u64::from(layout.chunk_size)).min(layout.total_size);
        shard[..(end - start) as usize].copy_from_slice(&object[start as usize..end as usize]);
    }
    shard
}

/// Computes the R parity shards for one block. `data_shards` must hold K
/// shards of chunk_size bytes each (conceptual pad shards included).
pub(crate) fn encode_block_parity(
    rs: &ReedSolomon,
    mut data_shards: Vec<Vec<u8>>,
    chunk_size: u32,
    fec_r: u8,
) -> Result<Vec<Vec<u8>>> {
    let mut shards = Vec::with_capacity(data_shards.len() + usize::from(fec_r));
    shards.append(&mut data_shards);
    for _ in 0..fec_r {
        shards.push(vec![0u8; chunk_size as usize]);
    }
    rs.encode(&mut shards)
        .map_err(|e| Error::Other(format!("reed-solomon encode: {e}")))?;
    Ok(shards.split_off(shards.len() - usize::from(fec_r)))
}

/// Recovers the missing data shards of one block in place. `shards` must be
/// K + R entries, present ones at chunk_size bytes; at least K present.
pub(crate) fn reconstruct_block_data(
    rs: &ReedSolomon,
    shards: &mut [Option<Vec<u8>>],
) -> Result<()> {
    rs.reconstruct_data(shards)
        .map_err(|_| Error::ErrFecDecodeFailed)
}
