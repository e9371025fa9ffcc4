//! KV cache manager interface and the block-pool reference implementation.
//!
//! The session never touches cache memory; it only tells the manager how
//! much capacity each sequence slot needs: the prompt on admission, one more
//! token per live sequence per step, nothing after release. Slots are the
//! absolute sequence indices of the request, so a micro-batch always
//! addresses the same slots for the whole call.
//!
//! [`BlockKvCacheManager`] is CPU-side bookkeeping only: a LIFO pool of
//! fixed-size blocks plus one block table per beam.

#![allow(clippy::must_use_candidate)]

use std::collections::BTreeMap;

use thiserror::Error;

use crate::config::CacheConfig;

/// The cache could not provide the requested capacity.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("cache exhausted: requested {requested} blocks, {available} available")]
pub struct CacheExhausted {
    pub requested: usize,
    pub available: usize,
}

/// Why a group reservation was refused.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveError {
    #[error(transparent)]
    Exhausted(#[from] CacheExhausted),
    /// The slot still holds an earlier reservation.
    #[error("slot {0} already reserved")]
    AlreadyReserved(usize),
}

/// Capacity bookkeeping for per-sequence KV cache reservations.
pub trait KvCacheManager {
    /// Reserve `prompt_lens[i]` tokens for every beam of slot `slots[i]`.
    ///
    /// Admission is all-or-nothing: on error no slot in the group holds a
    /// reservation.
    ///
    /// # Errors
    /// Returns [`ReserveError::Exhausted`] if the group does not fit and
    /// [`ReserveError::AlreadyReserved`] if a slot is still held.
    fn reserve(
        &mut self,
        slots: &[usize],
        prompt_lens: &[usize],
        beam_width: usize,
    ) -> Result<(), ReserveError>;

    /// Grow every beam of each slot by exactly one token. All-or-nothing.
    ///
    /// # Errors
    /// Returns [`CacheExhausted`] if the growth does not fit.
    fn extend(&mut self, slots: &[usize]) -> Result<(), CacheExhausted>;

    /// Release the slots' reservations. Unknown slots are ignored.
    fn release(&mut self, slots: &[usize]);

    /// Tokens currently reserved for `slot` (per beam), if reserved.
    fn occupancy(&self, slot: usize) -> Option<usize>;
}

/// Pool of fixed-size KV cache blocks.
///
/// Each block is identified by an index in `[0, num_blocks)`. Free blocks
/// are kept on a stack (LIFO), so allocation and freeing are O(1).
#[derive(Debug)]
pub struct BlockPool {
    free_blocks: Vec<usize>,
    num_blocks: usize,
    tokens_per_block: usize,
}

impl BlockPool {
    /// Create a pool with every block free.
    ///
    /// # Panics
    /// Panics if `tokens_per_block` or `num_blocks` is zero.
    pub fn new(config: &CacheConfig) -> Self {
        assert!(config.tokens_per_block > 0, "tokens_per_block must be > 0");
        assert!(config.num_blocks > 0, "num_blocks must be > 0");
        Self {
            free_blocks: (0..config.num_blocks).collect(),
            num_blocks: config.num_blocks,
            tokens_per_block: config.tokens_per_block,
        }
    }

    /// Take one block, or `None` if the pool is exhausted.
    pub fn allocate(&mut self) -> Option<usize> {
        self.free_blocks.pop()
    }

    /// Return a block to the pool.
    ///
    /// # Panics
    /// Panics if `block` is out of range or already free.
    pub fn free(&mut self, block: usize) {
        assert!(
            block < self.num_blocks,
            "block index {block} out of range (num_blocks = {})",
            self.num_blocks,
        );
        assert!(
            !self.free_blocks.contains(&block),
            "double-free of block {block}",
        );
        self.free_blocks.push(block);
    }

    pub fn num_free(&self) -> usize {
        self.free_blocks.len()
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    pub fn tokens_per_block(&self) -> usize {
        self.tokens_per_block
    }

    /// `ceil(num_tokens / tokens_per_block)`.
    pub fn blocks_needed(&self, num_tokens: usize) -> usize {
        num_tokens.div_ceil(self.tokens_per_block)
    }
}

/// Logical-to-physical block mapping for one beam of one sequence.
#[derive(Debug, Clone, Default)]
pub struct BlockTable {
    blocks: Vec<usize>,
    seq_len: usize,
}

impl BlockTable {
    /// Physical block indices in logical order.
    pub fn blocks(&self) -> &[usize] {
        &self.blocks
    }

    /// Tokens stored.
    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Whether storing one more token requires another block.
    pub fn needs_new_block(&self, tokens_per_block: usize) -> bool {
        self.seq_len == self.blocks.len() * tokens_per_block
    }
}

/// Reference [`KvCacheManager`] over a [`BlockPool`].
#[derive(Debug)]
pub struct BlockKvCacheManager {
    pool: BlockPool,
    /// slot → one table per beam
    sequences: BTreeMap<usize, Vec<BlockTable>>,
}

impl BlockKvCacheManager {
    /// # Panics
    /// Panics if the configuration has a zero block size or pool size.
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            pool: BlockPool::new(config),
            sequences: BTreeMap::new(),
        }
    }

    pub fn num_free_blocks(&self) -> usize {
        self.pool.num_free()
    }

    pub fn num_sequences(&self) -> usize {
        self.sequences.len()
    }

    /// Block table of one beam of a reserved slot.
    pub fn block_table(&self, slot: usize, beam: usize) -> Option<&BlockTable> {
        self.sequences.get(&slot).and_then(|beams| beams.get(beam))
    }

    fn exhausted(&self, requested: usize) -> CacheExhausted {
        CacheExhausted {
            requested,
            available: self.pool.num_free(),
        }
    }
}

impl KvCacheManager for BlockKvCacheManager {
    fn reserve(
        &mut self,
        slots: &[usize],
        prompt_lens: &[usize],
        beam_width: usize,
    ) -> Result<(), ReserveError> {
        assert_eq!(slots.len(), prompt_lens.len(), "one prompt length per slot");
        if let Some(&held) = slots.iter().find(|&&s| self.sequences.contains_key(&s)) {
            return Err(ReserveError::AlreadyReserved(held));
        }

        let requested: usize = prompt_lens
            .iter()
            .map(|&len| beam_width * self.pool.blocks_needed(len))
            .sum();
        if requested > self.pool.num_free() {
            return Err(self.exhausted(requested).into());
        }

        for (&slot, &len) in slots.iter().zip(prompt_lens) {
            let per_beam = self.pool.blocks_needed(len);
            let beams = (0..beam_width)
                .map(|_| BlockTable {
                    // Capacity was checked above.
                    blocks: (0..per_beam).filter_map(|_| self.pool.allocate()).collect(),
                    seq_len: len,
                })
                .collect();
            self.sequences.insert(slot, beams);
        }
        Ok(())
    }

    fn extend(&mut self, slots: &[usize]) -> Result<(), CacheExhausted> {
        let tpb = self.pool.tokens_per_block();
        let requested: usize = slots
            .iter()
            .map(|slot| {
                let beams = self
                    .sequences
                    .get(slot)
                    .unwrap_or_else(|| panic!("extend of unreserved slot {slot}"));
                beams.iter().filter(|t| t.needs_new_block(tpb)).count()
            })
            .sum();
        if requested > self.pool.num_free() {
            return Err(self.exhausted(requested));
        }

        for slot in slots {
            if let Some(beams) = self.sequences.get_mut(slot) {
                for table in beams.iter_mut() {
                    if table.needs_new_block(tpb) {
                        if let Some(block) = self.pool.allocate() {
                            table.blocks.push(block);
                        }
                    }
                    table.seq_len += 1;
                }
            }
        }
        Ok(())
    }

    fn release(&mut self, slots: &[usize]) {
        for slot in slots {
            if let Some(beams) = self.sequences.remove(slot) {
                for table in beams {
                    for block in table.blocks {
                        self.pool.free(block);
                    }
                }
            }
        }
    }

    fn occupancy(&self, slot: usize) -> Option<usize> {
        self.sequences
            .get(&slot)
            .and_then(|beams| beams.first())
            .map(BlockTable::seq_len)
    }
}
