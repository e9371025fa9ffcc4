//! Shared fixtures for the session integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::thread;

use tandem::comm::CrossRankLink;
use tandem::{
    BlockKvCacheManager, CacheConfig, CacheExhausted, DType, KvCacheManager, ModelTopology,
    ReserveError, SessionConfig, WorldLayout,
};
use tandem_cpu::{ChannelLink, EndRule, ToyEngine};
use tandem_runtime::{GenerationInput, GenerationSession};

pub const VOCAB: usize = 32;
pub const END_ID: u32 = 0;
pub const ENGINE_SEED: u64 = 11;

pub type HostSession<L> = GenerationSession<ToyEngine, RecordingCache, L>;

pub fn topology() -> ModelTopology {
    ModelTopology {
        hidden_size: 64,
        num_layers: 6,
        num_heads: 4,
        num_kv_heads: Some(2),
        vocab_size: VOCAB,
        dtype: DType::F16,
        logits_dtype: DType::F32,
    }
}

pub fn config(max_batch_size: usize, num_micro_batches: usize) -> SessionConfig {
    let mut config = SessionConfig::new(max_batch_size, 2, 48);
    config.num_micro_batches = Some(num_micro_batches);
    config.cache = CacheConfig {
        tokens_per_block: 4,
        num_blocks: 256,
    };
    config.sync_timeout_ms = 2_000;
    config
}

/// Toy engine for `world` whose end token never wins.
pub fn engine(world: &WorldLayout) -> ToyEngine {
    engine_with_end(world, usize::MAX)
}

/// Toy engine whose end token wins once a row holds `after_position`
/// tokens.
pub fn engine_with_end(world: &WorldLayout, after_position: usize) -> ToyEngine {
    ToyEngine::new(VOCAB, ENGINE_SEED, world).with_end_rule(EndRule {
        token: END_ID,
        after_position,
    })
}

pub fn input(prompts: &[&[u32]], max_new_tokens: usize) -> GenerationInput {
    GenerationInput::new(
        prompts.iter().map(|p| p.to_vec()).collect(),
        END_ID,
        max_new_tokens,
    )
}

/// Single-process session.
pub fn single(config: SessionConfig, engine: ToyEngine) -> HostSession<tandem::LocalLink> {
    let cache = RecordingCache::new(&config.cache);
    GenerationSession::new(
        config,
        topology(),
        WorldLayout::single(),
        engine,
        cache,
        tandem::LocalLink::default(),
    )
    .unwrap()
}

/// Run `body` on every rank of a `pp`-stage pipeline, one thread per rank,
/// and return the per-rank results in rank order.
pub fn run_pipeline<L, R>(
    pp: usize,
    config: &SessionConfig,
    make_engine: impl Fn(&WorldLayout) -> ToyEngine + Sync,
    wrap_link: impl Fn(ChannelLink) -> L + Sync,
    body: impl Fn(&mut HostSession<L>) -> R + Sync,
) -> Vec<R>
where
    L: CrossRankLink,
    R: Send,
{
    let ranks: Vec<usize> = (0..pp).collect();
    let links = ChannelLink::group(&ranks, config.sync_timeout());
    let (make_engine, wrap_link, body) = (&make_engine, &wrap_link, &body);
    thread::scope(|scope| {
        let handles: Vec<_> = links
            .into_iter()
            .enumerate()
            .map(|(rank, link)| {
                scope.spawn(move || {
                    let world = WorldLayout::new(1, pp, rank).unwrap();
                    let mut session = GenerationSession::new(
                        config.clone(),
                        topology(),
                        world.clone(),
                        make_engine(&world),
                        RecordingCache::new(&config.cache),
                        wrap_link(link),
                    )
                    .unwrap()
                    .with_label(format!("stage{rank}"));
                    body(&mut session)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

/// Block cache manager that counts growth per slot.
#[derive(Debug)]
pub struct RecordingCache {
    inner: BlockKvCacheManager,
    extends: BTreeMap<usize, usize>,
    reserves: usize,
}

impl RecordingCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            inner: BlockKvCacheManager::new(config),
            extends: BTreeMap::new(),
            reserves: 0,
        }
    }

    /// Successful one-token extensions of `slot` so far.
    pub fn extends(&self, slot: usize) -> usize {
        self.extends.get(&slot).copied().unwrap_or(0)
    }

    /// Successful group reservations so far.
    pub fn reserves(&self) -> usize {
        self.reserves
    }

    pub fn num_sequences(&self) -> usize {
        self.inner.num_sequences()
    }

    pub fn num_free_blocks(&self) -> usize {
        self.inner.num_free_blocks()
    }
}

impl KvCacheManager for RecordingCache {
    fn reserve(
        &mut self,
        slots: &[usize],
        prompt_lens: &[usize],
        beam_width: usize,
    ) -> Result<(), ReserveError> {
        self.inner.reserve(slots, prompt_lens, beam_width)?;
        self.reserves += 1;
        Ok(())
    }

    fn extend(&mut self, slots: &[usize]) -> Result<(), CacheExhausted> {
        self.inner.extend(slots)?;
        for &slot in slots {
            *self.extends.entry(slot).or_default() += 1;
        }
        Ok(())
    }

    fn release(&mut self, slots: &[usize]) {
        self.inner.release(slots);
    }

    fn occupancy(&self, slot: usize) -> Option<usize> {
        self.inner.occupancy(slot)
    }
}
