//! Fixtures shared by the tandem example programs.
//!
//! Run them with `cargo run -p tandem-examples --example <name>`.

use std::time::Duration;

use tandem_cpu::ChannelLink;

/// Links of every rank of a `tp × pp` world, indexed by global rank.
///
/// Ranks are laid out stage-major (`rank = stage * tp + tensor_rank`) and
/// each tensor rank gets its own pipeline group.
#[must_use]
pub fn rank_links(tp: usize, pp: usize, timeout: Duration) -> Vec<ChannelLink> {
    let mut links: Vec<Option<ChannelLink>> = (0..tp * pp).map(|_| None).collect();
    for tensor_rank in 0..tp {
        let group: Vec<usize> = (0..pp).map(|stage| stage * tp + tensor_rank).collect();
        for (link, rank) in ChannelLink::group(&group, timeout).into_iter().zip(group) {
            links[rank] = Some(link);
        }
    }
    links.into_iter().flatten().collect()
}

/// `batch` prompts of decreasing length, starting at `prompt_len`, with
/// tokens spread over `[0, vocab)` and never equal to `end_id`.
#[must_use]
pub fn synthetic_prompts(
    batch: usize,
    prompt_len: usize,
    vocab: usize,
    end_id: u32,
) -> Vec<Vec<u32>> {
    let span = vocab.saturating_sub(1).max(1);
    let end = end_id as usize;
    (0..batch)
        .map(|i| {
            let len = prompt_len - i % prompt_len.max(1);
            (0..len)
                .map(|j| {
                    let t = (i * 7 + j * 3) % span;
                    let t = if t >= end { t + 1 } else { t };
                    u32::try_from(t).unwrap_or(u32::MAX)
                })
                .collect()
        })
        .collect()
}
