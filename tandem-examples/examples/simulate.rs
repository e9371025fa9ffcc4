//! Multi-rank generation simulation
//!
//! Runs a generation session on every rank of a `tp × pp` group, one host
//! thread per rank, joined by in-process channel links. The model is the
//! deterministic toy engine, so the same flags always print the same tokens
//! whatever the pipeline depth, micro-batch count or capture setting.
//!
//! Usage:
//!   cargo run -p tandem-examples --example simulate -- --pp 2 --batch 4
//!   # Session settings from a JSON file, captured steps on:
//!   cargo run -p tandem-examples --example simulate -- \
//!     --config session.json --capture --log-level debug

use std::thread;
use std::time::Instant;

use clap::Parser;
use log::LevelFilter;

use tandem::{
    BlockKvCacheManager, DType, Error, ModelTopology, Result, SamplingConfig, SessionConfig,
    WorldLayout,
};
use tandem_cpu::{ChannelLink, EndRule, ToyEngine};
use tandem_examples::{rank_links, synthetic_prompts};
use tandem_runtime::{GenerationInput, GenerationOutput, GenerationSession, StepEvent};

const END_ID: u32 = 0;

/// Output lines and streamed token count of a first-stage rank.
type RankReport = Option<(Vec<String>, usize)>;

/// Pipeline-parallel generation on host threads
#[derive(Parser)]
#[command(name = "simulate")]
struct Cli {
    /// Tensor-parallel degree
    #[arg(long, default_value_t = 1)]
    tp: usize,

    /// Pipeline-parallel degree
    #[arg(long, default_value_t = 2)]
    pp: usize,

    /// Number of prompts
    #[arg(short, long, default_value_t = 4)]
    batch: usize,

    /// Length of the longest prompt
    #[arg(long, default_value_t = 6)]
    prompt_len: usize,

    /// Maximum tokens to generate per prompt
    #[arg(short = 'n', long, default_value_t = 16)]
    max_tokens: usize,

    /// Micro-batches per call (default: one per pipeline stage)
    #[arg(long)]
    micro_batches: Option<usize>,

    /// Beam width (beam search when > 1)
    #[arg(long, default_value_t = 1)]
    beams: usize,

    /// Record generation steps once and replay them
    #[arg(long)]
    capture: bool,

    /// One sampling stream per prompt instead of per micro-batch
    #[arg(long)]
    per_request: bool,

    /// Session configuration JSON; replaces the session flags above
    #[arg(short, long, env = "TANDEM_SESSION_CONFIG")]
    config: Option<String>,

    /// Vocabulary size of the toy model
    #[arg(long, default_value_t = 128)]
    vocab: usize,

    /// Transformer layers of the toy model
    #[arg(long, default_value_t = 8)]
    layers: usize,

    /// Make the end token win once a row holds this many tokens
    #[arg(long)]
    end_after: Option<usize>,

    /// Use greedy (argmax) decoding instead of sampling
    #[arg(long)]
    greedy: bool,

    /// Sampling temperature
    #[arg(short, long, default_value_t = 0.7)]
    temperature: f32,

    /// Nucleus sampling threshold
    #[arg(short = 'p', long, default_value_t = 0.9)]
    top_p: f32,

    /// RNG seed for sampling and for the toy model
    #[arg(short, long, default_value_t = 42)]
    seed: u64,

    /// Print each sequence as a JSON line
    #[arg(long)]
    json: bool,

    /// Log level: off, error, warn, info, debug or trace
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn session_config(&self) -> Result<SessionConfig> {
        if let Some(path) = &self.config {
            return SessionConfig::from_file(path);
        }
        let mut config =
            SessionConfig::new(self.batch, self.beams, self.prompt_len + self.max_tokens);
        config.num_micro_batches = self.micro_batches;
        config.reuse_captured_steps = self.capture;
        config.decoder_per_request = self.per_request;
        config.validate()?;
        Ok(config)
    }

    fn topology(&self) -> ModelTopology {
        ModelTopology {
            hidden_size: 256,
            num_layers: self.layers,
            num_heads: 8,
            num_kv_heads: Some(2),
            vocab_size: self.vocab,
            dtype: DType::BF16,
            logits_dtype: DType::F32,
        }
    }

    fn sampling(&self) -> SamplingConfig {
        if self.beams > 1 {
            return SamplingConfig::beam_search(self.beams);
        }
        SamplingConfig {
            temperature: (!self.greedy).then_some(self.temperature),
            top_p: self.top_p,
            seed: self.seed,
            ..SamplingConfig::default()
        }
    }

    fn input(&self) -> GenerationInput {
        let sequences = synthetic_prompts(self.batch, self.prompt_len, self.vocab, END_ID);
        GenerationInput::new(sequences, END_ID, self.max_tokens)
    }
}

/// Run one rank. First-stage ranks return their output lines.
fn run_rank(
    cli: &Cli,
    rank: usize,
    link: ChannelLink,
    config: &SessionConfig,
    input: &GenerationInput,
    sampling: &SamplingConfig,
) -> Result<RankReport> {
    let topology = cli.topology();
    let world = WorldLayout::new(cli.tp, cli.pp, rank)?;
    let mut engine = ToyEngine::new(topology.vocab_size, cli.seed, &world);
    if let Some(after_position) = cli.end_after {
        engine = engine.with_end_rule(EndRule {
            token: END_ID,
            after_position,
        });
    }
    let cache = BlockKvCacheManager::new(&config.cache);
    let mut session =
        GenerationSession::new(config.clone(), topology, world.clone(), engine, cache, link)?;

    let mut generated = 0;
    let mut output = GenerationOutput::with_callback(|event: &StepEvent| -> Result<()> {
        generated += event.tokens.iter().flatten().count();
        log::debug!(
            "rank {rank}: micro-batch {} step {} tokens {:?}{}",
            event.micro_batch,
            event.step,
            event.tokens,
            if event.finished { " (finished)" } else { "" }
        );
        Ok(())
    });
    session.generate(&mut output, input, sampling)?;

    if !world.is_first_pipeline_rank() {
        return Ok(None);
    }
    let mut lines = Vec::new();
    for seq in 0..output.num_sequences() {
        for beam in 0..output.beam_width() {
            let reason = output.finish_reason(seq, beam);
            let line = if cli.json {
                serde_json::json!({
                    "sequence": seq,
                    "beam": beam,
                    "prompt": &input.sequences[seq],
                    "generated": output.generated(seq, beam),
                    "finish_reason": reason.map(|r| format!("{r:?}")),
                })
                .to_string()
            } else {
                format!(
                    "[{seq}.{beam}] {:?} -> {:?} ({reason:?})",
                    &input.sequences[seq],
                    output.generated(seq, beam),
                )
            };
            lines.push(line);
        }
    }
    drop(output);
    Ok(Some((lines, generated)))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level: LevelFilter = cli
        .log_level
        .parse()
        .map_err(|_| Error::Configuration(format!("unknown log level \"{}\"", cli.log_level)))?;
    simple_logger::SimpleLogger::new()
        .with_level(level)
        .init()
        .map_err(|e| Error::Other(e.to_string()))?;

    let config = cli.session_config()?;
    let input = cli.input();
    let sampling = cli.sampling();
    let world_size = cli.tp * cli.pp;
    println!(
        "Simulating {world_size} ranks (tp={}, pp={}), {} prompts, up to {} new tokens",
        cli.tp,
        cli.pp,
        input.batch_size(),
        input.max_new_tokens
    );
    if let Some(t) = sampling.temperature {
        println!(
            "Sampling: temperature={t}, top_p={}, seed={}",
            sampling.top_p, sampling.seed
        );
    } else if sampling.beam_width > 1 {
        println!("Decoding: beam search (width {})", sampling.beam_width);
    } else {
        println!("Decoding: greedy (argmax)");
    }

    let links = rank_links(cli.tp, cli.pp, config.sync_timeout());
    let start = Instant::now();
    let results: Vec<Result<RankReport>> = thread::scope(|scope| {
        let handles: Vec<_> = links
            .into_iter()
            .enumerate()
            .map(|(rank, link)| {
                let (cli, config, input, sampling) = (&cli, &config, &input, &sampling);
                scope.spawn(move || run_rank(cli, rank, link, config, input, sampling))
            })
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(Error::Other(format!("rank {rank} panicked"))))
            })
            .collect()
    });
    let elapsed = start.elapsed();

    let mut report = None;
    for (rank, result) in results.into_iter().enumerate() {
        match result {
            Ok(Some(lines)) if report.is_none() => report = Some(lines),
            Ok(_) => {}
            Err(e) => {
                log::error!("rank {rank} failed: {e}");
                return Err(e);
            }
        }
    }

    if let Some((lines, generated)) = report {
        for line in &lines {
            println!("{line}");
        }
        println!(
            "Generated {generated} tokens in {:.3}s ({:.1} tokens/sec) on {world_size} ranks",
            elapsed.as_secs_f64(),
            generated as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        );
    }
    Ok(())
}
