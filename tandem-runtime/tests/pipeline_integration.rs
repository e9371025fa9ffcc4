//! Multi-rank generation: one session per rank on its own thread, joined by
//! in-process channel links.

mod test_helpers;

use std::thread;
use std::time::{Duration, Instant};

use tandem::comm::{CrossRankLink, Payload, StopFlag, SyncEvent};
use tandem::{Error, FinishReason, Result, SamplingConfig, SessionConfig, WorldLayout};
use tandem_cpu::{ChannelLink, FaultPlan, ToyEngine};
use tandem_runtime::{
    DecoderState, GenerationInput, GenerationOutput, GenerationRun, GenerationSession,
    MicroBatchStepper, StepEvent,
};

use test_helpers::{
    config, engine, engine_with_end, input, run_pipeline, single, topology, HostSession,
    RecordingCache,
};

fn greedy() -> SamplingConfig {
    SamplingConfig::greedy()
}

fn prompts() -> GenerationInput {
    input(&[&[1, 2, 3], &[4, 5, 6, 7, 8], &[9], &[10, 11]], 5)
}

/// What one rank saw of a call.
struct Outcome {
    result: Result<()>,
    ids: Vec<Vec<u32>>,
    reasons: Vec<Option<FinishReason>>,
    reserved: usize,
}

fn generate_on<L: CrossRankLink>(
    session: &mut HostSession<L>,
    input: &GenerationInput,
    sampling: &SamplingConfig,
) -> Outcome {
    let mut out = GenerationOutput::new();
    let result = session.generate(&mut out, input, sampling);
    Outcome {
        result,
        ids: out.padded_ids(),
        reasons: (0..out.num_sequences())
            .map(|s| out.finish_reason(s, 0))
            .collect(),
        reserved: session.cache().num_sequences(),
    }
}

fn single_process(config: &SessionConfig, input: &GenerationInput) -> Vec<Vec<u32>> {
    let mut session = single(config.clone(), engine(&WorldLayout::single()));
    let outcome = generate_on(&mut session, input, &greedy());
    outcome.result.unwrap();
    outcome.ids
}

/// Generated tokens of `seq` in the first stage's padded output. The toy
/// engine never emits the pad id.
fn generated_len(outcome: &Outcome, input: &GenerationInput, seq: usize) -> usize {
    outcome.ids[seq]
        .iter()
        .skip(input.sequences[seq].len())
        .take_while(|&&t| t != input.pad_id)
        .count()
}

fn same_link(link: ChannelLink) -> ChannelLink {
    link
}

// ---------------------------------------------------------------------------
// Agreement with a single process
// ---------------------------------------------------------------------------

#[test]
fn pipeline_matches_single_process() {
    let input = prompts();
    let baseline = single_process(&config(4, 1), &input);

    for pp in [2, 3] {
        for reuse in [false, true] {
            let mut config = config(4, 1);
            config.num_micro_batches = None;
            config.reuse_captured_steps = reuse;

            let outcomes = run_pipeline(pp, &config, engine, same_link, |session| {
                assert_eq!(session.num_micro_batches(), pp);
                generate_on(session, &input, &greedy())
            });

            for (rank, outcome) in outcomes.iter().enumerate() {
                assert!(outcome.result.is_ok(), "rank {rank}: {:?}", outcome.result);
                assert_eq!(outcome.reserved, 0);
            }
            // Only the first stage writes the output.
            assert_eq!(outcomes[0].ids, baseline, "pp={pp} reuse={reuse}");
            assert!(outcomes[1..].iter().all(|o| o.ids.is_empty()));
        }
    }
}

/// Drive a run one micro-batch step at a time, recording the decoder state
/// after every step.
fn step_through<S>(
    stepper: &mut S,
    input: &GenerationInput,
    output: &mut GenerationOutput<'_>,
) -> Vec<(usize, usize, DecoderState)>
where
    S: MicroBatchStepper<Run = GenerationRun>,
{
    let mut run = stepper.start(input, &greedy()).unwrap();
    let mut snapshots = Vec::new();
    while !run.is_finished() {
        for mb in 0..run.num_micro_batches() {
            if run.micro_batches()[mb].is_finished() {
                continue;
            }
            stepper.advance(&mut run, mb, output).unwrap();
            let state = &run.micro_batches()[mb];
            snapshots.push((mb, state.steps(), state.decoder().clone()));
        }
    }
    stepper.finish(run, output).unwrap();
    snapshots
}

#[test]
fn decoder_states_match_after_every_step() {
    let config = config(4, 2);
    let input = prompts();
    let results = run_pipeline(
        2,
        &config,
        |world| engine_with_end(world, 7),
        same_link,
        |session| {
            let mut out = GenerationOutput::new();
            let snapshots = step_through(session, &input, &mut out);
            (snapshots, out.padded_ids())
        },
    );

    let (receiver, sampler) = (&results[0], &results[1]);
    assert!(!receiver.0.is_empty());
    assert_eq!(receiver.0.len(), sampler.0.len());
    for (mirror, local) in receiver.0.iter().zip(&sampler.0) {
        assert_eq!(mirror, local, "micro-batch {} step {}", local.0, local.1);
    }
    assert!(!receiver.1.is_empty());
    assert!(sampler.1.is_empty());
}

#[test]
fn two_by_two_grid_matches_single_process() {
    let config = config(4, 2);
    let input = prompts();
    let baseline = single_process(&config, &input);

    // Stage-major ranks: tensor rank 0 pipelines ranks {0, 2}, tensor rank 1
    // pipelines ranks {1, 3}.
    let mut links: Vec<Option<ChannelLink>> = (0..4).map(|_| None).collect();
    for group in [[0, 2], [1, 3]] {
        for link in ChannelLink::group(&group, config.sync_timeout()) {
            let rank = link.rank();
            links[rank] = Some(link);
        }
    }

    let outcomes: Vec<Outcome> = thread::scope(|scope| {
        let handles: Vec<_> = links
            .into_iter()
            .enumerate()
            .map(|(rank, link)| {
                let (config, input) = (&config, &input);
                scope.spawn(move || {
                    let world = WorldLayout::new(2, 2, rank).unwrap();
                    let mut session = GenerationSession::new(
                        config.clone(),
                        topology(),
                        world.clone(),
                        engine(&world),
                        RecordingCache::new(&config.cache),
                        link.unwrap(),
                    )
                    .unwrap();
                    generate_on(&mut session, input, &greedy())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for outcome in &outcomes {
        assert!(outcome.result.is_ok());
    }
    assert_eq!(outcomes[0].ids, baseline);
    assert_eq!(outcomes[1].ids, baseline);
    assert!(outcomes[2].ids.is_empty());
    assert!(outcomes[3].ids.is_empty());
}

// ---------------------------------------------------------------------------
// Stop consensus
// ---------------------------------------------------------------------------

/// Link that replaces one rank's stop-flag contribution at one broadcast.
struct OverrideFlag {
    inner: ChannelLink,
    at: Option<usize>,
    flag: StopFlag,
    broadcasts: usize,
}

impl OverrideFlag {
    fn wrap(target_rank: usize, at: usize, flag: StopFlag) -> impl Fn(ChannelLink) -> Self + Sync {
        move |inner| Self {
            at: (inner.rank() == target_rank).then_some(at),
            inner,
            flag,
            broadcasts: 0,
        }
    }
}

impl CrossRankLink for OverrideFlag {
    fn rank(&self) -> usize {
        self.inner.rank()
    }

    fn send_async(&mut self, peer: usize, payload: Payload) -> Result<SyncEvent> {
        self.inner.send_async(peer, payload)
    }

    fn recv_async(&mut self, peer: usize) -> Result<SyncEvent> {
        self.inner.recv_async(peer)
    }

    fn wait(&mut self, event: SyncEvent) -> Result<Option<Payload>> {
        self.inner.wait(event)
    }

    fn discard(&mut self, event: SyncEvent) {
        self.inner.discard(event);
    }

    fn broadcast_flag(&mut self, root: usize, flag: StopFlag) -> Result<StopFlag> {
        let flag = if self.at == Some(self.broadcasts) {
            self.flag
        } else {
            flag
        };
        self.broadcasts += 1;
        self.inner.broadcast_flag(root, flag)
    }
}

#[test]
fn non_final_stop_view_is_overruled() {
    let config = config(4, 2);
    let input = prompts();
    let baseline = single_process(&config, &input);

    // Rank 0 claims micro-batch 1 is done after its first step.
    let outcomes = run_pipeline(
        2,
        &config,
        engine,
        OverrideFlag::wrap(0, 1, StopFlag::Stop),
        |session| generate_on(session, &input, &greedy()),
    );
    assert!(outcomes.iter().all(|o| o.result.is_ok()));
    assert_eq!(outcomes[0].ids, baseline);
}

#[test]
fn final_stage_stop_decision_wins() {
    let config = config(4, 2);
    let input = prompts();

    // The final stage stops micro-batch 0 (sequences 0 and 1) after step 0
    // although its rows are still live.
    let outcomes = run_pipeline(
        2,
        &config,
        engine,
        OverrideFlag::wrap(1, 0, StopFlag::Stop),
        |session| generate_on(session, &input, &greedy()),
    );
    for outcome in &outcomes {
        assert!(outcome.result.is_ok(), "{:?}", outcome.result);
        assert_eq!(outcome.reserved, 0);
    }
    let first = &outcomes[0];
    for seq in 0..2 {
        assert_eq!(first.reasons[seq], Some(FinishReason::Aborted));
        assert_eq!(generated_len(first, &input, seq), 1);
    }
    for seq in 2..4 {
        assert_eq!(first.reasons[seq], Some(FinishReason::Length));
        assert_eq!(generated_len(first, &input, seq), 5);
    }
}

#[test]
fn abort_on_final_stage_stops_every_rank() {
    let config = config(4, 2);
    let input = prompts();
    let outcomes = run_pipeline(2, &config, engine, same_link, |session| {
        if session.world().is_last_pipeline_rank() {
            session.abort_handle().request();
        }
        let outcome = generate_on(session, &input, &greedy());
        assert!(!session.abort_handle().is_requested());
        outcome
    });
    for outcome in &outcomes {
        assert!(outcome.result.is_ok());
    }
    let first = &outcomes[0];
    assert!(first
        .reasons
        .iter()
        .all(|r| *r == Some(FinishReason::Aborted)));
    for seq in 0..input.batch_size() {
        // One step ran before the stop decision.
        assert_eq!(generated_len(first, &input, seq), 1);
    }
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[test]
fn step_failure_on_one_rank_aborts_every_rank() {
    let config = config(4, 2);
    let input = prompts();
    let short = GenerationInput {
        max_new_tokens: 2,
        ..prompts()
    };
    let short_baseline = single_process(&config, &short);

    for faulty in [0, 1] {
        let make_engine = |world: &WorldLayout| -> ToyEngine {
            let engine = engine(world);
            if world.rank == faulty {
                engine.with_faults(FaultPlan {
                    fail_step: Some((0, 2)),
                    fail_release: false,
                })
            } else {
                engine
            }
        };
        let outcomes = run_pipeline(2, &config, make_engine, same_link, |session| {
            let failed = generate_on(session, &input, &greedy());
            // The session stays usable for a call that avoids the fault.
            let retried = generate_on(session, &short, &greedy());
            (failed, retried)
        });

        for (rank, (failed, retried)) in outcomes.iter().enumerate() {
            match (&failed.result, rank == faulty) {
                (Err(Error::Engine(_)), true) | (Err(Error::Synchronization(_)), false) => {}
                (other, _) => panic!("faulty={faulty} rank {rank}: unexpected {other:?}"),
            }
            assert!(failed.ids.is_empty());
            assert_eq!(failed.reserved, 0);
            assert!(retried.result.is_ok(), "rank {rank}: {:?}", retried.result);
        }
        assert_eq!(outcomes[0].1.ids, short_baseline);
    }
}

#[test]
fn callback_failure_on_one_rank_fails_its_peer() {
    let mut config = config(4, 2);
    // Long enough that a peer timing out would blow the elapsed bound below.
    config.sync_timeout_ms = 20_000;
    let input = prompts();
    let outcomes = run_pipeline(2, &config, engine, same_link, |session| {
        let rank = session.world().rank;
        let mut out = GenerationOutput::with_callback(move |e: &StepEvent| -> Result<()> {
            if rank == 0 && e.step == 1 {
                Err(Error::Callback("consumer stopped".into()))
            } else {
                Ok(())
            }
        });
        let started = Instant::now();
        let result = session.generate(&mut out, &input, &greedy());
        let elapsed = started.elapsed();
        let retried = generate_on(session, &input, &greedy());
        (result, elapsed, session.cache().num_sequences(), retried)
    });

    assert!(matches!(outcomes[0].0, Err(Error::Callback(_))));
    match &outcomes[1].0 {
        Err(Error::Synchronization(msg)) => assert!(msg.contains("peer rank failed"), "{msg}"),
        other => panic!("unexpected {other:?}"),
    }
    for (rank, (_, elapsed, reserved, retried)) in outcomes.iter().enumerate() {
        assert!(*elapsed < Duration::from_secs(5), "rank {rank} took {elapsed:?}");
        assert_eq!(*reserved, 0);
        assert!(retried.result.is_ok(), "rank {rank}: {:?}", retried.result);
    }
}
