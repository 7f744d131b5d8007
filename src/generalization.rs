//! Template discovery by random-walk path sampling.
//!
//! Producers pick random known pairs of the target, sample paths around them
//! and push the abstracted templates onto a bounded channel. A single consumer
//! deduplicates them into the [`Context`] batch by batch and stops once the
//! share of already-known templates in a batch reaches the saturation
//! threshold.
//!
//! A seeded, single-threaded variant exists for reproducible runs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use dashmap::DashSet;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::cancel::{CancelToken, StopReason};
use crate::context::Context;
use crate::error::{GpflResult, PipelineError};
use crate::graph::traverse::{SamplingConfig, sample_paths};
use crate::graph::{GraphView, Pair};
use crate::rule::Template;
use crate::symbol::RelationId;

/// How long a producer waits on a full channel before re-checking the consumer.
const OFFER_TIMEOUT: Duration = Duration::from_millis(100);

/// How long the consumer waits for a path before re-checking its budget.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// With no path arriving for this long, the consumer treats the batch as empty.
const IDLE_WINDOW: Duration = Duration::from_secs(2);

/// Fewest consecutive path-less draws after which the sequential sampler gives up.
const MIN_IDLE_DRAWS: usize = 100;

/// Generalization settings for one target.
#[derive(Debug, Clone)]
pub struct GeneralizationConfig {
    /// Maximum body length of closed templates.
    pub car_depth: usize,
    /// Maximum body length of open templates.
    pub ins_depth: usize,
    /// Paths per saturation batch.
    pub batch_size: usize,
    /// Overlap ratio at which sampling stops.
    pub saturation: f64,
    pub random_walkers: usize,
    /// Producer threads.
    pub threads: usize,
    pub time_budget: Option<Duration>,
    /// Seeds the sequential sampler; implies `sequential`.
    pub seed: Option<u64>,
    pub sequential: bool,
}

impl Default for GeneralizationConfig {
    fn default() -> Self {
        Self {
            car_depth: 3,
            ins_depth: 3,
            batch_size: 20_000,
            saturation: 0.99,
            random_walkers: 10,
            threads: 4,
            time_budget: None,
            seed: None,
            sequential: false,
        }
    }
}

impl GeneralizationConfig {
    fn sampling(&self) -> SamplingConfig {
        SamplingConfig {
            max_depth: self.car_depth.max(self.ins_depth),
            random_walkers: self.random_walkers,
        }
    }

    /// Whether a template is within the depth limit for its kind.
    pub fn admits(&self, template: &Template) -> bool {
        if template.closed {
            template.len() <= self.car_depth
        } else {
            template.len() <= self.ins_depth
        }
    }
}

/// What a generalization run did.
#[derive(Debug, Clone)]
pub struct GeneralizationReport {
    pub paths: usize,
    pub visited_pairs: usize,
    pub training_pairs: usize,
    /// Overlap ratio of the last complete batch.
    pub saturation: f64,
    pub templates: usize,
    pub stop: StopReason,
    pub elapsed: Duration,
}

/// Discover templates for `target` from its known `pairs` into `ctx`.
pub fn generalize<G>(
    graph: &G,
    pairs: &HashSet<Pair>,
    target: RelationId,
    ctx: &Context,
    config: &GeneralizationConfig,
) -> GpflResult<GeneralizationReport>
where
    G: GraphView + ?Sized,
{
    let start = Instant::now();
    let mut pairs: Vec<Pair> = pairs.iter().copied().collect();
    pairs.sort_by_key(|p| (p.sub, p.obj));

    let report = if pairs.is_empty() {
        GeneralizationReport {
            paths: 0,
            visited_pairs: 0,
            training_pairs: 0,
            saturation: 0.0,
            templates: ctx.template_count(),
            stop: StopReason::Exhausted,
            elapsed: start.elapsed(),
        }
    } else if config.sequential || config.seed.is_some() {
        generalize_sequential(graph, &pairs, target, ctx, config, start)
    } else {
        generalize_concurrent(graph, &pairs, target, ctx, config, start)?
    };

    info!(
        relation = %target,
        paths = report.paths,
        visited = report.visited_pairs,
        training = report.training_pairs,
        saturation = report.saturation,
        templates = report.templates,
        stop = %report.stop,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "generalization finished"
    );
    info!("{}", ctx.composition().summary("generated templates"));
    Ok(report)
}

// ---------------------------------------------------------------------------
// Concurrent sampler
// ---------------------------------------------------------------------------

struct ConsumerOutcome {
    paths: usize,
    saturation: f64,
    stop: StopReason,
}

fn generalize_concurrent<G>(
    graph: &G,
    pairs: &[Pair],
    target: RelationId,
    ctx: &Context,
    config: &GeneralizationConfig,
    start: Instant,
) -> GpflResult<GeneralizationReport>
where
    G: GraphView + ?Sized,
{
    let token = CancelToken::with_budget(config.time_budget);
    let consumer_alive = AtomicBool::new(true);
    let visited: DashSet<Pair> = DashSet::new();
    let sampling = config.sampling();
    let (tx, rx) = crossbeam_channel::bounded::<Template>(config.batch_size.max(1));

    let outcome = thread::scope(|scope| -> GpflResult<ConsumerOutcome> {
        let producers: Vec<_> = (0..config.threads.max(1))
            .map(|_| {
                let tx = tx.clone();
                let alive = &consumer_alive;
                let visited = &visited;
                let sampling = &sampling;
                scope.spawn(move || {
                    let mut rng = StdRng::from_entropy();
                    produce(graph, pairs, target, sampling, &tx, alive, visited, &mut rng);
                })
            })
            .collect();
        drop(tx);

        let outcome = consume(rx, ctx, config, &token);
        consumer_alive.store(false, Ordering::SeqCst);

        for producer in producers {
            producer.join().map_err(|_| PipelineError::WorkerPanicked {
                stage: "generalization producer",
            })?;
        }
        Ok(outcome)
    })?;

    Ok(GeneralizationReport {
        paths: outcome.paths,
        visited_pairs: visited.len(),
        training_pairs: pairs.len(),
        saturation: outcome.saturation,
        templates: ctx.template_count(),
        stop: outcome.stop,
        elapsed: start.elapsed(),
    })
}

#[allow(clippy::too_many_arguments)]
fn produce<G, R>(
    graph: &G,
    pairs: &[Pair],
    target: RelationId,
    sampling: &SamplingConfig,
    tx: &Sender<Template>,
    consumer_alive: &AtomicBool,
    visited: &DashSet<Pair>,
    rng: &mut R,
) where
    G: GraphView + ?Sized,
    R: Rng + ?Sized,
{
    while consumer_alive.load(Ordering::SeqCst) {
        let Some(&pair) = pairs.choose(rng) else {
            return;
        };
        visited.insert(pair);
        for path in sample_paths(graph, pair, target, sampling, rng) {
            let Some(template) = Template::from_path(&path, pair, target) else {
                continue;
            };
            if !offer(tx, template, consumer_alive) {
                return;
            }
        }
    }
}

/// Push one template, retrying while the consumer is alive.
fn offer(tx: &Sender<Template>, template: Template, consumer_alive: &AtomicBool) -> bool {
    let mut item = template;
    loop {
        match tx.send_timeout(item, OFFER_TIMEOUT) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(back)) => {
                if !consumer_alive.load(Ordering::SeqCst) {
                    return false;
                }
                item = back;
            }
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

fn consume(
    rx: Receiver<Template>,
    ctx: &Context,
    config: &GeneralizationConfig,
    token: &CancelToken,
) -> ConsumerOutcome {
    let batch_size = config.batch_size.max(1);
    let mut batch: HashMap<Template, u64> = HashMap::new();
    let mut in_batch = 0usize;
    let mut paths = 0usize;
    let mut saturation = 0.0;
    let mut last_arrival = Instant::now();

    let stop = loop {
        if token.is_cancelled() {
            break StopReason::TimeBudget;
        }
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(template) => {
                paths += 1;
                in_batch += 1;
                last_arrival = Instant::now();
                if config.admits(&template) {
                    *batch.entry(template).or_insert(0) += 1;
                }
                if in_batch < batch_size {
                    continue;
                }
                if batch.is_empty() {
                    break StopReason::EmptyBatch;
                }
                saturation = flush_batch(ctx, &mut batch);
                in_batch = 0;
                debug!(
                    paths,
                    saturation,
                    templates = ctx.template_count(),
                    "batch boundary"
                );
                if saturation >= config.saturation {
                    break StopReason::Saturated;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if last_arrival.elapsed() >= IDLE_WINDOW {
                    break StopReason::EmptyBatch;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break StopReason::Exhausted,
        }
    };

    for (template, count) in batch.drain() {
        ctx.record_sightings(template, count);
    }

    ConsumerOutcome {
        paths,
        saturation,
        stop,
    }
}

/// Record a batch into `ctx`; returns the share of templates already known.
fn flush_batch(ctx: &Context, batch: &mut HashMap<Template, u64>) -> f64 {
    let distinct = batch.len();
    let mut overlap = 0usize;
    for (template, count) in batch.drain() {
        if !ctx.record_sightings(template, count).first {
            overlap += 1;
        }
    }
    overlap as f64 / distinct as f64
}

// ---------------------------------------------------------------------------
// Sequential sampler
// ---------------------------------------------------------------------------

/// Single-threaded sampling. With a seed, the sequence of sampled paths is
/// fixed, so a longer time budget only ever processes a longer prefix of it.
fn generalize_sequential<G>(
    graph: &G,
    pairs: &[Pair],
    target: RelationId,
    ctx: &Context,
    config: &GeneralizationConfig,
    start: Instant,
) -> GeneralizationReport
where
    G: GraphView + ?Sized,
{
    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let token = CancelToken::with_budget(config.time_budget);
    let sampling = config.sampling();
    let batch_size = config.batch_size.max(1);
    let idle_limit = pairs.len().max(MIN_IDLE_DRAWS);

    let mut previous: HashSet<Template> = HashSet::new();
    let mut current: HashSet<Template> = HashSet::new();
    let mut visited: HashSet<Pair> = HashSet::new();
    let mut paths = 0usize;
    let mut idle_draws = 0usize;
    let mut saturation = 0.0;

    let stop = 'sampling: loop {
        if token.is_cancelled() {
            break StopReason::TimeBudget;
        }
        let pair = pairs[rng.gen_range(0..pairs.len())];
        visited.insert(pair);

        let sampled = sample_paths(graph, pair, target, &sampling, &mut rng);
        if sampled.is_empty() {
            idle_draws += 1;
            if idle_draws >= idle_limit {
                break StopReason::EmptyBatch;
            }
            continue;
        }
        idle_draws = 0;

        for path in sampled {
            paths += 1;
            if paths % batch_size == 0 {
                if current.is_empty() {
                    break 'sampling StopReason::EmptyBatch;
                }
                let overlap = current.iter().filter(|t| previous.contains(*t)).count();
                saturation = overlap as f64 / current.len() as f64;
                previous.extend(current.drain());
                debug!(paths, saturation, "batch boundary");
                if saturation >= config.saturation {
                    break 'sampling StopReason::Saturated;
                }
            }
            let Some(template) = Template::from_path(&path, pair, target) else {
                continue;
            };
            if config.admits(&template) {
                ctx.record_template(template.clone());
                current.insert(template);
            }
        }
    };

    GeneralizationReport {
        paths,
        visited_pairs: visited.len(),
        training_pairs: pairs.len(),
        saturation,
        templates: ctx.template_count(),
        stop,
        elapsed: start.elapsed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{KnowledgeGraph, Triple};
    use crate::symbol::EntityId;

    fn e(id: u32) -> EntityId {
        EntityId::new(id)
    }

    fn r(id: u32) -> RelationId {
        RelationId::new(id)
    }

    const TARGET: u32 = 0;
    const SPOUSE: u32 = 1;
    const LIVES: u32 = 2;

    /// Couples living in the same city; the target links each couple.
    fn build_graph() -> (KnowledgeGraph, HashSet<Pair>) {
        let kg = KnowledgeGraph::new();
        let mut pairs = HashSet::new();
        for i in 0..6u32 {
            let (a, b, city) = (e(10 + 2 * i), e(11 + 2 * i), e(100 + i % 2));
            kg.insert(&Triple::new(a, r(TARGET), b));
            kg.insert(&Triple::new(a, r(SPOUSE), b));
            kg.insert(&Triple::new(a, r(LIVES), city));
            kg.insert(&Triple::new(b, r(LIVES), city));
            pairs.insert(Pair::new(a, b));
        }
        (kg, pairs)
    }

    fn config(seed: Option<u64>) -> GeneralizationConfig {
        GeneralizationConfig {
            car_depth: 2,
            ins_depth: 1,
            batch_size: 8,
            saturation: 0.99,
            random_walkers: 0,
            threads: 2,
            time_budget: Some(Duration::from_secs(5)),
            seed,
            sequential: false,
        }
    }

    fn check_templates(ctx: &Context, config: &GeneralizationConfig) {
        for handle in ctx.sorted_templates() {
            let t = ctx.template(handle).unwrap();
            assert!(config.admits(&t), "template over depth: {t:?}");
            assert!(!t.is_empty());
        }
    }

    #[test]
    fn sequential_discovers_the_spouse_rule() {
        let (kg, pairs) = build_graph();
        let view = kg.read();
        let ctx = Context::new(r(TARGET), 20);
        let cfg = config(Some(42));
        let report = generalize(&view, &pairs, r(TARGET), &ctx, &cfg).unwrap();

        assert!(report.paths > 0);
        assert!(report.templates > 0);
        check_templates(&ctx, &cfg);

        let spouse = Template {
            head: r(TARGET),
            body: vec![crate::rule::BodyAtom {
                relation: r(SPOUSE),
                direction: crate::graph::Direction::Outgoing,
            }],
            closed: true,
            from_subject: true,
        };
        assert!(ctx.contains_template(&spouse));
    }

    #[test]
    fn concurrent_stays_within_depth_limits() {
        let (kg, pairs) = build_graph();
        let view = kg.read();
        let ctx = Context::new(r(TARGET), 20);
        let cfg = config(None);
        let report = generalize(&view, &pairs, r(TARGET), &ctx, &cfg).unwrap();

        assert!(report.paths > 0);
        assert!(report.visited_pairs <= pairs.len());
        assert_ne!(report.stop, StopReason::Exhausted);
        check_templates(&ctx, &cfg);
    }

    #[test]
    fn longer_budget_never_finds_fewer_templates() {
        let (kg, pairs) = build_graph();
        let view = kg.read();

        let short = Context::new(r(TARGET), 20);
        let mut cfg = config(Some(7));
        cfg.time_budget = Some(Duration::ZERO);
        generalize(&view, &pairs, r(TARGET), &short, &cfg).unwrap();

        let long = Context::new(r(TARGET), 20);
        cfg.time_budget = Some(Duration::from_secs(5));
        generalize(&view, &pairs, r(TARGET), &long, &cfg).unwrap();

        assert!(long.template_count() >= short.template_count());
    }

    #[test]
    fn no_pairs_means_nothing_to_do() {
        let kg = KnowledgeGraph::new();
        let view = kg.read();
        let ctx = Context::new(r(TARGET), 20);
        let report =
            generalize(&view, &HashSet::new(), r(TARGET), &ctx, &config(None)).unwrap();
        assert_eq!(report.stop, StopReason::Exhausted);
        assert_eq!(report.templates, 0);
    }

    #[test]
    fn flush_reports_overlap() {
        let ctx = Context::new(r(TARGET), 20);
        let known = Template {
            head: r(TARGET),
            body: vec![crate::rule::BodyAtom {
                relation: r(SPOUSE),
                direction: crate::graph::Direction::Outgoing,
            }],
            closed: true,
            from_subject: true,
        };
        ctx.record_template(known.clone());
        let mut fresh = known.clone();
        fresh.from_subject = false;

        let mut batch = HashMap::from([(known, 3), (fresh, 1)]);
        let saturation = flush_batch(&ctx, &mut batch);
        assert!((saturation - 0.5).abs() < 1e-12);
        assert!(batch.is_empty());
        assert_eq!(ctx.template_count(), 2);
    }
}
