//! Template specialization: scoring templates and their anchored instances.
//!
//! Worker threads pull template handles from a pre-sorted queue, ground each
//! template once and score it. A closed template is scored as a whole. An
//! open template is scored per anchor, once as a head-anchored instance and
//! once per reachable tail as a both-anchored instance; it survives when at
//! least one instance passes the quality gate. Two writer threads drain
//! separate bounded channels into the rule index and the flat rule file, so
//! workers never block on disk.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info};

use crate::cancel::{CancelToken, StopReason};
use crate::context::{Context, TemplateHandle};
use crate::error::{GpflResult, PersistResult, PipelineError};
use crate::graph::load::TargetExamples;
use crate::graph::{GraphView, Pair};
use crate::grounding::{GroundingRequest, Groundings, ground};
use crate::persist::rule_file::format_line;
use crate::persist::rule_index::{IndexRecord, InstanceRecord, RuleIndexWriter, order_by_handle};
use crate::persist::{create, flush, write_str};
use crate::rule::{OverfittingCheck, QualityGate, Rule, RuleStats, StatsParams, Template};
use crate::symbol::{EntityId, SymbolTable};

/// Capacity of each writer channel.
const WRITER_QUEUE: usize = 1024;

/// Specialization settings for one target.
#[derive(Debug, Clone)]
pub struct SpecializationConfig {
    pub gate: QualityGate,
    pub params: StatsParams,
    /// Carried for the log line; overfitting rules are persisted and
    /// filtered when read back.
    pub overfitting: OverfittingCheck,
    /// Groundings scored per template; a capped template is scored on the
    /// groundings found before the cap.
    pub learn_groundings: Option<usize>,
    /// Global cap on scored instances.
    pub ins_rule_cap: usize,
    pub threads: usize,
    pub time_budget: Option<Duration>,
    /// Keep both-anchored instances that merely restate the target.
    pub allow_ins_reverse: bool,
}

/// Where specialization writes its rules.
#[derive(Debug, Clone)]
pub struct RuleOutputs {
    pub index: PathBuf,
    pub flat: PathBuf,
}

/// What a specialization run did.
#[derive(Debug, Clone)]
pub struct SpecializationReport {
    pub templates: usize,
    pub specialized: usize,
    pub instantiated: usize,
    pub index_records: usize,
    pub rule_lines: usize,
    pub stop: StopReason,
    pub elapsed: Duration,
}

// ---------------------------------------------------------------------------
// Known pairs
// ---------------------------------------------------------------------------

type Adjacency = HashMap<EntityId, HashSet<EntityId>>;

fn adjacency(pairs: &HashSet<Pair>, by_object: bool) -> Adjacency {
    let mut map: Adjacency = HashMap::new();
    for pair in pairs {
        let (key, value) = if by_object {
            (pair.obj, pair.sub)
        } else {
            (pair.sub, pair.obj)
        };
        map.entry(key).or_default().insert(value);
    }
    map
}

/// Training and validation pairs indexed both ways.
struct KnownPairs<'a> {
    examples: &'a TargetExamples,
    subjects: HashSet<EntityId>,
    obj_to_subs: Adjacency,
    sub_to_objs: Adjacency,
    valid_obj_to_subs: Adjacency,
    valid_sub_to_objs: Adjacency,
}

impl<'a> KnownPairs<'a> {
    fn new(examples: &'a TargetExamples) -> Self {
        Self {
            examples,
            subjects: examples.train.iter().map(|p| p.sub).collect(),
            obj_to_subs: adjacency(&examples.train, true),
            sub_to_objs: adjacency(&examples.train, false),
            valid_obj_to_subs: adjacency(&examples.valid, true),
            valid_sub_to_objs: adjacency(&examples.valid, false),
        }
    }

    /// Anchor → the entities on the path side of its known pairs.
    fn anchoring(&self, from_subject: bool) -> &Adjacency {
        if from_subject {
            &self.obj_to_subs
        } else {
            &self.sub_to_objs
        }
    }

    fn valid_anchoring(&self, from_subject: bool) -> &Adjacency {
        if from_subject {
            &self.valid_obj_to_subs
        } else {
            &self.valid_sub_to_objs
        }
    }

    fn ground_truth(&self) -> u64 {
        self.examples.train.len() as u64
    }
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// Score a closed template from its groundings.
fn score_closed(
    template: Arc<Template>,
    groundings: &Groundings,
    known: &KnownPairs<'_>,
    params: &StatsParams,
) -> Rule {
    let mut stats = RuleStats::against(known.ground_truth());
    for grounding in groundings.iter() {
        let prediction = if template.from_subject {
            *grounding
        } else {
            grounding.reversed()
        };
        stats.total_predictions += 1;
        if known.subjects.contains(&prediction.sub) {
            stats.pca_total_predictions += 1;
        }
        if known.examples.train.contains(&prediction) {
            stats.support += 1;
        } else {
            stats.valid_total_predictions += 1;
            if known.examples.valid.contains(&prediction) {
                stats.valid_predictions += 1;
            }
        }
    }
    stats.compute(params);
    let mut rule = Rule::from_template(template);
    rule.stats = stats;
    rule
}

/// Score an anchored instance predicting `(origin, anchor)` for every origin.
fn score_anchored<'o>(
    rule: &mut Rule,
    origins: impl IntoIterator<Item = &'o EntityId>,
    originals: &HashSet<EntityId>,
    valid: Option<&HashSet<EntityId>>,
    params: &StatsParams,
) {
    let mut stats = RuleStats::against(originals.len() as u64);
    for origin in origins {
        stats.total_predictions += 1;
        if originals.contains(origin) {
            stats.support += 1;
        } else {
            stats.valid_total_predictions += 1;
            if valid.is_some_and(|v| v.contains(origin)) {
                stats.valid_predictions += 1;
            }
        }
    }
    stats.pca_total_predictions = if rule.from_subject() {
        stats.support
    } else {
        stats.total_predictions
    };
    stats.compute(params);
    rule.stats = stats;
}

/// A both-anchored instance that only restates the target on its anchor.
fn is_trivial(template: &Template, anchor: EntityId, tail: EntityId, allow_reverse: bool) -> bool {
    !allow_reverse
        && anchor == tail
        && template.len() == 1
        && template.body[0].relation == template.head
}

/// Output of one specialized template.
struct Specialized {
    record: IndexRecord,
    rules: Vec<Rule>,
}

struct Worker<'a, G: GraphView + ?Sized> {
    graph: &'a G,
    known: &'a KnownPairs<'a>,
    ctx: &'a Context,
    config: &'a SpecializationConfig,
    token: &'a CancelToken,
}

impl<G: GraphView + ?Sized> Worker<'_, G> {
    /// Count one passing instance, tripping the token past the cap.
    fn count_instance(&self) {
        if self.ctx.record_instantiated() > self.config.ins_rule_cap {
            self.token.cancel_with(StopReason::CountCap);
        }
    }

    fn specialize(&self, handle: TemplateHandle, template: Arc<Template>) -> Option<Specialized> {
        let request = GroundingRequest {
            template: &template,
            tail: None,
            cap: self.config.learn_groundings,
        };
        let groundings = ground(self.graph, &request, self.token);
        if let Some(reason) = self.token.reason() {
            debug!(%handle, %reason, groundings = groundings.len(), "specialization stopping, skipping template");
            return None;
        }
        if groundings.stopped == Some(StopReason::CountCap) {
            debug!(%handle, groundings = groundings.len(), "template grounding capped");
        }

        if template.closed {
            self.specialize_closed(handle, template, &groundings)
        } else {
            self.specialize_open(handle, template, &groundings)
        }
    }

    fn specialize_closed(
        &self,
        handle: TemplateHandle,
        template: Arc<Template>,
        groundings: &Groundings,
    ) -> Option<Specialized> {
        let rule = score_closed(template, groundings, self.known, &self.config.params);
        if !self.config.gate.passes(&rule.stats) {
            return None;
        }
        self.count_instance();
        let metrics = rule.stats.metrics().copied()?;
        Some(Specialized {
            record: IndexRecord {
                handle,
                template: Arc::clone(&rule.template),
                metrics,
                instances: Vec::new(),
            },
            rules: vec![rule],
        })
    }

    fn specialize_open(
        &self,
        handle: TemplateHandle,
        template: Arc<Template>,
        groundings: &Groundings,
    ) -> Option<Specialized> {
        let from_subject = template.from_subject;
        let mut origin_to_tails: Adjacency = HashMap::new();
        let mut tail_to_origins: Adjacency = HashMap::new();
        for pair in groundings.iter() {
            origin_to_tails.entry(pair.sub).or_default().insert(pair.obj);
            tail_to_origins.entry(pair.obj).or_default().insert(pair.sub);
        }

        let anchoring = self.known.anchoring(from_subject);
        let valid = self.known.valid_anchoring(from_subject);
        let mut anchors: Vec<EntityId> = anchoring.keys().copied().collect();
        anchors.sort();

        let mut passed: Vec<Rule> = Vec::new();
        let mut visited: HashSet<(EntityId, EntityId)> = HashSet::new();

        'anchors: for anchor in anchors {
            if self.token.is_cancelled() {
                break;
            }
            let Some(originals) = anchoring.get(&anchor) else {
                continue;
            };
            let valid_originals = valid.get(&anchor);

            let mut har = Rule::head_anchored(Arc::clone(&template), anchor);
            score_anchored(
                &mut har,
                origin_to_tails.keys(),
                originals,
                valid_originals,
                &self.config.params,
            );
            if self.config.gate.passes(&har.stats) {
                self.count_instance();
                passed.push(har);
            }

            let mut originals_sorted: Vec<EntityId> = originals.iter().copied().collect();
            originals_sorted.sort();
            for original in originals_sorted {
                let Some(tails) = origin_to_tails.get(&original) else {
                    continue;
                };
                let mut tails: Vec<EntityId> = tails.iter().copied().collect();
                tails.sort();
                for tail in tails {
                    if self.token.is_cancelled() {
                        break 'anchors;
                    }
                    if !visited.insert((anchor, tail))
                        || is_trivial(&template, anchor, tail, self.config.allow_ins_reverse)
                    {
                        continue;
                    }
                    let Some(origins) = tail_to_origins.get(&tail) else {
                        continue;
                    };
                    let mut bar = Rule::both_anchored(Arc::clone(&template), anchor, tail);
                    score_anchored(
                        &mut bar,
                        origins,
                        originals,
                        valid_originals,
                        &self.config.params,
                    );
                    if self.config.gate.passes(&bar.stats) {
                        self.count_instance();
                        passed.push(bar);
                    }
                }
            }
        }

        if passed.is_empty() {
            return None;
        }

        let mut aggregate = RuleStats::against(self.known.ground_truth());
        let mut instances = Vec::with_capacity(passed.len());
        for rule in &passed {
            aggregate.absorb(&rule.stats);
            let Some(anchor) = rule.anchor() else {
                continue;
            };
            instances.push(InstanceRecord {
                anchor,
                tail: rule.tail(),
                metrics: rule.stats.metrics().copied().unwrap_or_default(),
            });
        }
        let metrics = aggregate.compute(&self.config.params);

        Some(Specialized {
            record: IndexRecord {
                handle,
                template,
                metrics,
                instances,
            },
            rules: passed,
        })
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

fn write_index(
    rx: Receiver<IndexRecord>,
    path: &Path,
    symbols: &SymbolTable,
) -> PersistResult<usize> {
    let mut writer = RuleIndexWriter::create(path)?;
    for record in rx {
        writer.write(&record, symbols)?;
    }
    writer.finish()
}

fn write_flat(rx: Receiver<String>, path: &Path) -> PersistResult<usize> {
    let mut out: BufWriter<File> = create(path)?;
    let mut lines = 0;
    for line in rx {
        write_str(&mut out, &line, path)?;
        write_str(&mut out, "\n", path)?;
        lines += 1;
    }
    flush(&mut out, path)?;
    Ok(lines)
}

fn run_worker<G>(
    worker: &Worker<'_, G>,
    queue: &Receiver<TemplateHandle>,
    index_tx: &Sender<IndexRecord>,
    flat_tx: &Sender<String>,
    symbols: &SymbolTable,
) -> GpflResult<()>
where
    G: GraphView + ?Sized,
{
    while let Ok(handle) = queue.recv() {
        if worker.token.is_cancelled() {
            break;
        }
        let template = worker.ctx.template(handle)?;
        let Some(specialized) = worker.specialize(handle, template) else {
            continue;
        };
        worker.ctx.mark_specialized(handle);

        let measure = worker.config.gate.measure;
        for rule in &specialized.rules {
            if flat_tx.send(format_line(rule, symbols, measure)).is_err() {
                return Ok(());
            }
        }
        if index_tx.send(specialized.record).is_err() {
            return Ok(());
        }
    }
    Ok(())
}

/// Score every template in `ctx` and write the survivors to `outputs`.
pub fn specialize<G>(
    graph: &G,
    examples: &TargetExamples,
    symbols: &SymbolTable,
    ctx: &Context,
    config: &SpecializationConfig,
    outputs: &RuleOutputs,
) -> GpflResult<SpecializationReport>
where
    G: GraphView + ?Sized,
{
    let start = Instant::now();
    let known = KnownPairs::new(examples);
    let token = CancelToken::with_budget(config.time_budget);

    let sorted = ctx.sorted_templates();
    let templates = sorted.len();
    let (queue_tx, queue_rx) = crossbeam_channel::unbounded::<TemplateHandle>();
    for handle in sorted {
        // The receiver is alive until the scope below ends.
        let _ = queue_tx.send(handle);
    }
    drop(queue_tx);

    let (index_tx, index_rx) = crossbeam_channel::bounded::<IndexRecord>(WRITER_QUEUE);
    let (flat_tx, flat_rx) = crossbeam_channel::bounded::<String>(WRITER_QUEUE);

    let worker = Worker {
        graph,
        known: &known,
        ctx,
        config,
        token: &token,
    };

    let (index_records, rule_lines) = thread::scope(|scope| -> GpflResult<(usize, usize)> {
        let index_writer = scope.spawn(|| write_index(index_rx, &outputs.index, symbols));
        let flat_writer = scope.spawn(|| write_flat(flat_rx, &outputs.flat));

        let workers: Vec<_> = (0..config.threads.max(1))
            .map(|_| {
                let queue = queue_rx.clone();
                let index_tx = index_tx.clone();
                let flat_tx = flat_tx.clone();
                let worker = &worker;
                scope.spawn(move || run_worker(worker, &queue, &index_tx, &flat_tx, symbols))
            })
            .collect();
        drop(index_tx);
        drop(flat_tx);

        let mut first_error = None;
        for handle in workers {
            let result = handle.join().map_err(|_| PipelineError::WorkerPanicked {
                stage: "specialization",
            })?;
            if let Err(e) = result {
                token.cancel();
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        let index_records = index_writer.join().map_err(|_| PipelineError::WorkerPanicked {
            stage: "rule index writer",
        })??;
        let rule_lines = flat_writer.join().map_err(|_| PipelineError::WorkerPanicked {
            stage: "rule file writer",
        })??;
        match first_error {
            Some(e) => Err(e),
            None => Ok((index_records, rule_lines)),
        }
    })?;

    order_by_handle(&outputs.index)?;

    let instantiated = ctx.instantiated();
    let stop = token.reason().unwrap_or(StopReason::Exhausted);
    let report = SpecializationReport {
        templates,
        specialized: ctx.specialized().len(),
        instantiated,
        index_records,
        rule_lines,
        stop,
        elapsed: start.elapsed(),
    };

    info!(
        relation = %ctx.target(),
        templates = report.templates,
        specialized = report.specialized,
        instantiated = report.instantiated,
        rules = report.rule_lines,
        stop = %report.stop,
        functional = config.params.functional,
        overfitting_factor = config.overfitting.factor,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "specialization finished"
    );
    info!("{}", ctx.specialized_composition()?.summary("specialized templates"));
    Ok(report)
}
