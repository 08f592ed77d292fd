// The iteration driver.
//
// A session runs up to `iterations` trials: seed an RNG, generate a candidate
// while recording its draw tree, evaluate the property, and either move on
// with a freshly chained seed or hand the recorded tree to the shrink engine.
// Everything is reproducible from the global seed; on failure the exact
// (global seed, iteration seed, size hint) triple is part of the report.

use std::any::{Any, TypeId};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use log::{debug, trace};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rustc_hash::FxHashSet;
use thiserror::Error;

use crate::data::{run_generative, GenFailure};
use crate::generator::Generator;
use crate::shrinking::{self, ShrinkStats, StoppingReason};
use crate::structure::StructureNode;

/// Retry budget for finding a structurally novel tree within one iteration.
pub const MAX_NOVELTY_ATTEMPTS: usize = 100;

/// Fatal conditions of a search. These describe a defective generator or an
/// exhausted search space, never a falsified property.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error(
        "cannot generate sufficiently different values at iteration {iteration} \
         ({attempts} attempts)"
    )]
    CannotGenerateDistinct { iteration: usize, attempts: usize },
    #[error("condition unsatisfiable at iteration {iteration} (seed {seed})")]
    CannotSatisfyCondition { iteration: usize, seed: u64 },
    #[error("generator failed at iteration {iteration} (seed {seed}): {message}")]
    GeneratorFailure {
        iteration: usize,
        seed: u64,
        message: String,
    },
}

/// A captured property panic: the payload's type and its rendered message.
#[derive(Debug, Clone)]
pub struct PanicPayload {
    kind: TypeId,
    message: String,
}

impl PanicPayload {
    pub(crate) fn from_boxed(payload: Box<dyn Any + Send>) -> PanicPayload {
        PanicPayload {
            kind: payload.as_ref().type_id(),
            message: panic_message(payload.as_ref()),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Same originating payload type; the message text is allowed to differ.
    pub fn same_kind(&self, other: &PanicPayload) -> bool {
        self.kind == other.kind
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&'static str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        String::from("opaque panic payload")
    }
}

/// A generated value that falsified the property, together with the tree that
/// produced it and the panic it raised, if any.
#[derive(Debug, Clone)]
pub struct CounterExample<T> {
    pub(crate) tree: Arc<StructureNode>,
    pub(crate) value: T,
    pub(crate) panic: Option<PanicPayload>,
}

impl<T> CounterExample<T> {
    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn tree(&self) -> &StructureNode {
        &self.tree
    }

    /// `None` when the property merely returned false.
    pub fn panic(&self) -> Option<&PanicPayload> {
        self.panic.as_ref()
    }
}

/// The full failure report: the first counterexample found, the minimal one
/// after shrinking, and everything needed to reproduce the run.
#[derive(Debug, Clone)]
pub struct PropertyFailure<T> {
    pub(crate) first: CounterExample<T>,
    pub(crate) minimal: CounterExample<T>,
    pub(crate) global_seed: u64,
    pub(crate) iteration_seed: u64,
    pub(crate) iteration: usize,
    pub(crate) size_hint: usize,
    pub(crate) stats: ShrinkStats,
    pub(crate) stopping_reason: Option<StoppingReason>,
    pub(crate) reason_changed: bool,
}

impl<T> PropertyFailure<T> {
    pub fn first(&self) -> &CounterExample<T> {
        &self.first
    }

    pub fn minimal(&self) -> &CounterExample<T> {
        &self.minimal
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn stats(&self) -> ShrinkStats {
        self.stats
    }

    /// Set when minimization ended early instead of reaching a fixed point.
    pub fn stopping_reason(&self) -> Option<&StoppingReason> {
        self.stopping_reason.as_ref()
    }

    /// True when the minimal counterexample fails for a different reason than
    /// the first one (panic kind changed, or panic vs. plain false). The
    /// minimized input then exercises a different failure path and both
    /// counterexamples deserve attention.
    pub fn failure_reason_changed(&self) -> bool {
        self.reason_changed
    }

    /// The `(global seed, iteration seed, size hint)` triple that reproduces
    /// the failing iteration without re-running the search.
    pub fn reproduce_hint(&self) -> (u64, u64, usize) {
        (self.global_seed, self.iteration_seed, self.size_hint)
    }
}

impl<T: fmt::Debug> fmt::Display for PropertyFailure<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "property falsified at iteration {}", self.iteration)?;
        writeln!(f, "  minimal counterexample: {:?}", self.minimal.value)?;
        if let Some(panic) = &self.minimal.panic {
            writeln!(f, "  failing with panic: {}", panic.message())?;
        }
        if self.reason_changed {
            writeln!(f, "  note: the failure reason changed during minimization")?;
            writeln!(f, "  first counterexample: {:?}", self.first.value)?;
        }
        if let Some(StoppingReason::ReplayPanicked { message }) = &self.stopping_reason {
            writeln!(f, "  note: minimization stopped prematurely: {}", message)?;
        }
        write!(
            f,
            "  reproduce with global seed {}, iteration seed {}, size hint {}",
            self.global_seed, self.iteration_seed, self.size_hint
        )
    }
}

/// Result of a completed search.
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    /// Every iteration passed.
    Passed { iterations: usize },
    /// A counterexample was found and minimized.
    Falsified(Box<PropertyFailure<T>>),
}

/// Replay of one exact prior iteration, skipping the search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recheck {
    pub seed: u64,
    pub size_hint: usize,
}

/// Iteration index (1-based) to size hint; cycles through 1..=100.
pub fn default_size_hint(iteration: usize) -> usize {
    (iteration - 1) % 100 + 1
}

#[derive(Debug, Clone, Copy)]
pub struct CheckConfig {
    pub iterations: usize,
    /// `None` draws a fresh seed; it is recorded on any failure.
    pub seed: Option<u64>,
    pub size_hint_fn: fn(usize) -> usize,
    pub recheck: Option<Recheck>,
}

impl Default for CheckConfig {
    fn default() -> CheckConfig {
        CheckConfig {
            iterations: 100,
            seed: None,
            size_hint_fn: default_size_hint,
            recheck: None,
        }
    }
}

impl CheckConfig {
    pub fn with_seed(seed: u64) -> CheckConfig {
        CheckConfig {
            seed: Some(seed),
            ..CheckConfig::default()
        }
    }
}

/// Session progress events for embedding test runners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    IterationStarted { iteration: usize, total: usize },
    Falsified { iteration: usize },
    ShrinkFinished { attempts: usize, successful: usize },
}

/// Search for a counterexample to `property` over values of `generator`.
pub fn check_property<T, P>(
    generator: &Generator<T>,
    property: P,
    config: CheckConfig,
) -> Result<Outcome<T>, EngineError>
where
    T: Clone + 'static,
    P: Fn(&T) -> bool,
{
    check_property_with_notifier(generator, property, config, &mut |_| {})
}

/// Like [`check_property`], with a callback observing session progress.
pub fn check_property_with_notifier<T, P>(
    generator: &Generator<T>,
    property: P,
    config: CheckConfig,
    notifier: &mut dyn FnMut(&Progress),
) -> Result<Outcome<T>, EngineError>
where
    T: Clone + 'static,
    P: Fn(&T) -> bool,
{
    let global_seed = config.seed.unwrap_or_else(rand::random::<u64>);
    debug!("session start: global seed {global_seed}, {} iterations", config.iterations);
    let mut session = Session {
        generator,
        property: &property,
        global_seed,
        iterations: config.iterations,
        size_hint_fn: config.size_hint_fn,
        seen: FxHashSet::default(),
        notifier,
    };
    session.run(config.recheck)
}

struct Session<'a, T, P> {
    generator: &'a Generator<T>,
    property: &'a P,
    global_seed: u64,
    iterations: usize,
    size_hint_fn: fn(usize) -> usize,
    seen: FxHashSet<u64>,
    notifier: &'a mut dyn FnMut(&Progress),
}

enum IterationVerdict<T> {
    Passed { next_seed: u64 },
    Falsified(PropertyFailure<T>),
}

impl<'a, T, P> Session<'a, T, P>
where
    T: Clone + 'static,
    P: Fn(&T) -> bool,
{
    fn run(&mut self, recheck: Option<Recheck>) -> Result<Outcome<T>, EngineError> {
        if let Some(recheck) = recheck {
            (self.notifier)(&Progress::IterationStarted {
                iteration: 1,
                total: 1,
            });
            return match self.run_iteration(1, recheck.seed, recheck.size_hint, false)? {
                IterationVerdict::Passed { .. } => Ok(Outcome::Passed { iterations: 1 }),
                IterationVerdict::Falsified(failure) => {
                    Ok(Outcome::Falsified(Box::new(failure)))
                }
            };
        }
        // The first iteration runs on the global seed itself; every later one
        // on a seed drawn from its predecessor's RNG.
        let mut seed = self.global_seed;
        for iteration in 1..=self.iterations {
            (self.notifier)(&Progress::IterationStarted {
                iteration,
                total: self.iterations,
            });
            let size_hint = (self.size_hint_fn)(iteration);
            match self.run_iteration(iteration, seed, size_hint, true)? {
                IterationVerdict::Passed { next_seed } => seed = next_seed,
                IterationVerdict::Falsified(failure) => {
                    return Ok(Outcome::Falsified(Box::new(failure)))
                }
            }
        }
        debug!("no counterexample found in {} iterations", self.iterations);
        Ok(Outcome::Passed {
            iterations: self.iterations,
        })
    }

    fn run_iteration(
        &mut self,
        iteration: usize,
        iteration_seed: u64,
        size_hint: usize,
        require_novel: bool,
    ) -> Result<IterationVerdict<T>, EngineError> {
        let mut rng = ChaCha8Rng::seed_from_u64(iteration_seed);
        let generator = self.generator;
        let attempt_budget = if require_novel { MAX_NOVELTY_ATTEMPTS } else { 1 };
        let mut generated = None;
        for _ in 0..attempt_budget {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                run_generative(generator, &mut rng, size_hint)
            }));
            match outcome {
                Err(payload) => {
                    return Err(EngineError::GeneratorFailure {
                        iteration,
                        seed: iteration_seed,
                        message: panic_message(payload.as_ref()),
                    })
                }
                Ok(Err(GenFailure::CannotSatisfyCondition)) => {
                    return Err(EngineError::CannotSatisfyCondition {
                        iteration,
                        seed: iteration_seed,
                    })
                }
                // A replay failure can only come from a hand-written generator
                // function misusing the signal; report it as a defect rather
                // than letting it leak.
                Ok(Err(GenFailure::CannotRestoreValue)) => {
                    return Err(EngineError::GeneratorFailure {
                        iteration,
                        seed: iteration_seed,
                        message: "generator signalled a replay failure during generation"
                            .to_string(),
                    })
                }
                Ok(Ok((value, root))) => {
                    let novel = self.seen.insert(root.structural_hash());
                    if novel || !require_novel {
                        generated = Some((value, root));
                        break;
                    }
                }
            }
        }
        let Some((value, root)) = generated else {
            return Err(EngineError::CannotGenerateDistinct {
                iteration,
                attempts: MAX_NOVELTY_ATTEMPTS,
            });
        };
        let next_seed = rng.gen::<u64>();
        trace!("iteration {iteration}: seed {iteration_seed}, size hint {size_hint}");

        let property = self.property;
        let panic = match catch_unwind(AssertUnwindSafe(|| property(&value))) {
            Ok(true) => return Ok(IterationVerdict::Passed { next_seed }),
            Ok(false) => None,
            Err(payload) => Some(PanicPayload::from_boxed(payload)),
        };
        debug!("property falsified at iteration {iteration} (seed {iteration_seed})");
        (self.notifier)(&Progress::Falsified { iteration });

        let first = CounterExample {
            tree: Arc::new(root),
            value,
            panic,
        };
        let property: &dyn Fn(&T) -> bool = self.property;
        let minimization =
            shrinking::minimize(generator, property, &first, &mut self.seen, size_hint);
        (self.notifier)(&Progress::ShrinkFinished {
            attempts: minimization.stats.attempts,
            successful: minimization.stats.successful,
        });
        Ok(IterationVerdict::Falsified(PropertyFailure {
            first,
            minimal: minimization.minimal,
            global_seed: self.global_seed,
            iteration_seed,
            iteration,
            size_hint,
            stats: minimization.stats,
            stopping_reason: minimization.stopping_reason,
            reason_changed: minimization.reason_changed,
        }))
    }
}
