// Data sources: generative recording and deterministic replay.
//
// A generator is a pure function over a `DataSource`. In generative mode the
// source owns fresh randomness and records every draw into a structure tree;
// in replay mode it walks a previously recorded tree and re-derives the same
// value, or reports that the tree no longer matches the generator's shape.

use std::sync::Arc;

use rand_chacha::ChaCha8Rng;
use thiserror::Error;

use crate::distributions::IntDistribution;
use crate::generator::Generator;
use crate::structure::{IntData, NodeId, StructureElement, StructureNode};

/// Retry budget for conditional (filtered) generation.
pub const MAX_CONDITION_ATTEMPTS: usize = 100;

/// Why a generator run could not produce a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GenFailure {
    /// A conditional generator exhausted its retry budget.
    #[error("condition unsatisfiable within the retry budget")]
    CannotSatisfyCondition,
    /// Replay only: the recorded tree is structurally incompatible with the
    /// generator. Expected and frequent during shrinking; never an error of
    /// the property under test.
    #[error("cannot restore a value from the recorded structure")]
    CannotRestoreValue,
}

pub type GenResult<T> = Result<T, GenFailure>;

/// The source a generator function draws from.
pub enum DataSource<'a> {
    Generative(GenerativeData<'a>),
    Replay(ReplayData<'a>),
}

/// Recording mode: draws fresh randomness and builds the structure tree.
pub struct GenerativeData<'a> {
    rng: &'a mut ChaCha8Rng,
    next_id: u64,
    scopes: Vec<Scope>,
}

struct Scope {
    id: NodeId,
    shrink_prohibited: bool,
    size_hint: usize,
    children: Vec<Arc<StructureElement>>,
}

/// Replay mode: a cursor stack over a previously recorded tree.
pub struct ReplayData<'a> {
    stack: Vec<Cursor<'a>>,
}

struct Cursor<'a> {
    node: &'a StructureNode,
    next: usize,
    size_hint: usize,
}

fn child_size_hint(parent: usize) -> usize {
    parent.saturating_sub(1).max(1)
}

impl<'a> GenerativeData<'a> {
    fn new(rng: &'a mut ChaCha8Rng, size_hint: usize) -> GenerativeData<'a> {
        GenerativeData {
            rng,
            next_id: 1,
            scopes: vec![Scope {
                id: NodeId(0),
                shrink_prohibited: false,
                size_hint,
                children: Vec::new(),
            }],
        }
    }

    fn fresh_id(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }

    fn top(&self) -> &Scope {
        self.scopes.last().expect("generative scope stack is empty")
    }

    fn top_mut(&mut self) -> &mut Scope {
        self.scopes.last_mut().expect("generative scope stack is empty")
    }

    fn push_scope(&mut self, shrink_prohibited: bool) {
        let id = self.fresh_id();
        let size_hint = child_size_hint(self.top().size_hint);
        self.scopes.push(Scope {
            id,
            shrink_prohibited,
            size_hint,
            children: Vec::new(),
        });
    }

    fn pop_scope(&mut self) -> StructureNode {
        let scope = self.scopes.pop().expect("generative scope stack is empty");
        StructureNode {
            id: scope.id,
            shrink_prohibited: scope.shrink_prohibited,
            children: scope.children,
        }
    }

    fn close_scope(&mut self) {
        let node = self.pop_scope();
        self.top_mut()
            .children
            .push(Arc::new(StructureElement::Node(node)));
    }

    fn discard_last_child(&mut self, expected_before: usize) {
        let scope = self.top_mut();
        assert_eq!(
            scope.children.len(),
            expected_before + 1,
            "a discarded conditional attempt must be the most recently added child"
        );
        scope.children.pop();
    }

    fn into_root(mut self) -> StructureNode {
        let root = self.pop_scope();
        assert!(
            self.scopes.is_empty(),
            "unbalanced scopes at the end of generation"
        );
        root
    }
}

impl<'a> ReplayData<'a> {
    fn new(root: &'a StructureNode, size_hint: usize) -> ReplayData<'a> {
        ReplayData {
            stack: vec![Cursor {
                node: root,
                next: 0,
                size_hint,
            }],
        }
    }

    fn next_int(&mut self, distribution: &IntDistribution) -> GenResult<i64> {
        let cursor = self.stack.last_mut().expect("replay cursor stack is empty");
        let node = cursor.node;
        let index = cursor.next;
        cursor.next += 1;
        match node.children.get(index).map(|child| &**child) {
            Some(StructureElement::Int(leaf)) if distribution.is_valid(leaf.value) => {
                Ok(leaf.value)
            }
            _ => Err(GenFailure::CannotRestoreValue),
        }
    }

    fn descend(&mut self) -> GenResult<()> {
        let cursor = self.stack.last_mut().expect("replay cursor stack is empty");
        let node = cursor.node;
        let index = cursor.next;
        let size_hint = child_size_hint(cursor.size_hint);
        cursor.next += 1;
        match node.children.get(index).map(|child| &**child) {
            Some(StructureElement::Node(next)) => {
                self.stack.push(Cursor {
                    node: next,
                    next: 0,
                    size_hint,
                });
                Ok(())
            }
            _ => Err(GenFailure::CannotRestoreValue),
        }
    }

    fn ascend(&mut self) {
        self.stack.pop();
        debug_assert!(!self.stack.is_empty(), "replay cursor stack underflow");
    }
}

impl<'a> DataSource<'a> {
    /// Draw one integer from `distribution` at the current position.
    pub fn draw_int(&mut self, distribution: &IntDistribution) -> GenResult<i64> {
        match self {
            DataSource::Generative(data) => {
                let value = distribution.sample(data.rng);
                assert!(
                    distribution.is_valid(value),
                    "distribution {:?} produced a value it declares invalid: {}",
                    distribution,
                    value
                );
                let id = data.fresh_id();
                data.top_mut().children.push(Arc::new(StructureElement::Int(
                    IntData {
                        id,
                        value,
                        distribution: distribution.clone(),
                    },
                )));
                Ok(value)
            }
            DataSource::Replay(data) => data.next_int(distribution),
        }
    }

    /// Advisory size for collection generators; decreases with nesting depth
    /// to bound recursive generator growth.
    pub fn size_hint(&self) -> usize {
        match self {
            DataSource::Generative(data) => data.top().size_hint,
            DataSource::Replay(data) => {
                data.stack.last().expect("replay cursor stack is empty").size_hint
            }
        }
    }

    /// Run a nested generator in a fresh child scope.
    pub fn generate<T>(&mut self, generator: &Generator<T>) -> GenResult<T> {
        self.enter_scope(false)?;
        let result = generator.run(self);
        self.exit_scope();
        result
    }

    /// Run a nested generator in a child scope that the shrink engine will
    /// never descend into.
    pub fn generate_non_shrinkable<T>(&mut self, generator: &Generator<T>) -> GenResult<T> {
        self.enter_scope(true)?;
        let result = generator.run(self);
        self.exit_scope();
        result
    }

    /// Run a nested generator until `predicate` accepts its value.
    ///
    /// Generatively this retries up to [`MAX_CONDITION_ATTEMPTS`] times,
    /// discarding each rejected attempt's subtree. On replay the retries are
    /// already baked into the recorded tree, so the generator runs once and a
    /// predicate miss means the candidate tree is incompatible.
    pub fn generate_conditional<T>(
        &mut self,
        generator: &Generator<T>,
        predicate: impl Fn(&T) -> bool,
    ) -> GenResult<T> {
        if matches!(self, DataSource::Replay(_)) {
            let value = self.generate(generator)?;
            return if predicate(&value) {
                Ok(value)
            } else {
                Err(GenFailure::CannotRestoreValue)
            };
        }
        for _ in 0..MAX_CONDITION_ATTEMPTS {
            let before = match self {
                DataSource::Generative(data) => data.top().children.len(),
                DataSource::Replay(_) => unreachable!(),
            };
            let value = self.generate(generator)?;
            if predicate(&value) {
                return Ok(value);
            }
            match self {
                DataSource::Generative(data) => data.discard_last_child(before),
                DataSource::Replay(_) => unreachable!(),
            }
        }
        Err(GenFailure::CannotSatisfyCondition)
    }

    fn enter_scope(&mut self, shrink_prohibited: bool) -> GenResult<()> {
        match self {
            DataSource::Generative(data) => {
                data.push_scope(shrink_prohibited);
                Ok(())
            }
            DataSource::Replay(data) => data.descend(),
        }
    }

    fn exit_scope(&mut self) {
        match self {
            DataSource::Generative(data) => data.close_scope(),
            DataSource::Replay(data) => data.ascend(),
        }
    }
}

/// Run `generator` generatively, recording its draws. Returns the produced
/// value together with the recorded tree.
pub fn run_generative<T>(
    generator: &Generator<T>,
    rng: &mut ChaCha8Rng,
    size_hint: usize,
) -> GenResult<(T, StructureNode)> {
    let mut source = DataSource::Generative(GenerativeData::new(rng, size_hint));
    let value = generator.run(&mut source)?;
    let DataSource::Generative(data) = source else {
        unreachable!()
    };
    Ok((value, data.into_root()))
}

/// Replay `generator` over a previously recorded tree.
pub fn run_replay<T>(
    generator: &Generator<T>,
    root: &StructureNode,
    size_hint: usize,
) -> GenResult<T> {
    let mut source = DataSource::Replay(ReplayData::new(root, size_hint));
    generator.run(&mut source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::{self, Generator};
    use rand::SeedableRng;

    fn rng(seed: u64) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(seed)
    }

    #[test]
    fn generative_records_draws_in_order() {
        let gen = Generator::from_fn(|data| {
            let a = data.draw_int(&IntDistribution::uniform(0, 9))?;
            let b = data.draw_int(&IntDistribution::uniform(10, 19))?;
            let c = data.generate(&Generator::from_fn(|data| {
                data.draw_int(&IntDistribution::uniform(20, 29))
            }))?;
            Ok((a, b, c))
        });

        let ((a, b, c), root) = run_generative(&gen, &mut rng(7), 5).unwrap();
        assert_eq!(root.children.len(), 3);

        let StructureElement::Int(first) = &*root.children[0] else {
            panic!("expected a leaf");
        };
        let StructureElement::Int(second) = &*root.children[1] else {
            panic!("expected a leaf");
        };
        let StructureElement::Node(scope) = &*root.children[2] else {
            panic!("expected a node");
        };
        assert_eq!(first.value, a);
        assert_eq!(second.value, b);
        assert_eq!(scope.children.len(), 1);
        let StructureElement::Int(inner) = &*scope.children[0] else {
            panic!("expected a leaf");
        };
        assert_eq!(inner.value, c);

        // Preorder, strictly increasing ids.
        assert!(first.id < second.id);
        assert!(second.id < scope.id);
        assert!(scope.id < inner.id);
    }

    #[test]
    fn replay_round_trips_the_recorded_value() {
        let gen = generator::zip_with(
            generator::lists_of(generator::integers(0, 50)),
            generator::integers(-5, 5),
            |list, offset| (list, offset),
        );
        let (value, root) = run_generative(&gen, &mut rng(11), 8).unwrap();
        let replayed = run_replay(&gen, &root, 8).unwrap();
        assert_eq!(replayed, value);
    }

    #[test]
    fn replay_fails_when_the_tree_is_exhausted() {
        let one = Generator::from_fn(|data| data.draw_int(&IntDistribution::uniform(0, 9)));
        let two = Generator::from_fn(|data| {
            let a = data.draw_int(&IntDistribution::uniform(0, 9))?;
            let b = data.draw_int(&IntDistribution::uniform(0, 9))?;
            Ok(a + b)
        });
        let (_, root) = run_generative(&one, &mut rng(3), 1).unwrap();
        assert_eq!(run_replay(&two, &root, 1), Err(GenFailure::CannotRestoreValue));
    }

    #[test]
    fn replay_validates_against_the_current_distribution() {
        let wide = Generator::from_fn(|data| data.draw_int(&IntDistribution::uniform(0, 100)));
        let narrow = Generator::from_fn(|data| data.draw_int(&IntDistribution::uniform(0, 3)));
        let mut source = rng(14);
        // Find a recording whose value a narrower distribution must reject.
        let root = loop {
            let (value, root) = run_generative(&wide, &mut source, 1).unwrap();
            if value > 3 {
                break root;
            }
        };
        assert_eq!(
            run_replay(&narrow, &root, 1),
            Err(GenFailure::CannotRestoreValue)
        );
    }

    #[test]
    fn replay_expects_a_node_where_one_was_recorded() {
        let nested = Generator::from_fn(|data| {
            data.generate(&Generator::from_fn(|data| {
                data.draw_int(&IntDistribution::uniform(0, 9))
            }))
        });
        let flat = Generator::from_fn(|data| data.draw_int(&IntDistribution::uniform(0, 9)));
        let (_, root) = run_generative(&flat, &mut rng(5), 1).unwrap();
        assert_eq!(
            run_replay(&nested, &root, 1),
            Err(GenFailure::CannotRestoreValue)
        );
    }

    #[test]
    fn conditional_generation_discards_rejected_attempts() {
        let gen = generator::integers(0, 9).such_that(|value| *value >= 5);
        let (value, root) = run_generative(&gen, &mut rng(21), 1).unwrap();
        assert!(value >= 5);
        // Rejected attempts were removed; only the surviving scope remains.
        assert_eq!(root.children.len(), 1);
        assert!(matches!(&*root.children[0], StructureElement::Node(_)));
        let replayed = run_replay(&gen, &root, 1).unwrap();
        assert_eq!(replayed, value);
    }

    #[test]
    fn conditional_generation_gives_up_eventually() {
        let gen = generator::integers(0, 9).such_that(|_| false);
        assert_eq!(
            run_generative(&gen, &mut rng(2), 1).map(|(value, _)| value),
            Err(GenFailure::CannotSatisfyCondition)
        );
    }

    #[test]
    fn non_shrinkable_scopes_are_flagged() {
        let gen = generator::integers(0, 9).no_shrink();
        let (_, root) = run_generative(&gen, &mut rng(8), 1).unwrap();
        assert_eq!(root.children.len(), 1);
        let StructureElement::Node(scope) = &*root.children[0] else {
            panic!("expected a node");
        };
        assert!(scope.shrink_prohibited);
    }

    #[test]
    fn size_hint_shrinks_with_depth() {
        let gen = Generator::from_fn(|data| {
            let outer = data.size_hint();
            let inner =
                data.generate(&Generator::from_fn(|data| Ok(data.size_hint())))?;
            Ok((outer, inner))
        });
        let ((outer, inner), _) = run_generative(&gen, &mut rng(1), 5).unwrap();
        assert_eq!((outer, inner), (5, 4));
        let ((outer, inner), _) = run_generative(&gen, &mut rng(1), 1).unwrap();
        assert_eq!((outer, inner), (1, 1));
        let ((outer, inner), _) = run_generative(&gen, &mut rng(1), 0).unwrap();
        assert_eq!((outer, inner), (0, 1));
    }
}
