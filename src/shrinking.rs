// Structural minimization of falsifying draw trees.
//
// The shrinker never looks at generated values. It mutates the recorded tree
// of draws, replays each candidate through the unchanged generator function,
// and keeps any replacement whose value still falsifies the property. Replay
// incompatibility (`CannotRestoreValue`) is the expected, frequent outcome of
// a candidate and simply rejects it.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use log::{debug, trace};
use rustc_hash::FxHashSet;

use crate::data::run_replay;
use crate::engine::{panic_message, CounterExample, PanicPayload};
use crate::generator::Generator;
use crate::structure::{IntData, NodeId, StructureElement, StructureNode};

/// Counters describing one minimization run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShrinkStats {
    /// Candidate trees that were actually replayed.
    pub attempts: usize,
    /// Candidates that still falsified and became the new minimum.
    pub successful: usize,
}

/// Why minimization ended before reaching a fixed point.
#[derive(Debug, Clone)]
pub enum StoppingReason {
    /// Replaying a shrink candidate panicked outside the property itself,
    /// which points at a generator defect. The best tree committed so far is
    /// kept; further mutation would not be trustworthy.
    ReplayPanicked { message: String },
}

pub(crate) struct Minimization<T> {
    pub minimal: CounterExample<T>,
    pub stats: ShrinkStats,
    pub stopping_reason: Option<StoppingReason>,
    pub reason_changed: bool,
}

/// Shrink `first` to a local minimum: repeat full passes over the tree until
/// one commits no further replacement.
pub(crate) fn minimize<T: Clone>(
    generator: &Generator<T>,
    property: &dyn Fn(&T) -> bool,
    first: &CounterExample<T>,
    seen: &mut FxHashSet<u64>,
    size_hint: usize,
) -> Minimization<T> {
    let mut context = ShrinkContext {
        generator,
        property,
        seen,
        size_hint,
        root: Arc::clone(&first.tree),
        minimal: first.clone(),
        attempts: 0,
        successful: 0,
        stop: None,
    };
    loop {
        let committed = context.successful;
        let root_id = context.root.id;
        context.shrink_element(root_id);
        if context.stop.is_some() || context.successful == committed {
            break;
        }
    }
    debug!(
        "minimization finished: {} attempts, {} commits, tree size {} -> {}",
        context.attempts,
        context.successful,
        first.tree.size(),
        context.root.size()
    );
    let reason_changed = !same_failure_reason(first, &context.minimal);
    Minimization {
        minimal: context.minimal,
        stats: ShrinkStats {
            attempts: context.attempts,
            successful: context.successful,
        },
        stopping_reason: context.stop,
        reason_changed,
    }
}

fn same_failure_reason<T>(first: &CounterExample<T>, minimal: &CounterExample<T>) -> bool {
    match (&first.panic, &minimal.panic) {
        (None, None) => true,
        (Some(a), Some(b)) => a.same_kind(b),
        _ => false,
    }
}

struct ShrinkContext<'a, T> {
    generator: &'a Generator<T>,
    property: &'a dyn Fn(&T) -> bool,
    seen: &'a mut FxHashSet<u64>,
    size_hint: usize,
    root: Arc<StructureNode>,
    minimal: CounterExample<T>,
    attempts: usize,
    successful: usize,
    stop: Option<StoppingReason>,
}

impl<'a, T: Clone> ShrinkContext<'a, T> {
    /// A snapshot of the element currently at `id`, if it still exists in the
    /// minimal tree. Cheap: nodes share their subtrees.
    fn current_element(&self, id: NodeId) -> Option<StructureElement> {
        if id == self.root.id {
            return Some(StructureElement::Node((*self.root).clone()));
        }
        self.root.find(id).map(|child| (**child).clone())
    }

    /// Replace the subtree at `id` with `candidate`, replay, and commit when
    /// the value still falsifies. Every attempted tree enters the dedup set.
    fn try_replacement(&mut self, id: NodeId, candidate: StructureElement) -> bool {
        if self.stop.is_some() {
            return false;
        }
        let new_root = if id == self.root.id {
            match candidate {
                StructureElement::Node(node) => node,
                StructureElement::Int(_) => return false,
            }
        } else {
            match self.root.replace(id, candidate) {
                Some(root) => root,
                None => return false,
            }
        };
        if !self.seen.insert(new_root.structural_hash()) {
            return false;
        }
        self.attempts += 1;
        let new_root = Arc::new(new_root);

        let generator = self.generator;
        let size_hint = self.size_hint;
        let replayed =
            catch_unwind(AssertUnwindSafe(|| run_replay(generator, &new_root, size_hint)));
        let value = match replayed {
            Err(payload) => {
                self.stop = Some(StoppingReason::ReplayPanicked {
                    message: panic_message(payload.as_ref()),
                });
                return false;
            }
            Ok(Err(_)) => return false,
            Ok(Ok(value)) => value,
        };

        let property = self.property;
        let panic = match catch_unwind(AssertUnwindSafe(|| property(&value))) {
            Ok(true) => return false,
            Ok(false) => None,
            Err(payload) => Some(PanicPayload::from_boxed(payload)),
        };
        trace!("commit at {:?}: tree size {}", id, new_root.size());
        self.root = Arc::clone(&new_root);
        self.minimal = CounterExample {
            tree: new_root,
            value,
            panic,
        };
        self.successful += 1;
        true
    }

    fn shrink_element(&mut self, id: NodeId) {
        if self.stop.is_some() {
            return;
        }
        match self.current_element(id) {
            Some(StructureElement::Int(leaf)) => self.shrink_int(leaf),
            Some(StructureElement::Node(node)) => self.shrink_node(node),
            None => {}
        }
    }

    fn shrink_node(&mut self, node: StructureNode) {
        if node.shrink_prohibited {
            return;
        }
        let id = node.id;
        if node.is_list_shaped() {
            self.shrink_list_elements(id);
        }
        // Recurse into the current version's children; list shrinking above
        // may have removed some of the originals.
        let Some(StructureElement::Node(current)) = self.current_element(id) else {
            return;
        };
        let skip = usize::from(current.is_list_shaped());
        let child_ids: Vec<NodeId> = current
            .children
            .iter()
            .skip(skip)
            .map(|child| child.id())
            .collect();
        for child_id in child_ids {
            if self.stop.is_some() {
                return;
            }
            self.shrink_element(child_id);
        }
        // A sibling's mutation may have replaced this node meanwhile, so
        // re-fetch before the collapse heuristic.
        if let Some(StructureElement::Node(current)) = self.current_element(id) {
            self.try_collapse_alternative(&current);
        }
    }

    /// Element removal for list-shaped nodes: an exponential-then-binary
    /// search for the smallest reproducing sublist, tried tail-first.
    fn shrink_list_elements(&mut self, id: NodeId) {
        let mut limit = usize::MAX;
        loop {
            let mut last_success = None;
            let mut offset = 0;
            loop {
                if self.stop.is_some() {
                    return;
                }
                let Some(len) = self.list_len(id) else {
                    return;
                };
                if offset >= len || offset >= limit {
                    break;
                }
                let mut window = 1usize;
                loop {
                    if self.stop.is_some() {
                        return;
                    }
                    let Some(len) = self.list_len(id) else {
                        return;
                    };
                    if window > len - offset {
                        window = len - offset;
                        if window == 0 {
                            break;
                        }
                    }
                    if self.try_remove_elements(id, offset, window) {
                        last_success = Some(offset);
                        let Some(len) = self.list_len(id) else {
                            return;
                        };
                        if len == offset {
                            break;
                        }
                        window = (window * 2).min(len - offset);
                    } else if window > 1 {
                        window /= 2;
                    } else {
                        break;
                    }
                }
                offset += 1;
            }
            // Repeat the pass while something was removed, bounded by the
            // last offset that made progress.
            match last_success {
                None => return,
                Some(success) => limit = success.max(1),
            }
        }
    }

    fn list_len(&self, id: NodeId) -> Option<usize> {
        match self.current_element(id) {
            Some(StructureElement::Node(node)) if node.is_list_shaped() => {
                Some(node.children.len() - 1)
            }
            _ => None,
        }
    }

    /// Remove the `window` elements ending `offset` before the tail, with the
    /// leading counter rewritten to the new length.
    fn try_remove_elements(&mut self, id: NodeId, offset: usize, window: usize) -> bool {
        let Some(StructureElement::Node(node)) = self.current_element(id) else {
            return false;
        };
        let Some(counter) = node.list_length_counter() else {
            return false;
        };
        let len = node.children.len() - 1;
        if window == 0 || offset + window > len {
            return false;
        }
        let new_len = len - window;
        if !counter.distribution.is_valid(new_len as i64) {
            return false;
        }
        let counter = IntData {
            id: counter.id,
            value: new_len as i64,
            distribution: counter.distribution.clone(),
        };
        let start = 1 + (len - offset - window);
        let end = 1 + (len - offset);
        let mut children = Vec::with_capacity(node.children.len() - window);
        children.push(Arc::new(StructureElement::Int(counter)));
        children.extend(node.children[1..start].iter().cloned());
        children.extend(node.children[end..].iter().cloned());
        let candidate = StructureNode {
            id: node.id,
            shrink_prohibited: node.shrink_prohibited,
            children,
        };
        self.try_replacement(id, StructureElement::Node(candidate))
    }

    /// Leaf shrinking: zero first, then the absolute value for negatives,
    /// then halving toward zero with a boundary search once halving overshoots.
    fn shrink_int(&mut self, leaf: IntData) {
        if leaf.value == 0 {
            return;
        }
        if self.try_int(&leaf, 0) {
            return;
        }
        let mut current = leaf.value;
        if current < 0 {
            if let Some(flipped) = current.checked_neg() {
                if self.try_int(&leaf, flipped) {
                    current = flipped;
                }
            }
        }
        loop {
            if self.stop.is_some() {
                return;
            }
            let half = current / 2;
            if half == 0 || half == current {
                return;
            }
            if self.try_int(&leaf, half) {
                current = half;
                continue;
            }
            // The halved value no longer reproduces; close in on the boundary
            // between it and the smallest value known to fail.
            let (mut passing, mut failing) = (half, current);
            while (failing - passing).abs() > 1 {
                if self.stop.is_some() {
                    return;
                }
                let midpoint = passing + (failing - passing) / 2;
                if self.try_int(&leaf, midpoint) {
                    failing = midpoint;
                } else {
                    passing = midpoint;
                }
            }
            return;
        }
    }

    fn try_int(&mut self, leaf: &IntData, value: i64) -> bool {
        leaf.distribution.is_valid(value)
            && self.try_replacement(
                leaf.id,
                StructureElement::Int(IntData {
                    id: leaf.id,
                    value,
                    distribution: leaf.distribution.clone(),
                }),
            )
    }

    /// Collapse one layer of a redundant alternative: a node holding a
    /// discriminant and a one-element list whose element is itself
    /// alternative-shaped is replaced by that element. Best effort; targets
    /// recursive choice generators.
    fn try_collapse_alternative(&mut self, node: &StructureNode) {
        if self.stop.is_some() {
            return;
        }
        let Some(inner) = alternative_core(node) else {
            return;
        };
        let candidate = StructureNode {
            id: node.id,
            shrink_prohibited: inner.shrink_prohibited,
            children: inner.children.clone(),
        };
        let _ = self.try_replacement(node.id, StructureElement::Node(candidate));
    }
}

fn alternative_core(node: &StructureNode) -> Option<&StructureNode> {
    let list = alternative_list(node)?;
    if list.children.len() != 2 {
        return None;
    }
    let StructureElement::Node(inner) = &*list.children[1] else {
        return None;
    };
    alternative_list(inner)?;
    Some(inner)
}

fn alternative_list(node: &StructureNode) -> Option<&StructureNode> {
    if node.children.len() != 2 {
        return None;
    }
    let StructureElement::Int(_) = &*node.children[0] else {
        return None;
    };
    let StructureElement::Node(list) = &*node.children[1] else {
        return None;
    };
    if list.is_list_shaped() {
        Some(list)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{run_generative, run_replay};
    use crate::distributions::IntDistribution;
    use crate::generator;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn leaf(id: u64, value: i64, distribution: IntDistribution) -> Arc<StructureElement> {
        Arc::new(StructureElement::Int(IntData {
            id: NodeId(id),
            value,
            distribution,
        }))
    }

    fn node(id: u64, children: Vec<Arc<StructureElement>>) -> Arc<StructureElement> {
        Arc::new(StructureElement::Node(StructureNode {
            id: NodeId(id),
            shrink_prohibited: false,
            children,
        }))
    }

    fn counterexample<T>(tree: StructureNode, value: T) -> CounterExample<T> {
        CounterExample {
            tree: Arc::new(tree),
            value,
            panic: None,
        }
    }

    #[test]
    fn leaf_shrinking_finds_the_boundary() {
        let gen = generator::integers(0, 100);
        let mut rng = ChaCha8Rng::seed_from_u64(33);
        let (value, root) = loop {
            let (value, root) = run_generative(&gen, &mut rng, 1).unwrap();
            if value >= 50 {
                break (value, root);
            }
        };
        let property: &dyn Fn(&i64) -> bool = &|value| *value < 50;
        let first = counterexample(root, value);
        let mut seen = FxHashSet::default();
        seen.insert(first.tree.structural_hash());

        let result = minimize(&gen, property, &first, &mut seen, 1);
        assert_eq!(*result.minimal.value(), 50);
        assert!(result.stopping_reason.is_none());
        assert!(!result.reason_changed);
    }

    #[test]
    fn list_shrinking_removes_elements_and_zeroes_the_rest() {
        let gen = generator::lists_of(generator::integers(0, 9));
        let mut rng = ChaCha8Rng::seed_from_u64(41);
        let (value, root) = loop {
            let (value, root) = run_generative(&gen, &mut rng, 8).unwrap();
            if value.len() >= 3 {
                break (value, root);
            }
        };
        let property: &dyn Fn(&Vec<i64>) -> bool = &|list| list.len() < 3;
        let first_size = root.size();
        let first = counterexample(root, value);
        let mut seen = FxHashSet::default();
        seen.insert(first.tree.structural_hash());

        let result = minimize(&gen, property, &first, &mut seen, 8);
        assert_eq!(*result.minimal.value(), vec![0, 0, 0]);
        assert!(result.minimal.tree().size() <= first_size);
    }

    #[test]
    fn prohibited_subtrees_are_left_alone() {
        let gen = generator::zip_with(
            generator::integers(0, 9).no_shrink(),
            generator::integers(0, 9),
            |a, b| (a, b),
        );
        let mut rng = ChaCha8Rng::seed_from_u64(17);
        let ((a, b), root) = loop {
            let (pair, root) = run_generative(&gen, &mut rng, 1).unwrap();
            if pair.1 > 0 {
                break (pair, root);
            }
        };
        let property: &dyn Fn(&(i64, i64)) -> bool = &|_| false;
        let first = counterexample(root, (a, b));
        let mut seen = FxHashSet::default();
        seen.insert(first.tree.structural_hash());

        let result = minimize(&gen, property, &first, &mut seen, 1);
        let (min_a, min_b) = *result.minimal.value();
        assert_eq!(min_a, a, "non-shrinkable component must not change");
        assert_eq!(min_b, 0);
    }

    // A recursive alternative: either a small integer, or a one-element
    // wrapper around another alternative. Matches the shape the collapse
    // heuristic is after.
    fn alternative() -> Generator<i64> {
        Generator::from_fn(|data| {
            let discriminant = data.draw_int(&IntDistribution::uniform(0, 1))?;
            if discriminant == 0 {
                data.generate(&Generator::from_fn(|data| {
                    data.draw_int(&IntDistribution::uniform(0, 9))
                }))
            } else {
                data.generate(&Generator::from_fn(|data| {
                    let count = data.draw_int(&IntDistribution::uniform(1, 1))?;
                    let mut last = 0;
                    for _ in 0..count {
                        last = data.generate(&alternative())?;
                    }
                    Ok(last)
                }))
            }
        })
    }

    #[test]
    fn redundant_alternative_layers_collapse() {
        // root#0 [ disc#1=1, wrapper#2 [ count#3=1, alt#4 [ disc#5=0, leaf scope#6 [ int#7=0 ] ] ] ]
        let root = StructureNode {
            id: NodeId(0),
            shrink_prohibited: false,
            children: vec![
                leaf(1, 1, IntDistribution::uniform(0, 1)),
                node(
                    2,
                    vec![
                        leaf(3, 1, IntDistribution::uniform(1, 1)),
                        node(
                            4,
                            vec![
                                leaf(5, 0, IntDistribution::uniform(0, 1)),
                                node(6, vec![leaf(7, 0, IntDistribution::uniform(0, 9))]),
                            ],
                        ),
                    ],
                ),
            ],
        };
        let gen = alternative();
        assert_eq!(run_replay(&gen, &root, 1), Ok(0));

        let property: &dyn Fn(&i64) -> bool = &|_| false;
        let first_size = root.size();
        let first = counterexample(root, 0);
        let mut seen = FxHashSet::default();
        seen.insert(first.tree.structural_hash());

        let result = minimize(&gen, property, &first, &mut seen, 1);
        assert!(result.stats.successful >= 1);
        assert_eq!(*result.minimal.value(), 0);
        // One wrapper layer is gone: disc + leaf scope + int remain.
        assert_eq!(result.minimal.tree().size(), 4);
        assert!(result.minimal.tree().size() < first_size);
    }

    #[test]
    fn generator_panic_during_replay_stops_minimization() {
        let gen = Generator::from_fn(|data| {
            let value = data.draw_int(&IntDistribution::uniform(0, 100))?;
            if value < 50 {
                panic!("generator defect on the small branch");
            }
            Ok(value)
        });
        let root = StructureNode {
            id: NodeId(0),
            shrink_prohibited: false,
            children: vec![leaf(1, 87, IntDistribution::uniform(0, 100))],
        };
        let property: &dyn Fn(&i64) -> bool = &|value| *value < 50;
        let first = counterexample(root, 87);
        let mut seen = FxHashSet::default();
        seen.insert(first.tree.structural_hash());

        let result = minimize(&gen, property, &first, &mut seen, 1);
        match &result.stopping_reason {
            Some(StoppingReason::ReplayPanicked { message }) => {
                assert!(message.contains("generator defect"));
            }
            None => panic!("expected minimization to stop prematurely"),
        }
        // The pre-abort minimum is kept.
        assert_eq!(*result.minimal.value(), 87);
        assert_eq!(result.stats.successful, 0);
    }

    #[test]
    fn failure_reason_comparison_tracks_payload_kinds() {
        let str_panic = || {
            PanicPayload::from_boxed(
                catch_unwind(|| panic!("plain message")).unwrap_err(),
            )
        };
        let string_panic = |text: &str| {
            let owned = text.to_string();
            PanicPayload::from_boxed(
                catch_unwind(AssertUnwindSafe(|| std::panic::panic_any(owned))).unwrap_err(),
            )
        };

        let a = counterexample_with_panic(Some(str_panic()));
        let b = counterexample_with_panic(Some(str_panic()));
        let c = counterexample_with_panic(Some(string_panic("other kind")));
        let d = counterexample_with_panic(None);

        assert!(same_failure_reason(&a, &b));
        assert!(!same_failure_reason(&a, &c));
        assert!(!same_failure_reason(&a, &d));
        assert!(same_failure_reason(&d, &d));
    }

    fn counterexample_with_panic(panic: Option<PanicPayload>) -> CounterExample<i64> {
        CounterExample {
            tree: Arc::new(StructureNode::new(NodeId(0))),
            value: 0,
            panic,
        }
    }
}
