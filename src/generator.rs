// Generator combinators.
//
// A `Generator<T>` wraps a pure function from a `DataSource` to a value.
// Purity is a hard requirement: the same recorded tree must always replay to
// the same value, otherwise shrinking is unsound. All composition goes through
// the data source so that every nested generator leaves a scope in the
// recorded tree.

use std::rc::Rc;

use crate::data::{DataSource, GenResult};
use crate::distributions::IntDistribution;

pub struct Generator<T> {
    function: Rc<dyn Fn(&mut DataSource<'_>) -> GenResult<T>>,
}

impl<T> Clone for Generator<T> {
    fn clone(&self) -> Generator<T> {
        Generator {
            function: Rc::clone(&self.function),
        }
    }
}

impl<T> Generator<T> {
    pub(crate) fn run(&self, data: &mut DataSource<'_>) -> GenResult<T> {
        (self.function)(data)
    }
}

impl<T: 'static> Generator<T> {
    /// Wrap a raw generator function.
    pub fn from_fn(
        function: impl Fn(&mut DataSource<'_>) -> GenResult<T> + 'static,
    ) -> Generator<T> {
        Generator {
            function: Rc::new(function),
        }
    }

    /// Transform the produced value. Performs no extra draws.
    pub fn map<U: 'static>(self, f: impl Fn(T) -> U + 'static) -> Generator<U> {
        Generator::from_fn(move |data| self.run(data).map(&f))
    }

    /// Generate a value, then let `f` choose the generator that continues
    /// within the same structure scope.
    pub fn flat_map<U: 'static>(
        self,
        f: impl Fn(T) -> Generator<U> + 'static,
    ) -> Generator<U> {
        Generator::from_fn(move |data| {
            let value = data.generate(&self)?;
            f(value).run(data)
        })
    }

    /// Filter with a bounded retry budget. Prefer narrowing the generator
    /// itself when the predicate rejects most values.
    pub fn such_that(self, predicate: impl Fn(&T) -> bool + 'static) -> Generator<T> {
        Generator::from_fn(move |data| data.generate_conditional(&self, &predicate))
    }

    /// Opt this generator's output out of structural shrinking.
    pub fn no_shrink(self) -> Generator<T> {
        Generator::from_fn(move |data| data.generate_non_shrinkable(&self))
    }
}

pub fn constant<T: Clone + 'static>(value: T) -> Generator<T> {
    Generator::from_fn(move |_| Ok(value.clone()))
}

/// Uniform integers in the inclusive range `[min, max]`.
pub fn integers(min: i64, max: i64) -> Generator<i64> {
    let distribution = IntDistribution::uniform(min, max);
    Generator::from_fn(move |data| data.draw_int(&distribution))
}

/// Non-negative integers whose expected magnitude follows the size hint.
pub fn naturals() -> Generator<i64> {
    Generator::from_fn(|data| {
        let distribution = IntDistribution::geometric(data.size_hint());
        data.draw_int(&distribution)
    })
}

pub fn booleans() -> Generator<bool> {
    integers(0, 1).map(|value| value == 1)
}

/// A uniformly chosen element of `options`. The index shrinks toward the
/// first option.
pub fn sampled_from<T: Clone + 'static>(options: Vec<T>) -> Generator<T> {
    assert!(!options.is_empty(), "sampled_from needs at least one option");
    let distribution = IntDistribution::uniform(0, options.len() as i64 - 1);
    Generator::from_fn(move |data| {
        let index = data.draw_int(&distribution)?;
        Ok(options[index as usize].clone())
    })
}

/// A uniform choice among generators. The choice index itself is drawn
/// non-shrinkably; shrinking works on the chosen alternative's output.
pub fn any_of<T: 'static>(alternatives: Vec<Generator<T>>) -> Generator<T> {
    assert!(!alternatives.is_empty(), "any_of needs at least one alternative");
    let index = integers(0, alternatives.len() as i64 - 1);
    Generator::from_fn(move |data| {
        let choice = data.generate_non_shrinkable(&index)? as usize;
        data.generate(&alternatives[choice])
    })
}

/// A weighted choice among generators. The discriminant shrinks toward lower
/// indices, so put the simplest alternative first.
pub fn frequency<T: 'static>(choices: Vec<(u64, Generator<T>)>) -> Generator<T> {
    let distribution =
        IntDistribution::frequency(choices.iter().map(|(weight, _)| *weight).collect());
    Generator::from_fn(move |data| {
        let index = data.draw_int(&distribution)? as usize;
        data.generate(&choices[index].1)
    })
}

pub fn zip_with<A: 'static, B: 'static, T: 'static>(
    a: Generator<A>,
    b: Generator<B>,
    f: impl Fn(A, B) -> T + 'static,
) -> Generator<T> {
    Generator::from_fn(move |data| {
        let left = data.generate(&a)?;
        let right = data.generate(&b)?;
        Ok(f(left, right))
    })
}

/// Lists whose length follows a geometric distribution on the size hint.
///
/// The length is recorded as a shrinkable leading integer followed by one
/// scope per element; the shrink engine's list handling depends on exactly
/// this shape.
pub fn lists_of<T: 'static>(item: Generator<T>) -> Generator<Vec<T>> {
    Generator::from_fn(move |data| {
        let distribution = IntDistribution::geometric(data.size_hint());
        let length = data.draw_int(&distribution)?;
        let mut items = Vec::with_capacity(length as usize);
        for _ in 0..length {
            items.push(data.generate(&item)?);
        }
        Ok(items)
    })
}

/// Like [`lists_of`], but the length is bounded below by one. The bound is
/// part of the length counter's distribution, so shrinking can never empty
/// the list.
pub fn non_empty_lists_of<T: 'static>(item: Generator<T>) -> Generator<Vec<T>> {
    Generator::from_fn(move |data| {
        let distribution = IntDistribution::bound(
            1,
            i64::MAX,
            IntDistribution::geometric(data.size_hint()),
        );
        let length = data.draw_int(&distribution)?;
        let mut items = Vec::with_capacity(length as usize);
        for _ in 0..length {
            items.push(data.generate(&item)?);
        }
        Ok(items)
    })
}

/// Characters in the inclusive range `[min, max]`, skipping code points that
/// are not valid `char`s.
pub fn chars_in(min: char, max: char) -> Generator<char> {
    assert!(min <= max, "empty char range {:?}..={:?}", min, max);
    integers(min as i64, max as i64)
        .such_that(|code| char::from_u32(*code as u32).is_some())
        .map(|code| char::from_u32(code as u32).unwrap_or(char::REPLACEMENT_CHARACTER))
}

pub fn ascii_printable() -> Generator<char> {
    integers(32, 126).map(|code| code as u8 as char)
}

pub fn ascii_letters() -> Generator<char> {
    sampled_from(('a'..='z').chain('A'..='Z').collect())
}

pub fn strings_of(chars: Generator<char>) -> Generator<String> {
    lists_of(chars).map(|chars| chars.into_iter().collect())
}
