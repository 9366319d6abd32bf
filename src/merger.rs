//! K-way mergers.
//!
//! Both mergers take a set of individually sorted inputs and produce a single sorted stream.
//! Equal keys are emitted in input order: an item from input *i* always precedes an equal item from input *j > i*.
//! Input errors are passed through in-stream, after the items that precede them.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::error::Error;

/// Merge frontier strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeStrategy {
    /// Binary heap frontier, *m* \* log(*n*).
    #[default]
    Heap,
    /// Linear scan over all input heads, *m* \* *n*. Only reasonable for a handful of inputs.
    LinearScan,
}

impl MergeStrategy {
    /// Creates a merger of the selected strategy.
    ///
    /// # Arguments
    /// * `chunks` - Sorted inputs to be merged, their order defines the tie-break
    /// * `key` - Function extracting the sort key of an item
    pub fn merge<T, E, C, F, K, I>(&self, chunks: I, key: F) -> Merger<T, E, C, F, K>
    where
        E: Error,
        C: IntoIterator<Item = Result<T, E>>,
        F: Fn(&T) -> K,
        K: Ord,
        I: IntoIterator<Item = C>,
    {
        match self {
            MergeStrategy::Heap => Merger::Heap(BinaryHeapMerger::new(chunks, key)),
            MergeStrategy::LinearScan => Merger::LinearScan(LinearScanMerger::new(chunks, key)),
        }
    }
}

/// Merger of either strategy.
pub enum Merger<T, E, C, F, K>
where
    E: Error,
    C: IntoIterator<Item = Result<T, E>>,
    F: Fn(&T) -> K,
    K: Ord,
{
    Heap(BinaryHeapMerger<T, E, C, F, K>),
    LinearScan(LinearScanMerger<T, E, C, F>),
}

impl<T, E, C, F, K> Iterator for Merger<T, E, C, F, K>
where
    E: Error,
    C: IntoIterator<Item = Result<T, E>>,
    F: Fn(&T) -> K,
    K: Ord,
{
    type Item = Result<T, E>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Merger::Heap(merger) => merger.next(),
            Merger::LinearScan(merger) => merger.next(),
        }
    }
}

/// Merge inputs together with the item currently exposed by each of them.
struct Heads<T, I> {
    inputs: Vec<Option<I>>,
    heads: Vec<Option<T>>,
}

impl<T, E, I> Heads<T, I>
where
    I: Iterator<Item = Result<T, E>>,
{
    fn new(inputs: Vec<I>) -> Self {
        let heads = Vec::from_iter(inputs.iter().map(|_| None));
        let inputs = Vec::from_iter(inputs.into_iter().map(Some));

        Heads { inputs, heads }
    }

    fn len(&self) -> usize {
        self.inputs.len()
    }

    /// Pulls the next item of the input into its head slot. Returns `false` once the input is exhausted.
    /// An exhausted input is dropped immediately releasing its resources.
    fn advance(&mut self, idx: usize) -> Result<bool, E> {
        let next = match self.inputs[idx].as_mut() {
            Some(input) => input.next(),
            None => None,
        };

        match next {
            Some(Ok(item)) => {
                self.heads[idx] = Some(item);
                Ok(true)
            }
            Some(Err(err)) => Err(err),
            None => {
                self.inputs[idx] = None;
                Ok(false)
            }
        }
    }

    fn head(&self, idx: usize) -> Option<&T> {
        self.heads[idx].as_ref()
    }

    fn take(&mut self, idx: usize) -> Option<T> {
        self.heads[idx].take()
    }
}

/// Binary heap merger implementation.
/// Merges multiple sorted inputs into a single sorted output.
/// Time complexity is *m* \* log(*n*) in worst case where *m* is the number of items,
/// *n* is the number of chunks (inputs). At most one item per input is held in memory.
pub struct BinaryHeapMerger<T, E, C, F, K>
where
    E: Error,
    C: IntoIterator<Item = Result<T, E>>,
    F: Fn(&T) -> K,
    K: Ord,
{
    // binary heap is max-heap by default so we reverse it to convert it to min-heap;
    // the input index breaks ties between equal keys
    frontier: BinaryHeap<Reverse<(K, usize)>>,
    chunks: Heads<T, C::IntoIter>,
    key: F,
    primed: usize,
    pending_error: Option<E>,
}

impl<T, E, C, F, K> BinaryHeapMerger<T, E, C, F, K>
where
    E: Error,
    C: IntoIterator<Item = Result<T, E>>,
    F: Fn(&T) -> K,
    K: Ord,
{
    /// Creates an instance of a binary heap merger using chunks as inputs.
    /// Chunk items should be sorted in ascending order otherwise the result is undefined.
    ///
    /// # Arguments
    /// * `chunks` - Chunks to be merged in a single sorted one
    /// * `key` - Function extracting the sort key of an item
    pub fn new<I>(chunks: I, key: F) -> Self
    where
        I: IntoIterator<Item = C>,
    {
        let chunks = Heads::new(Vec::from_iter(chunks.into_iter().map(|c| c.into_iter())));
        let frontier = BinaryHeap::with_capacity(chunks.len());

        return BinaryHeapMerger {
            frontier,
            chunks,
            key,
            primed: 0,
            pending_error: None,
        };
    }

    fn advance(&mut self, idx: usize) -> Result<(), E> {
        if self.chunks.advance(idx)? {
            if let Some(item) = self.chunks.head(idx) {
                self.frontier.push(Reverse(((self.key)(item), idx)));
            }
        }
        Ok(())
    }
}

impl<T, E, C, F, K> Iterator for BinaryHeapMerger<T, E, C, F, K>
where
    E: Error,
    C: IntoIterator<Item = Result<T, E>>,
    F: Fn(&T) -> K,
    K: Ord,
{
    type Item = Result<T, E>;

    /// Returns the next item from the inputs in ascending order.
    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.pending_error.take() {
            return Some(Err(err));
        }

        while self.primed < self.chunks.len() {
            let idx = self.primed;
            self.primed += 1;
            if let Err(err) = self.advance(idx) {
                return Some(Err(err));
            }
        }

        let Reverse((_, idx)) = self.frontier.pop()?;
        let result = self.chunks.take(idx)?;
        if let Err(err) = self.advance(idx) {
            self.pending_error = Some(err);
        }

        return Some(Ok(result));
    }
}

/// Linear scan merger implementation.
/// Looks through the heads of all inputs for the minimum on every step.
/// Time complexity is *m* \* *n* where *m* is the number of items, *n* is the number of chunks (inputs).
pub struct LinearScanMerger<T, E, C, F>
where
    E: Error,
    C: IntoIterator<Item = Result<T, E>>,
{
    chunks: Heads<T, C::IntoIter>,
    key: F,
    primed: usize,
    pending_error: Option<E>,
}

impl<T, E, C, F> LinearScanMerger<T, E, C, F>
where
    E: Error,
    C: IntoIterator<Item = Result<T, E>>,
{
    /// Creates an instance of a linear scan merger using chunks as inputs.
    /// Chunk items should be sorted in ascending order otherwise the result is undefined.
    pub fn new<I>(chunks: I, key: F) -> Self
    where
        I: IntoIterator<Item = C>,
    {
        LinearScanMerger {
            chunks: Heads::new(Vec::from_iter(chunks.into_iter().map(|c| c.into_iter()))),
            key,
            primed: 0,
            pending_error: None,
        }
    }
}

impl<T, E, C, F, K> Iterator for LinearScanMerger<T, E, C, F>
where
    E: Error,
    C: IntoIterator<Item = Result<T, E>>,
    F: Fn(&T) -> K,
    K: Ord,
{
    type Item = Result<T, E>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.pending_error.take() {
            return Some(Err(err));
        }

        while self.primed < self.chunks.len() {
            let idx = self.primed;
            self.primed += 1;
            if let Err(err) = self.chunks.advance(idx) {
                return Some(Err(err));
            }
        }

        let mut min: Option<(K, usize)> = None;
        for idx in 0..self.chunks.len() {
            if let Some(item) = self.chunks.head(idx) {
                let key = (self.key)(item);
                // strict comparison keeps the lowest input index among equal keys
                if min.as_ref().map_or(true, |(min_key, _)| key < *min_key) {
                    min = Some((key, idx));
                }
            }
        }

        let (_, idx) = min?;
        let result = self.chunks.take(idx)?;
        if let Err(err) = self.chunks.advance(idx) {
            self.pending_error = Some(err);
        }

        return Some(Ok(result));
    }
}

#[cfg(test)]
mod test {
    use rstest::*;
    use std::error::Error;
    use std::io::{self, ErrorKind};

    use super::MergeStrategy;

    #[rstest]
    #[case(
        vec![],
        vec![],
    )]
    #[case(
        vec![
            vec![],
            vec![]
        ],
        vec![],
    )]
    #[case(
        vec![
            vec![Ok(4), Ok(5), Ok(7)],
            vec![Ok(1), Ok(6)],
            vec![Ok(3)],
            vec![],
        ],
        vec![Ok(1), Ok(3), Ok(4), Ok(5), Ok(6), Ok(7)],
    )]
    #[case(
        vec![
            vec![Result::Err(io::Error::new(ErrorKind::Other, "test error"))]
        ],
        vec![
            Result::Err(io::Error::new(ErrorKind::Other, "test error"))
        ],
    )]
    #[case(
        vec![
            vec![Ok(3), Result::Err(io::Error::new(ErrorKind::Other, "test error"))],
            vec![Ok(1), Ok(2)],
        ],
        vec![
            Ok(1),
            Ok(2),
            Ok(3),
            Result::Err(io::Error::new(ErrorKind::Other, "test error")),
        ],
    )]
    fn test_merger(
        #[case] chunks: Vec<Vec<Result<i32, io::Error>>>,
        #[case] expected_result: Vec<Result<i32, io::Error>>,
    ) {
        for strategy in [MergeStrategy::Heap, MergeStrategy::LinearScan] {
            let chunks = Vec::from_iter(chunks.iter().map(|chunk| Vec::from_iter(chunk.iter().map(clone_result))));
            let merger = strategy.merge(chunks, |item: &i32| *item);
            let actual_result: Vec<Result<i32, io::Error>> = merger.collect();
            assert!(
                compare_vectors_of_result::<_, io::Error>(&actual_result, &expected_result),
                "strategy={:?}, actual={:?}, expected={:?}",
                strategy,
                actual_result,
                expected_result
            );
        }
    }

    fn clone_result(result: &Result<i32, io::Error>) -> Result<i32, io::Error> {
        match result {
            Ok(item) => Ok(*item),
            Err(err) => Err(io::Error::new(err.kind(), err.to_string())),
        }
    }

    #[rstest]
    fn test_merger_tie_break(#[values(MergeStrategy::Heap, MergeStrategy::LinearScan)] strategy: MergeStrategy) {
        let chunks: Vec<Vec<Result<(i32, &str), io::Error>>> = vec![
            vec![Ok((3, "beta")), Ok((5, "alpha"))],
            vec![Ok((1, "delta")), Ok((5, "gamma"))],
            vec![Ok((5, "omega"))],
        ];

        let merger = strategy.merge(chunks, |item: &(i32, &str)| item.0);
        let actual_result: Result<Vec<(i32, &str)>, io::Error> = merger.collect();

        assert_eq!(
            actual_result.unwrap(),
            vec![(1, "delta"), (3, "beta"), (5, "alpha"), (5, "gamma"), (5, "omega")]
        );
    }

    #[test]
    fn test_strategies_agree() {
        let chunks = || {
            Vec::from_iter((0..7).map(|chunk| {
                Vec::from_iter((0..50).map(move |item| Ok::<_, io::Error>((item * (chunk + 1) / 3, chunk))))
            }))
        };

        let heap: Vec<(i32, i32)> = MergeStrategy::Heap
            .merge(chunks(), |item: &(i32, i32)| item.0)
            .map(Result::unwrap)
            .collect();
        let scan: Vec<(i32, i32)> = MergeStrategy::LinearScan
            .merge(chunks(), |item: &(i32, i32)| item.0)
            .map(Result::unwrap)
            .collect();

        assert_eq!(heap.len(), 350);
        assert_eq!(heap, scan);
        assert!(heap.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    fn compare_vectors_of_result<T: PartialEq, E: Error + 'static>(
        actual: &Vec<Result<T, E>>,
        expected: &Vec<Result<T, E>>,
    ) -> bool {
        actual.len() == expected.len()
            && actual
                .into_iter()
                .zip(expected)
                .all(
                    |(actual_result, expected_result)| match (actual_result, expected_result) {
                        (Ok(actual_result), Ok(expected_result)) if actual_result == expected_result => true,
                        (Err(actual_err), Err(expected_err)) => actual_err.to_string() == expected_err.to_string(),
                        _ => false,
                    },
                )
    }
}
