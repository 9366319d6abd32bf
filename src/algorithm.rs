//! In-memory chunk sorting algorithms.
//!
//! Both algorithms are iterative so that large chunks never risk a call stack overflow, and both order equal
//! elements by their original position. Given the same chunk they produce exactly the same permutation.

use std::cmp::Ordering;

/// In-memory sorting algorithm used for chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortAlgorithm {
    /// Iterative quicksort with Lomuto partitioning around the last element.
    /// Quadratic on sorted input and on runs of equal keys.
    Quick,
    /// Iterative bottom-up merge sort.
    #[default]
    Merge,
}

impl SortAlgorithm {
    /// Sorts items in ascending order using the provided compare function.
    pub fn sort_by<T, F>(&self, items: &mut Vec<T>, compare: F)
    where
        F: Fn(&T, &T) -> Ordering,
    {
        match self {
            SortAlgorithm::Quick => quick_sort_by(items, compare),
            SortAlgorithm::Merge => merge_sort_by(items, compare),
        }
    }
}

/// Sorts items with quicksort.
///
/// Quicksort is not stable by itself so the original position is used as a secondary key.
pub fn quick_sort_by<T, F>(items: &mut Vec<T>, compare: F)
where
    F: Fn(&T, &T) -> Ordering,
{
    let mut order = Vec::from_iter(0..items.len());
    quick_sort_unstable_by(&mut order, |&a, &b| compare(&items[a], &items[b]).then(a.cmp(&b)));
    apply_permutation(items, &order);
}

/// Sorts items with a stable bottom-up merge sort.
pub fn merge_sort_by<T, F>(items: &mut Vec<T>, compare: F)
where
    F: Fn(&T, &T) -> Ordering,
{
    let mut order = Vec::from_iter(0..items.len());
    bottom_up_merge_sort_by(&mut order, |&a, &b| compare(&items[a], &items[b]));
    apply_permutation(items, &order);
}

/// Iterative quicksort.
///
/// Uses the last element of a range as the pivot. Pending ranges are kept on an explicit stack, the smaller
/// partition is always processed first so the stack never grows beyond *log2(n)* entries.
pub fn quick_sort_unstable_by<T, F>(items: &mut [T], compare: F)
where
    F: Fn(&T, &T) -> Ordering,
{
    // half-open [low, high) ranges still to be sorted
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    let (mut low, mut high) = (0, items.len());

    loop {
        while high - low > 1 {
            let pivot = lomuto_partition(items, low, high, &compare);
            if pivot - low < high - pivot - 1 {
                ranges.push((pivot + 1, high));
                high = pivot;
            } else {
                ranges.push((low, pivot));
                low = pivot + 1;
            }
        }

        match ranges.pop() {
            Some(range) => (low, high) = range,
            None => break,
        }
    }
}

/// Partitions `items[low..high]` around its last element and returns the pivot's final position.
fn lomuto_partition<T, F>(items: &mut [T], low: usize, high: usize, compare: &F) -> usize
where
    F: Fn(&T, &T) -> Ordering,
{
    let pivot = high - 1;
    let mut store = low;
    for idx in low..pivot {
        if compare(&items[idx], &items[pivot]) == Ordering::Less {
            items.swap(store, idx);
            store += 1;
        }
    }
    items.swap(store, pivot);

    store
}

/// Iterative bottom-up merge sort.
///
/// Merges neighbouring runs of doubling width through a scratch buffer of the same size as the input.
/// Time complexity is *n* \* log(*n*), auxiliary space is *n*.
pub fn bottom_up_merge_sort_by<T, F>(items: &mut [T], compare: F)
where
    T: Copy,
    F: Fn(&T, &T) -> Ordering,
{
    let len = items.len();
    let mut scratch = items.to_vec();
    let mut width = 1;

    while width < len {
        let mut start = 0;
        while start < len {
            let mid = usize::min(start + width, len);
            let end = usize::min(mid + width, len);
            merge_into(&items[start..mid], &items[mid..end], &mut scratch[start..end], &compare);
            start = end;
        }
        items.copy_from_slice(&scratch);
        width *= 2;
    }
}

fn merge_into<T, F>(left: &[T], right: &[T], out: &mut [T], compare: &F)
where
    T: Copy,
    F: Fn(&T, &T) -> Ordering,
{
    let (mut i, mut j) = (0, 0);
    for slot in out.iter_mut() {
        // take from the right only when strictly smaller to keep equal elements in order
        let take_right = i == left.len() || (j < right.len() && compare(&right[j], &left[i]) == Ordering::Less);
        if take_right {
            *slot = right[j];
            j += 1;
        } else {
            *slot = left[i];
            i += 1;
        }
    }
}

/// Reorders items so that `items[k]` becomes the element previously found at `order[k]`.
fn apply_permutation<T>(items: &mut Vec<T>, order: &[usize]) {
    let mut slots = Vec::from_iter(items.drain(..).map(Some));
    items.extend(order.iter().filter_map(|&idx| slots[idx].take()));
}

#[cfg(test)]
mod test {
    use rand::seq::SliceRandom;
    use rand::Rng;
    use rstest::*;

    use super::{bottom_up_merge_sort_by, quick_sort_unstable_by, SortAlgorithm};

    #[rstest]
    #[case(SortAlgorithm::Quick, vec![])]
    #[case(SortAlgorithm::Merge, vec![])]
    #[case(SortAlgorithm::Quick, vec![1])]
    #[case(SortAlgorithm::Merge, vec![1])]
    #[case(SortAlgorithm::Quick, vec![2, 1])]
    #[case(SortAlgorithm::Merge, vec![5, 3, 5, 1, 0, -7, 3])]
    #[case(SortAlgorithm::Quick, vec![5, 3, 5, 1, 0, -7, 3])]
    #[case(SortAlgorithm::Quick, vec![4, 4, 4, 4])]
    fn test_sort_small(#[case] algorithm: SortAlgorithm, #[case] mut items: Vec<i64>) {
        let mut expected = items.clone();
        expected.sort();

        algorithm.sort_by(&mut items, |a, b| a.cmp(b));
        assert_eq!(items, expected);
    }

    #[rstest]
    fn test_sort_shuffled(#[values(SortAlgorithm::Quick, SortAlgorithm::Merge)] algorithm: SortAlgorithm) {
        let mut items = Vec::from_iter(0..1000);
        items.shuffle(&mut rand::thread_rng());

        algorithm.sort_by(&mut items, |a, b| a.cmp(b));
        assert_eq!(items, Vec::from_iter(0..1000));
    }

    #[rstest]
    fn test_sort_presorted(
        #[values(SortAlgorithm::Quick, SortAlgorithm::Merge)] algorithm: SortAlgorithm,
        #[values(false, true)] reversed: bool,
    ) {
        let mut items = Vec::from_iter(0..500);
        if reversed {
            items.reverse();
        }

        algorithm.sort_by(&mut items, |a, b| a.cmp(b));
        assert_eq!(items, Vec::from_iter(0..500));
    }

    #[test]
    fn test_algorithms_agree_on_ties() {
        let mut rng = rand::thread_rng();
        // few distinct keys, the second field records the original position
        let items = Vec::from_iter((0..2000).map(|pos| (rng.gen_range(0..16), pos)));

        let mut quick = items.clone();
        SortAlgorithm::Quick.sort_by(&mut quick, |a, b| a.0.cmp(&b.0));
        let mut merge = items.clone();
        SortAlgorithm::Merge.sort_by(&mut merge, |a, b| a.0.cmp(&b.0));

        assert_eq!(quick, merge);
        let mut expected = items;
        expected.sort_by_key(|item| item.0);
        assert_eq!(merge, expected);
    }

    #[test]
    fn test_raw_sorts() {
        let mut items = vec![9, 2, 7, 2, 8, 1];
        quick_sort_unstable_by(&mut items, |a, b| a.cmp(b));
        assert_eq!(items, vec![1, 2, 2, 7, 8, 9]);

        let mut items = vec![(3, 'a'), (1, 'b'), (3, 'c'), (2, 'd'), (1, 'e')];
        bottom_up_merge_sort_by(&mut items, |a, b| a.0.cmp(&b.0));
        assert_eq!(items, vec![(1, 'b'), (1, 'e'), (2, 'd'), (3, 'a'), (3, 'c')]);
    }

    #[test]
    fn test_sort_non_copy_items() {
        let mut items = vec!["pear".to_string(), "apple".to_string(), "fig".to_string()];
        SortAlgorithm::Quick.sort_by(&mut items, |a, b| a.len().cmp(&b.len()));
        assert_eq!(items, vec!["fig", "pear", "apple"]);
    }
}
