//! Two-run merger.

use std::cmp::Ordering;

/// Merges two sorted runs into a single sorted run.
/// Runs should be sorted in ascending order otherwise the result is undefined.
/// The merge is stable: on equal items the item from `a` goes first.
///
/// # Arguments
/// * `a` - Left run
/// * `b` - Right run
pub fn merge<T, A, B>(a: A, b: B) -> Vec<T>
where
    T: Ord,
    A: IntoIterator<Item = T>,
    B: IntoIterator<Item = T>,
{
    merge_by(a, b, T::cmp)
}

/// Merges two sorted runs into a single sorted run using a custom compare function.
/// Time complexity is *n* + *m* where *n* and *m* are the run lengths.
///
/// # Arguments
/// * `a` - Left run
/// * `b` - Right run
/// * `compare` - Function to be used to compare items
pub fn merge_by<T, A, B, F>(a: A, b: B, compare: F) -> Vec<T>
where
    A: IntoIterator<Item = T>,
    B: IntoIterator<Item = T>,
    F: Fn(&T, &T) -> Ordering,
{
    let mut a = a.into_iter().peekable();
    let mut b = b.into_iter().peekable();

    let mut merged = Vec::with_capacity(a.size_hint().0 + b.size_hint().0);

    loop {
        let take_left = match (a.peek(), b.peek()) {
            (Some(left), Some(right)) => compare(left, right) != Ordering::Greater,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };

        let next = if take_left { a.next() } else { b.next() };
        merged.extend(next);
    }

    return merged;
}
