use itertools::Itertools;

/// Returns the factors of an integer, in ascending order.
pub fn factors(x: u32) -> Vec<u32> {
    let mut result = Vec::new();
    let mut i = 1;
    while i * i <= x {
        if x.is_multiple_of(i) {
            result.push(i);
            if x / i != i {
                result.push(x / i);
            }
        }
        i += 1;
    }
    result.sort_unstable();
    result
}

/// Returns every non-empty subset of `items` up to `max_size` elements.
///
/// Subsets are ordered by size, then lexicographically by position within
/// `items`. Elements within a subset keep their order in `items`.
pub fn bounded_subsets<T: Clone>(items: &[T], max_size: usize) -> Vec<Vec<T>> {
    let mut result = Vec::new();
    for size in 1..=max_size.min(items.len()) {
        result.extend(items.iter().cloned().combinations(size));
    }
    result
}

pub fn join_into_string(c: impl IntoIterator<Item = impl ToString>, separator: &str) -> String {
    c.into_iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(separator)
}
