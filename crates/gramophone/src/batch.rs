/// The messaging platform caps a media group at ten items.
pub const MAX_GROUP: usize = 10;

/// Group size for `n` tracks: everything in one group when it fits,
/// otherwise the fewest groups possible with sizes kept as even as
/// possible so no trailing sliver batch shows up.
pub fn optimal_batch_size(n: usize) -> usize {
    if n == 0 {
        return 1;
    }
    if n <= MAX_GROUP {
        return n;
    }
    let groups = n.div_ceil(MAX_GROUP);
    n.div_ceil(groups)
}

/// Splits `items` into media groups, preserving order.
pub fn split<T>(mut items: Vec<T>) -> Vec<Vec<T>> {
    let size = optimal_batch_size(items.len());
    let mut out = Vec::new();
    while !items.is_empty() {
        let take = size.min(items.len());
        let rest = items.split_off(take);
        out.push(std::mem::replace(&mut items, rest));
    }
    out
}
