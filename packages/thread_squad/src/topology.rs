//! The k-ary notification tree laid over worker indices.
//!
//! Workers are arranged implicitly: the worker at the start of an index range
//! is the root of that range, and the range splits into chunks of
//! `ceil(len / FAN_OUT)` whose first workers are the root's direct
//! subordinates. The split repeats inside the leftmost chunk (which the root
//! itself heads), so a root's subordinates sit at several depths of its own
//! range. Notifications fan out along this tree and completions climb back
//! up it, which keeps coordination cost logarithmic in the worker count.
//!
//! Uneven splits make later siblings head smaller chunks than earlier ones,
//! never larger, keeping the leftmost child heavy. Worker 0 heads the entire
//! range and is the synchronization apex.

/// Direct subordinates per tree level.
pub(crate) const FAN_OUT: usize = 8;

/// The chunk size one level below a range of `stride` workers.
pub(crate) fn next_substride(stride: usize) -> usize {
    stride.div_ceil(FAN_OUT)
}

/// Computes the nominal subtree span of every worker.
///
/// `spans[0] == num_threads`; every other entry is the chunk size of the
/// level at which that worker first appears as a chunk root. Spans are
/// nominal: a tail chunk may be cut short by the end of the range, so every
/// use site clamps with `min(first + span, limit)`.
pub(crate) fn subtree_spans(num_threads: usize) -> Vec<usize> {
    let mut spans = vec![0; num_threads];
    if num_threads > 0 {
        init_range(&mut spans, 0, num_threads, num_threads);
    }
    spans
}

fn init_range(spans: &mut [usize], first: usize, last: usize, stride: usize) {
    if stride > 1 {
        let substride = next_substride(stride);
        let mut i = first;
        while i < last {
            init_range(spans, i, last.min(i + substride), substride);
            i += substride;
        }
    }
    spans[first] = stride;
}

/// Visits the direct subordinates of `first`, widest subtrees first.
///
/// This is the dispatch order: waking the heads of the largest subtrees
/// first lets the deepest notification chains start as early as possible.
/// Subordinates at or past `limit` are not visited.
pub(crate) fn for_each_child_top_down<F>(first: usize, span: usize, limit: usize, visit: &mut F)
where
    F: FnMut(usize),
{
    if span <= 1 {
        return;
    }

    let substride = next_substride(span);
    let last = limit.min(first + span);

    let mut i = first + substride;
    while i < last {
        visit(i);
        i += substride;
    }

    for_each_child_top_down(first, substride, limit, visit);
}

/// Visits the direct subordinates of `first`, narrowest subtrees first.
///
/// This is the completion order: the nearest subordinates head the smallest
/// subtrees and finish first, so waiting on them first overlaps with the
/// larger subtrees still draining. Subordinates at or past `limit` are not
/// visited.
pub(crate) fn for_each_child_bottom_up<F>(first: usize, span: usize, limit: usize, visit: &mut F)
where
    F: FnMut(usize),
{
    if span <= 1 {
        return;
    }

    let substride = next_substride(span);
    for_each_child_bottom_up(first, substride, limit, visit);

    let last = limit.min(first + span);

    let mut i = first + substride;
    while i < last {
        visit(i);
        i += substride;
    }
}
