//! Singly linked chains threaded through index-addressed storage.
//!
//! Links are plain handles rather than pointers, so a chain can never outlive
//! the storage that backs it. Cycles are not detected here; callers that need
//! that bound their walks by the storage's capacity.

/// Storage whose elements carry a single forward link.
pub(crate) trait Chain {
    type Link: Copy + Eq;

    fn next(&self, link: Self::Link) -> Option<Self::Link>;
    fn set_next(&mut self, link: Self::Link, next: Option<Self::Link>);

    /// Creates an iterator over the chain starting at `first`.
    fn iter_chain(&self, first: Option<Self::Link>) -> ChainIter<'_, Self>
    where
        Self: Sized,
    {
        ChainIter { chain: self, current: first }
    }
}

/// An iterator over the links of a chain.
///
/// This `struct` is created by [`Chain::iter_chain`].
#[must_use = "iterators are lazy and do nothing unless consumed"]
pub(crate) struct ChainIter<'a, C: Chain> {
    chain: &'a C,
    current: Option<C::Link>,
}

impl<'a, C: Chain> Iterator for ChainIter<'a, C> {
    type Item = C::Link;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.current?;
        self.current = self.chain.next(current);
        Some(current)
    }
}

/// Stable bottom-up merge sort of the chain beginning at `head`.
///
/// `le(chain, a, b)` must return whether `a` orders before or equal to `b`.
/// Runs in O(n log n) comparisons with no auxiliary allocation. Returns the
/// new head; the tail's link is cleared.
pub(crate) fn merge_sort<C, F>(chain: &mut C, head: Option<C::Link>, mut le: F) -> Option<C::Link>
where
    C: Chain,
    F: FnMut(&C, C::Link, C::Link) -> bool,
{
    let mut list = head?;
    let mut run = 1usize;

    loop {
        let mut p = Some(list);
        let mut new_head = None;
        let mut tail: Option<C::Link> = None;
        let mut merges = 0usize;

        while let Some(p_start) = p {
            merges += 1;

            // step `run` places along from p to find the start of q
            let mut q = Some(p_start);
            let mut p_size = 0usize;
            for _ in 0..run {
                p_size += 1;
                q = q.and_then(|link| chain.next(link));
                if q.is_none() {
                    break;
                }
            }
            let mut q_size = run;

            let mut p_cur = Some(p_start);
            loop {
                let take = match (p_size > 0, p_cur, q_size > 0, q) {
                    (true, Some(pl), true, Some(ql)) => {
                        if le(chain, pl, ql) { pl } else { ql }
                    }
                    (true, Some(pl), _, _) => pl,
                    (_, _, true, Some(ql)) => ql,
                    _ => break,
                };

                if Some(take) == p_cur && p_size > 0 {
                    p_cur = chain.next(take);
                    p_size -= 1;
                } else {
                    q = chain.next(take);
                    q_size -= 1;
                }

                match tail {
                    Some(t) => chain.set_next(t, Some(take)),
                    None => new_head = Some(take),
                }
                tail = Some(take);
            }

            p = q;
        }

        if let Some(t) = tail {
            chain.set_next(t, None);
        }

        match new_head {
            Some(h) if merges > 1 => {
                list = h;
                run *= 2;
            }
            _ => return new_head,
        }
    }
}
