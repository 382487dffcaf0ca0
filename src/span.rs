/// A half-open range of region offsets, `base..acme`.
///
/// Offsets are relative to the arena's base pointer, see [`Rmalloc::base`](crate::Rmalloc::base).
#[derive(Debug, Clone, Copy, Default, Hash)]
pub struct Span {
    pub base: usize,
    pub acme: usize,
}

impl PartialEq for Span {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        (self.is_empty() && other.is_empty())
        || (self.base == other.base && self.acme == other.acme)
    }
}
impl Eq for Span {}

impl Span {
    pub const fn new(base: usize, acme: usize) -> Self {
        Self { base, acme }
    }

    pub const fn from_base_size(base: usize, size: usize) -> Self {
        Self { base, acme: base + size }
    }

    pub const fn size(&self) -> usize {
        if self.acme > self.base {
            self.acme - self.base
        } else {
            0
        }
    }

    pub const fn is_empty(&self) -> bool {
        self.base >= self.acme
    }

    /// Returns whether `self` contains `other`.
    ///
    /// Empty spans are contained by any span.
    pub const fn contains_span(&self, other: Span) -> bool {
        other.is_empty() || (self.base <= other.base && other.acme <= self.acme)
    }

    /// Returns whether some of `self` overlaps some of `other`.
    ///
    /// Empty spans don't overlap with anything.
    pub const fn overlaps(&self, other: Span) -> bool {
        if self.is_empty() || other.is_empty() {
            false
        } else {
            !(self.base >= other.acme || other.base >= self.acme)
        }
    }
}

impl core::fmt::Display for Span {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#x}..{:#x}", self.base, self.acme)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span() {
        let span = Span::from_base_size(1234, 5678);

        assert!(span == Span::new(1234, 1234 + 5678));
        assert!(span.size() == 5678);
        assert!(!span.is_empty());
        assert!(span.contains_span(Span::new(2000, 3000)));
        assert!(span.contains_span(Span::new(3000, 3000)));
        assert!(!span.contains_span(Span::new(0, 2000)));

        assert!(Span::new(10, 5).is_empty());
        assert!(Span::new(10, 5) == Span::new(7, 7));
        assert!(Span::new(10, 5).size() == 0);
    }

    #[test]
    fn test_overlap() {
        let a = Span::new(0, 100);

        assert!(a.overlaps(Span::new(99, 200)));
        assert!(a.overlaps(Span::new(50, 60)));
        assert!(!a.overlaps(Span::new(100, 200)));
        assert!(!Span::new(100, 200).overlaps(a));
        assert!(!a.overlaps(Span::new(50, 50)));
    }
}
