use allocator_api2::{alloc::Allocator, vec::Vec};

use super::Rmalloc;
use crate::{
    error::InvariantViolation,
    header::{Handle, HEADER_SIZE},
    llist::Chain,
    OomHandler, Span,
};

impl<O: OomHandler, A: Allocator + Clone> Rmalloc<O, A> {
    /// Checks the arena's structural invariants without panicking.
    ///
    /// - the header chain, the free lists and the free-record chain are acyclic;
    /// - every chained header describes a chunk within `0..memory_high`, and
    ///   `memory_high` lies below the header table;
    /// - chunks tile `0..memory_high` without overlap;
    /// - every filed chunk is Free, sits in the class its size warrants and
    ///   carries a trailer record referring back to its header;
    /// - every Free chunk is filed, and every unused record is recyclable;
    /// - chunk bytes and the header table fit in the region.
    pub fn verify(&self) -> Result<(), InvariantViolation> {
        let capacity = self.headers.capacity();
        let header_low = self.headers.low();

        if self.memory_high > header_low {
            return Err(InvariantViolation::OutOfBounds(self.memory_high));
        }

        let bounds = Span::new(0, self.memory_high);
        let mut spans: Vec<Span, A> = Vec::new_in(self.alloc.clone());
        let mut free_chunks = 0;
        let mut current = self.headers.chain;
        while let Some(h) = current {
            if spans.len() >= capacity {
                return Err(InvariantViolation::CycleDetected);
            }

            let header = self.headers.live(h).ok_or(InvariantViolation::OutOfBounds(usize::MAX))?;
            let span = Span::from_base_size(header.addr, header.size);
            if span.is_empty() || !bounds.contains_span(span) {
                return Err(InvariantViolation::OutOfBounds(header.addr));
            }
            if header.state.is_free() {
                free_chunks += 1;
            }

            spans.push(span);
            current = self.headers.next(h);
        }

        spans.sort_unstable_by_key(|span| span.base);
        for pair in spans.windows(2) {
            if pair[0].overlaps(pair[1]) {
                return Err(InvariantViolation::RegionOverlap(pair[1].base));
            }
        }

        let mut acme = 0;
        for span in spans.iter() {
            if span.base != acme {
                return Err(InvariantViolation::Conservation);
            }
            acme = span.acme;
        }
        if acme != self.memory_high {
            return Err(InvariantViolation::Conservation);
        }

        let mut filed = 0;
        for class in 0..self.classes.count() {
            let mut result = Ok(());
            self.classes.walk(&self.region, &self.headers, class, |h: Handle| {
                filed += 1;
                let header = self.headers.get(h);
                if !header.state.is_free() {
                    result = Err(InvariantViolation::TrailerMismatch(h));
                } else if self.classes.class_of(header.size) != class {
                    result = Err(InvariantViolation::SizeClassMismatch { class, size: header.size });
                }
            })?;
            result?;

            if filed > capacity {
                return Err(InvariantViolation::CycleDetected);
            }
        }
        if filed != free_chunks {
            return Err(InvariantViolation::Conservation);
        }

        let recyclable = self.headers.free_records().count();
        if recyclable > capacity {
            return Err(InvariantViolation::CycleDetected);
        }
        if recyclable + spans.len() != capacity {
            return Err(InvariantViolation::Conservation);
        }

        let highest_end = self.highest.map_or(0, |h| self.headers.get(h).end());
        if highest_end != self.memory_high {
            return Err(InvariantViolation::OutOfBounds(highest_end));
        }

        if capacity * HEADER_SIZE + self.memory_high > self.region.size() {
            return Err(InvariantViolation::Conservation);
        }

        Ok(())
    }
}
