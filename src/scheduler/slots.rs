use std::iter::FusedIterator;

use crate::engine::EngineError;
use crate::model::{CandidateSlot, CommittedInterval, Mechanic, Ms, Span, first_conflict};

/// Candidate windows for one mechanic inside one business window.
///
/// Starts are aligned to `window.start + k * stride`. A candidate is emitted
/// when `[start, start + duration)` fits before close and overlaps no
/// committed interval. On a conflict the next start jumps straight to the
/// first aligned instant at or after the conflicting interval's end, since
/// every aligned start in between overlaps it too.
#[derive(Debug, Clone, Copy)]
pub struct SlotGenerator<'a> {
    mechanic: &'a Mechanic,
    committed: &'a [CommittedInterval],
    window: Span,
    stride: Ms,
    duration: Ms,
}

impl<'a> SlotGenerator<'a> {
    pub fn new(
        mechanic: &'a Mechanic,
        committed: &'a [CommittedInterval],
        window: Span,
        stride: Ms,
        duration: Ms,
    ) -> Result<Self, EngineError> {
        if duration <= 0 {
            return Err(EngineError::invalid("duration must be positive"));
        }
        if stride <= 0 {
            return Err(EngineError::invalid("stride must be positive"));
        }
        if window.start >= window.end {
            return Err(EngineError::invalid("opening time must be before closing time"));
        }
        Ok(Self {
            mechanic,
            committed,
            window,
            stride,
            duration,
        })
    }

    /// A fresh pass, starting again at opening time.
    pub fn iter(&self) -> Slots<'a> {
        Slots {
            generator: *self,
            next_start: self.window.start,
        }
    }

    /// Smallest aligned start at or after `t`.
    fn align_up(&self, t: Ms) -> Ms {
        let offset = t - self.window.start;
        if offset <= 0 {
            return self.window.start;
        }
        let steps = (offset + self.stride - 1) / self.stride;
        self.window.start.saturating_add(steps.saturating_mul(self.stride))
    }
}

impl<'a> IntoIterator for &SlotGenerator<'a> {
    type Item = CandidateSlot;
    type IntoIter = Slots<'a>;

    fn into_iter(self) -> Slots<'a> {
        self.iter()
    }
}

/// Lazy, finite and ascending by start.
#[derive(Debug, Clone)]
pub struct Slots<'a> {
    generator: SlotGenerator<'a>,
    next_start: Ms,
}

impl Iterator for Slots<'_> {
    type Item = CandidateSlot;

    fn next(&mut self) -> Option<CandidateSlot> {
        let g = &self.generator;
        loop {
            let start = self.next_start;
            let end = start.checked_add(g.duration)?;
            if end > g.window.end {
                return None;
            }
            let span = Span::new(start, end);
            match first_conflict(g.committed, &span) {
                None => {
                    self.next_start = start.saturating_add(g.stride);
                    return Some(CandidateSlot {
                        mechanic_id: g.mechanic.id,
                        mechanic_name: g.mechanic.name.clone(),
                        span,
                    });
                }
                // `hit.span.end > start` because they overlap, so this always advances.
                Some(hit) => self.next_start = g.align_up(hit.span.end),
            }
        }
    }
}

impl FusedIterator for Slots<'_> {}
