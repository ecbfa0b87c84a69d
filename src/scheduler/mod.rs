//! The scheduling core: slot generation, availability, conditional booking
//! and the visit lifecycle. Everything here runs against a [`VisitStore`]
//! passed in per call, so the same logic serves the WAL-backed engine and
//! test doubles.
//!
//! [`VisitStore`]: crate::engine::VisitStore

mod availability;
mod booking;
pub mod lifecycle;
mod slots;
#[cfg(test)]
pub(crate) mod testkit;

pub use availability::AvailabilityRequest;
pub use booking::{BookingOutcome, BookingRequest, SlotNoLongerAvailable};
pub use lifecycle::{advance, check_transition};
pub use slots::{SlotGenerator, Slots};

use crate::config::{ConfigError, ShopHours};

/// Stateless apart from the shop's hours and stride.
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    hours: ShopHours,
}

impl Scheduler {
    pub fn new(hours: ShopHours) -> Result<Self, ConfigError> {
        hours.validate()?;
        Ok(Self { hours })
    }

    pub fn hours(&self) -> &ShopHours {
        &self.hours
    }
}
