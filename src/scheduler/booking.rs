use tracing::{info, warn};
use ulid::Ulid;

use crate::engine::conflict::validate_services;
use crate::engine::{EngineError, VisitStore};
use crate::model::{BookingOffer, NewVisit, Visit, first_conflict};
use crate::observability::BOOKINGS_TOTAL;

use super::Scheduler;

/// A user picked `offer` from an availability answer and wants it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub visit_id: Ulid,
    pub offer: BookingOffer,
    pub client_id: Ulid,
    pub vehicle_id: Ulid,
    pub service_ids: Vec<Ulid>,
}

impl BookingRequest {
    pub fn new(offer: BookingOffer, client_id: Ulid, vehicle_id: Ulid, service_ids: Vec<Ulid>) -> Self {
        Self {
            visit_id: Ulid::new(),
            offer,
            client_id,
            vehicle_id,
            service_ids,
        }
    }
}

/// The offer overlapped a visit committed after the availability snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotNoLongerAvailable {
    pub offer: BookingOffer,
    pub conflicting_visit: Ulid,
}

/// Losing a booking race is an expected answer, not a failure.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingOutcome {
    Booked(Visit),
    Rejected(SlotNoLongerAvailable),
}

impl BookingOutcome {
    pub fn is_booked(&self) -> bool {
        matches!(self, BookingOutcome::Booked(_))
    }

    pub fn into_visit(self) -> Option<Visit> {
        match self {
            BookingOutcome::Booked(v) => Some(v),
            BookingOutcome::Rejected(_) => None,
        }
    }
}

impl Scheduler {
    /// Commit `request.offer` if, and only if, it still overlaps nothing.
    ///
    /// The offer is re-checked against a fresh read of the mechanic's
    /// commitments, then handed to the store, which checks again and
    /// inserts atomically. Of several concurrent requests for overlapping
    /// windows on one mechanic, at most one comes back `Booked`.
    pub async fn book_slot<S>(&self, store: &S, request: BookingRequest) -> Result<BookingOutcome, EngineError>
    where
        S: VisitStore + ?Sized,
    {
        self.validate_booking(&request)?;
        let offer = request.offer;

        let committed = store
            .list_committed_intervals(offer.mechanic_id, offer.span)
            .await?;
        if let Some(hit) = first_conflict(&committed, &offer.span) {
            return Ok(self.reject(offer, hit.visit_id));
        }

        let new_visit = NewVisit {
            id: request.visit_id,
            mechanic_id: offer.mechanic_id,
            client_id: request.client_id,
            vehicle_id: request.vehicle_id,
            service_ids: request.service_ids,
            span: offer.span,
        };
        match store.create_visit(new_visit).await {
            Ok(visit) => {
                metrics::counter!(BOOKINGS_TOTAL, "outcome" => "booked").increment(1);
                info!(
                    "visit {} booked on mechanic {} [{}, {})",
                    visit.id, visit.mechanic_id, visit.span.start, visit.span.end
                );
                Ok(BookingOutcome::Booked(visit))
            }
            // Someone committed between our read and the store's check.
            Err(EngineError::SlotNoLongerAvailable { conflicting, .. }) => Ok(self.reject(offer, conflicting)),
            Err(e) => Err(e),
        }
    }

    fn validate_booking(&self, request: &BookingRequest) -> Result<(), EngineError> {
        let span = request.offer.span;
        if span.start >= span.end {
            return Err(EngineError::invalid("offer must end after it starts"));
        }
        validate_services(&request.service_ids)?;
        let day = self
            .hours()
            .local_date(span.start)
            .ok_or_else(|| EngineError::invalid("offer start out of range"))?;
        if !self.hours().day_window(day).contains_span(&span) {
            return Err(EngineError::invalid("offer falls outside business hours"));
        }
        Ok(())
    }

    fn reject(&self, offer: BookingOffer, conflicting_visit: Ulid) -> BookingOutcome {
        metrics::counter!(BOOKINGS_TOTAL, "outcome" => "rejected").increment(1);
        warn!(
            "offer on mechanic {} [{}, {}) lost to visit {conflicting_visit}",
            offer.mechanic_id, offer.span.start, offer.span.end
        );
        BookingOutcome::Rejected(SlotNoLongerAvailable {
            offer,
            conflicting_visit,
        })
    }
}
