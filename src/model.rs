use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// A mechanic: the bookable resource. One visit at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mechanic {
    pub id: Ulid,
    pub name: String,
}

/// Time already occupied on a mechanic by a confirmed visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommittedInterval {
    pub visit_id: Ulid,
    pub mechanic_id: Ulid,
    pub span: Span,
}

/// First committed interval that overlaps `span`, in iteration order.
/// Order and mutual overlap of `committed` don't matter.
pub fn first_conflict<'a, I>(committed: I, span: &Span) -> Option<&'a CommittedInterval>
where
    I: IntoIterator<Item = &'a CommittedInterval>,
{
    committed.into_iter().find(|c| c.span.overlaps(span))
}

/// A computed, not-yet-booked window on one mechanic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateSlot {
    pub mechanic_id: Ulid,
    pub mechanic_name: String,
    pub span: Span,
}

/// A candidate slot picked by a user. The exact (mechanic, start, end)
/// triple is what gets re-validated at commit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BookingOffer {
    pub mechanic_id: Ulid,
    pub span: Span,
}

impl From<&CandidateSlot> for BookingOffer {
    fn from(slot: &CandidateSlot) -> Self {
        Self {
            mechanic_id: slot.mechanic_id,
            span: slot.span,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VisitStatus {
    Scheduled,
    InProgress,
    Done,
    Delivered,
}

impl VisitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VisitStatus::Scheduled => "scheduled",
            VisitStatus::InProgress => "in-progress",
            VisitStatus::Done => "done",
            VisitStatus::Delivered => "delivered",
        }
    }
}

impl fmt::Display for VisitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VisitStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "scheduled" => Ok(VisitStatus::Scheduled),
            "in-progress" | "in_progress" => Ok(VisitStatus::InProgress),
            "done" => Ok(VisitStatus::Done),
            "delivered" => Ok(VisitStatus::Delivered),
            other => Err(format!("unknown visit status: {other}")),
        }
    }
}

/// Everything needed to commit a visit, before the store stamps it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewVisit {
    pub id: Ulid,
    pub mechanic_id: Ulid,
    pub client_id: Ulid,
    pub vehicle_id: Ulid,
    pub service_ids: Vec<Ulid>,
    pub span: Span,
}

/// The persisted record of a confirmed appointment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Visit {
    pub id: Ulid,
    pub client_id: Ulid,
    pub vehicle_id: Ulid,
    pub mechanic_id: Ulid,
    pub service_ids: Vec<Ulid>,
    pub span: Span,
    pub status: VisitStatus,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Visit {
    pub fn committed_interval(&self) -> CommittedInterval {
        CommittedInterval {
            visit_id: self.id,
            mechanic_id: self.mechanic_id,
            span: self.span,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MechanicState {
    pub id: Ulid,
    pub name: String,
    /// Visits sorted by `span.start`. Their spans are the committed intervals.
    pub visits: Vec<Visit>,
}

impl MechanicState {
    pub fn new(id: Ulid, name: String) -> Self {
        Self {
            id,
            name,
            visits: Vec::new(),
        }
    }

    pub fn info(&self) -> Mechanic {
        Mechanic {
            id: self.id,
            name: self.name.clone(),
        }
    }

    /// Insert visit maintaining sort order by span.start.
    pub fn insert_visit(&mut self, visit: Visit) {
        let pos = self
            .visits
            .binary_search_by_key(&visit.span.start, |v| v.span.start)
            .unwrap_or_else(|e| e);
        self.visits.insert(pos, visit);
    }

    pub fn remove_visit(&mut self, id: Ulid) -> Option<Visit> {
        let pos = self.visits.iter().position(|v| v.id == id)?;
        Some(self.visits.remove(pos))
    }

    pub fn visit(&self, id: Ulid) -> Option<&Visit> {
        self.visits.iter().find(|v| v.id == id)
    }

    pub fn visit_mut(&mut self, id: Ulid) -> Option<&mut Visit> {
        self.visits.iter_mut().find(|v| v.id == id)
    }

    /// Return only visits whose span overlaps the query window.
    /// Uses binary search to skip visits starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Visit> {
        let right_bound = self.visits.partition_point(|v| v.span.start < query.end);
        self.visits[..right_bound]
            .iter()
            .filter(move |v| v.span.end > query.start)
    }

    pub fn committed_intervals(&self, query: &Span) -> Vec<CommittedInterval> {
        self.overlapping(query).map(Visit::committed_interval).collect()
    }
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    MechanicCreated {
        id: Ulid,
        name: String,
    },
    MechanicDeleted {
        id: Ulid,
    },
    VisitBooked {
        id: Ulid,
        mechanic_id: Ulid,
        client_id: Ulid,
        vehicle_id: Ulid,
        service_ids: Vec<Ulid>,
        span: Span,
        at: Ms,
    },
    VisitAdvanced {
        id: Ulid,
        mechanic_id: Ulid,
        status: VisitStatus,
        at: Ms,
    },
    VisitDeleted {
        id: Ulid,
        mechanic_id: Ulid,
    },
}

impl Event {
    /// The mechanic whose board this event belongs to.
    pub fn mechanic_id(&self) -> Ulid {
        match self {
            Event::MechanicCreated { id, .. } | Event::MechanicDeleted { id } => *id,
            Event::VisitBooked { mechanic_id, .. }
            | Event::VisitAdvanced { mechanic_id, .. }
            | Event::VisitDeleted { mechanic_id, .. } => *mechanic_id,
        }
    }
}
