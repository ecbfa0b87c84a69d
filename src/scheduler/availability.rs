use chrono::NaiveDate;
use tracing::debug;

use crate::engine::{EngineError, VisitStore};
use crate::limits::MAX_DURATION_MINUTES;
use crate::model::{CandidateSlot, MINUTE_MS, Ms};
use crate::observability::SLOTS_OFFERED;

use super::{Scheduler, SlotGenerator};

/// "Which slots of this length are open on this day?"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailabilityRequest {
    pub date: NaiveDate,
    pub duration_minutes: u32,
}

impl AvailabilityRequest {
    pub fn new(date: NaiveDate, duration_minutes: i64) -> Result<Self, EngineError> {
        if duration_minutes <= 0 {
            return Err(EngineError::invalid("duration must be a positive number of minutes"));
        }
        if duration_minutes > MAX_DURATION_MINUTES {
            return Err(EngineError::invalid("duration longer than a day"));
        }
        Ok(Self {
            date,
            duration_minutes: duration_minutes as u32,
        })
    }

    /// Parse a `YYYY-MM-DD` calendar date.
    pub fn parse(date: &str, duration_minutes: i64) -> Result<Self, EngineError> {
        let parsed = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d")
            .map_err(|e| EngineError::invalid(format!("bad date {date:?}: {e}")))?;
        Self::new(parsed, duration_minutes)
    }

    pub fn duration_ms(&self) -> Ms {
        self.duration_minutes as Ms * MINUTE_MS
    }
}

impl Scheduler {
    /// Open slots on every mechanic, mechanic by mechanic and ascending by
    /// start within each. This is a snapshot: nothing is reserved, and a
    /// slot returned here can be taken before it is booked.
    pub async fn get_availability<S>(
        &self,
        store: &S,
        request: &AvailabilityRequest,
    ) -> Result<Vec<CandidateSlot>, EngineError>
    where
        S: VisitStore + ?Sized,
    {
        let window = self.hours().day_window(request.date);
        let stride = self.hours().stride_ms();
        let duration = request.duration_ms();

        let mechanics = store.list_resources().await?;
        let mut slots = Vec::new();
        for mechanic in &mechanics {
            let committed = match store.list_committed_intervals(mechanic.id, window).await {
                Ok(c) => c,
                // Deleted between listing and reading.
                Err(EngineError::ResourceNotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let generator = SlotGenerator::new(mechanic, &committed, window, stride, duration)?;
            slots.extend(generator.iter());
        }

        metrics::histogram!(SLOTS_OFFERED).record(slots.len() as f64);
        debug!(
            "availability {} x {}min: {} slots across {} mechanics",
            request.date,
            request.duration_minutes,
            slots.len(),
            mechanics.len()
        );
        Ok(slots)
    }
}

#[cfg(test)]
mod tests {
    use ulid::Ulid;

    use super::*;
    use crate::scheduler::testkit::{self, at};

    #[test]
    fn parses_requests() {
        let req = AvailabilityRequest::parse("2030-01-07", 60).unwrap();
        assert_eq!(req.date, testkit::day());
        assert_eq!(req.duration_ms(), 60 * MINUTE_MS);

        assert!(matches!(
            AvailabilityRequest::parse("2030-13-07", 60),
            Err(EngineError::InvalidRequest(_))
        ));
        assert!(matches!(
            AvailabilityRequest::parse("next tuesday", 60),
            Err(EngineError::InvalidRequest(_))
        ));
        assert!(AvailabilityRequest::parse("2030-01-07", 0).is_err());
        assert!(AvailabilityRequest::parse("2030-01-07", -30).is_err());
        assert!(AvailabilityRequest::parse("2030-01-07", 1441).is_err());
        assert!(AvailabilityRequest::parse("2030-01-07", 1440).is_ok());
    }

    #[tokio::test]
    async fn no_mechanics_no_slots() {
        let (engine, scheduler) = testkit::setup("avail_empty");
        let req = AvailabilityRequest::new(testkit::day(), 60).unwrap();
        let slots = scheduler.get_availability(&*engine, &req).await.unwrap();
        assert!(slots.is_empty());
    }

    #[tokio::test]
    async fn booked_hour_is_excluded() {
        let (engine, scheduler) = testkit::setup("avail_booked");
        let ana = testkit::add_mechanic(&engine, "Ana").await;
        testkit::book(&engine, ana, at(10, 0), at(11, 0)).await;

        let req = AvailabilityRequest::new(testkit::day(), 60).unwrap();
        let slots = scheduler.get_availability(&*engine, &req).await.unwrap();
        let starts: Vec<Ms> = slots.iter().map(|s| s.span.start).collect();
        assert_eq!(starts.len(), 14);
        assert_eq!(starts[0], at(9, 0));
        assert_eq!(starts[1], at(11, 0));
        assert_eq!(*starts.last().unwrap(), at(17, 0));
        assert!(slots.iter().all(|s| s.mechanic_id == ana));
    }

    #[tokio::test]
    async fn grouped_by_mechanic() {
        let (engine, scheduler) = testkit::setup("avail_grouped");
        let bruno = testkit::add_mechanic(&engine, "Bruno").await;
        let ana = testkit::add_mechanic(&engine, "Ana").await;
        testkit::book(&engine, bruno, at(9, 0), at(17, 0)).await;

        let req = AvailabilityRequest::new(testkit::day(), 60).unwrap();
        let slots = scheduler.get_availability(&*engine, &req).await.unwrap();

        // Ana first (list order is by name), then Bruno's single free hour.
        assert_eq!(slots.len(), 17 + 1);
        assert!(slots[..17].iter().all(|s| s.mechanic_id == ana));
        assert_eq!(slots[17].mechanic_id, bruno);
        assert_eq!(slots[17].mechanic_name, "Bruno");
        assert_eq!(slots[17].span.start, at(17, 0));
    }

    #[tokio::test]
    async fn repeated_queries_agree() {
        let (engine, scheduler) = testkit::setup("avail_repeat");
        let mut ids = Vec::new();
        for name in ["Carla", "Ana", "Ana", "Bruno"] {
            ids.push(testkit::add_mechanic(&engine, name).await);
        }
        testkit::book(&engine, ids[0], at(11, 0), at(12, 30)).await;
        testkit::book(&engine, ids[1], at(9, 0), at(10, 0)).await;
        testkit::book(&engine, ids[2], at(15, 30), at(16, 0)).await;

        let req = AvailabilityRequest::new(testkit::day(), 45).unwrap();
        let first = scheduler.get_availability(&*engine, &req).await.unwrap();
        let second = scheduler.get_availability(&*engine, &req).await.unwrap();
        assert_eq!(first, second);

        // The two mechanics named Ana come out in id order, each as one run.
        let mut anas = vec![ids[1], ids[2]];
        anas.sort();
        let order: Vec<Ulid> = first.iter().map(|s| s.mechanic_id).fold(Vec::new(), |mut acc, id| {
            if acc.last() != Some(&id) {
                acc.push(id);
            }
            acc
        });
        assert_eq!(order, vec![anas[0], anas[1], ids[3], ids[0]]);
    }

    #[tokio::test]
    async fn other_days_do_not_interfere() {
        let (engine, scheduler) = testkit::setup("avail_days");
        let ana = testkit::add_mechanic(&engine, "Ana").await;
        let next_day = 24 * crate::model::HOUR_MS;
        testkit::book(&engine, ana, at(9, 0) + next_day, at(18, 0) + next_day).await;

        let req = AvailabilityRequest::new(testkit::day(), 540).unwrap();
        let slots = scheduler.get_availability(&*engine, &req).await.unwrap();
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].span.start, at(9, 0));
        assert_eq!(slots[0].span.end, at(18, 0));
    }
}
