use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::DateOutcome;

/// One row of the runs log: the outcome of processing one service date.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RunStats {
    pub timestamp: DateTime<Utc>,
    pub service_date: Option<NaiveDate>,
    pub schema_version: u32,

    // composition
    pub planned_rows: usize,
    pub avl_rows: usize,
    pub unmapped_avl_rows: usize,
    pub joined_rows: usize,
    pub plan_only_rows: usize,
    pub avl_only_rows: usize,
    pub tolerance_drops: usize,
    pub canonical_rows: usize,

    // realtime
    pub gtfs_rt_rows: usize,
    pub rt_events: usize,
    pub avl_observations: usize,

    // result
    pub valid_rows: usize,
    pub with_rt: usize,
    pub with_avl: usize,
    pub with_arrival: usize,
    pub with_departure: usize,
    pub rejected_rows: usize,
    pub advisories: usize,

    // error tracking
    pub error_type: Option<String>,
    pub error_message: Option<String>,
}

impl RunStats {
    pub fn from_outcome(outcome: &DateOutcome, schema_version: u32) -> Self {
        let mut s = RunStats {
            timestamp: Utc::now(),
            service_date: Some(outcome.service_date),
            schema_version,
            planned_rows: outcome.composition.planned_rows,
            avl_rows: outcome.composition.avl_rows,
            unmapped_avl_rows: outcome.composition.unmapped_avl_rows,
            joined_rows: outcome.composition.joined_rows,
            plan_only_rows: outcome.composition.plan_only_rows,
            avl_only_rows: outcome.composition.avl_only_rows,
            tolerance_drops: outcome.composition.tolerance_drops,
            canonical_rows: outcome.composition.output_rows,
            gtfs_rt_rows: outcome.realtime.input_rows,
            rt_events: outcome.realtime.events,
            avl_observations: outcome.avl_observations,
            valid_rows: outcome.visits.len(),
            rejected_rows: outcome.rejected_rows(),
            advisories: outcome.advisories.len(),
            ..Default::default()
        };

        for v in &outcome.visits {
            if v.event.rt.is_some() {
                s.with_rt += 1;
            }
            if v.event.avl.is_some() {
                s.with_avl += 1;
            }
            if v.stop_arrival_instant.is_some() {
                s.with_arrival += 1;
            }
            if v.stop_departure_instant.is_some() {
                s.with_departure += 1;
            }
        }

        s
    }

    pub fn pct(part: usize, total: usize) -> f64 {
        if total == 0 {
            0.0
        } else {
            (part as f64 / total as f64) * 100.0
        }
    }

    pub fn arrival_pct(&self) -> f64 {
        Self::pct(self.with_arrival, self.valid_rows)
    }

    /// Create an error record for a service date that could not be processed
    pub fn from_error(service_date: NaiveDate, error_type: &str, error_message: &str) -> Self {
        RunStats {
            timestamp: Utc::now(),
            service_date: Some(service_date),
            error_type: Some(error_type.to_string()),
            error_message: Some(error_message.to_string()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CanonicalStop, EnrichedStopVisit, MatchedStopEvent};
    use crate::realtime::NormalizeCounts;
    use crate::schedule::CompositionCounts;

    fn service_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 3).unwrap()
    }

    fn visit(arrival: bool) -> EnrichedStopVisit {
        let mut v = EnrichedStopVisit::unresolved(MatchedStopEvent {
            service_date: service_date(),
            stop: CanonicalStop::default(),
            rt: None,
            avl: None,
            sort_instant: None,
            departure_instant_gtfs: None,
            vehicle_key: None,
        });
        if arrival {
            v.stop_arrival_instant = Some(Utc::now());
        }
        v
    }

    #[test]
    fn test_pct_with_zero_total() {
        assert_eq!(RunStats::pct(10, 0), 0.0);
    }

    #[test]
    fn test_pct_normal_values() {
        assert_eq!(RunStats::pct(1, 4), 25.0);
    }

    #[test]
    fn test_from_outcome() {
        let outcome = DateOutcome {
            service_date: service_date(),
            visits: vec![visit(true), visit(false)],
            rejected_schedule: vec![],
            rejected_matched: vec![],
            rejected_visits: vec![],
            composition: CompositionCounts {
                planned_rows: 2,
                output_rows: 2,
                ..Default::default()
            },
            realtime: NormalizeCounts {
                input_rows: 10,
                events: 4,
                ..Default::default()
            },
            avl_observations: 0,
            reports: vec![],
            advisories: vec![],
        };

        let stats = RunStats::from_outcome(&outcome, 1);

        assert_eq!(stats.service_date, Some(service_date()));
        assert_eq!(stats.planned_rows, 2);
        assert_eq!(stats.gtfs_rt_rows, 10);
        assert_eq!(stats.valid_rows, 2);
        assert_eq!(stats.with_arrival, 1);
        assert_eq!(stats.arrival_pct(), 50.0);
        assert_eq!(stats.error_type, None);
    }

    #[test]
    fn test_from_error() {
        let stats = RunStats::from_error(service_date(), "input_absent", "no gtfs-rt");
        assert_eq!(stats.error_type.as_deref(), Some("input_absent"));
        assert_eq!(stats.valid_rows, 0);
    }
}
