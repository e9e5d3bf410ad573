//! Reconciliation of one service date, from source rows to validated stop
//! visits.

use chrono::NaiveDate;
use tracing::info;

use crate::config::PipelineConfig;
use crate::error::{Advisory, PipelineError};
use crate::metrics::enrich;
use crate::model::{
    AvlCrossing, CanonicalStop, EnrichedStopVisit, GtfsRtObservation, MatchedStopEvent,
    PlannedStop, ScheduledStopCrossing,
};
use crate::realtime::{NormalizeCounts, bus_routes, match_events, normalize_avl, normalize_gtfs_rt};
use crate::reference::{AvlReference, ReferenceTables};
use crate::schedule::{CompositionCounts, compose};
use crate::validate::{
    Rejected, ValidationReport, enriched_checks, matched_checks, schedule_checks, validate,
};

/// Everything read from the sources for one service date.
#[derive(Debug, Clone, Default)]
pub struct ServiceDateInputs {
    pub planned: Vec<PlannedStop>,
    pub avl_schedule: Vec<ScheduledStopCrossing>,
    pub avl_crossings: Vec<AvlCrossing>,
    pub reference: ReferenceTables,
    /// Vehicle positions from the partitions around the service date.
    pub gtfs_rt: Vec<GtfsRtObservation>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DateOutcome {
    pub service_date: NaiveDate,
    pub visits: Vec<EnrichedStopVisit>,
    pub rejected_schedule: Vec<Rejected<CanonicalStop>>,
    pub rejected_matched: Vec<Rejected<MatchedStopEvent>>,
    pub rejected_visits: Vec<Rejected<EnrichedStopVisit>>,
    pub composition: CompositionCounts,
    pub realtime: NormalizeCounts,
    pub avl_observations: usize,
    pub reports: Vec<ValidationReport>,
    pub advisories: Vec<Advisory>,
}

impl DateOutcome {
    pub fn rejected_rows(&self) -> usize {
        self.rejected_schedule.len() + self.rejected_matched.len() + self.rejected_visits.len()
    }
}

/// Runs compose, match, enrich and validate for `service_date`.
///
/// Stages run strictly in that order; each stage's rejected rows are
/// quarantined before the next stage sees the data.
///
/// # Errors
///
/// [`PipelineError::InputAbsent`] when there is no GTFS-RT row or no planned
/// row for the date, [`PipelineError::InvalidConfig`] for a bad config.
#[tracing::instrument(skip(inputs, config), fields(service_date = %service_date))]
pub fn process_service_date(
    service_date: NaiveDate,
    inputs: &ServiceDateInputs,
    config: &PipelineConfig,
) -> Result<DateOutcome, PipelineError> {
    config.validate()?;
    if inputs.gtfs_rt.is_empty() {
        return Err(PipelineError::InputAbsent {
            service_date,
            input: "gtfs-rt",
        });
    }

    let reference = AvlReference::new(&inputs.reference);
    let avl_schedule = reference.translate_schedule(&inputs.avl_schedule);
    let composition = compose(
        service_date,
        &inputs.planned,
        &avl_schedule,
        &reference,
        config.max_sequence_diff,
    )?;
    let mut advisories: Vec<Advisory> = composition.advisory.into_iter().collect();

    let schedule = validate(
        "schedule",
        composition.stops,
        &schedule_checks(config.max_sequence_diff),
    );

    let routes = bus_routes(&schedule.valid, &config.bus_route_types);
    let (rt_events, realtime) = normalize_gtfs_rt(
        &inputs.gtfs_rt,
        service_date,
        &routes,
        config.timezone,
        config.service_day_start_hour,
    );
    let avl = normalize_avl(
        reference.translate_crossings(&inputs.avl_crossings, config.timezone),
        service_date,
    );

    let matched = validate(
        "matched",
        match_events(
            service_date,
            schedule.valid,
            &rt_events,
            &avl,
            config.max_sequence_diff,
        ),
        &matched_checks(),
    );
    let visits = validate(
        "stop_visits",
        enrich(matched.valid, config.timezone),
        &enriched_checks(),
    );

    let reports = vec![schedule.report, matched.report, visits.report];
    advisories.extend(reports.iter().filter_map(ValidationReport::advisory));

    let outcome = DateOutcome {
        service_date,
        visits: visits.valid,
        rejected_schedule: schedule.rejected,
        rejected_matched: matched.rejected,
        rejected_visits: visits.rejected,
        composition: composition.counts,
        realtime,
        avl_observations: avl.len(),
        reports,
        advisories,
    };

    info!(
        %service_date,
        valid = outcome.visits.len(),
        rejected = outcome.rejected_rows(),
        advisories = outcome.advisories.len(),
        "Service date processed"
    );

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StopStatus;
    use chrono::{DateTime, TimeZone, Utc};

    fn service_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 3).unwrap()
    }

    fn at(offset: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_717_416_000 + offset, 0).unwrap()
    }

    fn plan(stop: &str, seq: i64) -> PlannedStop {
        PlannedStop {
            trip_id: "T".to_string(),
            stop_id: stop.to_string(),
            stop_sequence: seq,
            stop_count: 3,
            route_id: "28".to_string(),
            route_type: Some(3),
            branch_route_id: None,
            trunk_route_id: None,
            service_id: "weekday".to_string(),
            direction_id: Some(0),
            block_id: Some("b1".to_string()),
            parent_station: None,
            plan_arrival_secs: Some(8 * 3600 + seq * 120),
            plan_departure_secs: Some(8 * 3600 + seq * 120 + 30),
            plan_start_secs: Some(8 * 3600),
            static_version_key: Some(1),
        }
    }

    fn position(stop: &str, seq: i64, status: StopStatus, offset: i64) -> GtfsRtObservation {
        GtfsRtObservation {
            observed_at: at(offset),
            trip_id: Some("T".to_string()),
            route_id: Some("28".to_string()),
            direction_id: Some(0),
            start_date: Some("20240603".to_string()),
            stop_id: Some(stop.to_string()),
            stop_sequence: Some(seq),
            status: Some(status),
            vehicle_id: Some("y1234".to_string()),
            vehicle_label: Some("1234".to_string()),
        }
    }

    fn inputs() -> ServiceDateInputs {
        ServiceDateInputs {
            planned: vec![plan("A", 1), plan("B", 2), plan("C", 3)],
            gtfs_rt: vec![
                position("A", 1, StopStatus::InTransitTo, 0),
                position("A", 1, StopStatus::StoppedAt, 30),
                position("B", 2, StopStatus::InTransitTo, 100),
                position("B", 2, StopStatus::StoppedAt, 140),
                position("B", 2, StopStatus::StoppedAt, 145),
                position("C", 3, StopStatus::InTransitTo, 200),
                position("C", 3, StopStatus::StoppedAt, 260),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_gtfs_rt_only_day() {
        let outcome =
            process_service_date(service_date(), &inputs(), &PipelineConfig::default()).unwrap();

        assert_eq!(outcome.visits.len(), 3);
        assert_eq!(outcome.rejected_rows(), 0);
        assert!(outcome.advisories.is_empty());
        assert_eq!(outcome.realtime.duplicates, 1);

        let b = &outcome.visits[1];
        assert_eq!(b.event.stop.stop_id.as_deref(), Some("B"));
        assert_eq!(b.stop_arrival_instant, Some(at(140)));
        assert_eq!(b.stop_departure_instant, Some(at(200)));
        assert_eq!(b.dwell_time_seconds, Some(60));
        assert_eq!(b.travel_time_seconds, Some(40));

        let c = &outcome.visits[2];
        assert_eq!(c.stop_arrival_instant, Some(at(260)));
        assert_eq!(c.stop_departure_instant, None);
    }

    #[test]
    fn test_missing_gtfs_rt_is_input_absent() {
        let mut inputs = inputs();
        inputs.gtfs_rt.clear();

        let err = process_service_date(service_date(), &inputs, &PipelineConfig::default())
            .unwrap_err();
        assert!(matches!(err, PipelineError::InputAbsent { input: "gtfs-rt", .. }));
    }

    #[test]
    fn test_missing_planned_is_input_absent() {
        let mut inputs = inputs();
        inputs.planned.clear();

        let err = process_service_date(service_date(), &inputs, &PipelineConfig::default())
            .unwrap_err();
        assert_eq!(err.kind(), "input_absent");
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = PipelineConfig {
            service_day_start_hour: 30,
            ..Default::default()
        };
        let err = process_service_date(service_date(), &inputs(), &config).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
    }

    #[test]
    fn test_rerun_is_identical() {
        let config = PipelineConfig::default();
        let first = process_service_date(service_date(), &inputs(), &config).unwrap();
        let second = process_service_date(service_date(), &inputs(), &config).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_out_of_order_arrival_is_quarantined() {
        let mut inputs = inputs();
        // Vehicle reports stopped at C before it left B.
        inputs.gtfs_rt.retain(|o| {
            !(o.stop_id.as_deref() == Some("C") && o.status == Some(StopStatus::StoppedAt))
        });
        inputs
            .gtfs_rt
            .push(position("C", 3, StopStatus::StoppedAt, 120));

        let outcome =
            process_service_date(service_date(), &inputs, &PipelineConfig::default()).unwrap();

        assert_eq!(outcome.visits.len(), 2);
        assert_eq!(outcome.rejected_visits.len(), 1);
        assert!(
            outcome.rejected_visits[0]
                .failed
                .contains(&"stop_sequence_implies_time_order")
        );
        assert!(outcome.advisories.iter().any(|a| matches!(
            a,
            Advisory::ValidationFailure { stage, .. } if stage == "stop_visits"
        )));
    }
}
