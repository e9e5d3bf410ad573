//! Named-predicate validation of stage outputs.
//!
//! Every check produces a boolean mask over the whole row set. A row that
//! fails one or more checks moves to the rejected set together with the
//! names of all checks it failed. Invalid rows never abort a run.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::error::Advisory;
use crate::model::{CanonicalStop, EnrichedStopVisit, MatchedStopEvent, ScheduleSource};

/// `true` marks a row that passes.
pub type Mask = Vec<bool>;

pub struct Check<T> {
    pub name: &'static str,
    mask: Box<dyn Fn(&[T]) -> Mask + Send + Sync>,
}

impl<T: 'static> Check<T> {
    /// A check evaluated on each row on its own.
    pub fn row<F>(name: &'static str, predicate: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Self {
            name,
            mask: Box::new(move |rows: &[T]| rows.iter().map(&predicate).collect()),
        }
    }

    /// A check that compares rows with each other.
    pub fn set<F>(name: &'static str, mask: F) -> Self
    where
        F: Fn(&[T]) -> Mask + Send + Sync + 'static,
    {
        Self {
            name,
            mask: Box::new(mask),
        }
    }

    pub fn evaluate(&self, rows: &[T]) -> Mask {
        (self.mask)(rows)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rejected<T> {
    pub row: T,
    pub failed: Vec<&'static str>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    pub stage: String,
    pub total: usize,
    pub valid: usize,
    pub rejected: usize,
    /// Rejections per check name. A row failing two checks counts in both.
    pub causes: BTreeMap<String, usize>,
}

impl ValidationReport {
    pub fn advisory(&self) -> Option<Advisory> {
        (self.rejected > 0).then(|| Advisory::ValidationFailure {
            stage: self.stage.clone(),
            rejected: self.rejected,
            causes: self.causes.clone(),
        })
    }
}

#[derive(Debug)]
pub struct Validated<T> {
    pub valid: Vec<T>,
    pub rejected: Vec<Rejected<T>>,
    pub report: ValidationReport,
}

/// Splits `rows` into valid and rejected sets.
pub fn validate<T: 'static>(stage: &str, rows: Vec<T>, checks: &[Check<T>]) -> Validated<T> {
    let total = rows.len();
    let masks: Vec<(&'static str, Mask)> = checks
        .iter()
        .map(|check| (check.name, check.evaluate(&rows)))
        .collect();

    let mut valid = Vec::with_capacity(total);
    let mut rejected = Vec::new();
    let mut causes: BTreeMap<String, usize> = BTreeMap::new();

    for (idx, row) in rows.into_iter().enumerate() {
        let failed: Vec<&'static str> = masks
            .iter()
            .filter(|(_, mask)| !mask.get(idx).copied().unwrap_or(true))
            .map(|(name, _)| *name)
            .collect();

        if failed.is_empty() {
            valid.push(row);
        } else {
            for name in &failed {
                *causes.entry(name.to_string()).or_insert(0) += 1;
            }
            debug!(stage, row = idx, failed = ?failed, "Row rejected");
            rejected.push(Rejected { row, failed });
        }
    }

    let report = ValidationReport {
        stage: stage.to_string(),
        total,
        valid: valid.len(),
        rejected: rejected.len(),
        causes,
    };

    if report.rejected > 0 {
        warn!(
            stage,
            total,
            valid = report.valid,
            rejected = report.rejected,
            causes = ?report.causes,
            "Validation rejected rows"
        );
    } else {
        info!(stage, total, "Validation passed");
    }

    Validated {
        valid,
        rejected,
        report,
    }
}

fn group_by<'a, T, K, F>(rows: &'a [T], key: F) -> BTreeMap<K, Vec<usize>>
where
    K: Ord,
    F: Fn(&'a T) -> Option<K>,
{
    let mut groups: BTreeMap<K, Vec<usize>> = BTreeMap::new();
    for (idx, row) in rows.iter().enumerate() {
        if let Some(k) = key(row) {
            groups.entry(k).or_default().push(idx);
        }
    }
    groups
}

pub fn schedule_checks(max_sequence_diff: i64) -> Vec<Check<CanonicalStop>> {
    vec![
        Check::row("sequence_diff_within_tolerance", move |s: &CanonicalStop| {
            s.sequence_diff.is_none_or(|d| d <= max_sequence_diff)
        }),
        Check::row("source_matches_sequences", |s: &CanonicalStop| {
            match s.source {
                Some(ScheduleSource::PlanOnly) => {
                    s.plan_stop_sequence.is_some() && s.avl_stop_sequence.is_none()
                }
                Some(ScheduleSource::AvlOnly) => {
                    s.plan_stop_sequence.is_none() && s.avl_stop_sequence.is_some()
                }
                Some(ScheduleSource::Joined) => {
                    s.plan_stop_sequence.is_some() && s.avl_stop_sequence.is_some()
                }
                None => false,
            }
        }),
        Check::row("trip_attributes_filled", |s: &CanonicalStop| {
            s.route_id.is_some() && s.service_id.is_some()
        }),
        Check::set("plan_sequence_increases_in_trip", plan_sequence_mask),
        Check::set("timepoint_order_timepoint_id_correspond", timepoint_mask),
    ]
}

fn plan_sequence_mask(rows: &[CanonicalStop]) -> Mask {
    let mut mask = vec![true; rows.len()];
    for (_, mut indices) in group_by(rows, |s| Some(s.trip_id.as_str())) {
        indices.sort_by_key(|&i| rows[i].stop_sequence);
        let mut highest = None;
        for i in indices {
            if let Some(seq) = rows[i].plan_stop_sequence {
                if highest.is_some_and(|h| seq <= h) {
                    mask[i] = false;
                }
                highest = highest.max(Some(seq));
            }
        }
    }
    mask
}

fn timepoint_mask(rows: &[CanonicalStop]) -> Mask {
    let mut mask: Mask = rows
        .iter()
        .map(|s| s.timepoint_id.is_some() == s.timepoint_order.is_some())
        .collect();
    for (_, mut indices) in group_by(rows, |s| Some(s.trip_id.as_str())) {
        indices.sort_by_key(|&i| rows[i].stop_sequence);
        let mut previous = None;
        for i in indices {
            if let Some(order) = rows[i].timepoint_order {
                if previous.is_some_and(|p| order <= p) {
                    mask[i] = false;
                }
                previous = Some(order);
            }
        }
    }
    mask
}

pub fn matched_checks() -> Vec<Check<MatchedStopEvent>> {
    vec![
        Check::row("rt_direction_matches_schedule", |e: &MatchedStopEvent| {
            match (e.rt.as_ref().and_then(|rt| rt.direction_id), e.stop.direction_id) {
                (Some(rt), Some(plan)) => rt == plan,
                _ => true,
            }
        }),
        Check::row("avl_vehicle_matches_rt_vehicle", |e: &MatchedStopEvent| {
            let rt = e.rt.as_ref().and_then(|rt| rt.vehicle_label.as_deref());
            let avl = e.avl.as_ref().and_then(|avl| avl.vehicle_label.as_deref());
            match (rt, avl) {
                (Some(rt), Some(avl)) => rt == avl,
                _ => true,
            }
        }),
        Check::row("avl_observation_on_service_date", |e: &MatchedStopEvent| {
            e.avl
                .as_ref()
                .is_none_or(|avl| avl.service_date == e.service_date)
        }),
        Check::row("rt_event_has_sort_instant", |e: &MatchedStopEvent| {
            e.rt.is_none() || e.sort_instant.is_some()
        }),
    ]
}

pub fn enriched_checks() -> Vec<Check<EnrichedStopVisit>> {
    vec![
        Check::row("departure_after_arrival", |v: &EnrichedStopVisit| {
            match (v.stop_arrival_instant, v.stop_departure_instant) {
                (Some(arr), Some(dep)) => dep >= arr,
                _ => true,
            }
        }),
        Check::set("stop_sequence_implies_time_order", time_order_mask),
        Check::row("final_stop_has_arrival_dt", |v: &EnrichedStopVisit| {
            let seen_in_transit = v
                .event
                .rt
                .as_ref()
                .is_some_and(|rt| rt.in_transit_to_at.is_some());
            !(v.event.stop.is_final_planned_stop() && seen_in_transit)
                || v.stop_arrival_instant.is_some()
        }),
    ]
}

fn instant_span(v: &EnrichedStopVisit) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    let instants = [v.stop_arrival_instant, v.stop_departure_instant];
    (
        instants.iter().flatten().min().copied(),
        instants.iter().flatten().max().copied(),
    )
}

/// Within each (vehicle, service date), trips are taken in the order of
/// their earliest instant and stops by stop sequence. A row fails when its
/// earliest instant precedes the latest instant of the previous timed row.
fn time_order_mask(rows: &[EnrichedStopVisit]) -> Mask {
    let mut mask = vec![true; rows.len()];

    let mut vehicle_days: BTreeMap<(&str, NaiveDate), BTreeMap<&str, Vec<usize>>> =
        BTreeMap::new();
    for (idx, visit) in rows.iter().enumerate() {
        if let Some(vehicle) = visit.event.vehicle() {
            vehicle_days
                .entry((vehicle, visit.event.service_date))
                .or_default()
                .entry(visit.event.stop.trip_id.as_str())
                .or_default()
                .push(idx);
        }
    }

    for trips in vehicle_days.into_values() {
        let mut ordered: Vec<(Option<DateTime<Utc>>, &str, Vec<usize>)> = trips
            .into_iter()
            .map(|(trip_id, mut indices)| {
                indices.sort_by_key(|&i| rows[i].event.stop.stop_sequence);
                let first = indices.iter().filter_map(|&i| instant_span(&rows[i]).0).min();
                (first, trip_id, indices)
            })
            .collect();
        ordered.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(b.1)));

        let mut previous_latest: Option<DateTime<Utc>> = None;
        for i in ordered.into_iter().flat_map(|(_, _, indices)| indices) {
            let (earliest, latest) = instant_span(&rows[i]);
            if let (Some(prev), Some(earliest)) = (previous_latest, earliest) {
                if earliest < prev {
                    mask[i] = false;
                }
            }
            if latest.is_some() {
                previous_latest = latest;
            }
        }
    }

    mask
}
