//! Composition of the planned schedule and the AVL schedule into one
//! canonical stop list per trip.

use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

use crate::error::{Advisory, PipelineError};
use crate::model::{AvlScheduledStop, CanonicalStop, PlannedStop};
use crate::reference::AvlReference;

/// Row-count reconciliation figures for one composition.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompositionCounts {
    pub planned_rows: usize,
    /// AVL rows on trips present in the planned schedule.
    pub avl_rows: usize,
    /// AVL rows whose geo node did not translate to a stop. They are kept
    /// as AVL-only rows without a stop id and are part of `avl_only_rows`.
    pub unmapped_avl_rows: usize,
    pub joined_rows: usize,
    pub plan_only_rows: usize,
    pub avl_only_rows: usize,
    pub tolerance_drops: usize,
    pub output_rows: usize,
}

impl CompositionCounts {
    pub fn expected_rows(&self) -> usize {
        self.planned_rows + self.avl_only_rows
    }
}

#[derive(Debug)]
pub struct Composition {
    pub stops: Vec<CanonicalStop>,
    pub counts: CompositionCounts,
    pub advisory: Option<Advisory>,
}

/// Forward-fills then backward-fills each listed field across a trip's rows.
macro_rules! fill_trip_fields {
    ($rows:expr; $($field:ident),+ $(,)?) => {
        $(
            let mut carried = None;
            for row in $rows.iter_mut() {
                if row.$field.is_some() {
                    carried = row.$field.clone();
                } else {
                    row.$field = carried.clone();
                }
            }
            let mut carried = None;
            for row in $rows.iter_mut().rev() {
                if row.$field.is_some() {
                    carried = row.$field.clone();
                } else {
                    row.$field = carried.clone();
                }
            }
        )+
    };
}

/// Joins planned and AVL scheduled stops on (trip_id, stop_id).
///
/// AVL rows are first restricted to the planned trips. AVL rows whose stop
/// did not translate cannot join and stay in the trip as AVL-only rows
/// without a stop id. Joined pairs whose
/// stop sequences differ by more than `max_sequence_diff` are dropped as
/// matches against the wrong visit of a revisited stop. A canonical row
/// count that does not reconcile is returned as an advisory.
///
/// # Errors
///
/// Returns [`PipelineError::InputAbsent`] when the planned schedule is empty.
pub fn compose(
    service_date: NaiveDate,
    planned: &[PlannedStop],
    avl_schedule: &[AvlScheduledStop],
    reference: &AvlReference,
    max_sequence_diff: i64,
) -> Result<Composition, PipelineError> {
    if planned.is_empty() {
        return Err(PipelineError::InputAbsent {
            service_date,
            input: "planned schedule",
        });
    }
    if avl_schedule.is_empty() {
        warn!(%service_date, "AVL schedule is empty, canonical stops will be plan-only");
    }

    let mut counts = CompositionCounts {
        planned_rows: planned.len(),
        ..Default::default()
    };

    let planned_trips: HashSet<&str> = planned.iter().map(|p| p.trip_id.as_str()).collect();

    let mut keyed: BTreeMap<(&str, &str), (Vec<&PlannedStop>, Vec<&AvlScheduledStop>)> =
        BTreeMap::new();
    let mut unmapped: Vec<(&str, &AvlScheduledStop)> = Vec::new();
    for plan in planned {
        keyed
            .entry((plan.trip_id.as_str(), plan.stop_id.as_str()))
            .or_default()
            .0
            .push(plan);
    }
    for avl in avl_schedule {
        let Some(trip_id) = avl.trip_id.as_deref() else {
            continue;
        };
        if !planned_trips.contains(trip_id) {
            continue;
        }
        counts.avl_rows += 1;

        let Some(stop_id) = avl.stop_id.as_deref() else {
            counts.unmapped_avl_rows += 1;
            unmapped.push((trip_id, avl));
            continue;
        };
        keyed.entry((trip_id, stop_id)).or_default().1.push(avl);
    }

    let mut by_trip: BTreeMap<&str, Vec<CanonicalStop>> = BTreeMap::new();
    for (&(trip_id, stop_id), (plans, avls)) in &keyed {
        let rows = by_trip.entry(trip_id).or_default();

        if avls.is_empty() {
            counts.plan_only_rows += plans.len();
            rows.extend(plans.iter().map(|p| CanonicalStop::from_plan(p)));
        } else if plans.is_empty() {
            counts.avl_only_rows += avls.len();
            rows.extend(
                avls.iter()
                    .map(|a| with_timepoint(CanonicalStop::from_avl(trip_id, a), reference)),
            );
        } else {
            for plan in plans {
                for avl in avls {
                    let row = CanonicalStop::joined(plan, avl);
                    if row.sequence_diff.is_some_and(|d| d > max_sequence_diff) {
                        counts.tolerance_drops += 1;
                        debug!(
                            trip_id,
                            stop_id,
                            plan_stop_sequence = plan.stop_sequence,
                            avl_stop_sequence = avl.avl_stop_sequence,
                            "Dropping joined stop outside sequence tolerance"
                        );
                        continue;
                    }
                    counts.joined_rows += 1;
                    rows.push(with_timepoint(row, reference));
                }
            }
        }
    }

    for (trip_id, avl) in unmapped {
        counts.avl_only_rows += 1;
        by_trip
            .entry(trip_id)
            .or_default()
            .push(with_timepoint(CanonicalStop::from_avl(trip_id, avl), reference));
    }

    let mut stops = Vec::with_capacity(counts.expected_rows());
    for (_, rows) in by_trip {
        let mut rows = order_trip(rows);
        fill_trip_fields!(rows;
            route_id,
            route_type,
            branch_route_id,
            trunk_route_id,
            service_id,
            direction_id,
            block_id,
            plan_start_secs,
            plan_stop_count,
            static_version_key,
            pattern_id,
            pullout_id,
        );

        let stop_count = rows.len() as i64;
        for (idx, row) in rows.iter_mut().enumerate() {
            row.stop_sequence = idx as i64 + 1;
            row.stop_count = stop_count;
        }
        stops.extend(rows);
    }

    counts.output_rows = stops.len();

    let advisory = if counts.output_rows != counts.expected_rows() {
        warn!(
            %service_date,
            expected = counts.expected_rows(),
            actual = counts.output_rows,
            tolerance_drops = counts.tolerance_drops,
            "Canonical stop count does not reconcile"
        );
        Some(Advisory::RowCountMismatch {
            expected: counts.expected_rows(),
            actual: counts.output_rows,
        })
    } else {
        None
    };

    info!(
        %service_date,
        planned = counts.planned_rows,
        avl = counts.avl_rows,
        joined = counts.joined_rows,
        plan_only = counts.plan_only_rows,
        avl_only = counts.avl_only_rows,
        tolerance_drops = counts.tolerance_drops,
        unmapped = counts.unmapped_avl_rows,
        output = counts.output_rows,
        "Schedule composed"
    );

    Ok(Composition {
        stops,
        counts,
        advisory,
    })
}

fn with_timepoint(mut row: CanonicalStop, reference: &AvlReference) -> CanonicalStop {
    if let (Some(pattern_id), Some(position), Some(timepoint_id)) =
        (row.pattern_id, row.avl_stop_sequence, row.timepoint_id)
    {
        if let Some(meta) = reference.timepoint(pattern_id, position, timepoint_id) {
            row.timepoint_abbr = meta.timepoint_abbr.clone();
            row.timepoint_name = meta.timepoint_name.clone();
            row.timepoint_order = meta.timepoint_order;
        }
    }
    row
}

/// Orders a trip by AVL pattern position, merging plan-only rows in by
/// planned sequence.
fn order_trip(rows: Vec<CanonicalStop>) -> Vec<CanonicalStop> {
    let total = rows.len();
    let (mut positioned, mut plan_only): (Vec<_>, Vec<_>) = rows
        .into_iter()
        .partition(|r| r.avl_stop_sequence.is_some());
    positioned.sort_by_key(|r| (r.avl_stop_sequence, r.plan_stop_sequence));
    plan_only.sort_by_key(|r| r.plan_stop_sequence);

    let mut pending = plan_only.into_iter().peekable();
    let mut ordered = Vec::with_capacity(total);
    for row in positioned {
        if let Some(seq) = row.plan_stop_sequence {
            while let Some(earlier) =
                pending.next_if(|p| p.plan_stop_sequence.is_some_and(|s| s < seq))
            {
                ordered.push(earlier);
            }
        }
        ordered.push(row);
    }
    ordered.extend(pending);
    ordered
}
