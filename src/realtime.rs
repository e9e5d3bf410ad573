//! Realtime event matching.
//!
//! GTFS-RT vehicle positions are reduced to one event per vehicle visit of
//! a stop, then both realtime streams are aligned onto the canonical stop
//! list by nearest stop sequence.

use chrono::NaiveDate;
use chrono_tz::Tz;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info};

use crate::model::{
    AvlObservation, CanonicalStop, GtfsRtObservation, MatchedStopEvent, RtStopEvent, StopStatus,
};
use crate::service_date::{parse_gtfs_date, service_date_of};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NormalizeCounts {
    pub input_rows: usize,
    pub other_service_date: usize,
    pub incomplete: usize,
    pub non_bus: usize,
    pub duplicates: usize,
    pub events: usize,
}

/// Route ids of canonical stops whose route type is one of `route_types`.
pub fn bus_routes(stops: &[CanonicalStop], route_types: &[u16]) -> HashSet<String> {
    stops
        .iter()
        .filter(|s| s.route_type.is_some_and(|t| route_types.contains(&t)))
        .filter_map(|s| s.route_id.clone())
        .collect()
}

struct Position<'a> {
    observation: &'a GtfsRtObservation,
    trip_id: &'a str,
    route_id: &'a str,
    stop_id: &'a str,
    vehicle_id: &'a str,
    stop_sequence: i64,
    status: StopStatus,
}

/// Reduces raw vehicle positions to [`RtStopEvent`]s for `service_date`.
///
/// `INCOMING_AT` counts as `STOPPED_AT`. Only the earliest position per
/// (trip, stop, direction, vehicle, status) is kept before pivoting the
/// status into arrival and in-transit instants.
pub fn normalize_gtfs_rt(
    observations: &[GtfsRtObservation],
    service_date: NaiveDate,
    bus_routes: &HashSet<String>,
    tz: Tz,
    day_start_hour: u32,
) -> (Vec<RtStopEvent>, NormalizeCounts) {
    let mut counts = NormalizeCounts {
        input_rows: observations.len(),
        ..Default::default()
    };

    let mut positions = Vec::with_capacity(observations.len());
    for observation in observations {
        let observed_date = observation
            .start_date
            .as_deref()
            .and_then(parse_gtfs_date)
            .unwrap_or_else(|| service_date_of(observation.observed_at, tz, day_start_hour));
        if observed_date != service_date {
            counts.other_service_date += 1;
            continue;
        }

        let vehicle_id = observation
            .vehicle_id
            .as_deref()
            .or(observation.vehicle_label.as_deref());
        let (
            Some(trip_id),
            Some(route_id),
            Some(stop_id),
            Some(vehicle_id),
            Some(stop_sequence),
            Some(status),
        ) = (
            observation.trip_id.as_deref(),
            observation.route_id.as_deref(),
            observation.stop_id.as_deref(),
            vehicle_id,
            observation.stop_sequence,
            observation.status,
        )
        else {
            counts.incomplete += 1;
            continue;
        };

        if !bus_routes.contains(route_id) {
            counts.non_bus += 1;
            continue;
        }

        let status = match status {
            StopStatus::IncomingAt => StopStatus::StoppedAt,
            other => other,
        };

        positions.push(Position {
            observation,
            trip_id,
            route_id,
            stop_id,
            vehicle_id,
            stop_sequence,
            status,
        });
    }

    positions.sort_by(|a, b| {
        a.vehicle_id
            .cmp(b.vehicle_id)
            .then(a.observation.observed_at.cmp(&b.observation.observed_at))
            .then(a.stop_sequence.cmp(&b.stop_sequence))
            .then(a.status.cmp(&b.status))
    });

    let mut seen = HashSet::new();
    let mut pivoted: BTreeMap<(&str, &str, Option<u8>, &str), RtStopEvent> = BTreeMap::new();
    for p in &positions {
        let direction_id = p.observation.direction_id;
        if !seen.insert((p.trip_id, p.stop_id, direction_id, p.vehicle_id, p.status)) {
            counts.duplicates += 1;
            continue;
        }

        let event = pivoted
            .entry((p.trip_id, p.stop_id, direction_id, p.vehicle_id))
            .or_insert_with(|| RtStopEvent {
                trip_id: p.trip_id.to_string(),
                route_id: p.route_id.to_string(),
                stop_id: p.stop_id.to_string(),
                direction_id,
                vehicle_id: p.vehicle_id.to_string(),
                vehicle_label: p.observation.vehicle_label.clone(),
                stop_sequence: p.stop_sequence,
                arrival_observed_at: None,
                in_transit_to_at: None,
                departure_estimate: None,
            });
        match p.status {
            StopStatus::InTransitTo => event.in_transit_to_at = Some(p.observation.observed_at),
            _ => event.arrival_observed_at = Some(p.observation.observed_at),
        }
    }

    let mut events: Vec<RtStopEvent> = pivoted.into_values().collect();
    events.sort_by(|a, b| {
        a.vehicle_id
            .cmp(&b.vehicle_id)
            .then_with(|| a.trip_id.cmp(&b.trip_id))
            .then(a.stop_sequence.cmp(&b.stop_sequence))
            .then_with(|| a.stop_id.cmp(&b.stop_id))
    });
    for idx in 1..events.len() {
        let same_trip = events[idx - 1].vehicle_id == events[idx].vehicle_id
            && events[idx - 1].trip_id == events[idx].trip_id;
        if same_trip {
            events[idx - 1].departure_estimate = events[idx].in_transit_to_at;
        }
    }

    counts.events = events.len();
    info!(
        %service_date,
        input = counts.input_rows,
        other_service_date = counts.other_service_date,
        incomplete = counts.incomplete,
        non_bus = counts.non_bus,
        duplicates = counts.duplicates,
        events = counts.events,
        "GTFS-RT positions normalized"
    );

    (events, counts)
}

/// Keeps AVL observations for `service_date` that carry an actual arrival or
/// departure.
pub fn normalize_avl(observations: Vec<AvlObservation>, service_date: NaiveDate) -> Vec<AvlObservation> {
    let input = observations.len();
    let kept: Vec<_> = observations
        .into_iter()
        .filter(|o| o.service_date == service_date)
        .filter(|o| o.actual_arrival.is_some() || o.actual_departure.is_some())
        .collect();
    debug!(%service_date, input, kept = kept.len(), "AVL observations normalized");
    kept
}

/// Returns the candidate whose sequence is numerically closest to `target`,
/// preferring the smaller sequence on a tie. Remaining ties go to the
/// earliest candidate in iteration order.
pub fn nearest_by_sequence<T, I, F>(candidates: I, target: i64, sequence: F) -> Option<T>
where
    I: IntoIterator<Item = T>,
    F: Fn(&T) -> i64,
{
    candidates.into_iter().min_by_key(|c| {
        let seq = sequence(c);
        ((seq - target).abs(), seq)
    })
}

fn avl_compatible(
    observation: &AvlObservation,
    rt_vehicle_label: Option<&str>,
    route_id: Option<&str>,
) -> bool {
    let vehicle_ok = match (rt_vehicle_label, observation.vehicle_label.as_deref()) {
        (Some(rt), Some(avl)) => rt == avl,
        _ => true,
    };
    let route_ok = match (route_id, observation.route_id.as_deref()) {
        (Some(plan), Some(avl)) => plan == avl,
        _ => true,
    };
    vehicle_ok && route_ok
}

/// Gives every row of one physical vehicle on a trip the same key, including
/// rows only AVL saw.
fn assign_vehicle_keys(matched: &mut [MatchedStopEvent]) {
    let mut rt_ids: HashMap<(String, String), String> = HashMap::new();
    for event in matched.iter() {
        let Some(rt) = &event.rt else {
            continue;
        };
        let labels = [
            rt.vehicle_label.as_deref(),
            event.avl.as_ref().and_then(|avl| avl.vehicle_label.as_deref()),
        ];
        for label in labels.into_iter().flatten() {
            rt_ids
                .entry((event.stop.trip_id.clone(), label.to_string()))
                .or_insert_with(|| rt.vehicle_id.clone());
        }
    }

    for event in matched.iter_mut() {
        event.vehicle_key = match (&event.rt, &event.avl) {
            (Some(rt), _) => Some(rt.vehicle_id.clone()),
            (None, Some(avl)) => avl.vehicle_label.as_ref().map(|label| {
                rt_ids
                    .get(&(event.stop.trip_id.clone(), label.clone()))
                    .unwrap_or(label)
                    .clone()
            }),
            (None, None) => None,
        };
    }
}

/// Aligns GTFS-RT events and AVL observations onto canonical stops.
///
/// GTFS-RT events match within (trip, route, stop) against the planned
/// numbering; AVL observations match within (trip, stop) against pattern
/// positions, restricted to the GTFS-RT vehicle when both sides name one.
/// Candidates more than `max_sequence_diff` away never match, so on a loop
/// route the single event for the shared terminal stays on one visit.
/// Stops without a GTFS stop id match nothing.
///
/// Every matched row gets a vehicle key: the GTFS-RT vehicle id, else the
/// id GTFS-RT used on the same trip for the AVL label, else the AVL label.
pub fn match_events(
    service_date: NaiveDate,
    canonical: Vec<CanonicalStop>,
    rt_events: &[RtStopEvent],
    avl_observations: &[AvlObservation],
    max_sequence_diff: i64,
) -> Vec<MatchedStopEvent> {
    let mut rt_index: HashMap<(&str, &str, &str), Vec<&RtStopEvent>> = HashMap::new();
    for event in rt_events {
        rt_index
            .entry((
                event.trip_id.as_str(),
                event.route_id.as_str(),
                event.stop_id.as_str(),
            ))
            .or_default()
            .push(event);
    }
    for candidates in rt_index.values_mut() {
        candidates.sort_by(|a, b| {
            a.stop_sequence
                .cmp(&b.stop_sequence)
                .then_with(|| a.vehicle_id.cmp(&b.vehicle_id))
        });
    }

    let mut avl_index: HashMap<(&str, &str), Vec<&AvlObservation>> = HashMap::new();
    for observation in avl_observations {
        if let (Some(trip_id), Some(stop_id)) =
            (observation.trip_id.as_deref(), observation.stop_id.as_deref())
        {
            avl_index
                .entry((trip_id, stop_id))
                .or_default()
                .push(observation);
        }
    }
    for candidates in avl_index.values_mut() {
        candidates.sort_by(|a, b| {
            a.stop_sequence
                .cmp(&b.stop_sequence)
                .then_with(|| a.vehicle_label.cmp(&b.vehicle_label))
        });
    }

    let mut matched: Vec<MatchedStopEvent> = canonical
        .into_iter()
        .map(|stop| {
            let within = |seq: i64, target: i64| (seq - target).abs() <= max_sequence_diff;

            let gtfs_sequence = stop.gtfs_sequence();
            let rt = stop
                .route_id
                .as_deref()
                .zip(stop.stop_id.as_deref())
                .and_then(|(route_id, stop_id)| {
                    rt_index.get(&(stop.trip_id.as_str(), route_id, stop_id))
                })
                .and_then(|candidates| {
                    nearest_by_sequence(
                        candidates
                            .iter()
                            .copied()
                            .filter(|e| within(e.stop_sequence, gtfs_sequence)),
                        gtfs_sequence,
                        |e| e.stop_sequence,
                    )
                })
                .cloned();

            let rt_vehicle_label = rt.as_ref().and_then(|e| e.vehicle_label.as_deref());
            let avl_sequence = stop.avl_sequence();
            let avl = stop
                .stop_id
                .as_deref()
                .and_then(|stop_id| avl_index.get(&(stop.trip_id.as_str(), stop_id)))
                .and_then(|candidates| {
                    nearest_by_sequence(
                        candidates.iter().copied().filter(|o| {
                            within(o.stop_sequence, avl_sequence)
                                && avl_compatible(o, rt_vehicle_label, stop.route_id.as_deref())
                        }),
                        avl_sequence,
                        |o| o.stop_sequence,
                    )
                })
                .cloned();

            let sort_instant = rt.as_ref().and_then(|e| e.sort_instant());
            MatchedStopEvent {
                service_date,
                stop,
                rt,
                avl,
                sort_instant,
                departure_instant_gtfs: None,
                vehicle_key: None,
            }
        })
        .collect();

    assign_vehicle_keys(&mut matched);

    let mut vehicle_trips: HashMap<(String, String), Vec<usize>> = HashMap::new();
    for (idx, event) in matched.iter().enumerate() {
        if let (Some(rt), Some(_)) = (&event.rt, event.sort_instant) {
            vehicle_trips
                .entry((rt.vehicle_id.clone(), event.stop.trip_id.clone()))
                .or_default()
                .push(idx);
        }
    }
    for (_, mut indices) in vehicle_trips {
        indices.sort_by_key(|&i| (matched[i].sort_instant, matched[i].stop.stop_sequence));
        for pair in indices.windows(2) {
            let next = matched[pair[1]].sort_instant;
            matched[pair[0]].departure_instant_gtfs = next;
        }
    }
    for event in &mut matched {
        if event.departure_instant_gtfs.is_none() {
            event.departure_instant_gtfs = event.rt.as_ref().and_then(|rt| rt.departure_estimate);
        }
    }

    let with_rt = matched.iter().filter(|e| e.rt.is_some()).count();
    let with_avl = matched.iter().filter(|e| e.avl.is_some()).count();
    info!(
        %service_date,
        rows = matched.len(),
        with_rt,
        with_avl,
        rt_events = rt_events.len(),
        avl_observations = avl_observations.len(),
        "Realtime events matched"
    );

    matched
}
