//! Arrival/departure resolution and derived timing metrics.
//!
//! AVL instants take priority over GTFS-RT; GTFS-RT only fills gaps.
//! Every difference is taken between instants converted to the agency
//! timezone.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::info;

use crate::model::{EnrichedStopVisit, MatchedStopEvent};
use crate::service_date::{seconds_between, service_day_offset};

/// AVL actual arrival, else GTFS-RT stopped-at instant.
pub fn resolve_arrival(event: &MatchedStopEvent) -> Option<DateTime<Utc>> {
    event
        .avl
        .as_ref()
        .and_then(|avl| avl.actual_arrival)
        .or_else(|| event.rt.as_ref().and_then(|rt| rt.arrival_observed_at))
}

/// AVL actual departure, else the GTFS-RT departure derived from the next
/// stop.
pub fn resolve_departure(event: &MatchedStopEvent) -> Option<DateTime<Utc>> {
    event
        .avl
        .as_ref()
        .and_then(|avl| avl.actual_departure)
        .or(event.departure_instant_gtfs)
}

pub fn enrich(matched: Vec<MatchedStopEvent>, tz: Tz) -> Vec<EnrichedStopVisit> {
    let mut visits: Vec<EnrichedStopVisit> = matched
        .into_iter()
        .map(|event| {
            let arrival = resolve_arrival(&event);
            let departure = resolve_departure(&event);
            let dwell = match (arrival, departure) {
                (Some(arr), Some(dep)) => Some(seconds_between(dep, arr, tz)),
                _ => None,
            };
            let plan_arrival = event
                .stop
                .plan_arrival_secs
                .and_then(|secs| service_day_offset(event.service_date, secs, tz));
            let plan_departure = event
                .stop
                .plan_departure_secs
                .and_then(|secs| service_day_offset(event.service_date, secs, tz));

            EnrichedStopVisit {
                stop_arrival_instant: arrival,
                stop_departure_instant: departure,
                dwell_time_seconds: dwell,
                plan_arrival_instant: plan_arrival,
                plan_departure_instant: plan_departure,
                ..EnrichedStopVisit::unresolved(event)
            }
        })
        .collect();

    // travel time: arrival here minus departure from the previous stop
    lagged(
        &mut visits,
        |v| Some((v.event.vehicle()?.to_string(), v.event.stop.trip_id.clone())),
        by_stop_sequence,
        |prev, cur| match (cur.stop_arrival_instant, prev.stop_departure_instant) {
            (Some(arr), Some(dep)) => Some(seconds_between(arr, dep, tz)),
            _ => None,
        },
        |v, value| v.travel_time_seconds = value,
    );

    lagged(
        &mut visits,
        |v| Some(v.event.stop.trip_id.clone()),
        by_stop_sequence,
        |prev, cur| Some(cur.event.stop.plan_arrival_secs? - prev.event.stop.plan_departure_secs?),
        |v, value| v.plan_travel_time_seconds = value,
    );

    let departure_gap = |prev: &EnrichedStopVisit, cur: &EnrichedStopVisit| {
        Some(seconds_between(
            cur.stop_departure_instant?,
            prev.stop_departure_instant?,
            tz,
        ))
    };
    let plan_departure_gap = |prev: &EnrichedStopVisit, cur: &EnrichedStopVisit| {
        Some(cur.event.stop.plan_departure_secs? - prev.event.stop.plan_departure_secs?)
    };

    lagged(
        &mut visits,
        |v| {
            v.stop_departure_instant?;
            headway_key(v, HeadwayGrouping::Trunk)
        },
        by_departure,
        departure_gap,
        |v, value| v.trunk_headway_seconds = value,
    );
    lagged(
        &mut visits,
        |v| {
            v.stop_departure_instant?;
            headway_key(v, HeadwayGrouping::Branch)
        },
        by_departure,
        departure_gap,
        |v, value| v.branch_headway_seconds = value,
    );
    lagged(
        &mut visits,
        |v| {
            v.event.stop.plan_departure_secs?;
            headway_key(v, HeadwayGrouping::Trunk)
        },
        by_plan_departure,
        plan_departure_gap,
        |v, value| v.plan_trunk_headway_seconds = value,
    );
    lagged(
        &mut visits,
        |v| {
            v.event.stop.plan_departure_secs?;
            headway_key(v, HeadwayGrouping::Branch)
        },
        by_plan_departure,
        plan_departure_gap,
        |v, value| v.plan_branch_headway_seconds = value,
    );

    let resolved_arrivals = visits.iter().filter(|v| v.stop_arrival_instant.is_some()).count();
    let resolved_departures = visits
        .iter()
        .filter(|v| v.stop_departure_instant.is_some())
        .count();
    info!(
        rows = visits.len(),
        resolved_arrivals, resolved_departures, "Stop visits enriched"
    );

    visits
}

#[derive(Debug, Clone, Copy)]
enum HeadwayGrouping {
    Trunk,
    Branch,
}

type HeadwayKey = (String, Option<String>, Option<u8>, Option<String>);

/// (parent station, service, direction, trunk or branch route). Stops
/// without a GTFS stop have no headway.
fn headway_key(visit: &EnrichedStopVisit, grouping: HeadwayGrouping) -> Option<HeadwayKey> {
    let stop = &visit.event.stop;
    let place = stop.parent_station.as_ref().or(stop.stop_id.as_ref())?;
    let route = match grouping {
        HeadwayGrouping::Trunk => stop.trunk_route_id.as_ref(),
        HeadwayGrouping::Branch => stop.branch_route_id.as_ref(),
    }
    .or(stop.route_id.as_ref())
    .cloned();
    Some((
        place.clone(),
        stop.service_id.clone(),
        stop.direction_id,
        route,
    ))
}

fn by_stop_sequence(a: &EnrichedStopVisit, b: &EnrichedStopVisit) -> Ordering {
    a.event.stop.stop_sequence.cmp(&b.event.stop.stop_sequence)
}

fn by_departure(a: &EnrichedStopVisit, b: &EnrichedStopVisit) -> Ordering {
    a.stop_departure_instant
        .cmp(&b.stop_departure_instant)
        .then_with(|| a.event.stop.trip_id.cmp(&b.event.stop.trip_id))
}

fn by_plan_departure(a: &EnrichedStopVisit, b: &EnrichedStopVisit) -> Ordering {
    a.event
        .stop
        .plan_departure_secs
        .cmp(&b.event.stop.plan_departure_secs)
        .then_with(|| a.event.stop.trip_id.cmp(&b.event.stop.trip_id))
}

/// Partitions visits by `key`, orders each partition, and assigns
/// `diff(previous, current)` to every row after the first.
fn lagged<K, KF, OF, DF, AF>(visits: &mut [EnrichedStopVisit], key: KF, order: OF, diff: DF, assign: AF)
where
    K: Ord,
    KF: Fn(&EnrichedStopVisit) -> Option<K>,
    OF: Fn(&EnrichedStopVisit, &EnrichedStopVisit) -> Ordering,
    DF: Fn(&EnrichedStopVisit, &EnrichedStopVisit) -> Option<i64>,
    AF: Fn(&mut EnrichedStopVisit, Option<i64>),
{
    let mut partitions: BTreeMap<K, Vec<usize>> = BTreeMap::new();
    for (idx, visit) in visits.iter().enumerate() {
        if let Some(k) = key(visit) {
            partitions.entry(k).or_default().push(idx);
        }
    }

    for (_, mut indices) in partitions {
        indices.sort_by(|&a, &b| order(&visits[a], &visits[b]));
        for pair in indices.windows(2) {
            let value = diff(&visits[pair[0]], &visits[pair[1]]);
            assign(&mut visits[pair[1]], value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AvlObservation, CanonicalStop, RtStopEvent};
    use chrono::{NaiveDate, TimeZone};
    use chrono_tz::America::New_York;

    fn service_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 3).unwrap()
    }

    fn at(offset: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_717_416_000 + offset, 0).unwrap()
    }

    fn stop(trip: &str, stop_id: &str, seq: i64) -> CanonicalStop {
        CanonicalStop {
            trip_id: trip.to_string(),
            stop_id: Some(stop_id.to_string()),
            stop_sequence: seq,
            stop_count: 3,
            plan_stop_sequence: Some(seq),
            plan_stop_count: Some(3),
            route_id: Some("28".to_string()),
            service_id: Some("weekday".to_string()),
            direction_id: Some(0),
            ..Default::default()
        }
    }

    fn rt(vehicle: &str, arrival: Option<i64>) -> RtStopEvent {
        RtStopEvent {
            trip_id: "T".to_string(),
            route_id: "28".to_string(),
            stop_id: "B".to_string(),
            direction_id: Some(0),
            vehicle_id: vehicle.to_string(),
            vehicle_label: Some(vehicle.to_string()),
            stop_sequence: 2,
            arrival_observed_at: arrival.map(at),
            in_transit_to_at: None,
            departure_estimate: None,
        }
    }

    fn avl(arrival: Option<i64>, departure: Option<i64>) -> AvlObservation {
        AvlObservation {
            trip_id: Some("T".to_string()),
            stop_id: Some("B".to_string()),
            route_id: Some("28".to_string()),
            vehicle_label: Some("1234".to_string()),
            stop_sequence: 2,
            actual_arrival: arrival.map(at),
            actual_departure: departure.map(at),
            service_date: service_date(),
            waiver_remark: None,
        }
    }

    fn event(
        stop: CanonicalStop,
        rt: Option<RtStopEvent>,
        avl: Option<AvlObservation>,
        departure_gtfs: Option<i64>,
    ) -> MatchedStopEvent {
        let rt_vehicle = rt.as_ref().map(|e| e.vehicle_id.clone());
        MatchedStopEvent {
            service_date: service_date(),
            stop,
            rt,
            avl,
            sort_instant: None,
            departure_instant_gtfs: departure_gtfs.map(at),
            vehicle_key: rt_vehicle,
        }
    }

    #[test]
    fn test_avl_takes_priority() {
        let e = event(
            stop("T", "B", 2),
            Some(rt("1234", Some(140))),
            Some(avl(Some(130), Some(200))),
            Some(300),
        );
        assert_eq!(resolve_arrival(&e), Some(at(130)));
        assert_eq!(resolve_departure(&e), Some(at(200)));
    }

    #[test]
    fn test_gtfs_rt_fills_avl_gaps() {
        let e = event(
            stop("T", "B", 2),
            Some(rt("1234", Some(140))),
            Some(avl(None, Some(200))),
            Some(300),
        );
        assert_eq!(resolve_arrival(&e), Some(at(140)));
        assert_eq!(resolve_departure(&e), Some(at(200)));

        let rt_only = event(stop("T", "B", 2), Some(rt("1234", Some(140))), None, Some(300));
        assert_eq!(resolve_arrival(&rt_only), Some(at(140)));
        assert_eq!(resolve_departure(&rt_only), Some(at(300)));
    }

    #[test]
    fn test_unobserved_stop_has_no_instants() {
        let visits = enrich(vec![event(stop("T", "B", 2), None, None, None)], New_York);
        assert_eq!(visits[0].stop_arrival_instant, None);
        assert_eq!(visits[0].dwell_time_seconds, None);
        assert_eq!(visits[0].travel_time_seconds, None);
    }

    #[test]
    fn test_dwell_and_travel_time() {
        let visits = enrich(
            vec![
                event(stop("T", "A", 1), Some(rt("1234", Some(0))), None, Some(60)),
                event(stop("T", "B", 2), Some(rt("1234", Some(140))), None, Some(300)),
            ],
            New_York,
        );

        assert_eq!(visits[0].dwell_time_seconds, Some(60));
        assert_eq!(visits[0].travel_time_seconds, None);
        assert_eq!(visits[1].travel_time_seconds, Some(80));
        assert_eq!(visits[1].dwell_time_seconds, Some(160));
    }

    #[test]
    fn test_travel_time_follows_vehicle_across_avl_matched_stop() {
        let unlabelled = |stop_id: &str, seq: i64, in_transit: i64, arrival: i64| RtStopEvent {
            stop_id: stop_id.to_string(),
            stop_sequence: seq,
            vehicle_label: None,
            in_transit_to_at: Some(at(in_transit)),
            arrival_observed_at: Some(at(arrival)),
            ..rt("y1", None)
        };
        let rt_events = vec![
            unlabelled("A", 1, 0, 20),
            unlabelled("B", 2, 60, 100),
            unlabelled("C", 3, 170, 240),
        ];
        let stops = vec![stop("T", "A", 1), stop("T", "B", 2), stop("T", "C", 3)];
        let matched = crate::realtime::match_events(
            service_date(),
            stops,
            &rt_events,
            &[avl(Some(100), Some(130))],
            2,
        );

        let visits = enrich(matched, New_York);

        let travel: Vec<_> = visits.iter().map(|v| v.travel_time_seconds).collect();
        assert_eq!(travel, vec![None, Some(40), Some(110)]);
    }

    #[test]
    fn test_trunk_and_branch_headways_are_independent() {
        let branch_stop = |trip: &str, branch: &str| {
            let mut s = stop(trip, "B", 2);
            s.parent_station = Some("place-b".to_string());
            s.trunk_route_id = Some("trunk".to_string());
            s.branch_route_id = Some(branch.to_string());
            s
        };
        let visits = enrich(
            vec![
                event(branch_stop("t1", "a"), None, Some(avl(None, Some(0))), None),
                event(branch_stop("t2", "b"), None, Some(avl(None, Some(300))), None),
                event(branch_stop("t3", "a"), None, Some(avl(None, Some(600))), None),
            ],
            New_York,
        );

        let trunk: Vec<_> = visits.iter().map(|v| v.trunk_headway_seconds).collect();
        let branch: Vec<_> = visits.iter().map(|v| v.branch_headway_seconds).collect();
        assert_eq!(trunk, vec![None, Some(300), Some(300)]);
        assert_eq!(branch, vec![None, None, Some(600)]);
    }

    #[test]
    fn test_planned_metrics() {
        let mut first = stop("T", "A", 1);
        first.plan_departure_secs = Some(8 * 3600);
        let mut second = stop("T", "B", 2);
        second.plan_arrival_secs = Some(8 * 3600 + 240);
        second.plan_departure_secs = Some(8 * 3600 + 270);

        let visits = enrich(
            vec![event(first, None, None, None), event(second, None, None, None)],
            New_York,
        );

        assert_eq!(visits[1].plan_travel_time_seconds, Some(240));
        // 08:00 EDT
        assert_eq!(
            visits[0].plan_departure_instant,
            Some(Utc.with_ymd_and_hms(2024, 6, 3, 12, 0, 0).unwrap())
        );
    }
}
