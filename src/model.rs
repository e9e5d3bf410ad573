//! Record types for every stage of the stop-visit pipeline.
//!
//! Each stage consumes one generation of these records and returns the next.
//! Input rows derive `Deserialize` so the CSV source can read them directly.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// One planned stop visit from the static schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedStop {
    pub trip_id: String,
    pub stop_id: String,
    pub stop_sequence: i64,
    /// Number of planned stops on the trip.
    pub stop_count: i64,
    pub route_id: String,
    pub route_type: Option<u16>,
    pub branch_route_id: Option<String>,
    pub trunk_route_id: Option<String>,
    pub service_id: String,
    pub direction_id: Option<u8>,
    pub block_id: Option<String>,
    pub parent_station: Option<String>,
    /// Seconds past the service day's noon-minus-12h origin; may exceed 24h.
    pub plan_arrival_secs: Option<i64>,
    pub plan_departure_secs: Option<i64>,
    pub plan_start_secs: Option<i64>,
    pub static_version_key: Option<i64>,
}

/// A scheduled stop crossing as exported by the AVL system, keyed by
/// AVL-native integer ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledStopCrossing {
    pub trip_serial: i64,
    pub geo_node_id: i64,
    pub pattern_id: Option<i64>,
    pub pattern_position: i64,
    pub timepoint_id: Option<i64>,
    pub scheduled_secs: Option<i64>,
    pub pullout_id: Option<i64>,
}

/// An observed AVL stop crossing. Actual times are local wall-clock times
/// without an offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvlCrossing {
    pub trip_serial: i64,
    pub geo_node_id: i64,
    pub vehicle_key: Option<i64>,
    pub pattern_position: i64,
    pub actual_arrival_local: Option<NaiveDateTime>,
    pub actual_departure_local: Option<NaiveDateTime>,
    pub service_date: NaiveDate,
    pub waiver_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoNode {
    pub geo_node_id: i64,
    pub geo_node_abbr: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvlRoute {
    pub route_key: i64,
    pub route_abbr: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvlTrip {
    pub trip_serial: i64,
    pub trip_id: Option<String>,
    pub route_key: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvlVehicle {
    pub vehicle_key: i64,
    pub property_tag: Option<String>,
}

/// Timepoint metadata for one position of an AVL pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternTimepoint {
    pub pattern_id: i64,
    pub pattern_position: i64,
    pub timepoint_id: i64,
    pub timepoint_abbr: Option<String>,
    pub timepoint_name: Option<String>,
    pub timepoint_order: Option<i64>,
}

/// Excused-delay annotation attached to AVL crossings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waiver {
    pub waiver_id: i64,
    pub remark: Option<String>,
}

/// An AVL scheduled stop after translation to GTFS identifiers. Keys that
/// failed to translate are `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct AvlScheduledStop {
    pub trip_id: Option<String>,
    pub stop_id: Option<String>,
    pub route_id: Option<String>,
    pub avl_stop_sequence: i64,
    pub pattern_id: Option<i64>,
    pub timepoint_id: Option<i64>,
    pub scheduled_secs: Option<i64>,
    pub pullout_id: Option<i64>,
}

/// An observed AVL crossing after translation; at least one of the actual
/// instants is present once normalised.
#[derive(Debug, Clone, PartialEq)]
pub struct AvlObservation {
    pub trip_id: Option<String>,
    pub stop_id: Option<String>,
    pub route_id: Option<String>,
    pub vehicle_label: Option<String>,
    pub stop_sequence: i64,
    pub actual_arrival: Option<DateTime<Utc>>,
    pub actual_departure: Option<DateTime<Utc>>,
    pub service_date: NaiveDate,
    pub waiver_remark: Option<String>,
}

/// Which schedule source(s) contributed a canonical stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleSource {
    PlanOnly,
    AvlOnly,
    Joined,
}

impl ScheduleSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleSource::PlanOnly => "PLAN_ONLY",
            ScheduleSource::AvlOnly => "AVL_ONLY",
            ScheduleSource::Joined => "JOINED",
        }
    }
}

/// One stop of the canonical per-trip stop list.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CanonicalStop {
    pub trip_id: String,
    /// `None` for an AVL stop whose geo node has no GTFS stop.
    pub stop_id: Option<String>,
    /// 1-based position within the canonical trip.
    pub stop_sequence: i64,
    /// Rows in the canonical trip, non-revenue stops included.
    pub stop_count: i64,
    pub plan_stop_sequence: Option<i64>,
    pub avl_stop_sequence: Option<i64>,
    pub sequence_diff: Option<i64>,
    pub source: Option<ScheduleSource>,

    // trip scoped, filled across the trip
    pub route_id: Option<String>,
    pub route_type: Option<u16>,
    pub branch_route_id: Option<String>,
    pub trunk_route_id: Option<String>,
    pub service_id: Option<String>,
    pub direction_id: Option<u8>,
    pub block_id: Option<String>,
    pub plan_start_secs: Option<i64>,
    pub plan_stop_count: Option<i64>,
    pub static_version_key: Option<i64>,
    pub pattern_id: Option<i64>,
    pub pullout_id: Option<i64>,

    // stop scoped
    pub parent_station: Option<String>,
    pub plan_arrival_secs: Option<i64>,
    pub plan_departure_secs: Option<i64>,
    pub avl_scheduled_secs: Option<i64>,
    pub timepoint_id: Option<i64>,
    pub timepoint_abbr: Option<String>,
    pub timepoint_name: Option<String>,
    pub timepoint_order: Option<i64>,
}

impl CanonicalStop {
    pub fn from_plan(plan: &PlannedStop) -> Self {
        CanonicalStop {
            trip_id: plan.trip_id.clone(),
            stop_id: Some(plan.stop_id.clone()),
            plan_stop_sequence: Some(plan.stop_sequence),
            source: Some(ScheduleSource::PlanOnly),
            route_id: Some(plan.route_id.clone()),
            route_type: plan.route_type,
            branch_route_id: plan.branch_route_id.clone(),
            trunk_route_id: plan.trunk_route_id.clone(),
            service_id: Some(plan.service_id.clone()),
            direction_id: plan.direction_id,
            block_id: plan.block_id.clone(),
            plan_start_secs: plan.plan_start_secs,
            plan_stop_count: Some(plan.stop_count),
            static_version_key: plan.static_version_key,
            parent_station: plan.parent_station.clone(),
            plan_arrival_secs: plan.plan_arrival_secs,
            plan_departure_secs: plan.plan_departure_secs,
            ..Default::default()
        }
    }

    /// Builds an AVL-only row. The caller guarantees that the trip id
    /// translated; the stop id may not have.
    pub fn from_avl(trip_id: &str, avl: &AvlScheduledStop) -> Self {
        CanonicalStop {
            trip_id: trip_id.to_string(),
            stop_id: avl.stop_id.clone(),
            avl_stop_sequence: Some(avl.avl_stop_sequence),
            source: Some(ScheduleSource::AvlOnly),
            route_id: avl.route_id.clone(),
            pattern_id: avl.pattern_id,
            pullout_id: avl.pullout_id,
            avl_scheduled_secs: avl.scheduled_secs,
            timepoint_id: avl.timepoint_id,
            ..Default::default()
        }
    }

    pub fn joined(plan: &PlannedStop, avl: &AvlScheduledStop) -> Self {
        CanonicalStop {
            avl_stop_sequence: Some(avl.avl_stop_sequence),
            sequence_diff: Some((plan.stop_sequence - avl.avl_stop_sequence).abs()),
            source: Some(ScheduleSource::Joined),
            pattern_id: avl.pattern_id,
            pullout_id: avl.pullout_id,
            avl_scheduled_secs: avl.scheduled_secs,
            timepoint_id: avl.timepoint_id,
            ..CanonicalStop::from_plan(plan)
        }
    }

    /// Sequence number used when aligning GTFS-RT positions, which are
    /// numbered like the planned schedule.
    pub fn gtfs_sequence(&self) -> i64 {
        self.plan_stop_sequence
            .or(self.avl_stop_sequence)
            .unwrap_or(self.stop_sequence)
    }

    /// Sequence number used when aligning AVL crossings, which are numbered
    /// by pattern position.
    pub fn avl_sequence(&self) -> i64 {
        self.avl_stop_sequence
            .or(self.plan_stop_sequence)
            .unwrap_or(self.stop_sequence)
    }

    pub fn is_final_planned_stop(&self) -> bool {
        matches!(
            (self.plan_stop_sequence, self.plan_stop_count),
            (Some(seq), Some(count)) if seq == count
        )
    }
}

/// Vehicle stop status reported by a GTFS-RT vehicle position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopStatus {
    IncomingAt,
    StoppedAt,
    InTransitTo,
}

impl StopStatus {
    /// Maps the protobuf enum value of `VehicleStopStatus`.
    pub fn from_proto(value: i32) -> Option<Self> {
        match value {
            0 => Some(StopStatus::IncomingAt),
            1 => Some(StopStatus::StoppedAt),
            2 => Some(StopStatus::InTransitTo),
            _ => None,
        }
    }
}

/// One GTFS-RT vehicle position, flattened to the fields the pipeline uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GtfsRtObservation {
    pub observed_at: DateTime<Utc>,
    pub trip_id: Option<String>,
    pub route_id: Option<String>,
    pub direction_id: Option<u8>,
    /// `YYYYMMDD` start date from the trip descriptor.
    pub start_date: Option<String>,
    pub stop_id: Option<String>,
    pub stop_sequence: Option<i64>,
    pub status: Option<StopStatus>,
    pub vehicle_id: Option<String>,
    pub vehicle_label: Option<String>,
}

/// GTFS-RT observations for one (trip, stop, direction, vehicle), pivoted
/// by status.
#[derive(Debug, Clone, PartialEq)]
pub struct RtStopEvent {
    pub trip_id: String,
    pub route_id: String,
    pub stop_id: String,
    pub direction_id: Option<u8>,
    pub vehicle_id: String,
    pub vehicle_label: Option<String>,
    pub stop_sequence: i64,
    pub arrival_observed_at: Option<DateTime<Utc>>,
    pub in_transit_to_at: Option<DateTime<Utc>>,
    /// In-transit-to instant of the next stop on the same vehicle trip.
    pub departure_estimate: Option<DateTime<Utc>>,
}

impl RtStopEvent {
    pub fn sort_instant(&self) -> Option<DateTime<Utc>> {
        self.in_transit_to_at.or(self.arrival_observed_at)
    }
}

/// A canonical stop with at most one GTFS-RT event and one AVL observation.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedStopEvent {
    pub service_date: NaiveDate,
    pub stop: CanonicalStop,
    pub rt: Option<RtStopEvent>,
    pub avl: Option<AvlObservation>,
    pub sort_instant: Option<DateTime<Utc>>,
    pub departure_instant_gtfs: Option<DateTime<Utc>>,
    /// Key shared by every visit one vehicle makes on a trip, assigned
    /// during matching.
    pub vehicle_key: Option<String>,
}

impl MatchedStopEvent {
    pub fn vehicle(&self) -> Option<&str> {
        self.vehicle_key.as_deref()
    }

    /// Label reported by GTFS-RT, else by AVL.
    pub fn vehicle_label(&self) -> Option<&str> {
        self.rt
            .as_ref()
            .and_then(|rt| rt.vehicle_label.as_deref())
            .or_else(|| self.avl.as_ref().and_then(|avl| avl.vehicle_label.as_deref()))
    }
}

/// A matched stop event with resolved instants and derived metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedStopVisit {
    pub event: MatchedStopEvent,
    pub stop_arrival_instant: Option<DateTime<Utc>>,
    pub stop_departure_instant: Option<DateTime<Utc>>,
    pub travel_time_seconds: Option<i64>,
    pub dwell_time_seconds: Option<i64>,
    pub trunk_headway_seconds: Option<i64>,
    pub branch_headway_seconds: Option<i64>,
    pub plan_arrival_instant: Option<DateTime<Utc>>,
    pub plan_departure_instant: Option<DateTime<Utc>>,
    pub plan_travel_time_seconds: Option<i64>,
    pub plan_trunk_headway_seconds: Option<i64>,
    pub plan_branch_headway_seconds: Option<i64>,
}

impl EnrichedStopVisit {
    pub fn unresolved(event: MatchedStopEvent) -> Self {
        EnrichedStopVisit {
            event,
            stop_arrival_instant: None,
            stop_departure_instant: None,
            travel_time_seconds: None,
            dwell_time_seconds: None,
            trunk_headway_seconds: None,
            branch_headway_seconds: None,
            plan_arrival_instant: None,
            plan_departure_instant: None,
            plan_travel_time_seconds: None,
            plan_trunk_headway_seconds: None,
            plan_branch_headway_seconds: None,
        }
    }
}
