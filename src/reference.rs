//! Translation of AVL-native identifiers into GTFS identifiers.
//!
//! A key missing from a reference table leaves the translated field `None`.
//! Rows with a `None` join key simply fail to match downstream.

use chrono_tz::Tz;
use std::collections::HashMap;

use crate::model::{
    AvlCrossing, AvlObservation, AvlRoute, AvlScheduledStop, AvlTrip, AvlVehicle, GeoNode,
    PatternTimepoint, ScheduledStopCrossing, Waiver,
};
use crate::service_date::local_to_utc;

/// The small AVL reference tables, as read from the source.
#[derive(Debug, Clone, Default)]
pub struct ReferenceTables {
    pub geo_nodes: Vec<GeoNode>,
    pub routes: Vec<AvlRoute>,
    pub trips: Vec<AvlTrip>,
    pub vehicles: Vec<AvlVehicle>,
    pub pattern_timepoints: Vec<PatternTimepoint>,
    pub waivers: Vec<Waiver>,
}

/// Indexed lookups over [`ReferenceTables`].
#[derive(Debug, Default)]
pub struct AvlReference {
    stops: HashMap<i64, String>,
    routes: HashMap<i64, String>,
    trips: HashMap<i64, AvlTrip>,
    vehicles: HashMap<i64, String>,
    waivers: HashMap<i64, String>,
    timepoints: HashMap<(i64, i64, i64), PatternTimepoint>,
}

impl AvlReference {
    pub fn new(tables: &ReferenceTables) -> Self {
        Self {
            stops: tables
                .geo_nodes
                .iter()
                .filter_map(|g| Some((g.geo_node_id, g.geo_node_abbr.clone()?)))
                .collect(),
            routes: tables
                .routes
                .iter()
                .filter_map(|r| Some((r.route_key, r.route_abbr.clone()?)))
                .collect(),
            trips: tables
                .trips
                .iter()
                .map(|t| (t.trip_serial, t.clone()))
                .collect(),
            vehicles: tables
                .vehicles
                .iter()
                .filter_map(|v| Some((v.vehicle_key, v.property_tag.clone()?)))
                .collect(),
            waivers: tables
                .waivers
                .iter()
                .filter_map(|w| Some((w.waiver_id, w.remark.clone()?)))
                .collect(),
            timepoints: tables
                .pattern_timepoints
                .iter()
                .map(|tp| ((tp.pattern_id, tp.pattern_position, tp.timepoint_id), tp.clone()))
                .collect(),
        }
    }

    pub fn stop_id(&self, geo_node_id: i64) -> Option<String> {
        self.stops.get(&geo_node_id).cloned()
    }

    pub fn trip_id(&self, trip_serial: i64) -> Option<String> {
        self.trips.get(&trip_serial).and_then(|t| t.trip_id.clone())
    }

    pub fn route_id(&self, trip_serial: i64) -> Option<String> {
        self.trips
            .get(&trip_serial)
            .and_then(|t| t.route_key)
            .and_then(|key| self.routes.get(&key).cloned())
    }

    pub fn vehicle_label(&self, vehicle_key: i64) -> Option<String> {
        self.vehicles.get(&vehicle_key).cloned()
    }

    pub fn waiver_remark(&self, waiver_id: i64) -> Option<String> {
        self.waivers.get(&waiver_id).cloned()
    }

    pub fn timepoint(
        &self,
        pattern_id: i64,
        pattern_position: i64,
        timepoint_id: i64,
    ) -> Option<&PatternTimepoint> {
        self.timepoints
            .get(&(pattern_id, pattern_position, timepoint_id))
    }

    pub fn translate_schedule(&self, rows: &[ScheduledStopCrossing]) -> Vec<AvlScheduledStop> {
        rows.iter()
            .map(|row| AvlScheduledStop {
                trip_id: self.trip_id(row.trip_serial),
                stop_id: self.stop_id(row.geo_node_id),
                route_id: self.route_id(row.trip_serial),
                avl_stop_sequence: row.pattern_position,
                pattern_id: row.pattern_id,
                timepoint_id: row.timepoint_id,
                scheduled_secs: row.scheduled_secs,
                pullout_id: row.pullout_id,
            })
            .collect()
    }

    /// Translates observed crossings, converting local actual times to UTC
    /// in `tz`.
    pub fn translate_crossings(&self, rows: &[AvlCrossing], tz: Tz) -> Vec<AvlObservation> {
        rows.iter()
            .map(|row| AvlObservation {
                trip_id: self.trip_id(row.trip_serial),
                stop_id: self.stop_id(row.geo_node_id),
                route_id: self.route_id(row.trip_serial),
                vehicle_label: row.vehicle_key.and_then(|key| self.vehicle_label(key)),
                stop_sequence: row.pattern_position,
                actual_arrival: row.actual_arrival_local.and_then(|t| local_to_utc(t, tz)),
                actual_departure: row.actual_departure_local.and_then(|t| local_to_utc(t, tz)),
                service_date: row.service_date,
                waiver_remark: row.waiver_id.and_then(|id| self.waiver_remark(id)),
            })
            .collect()
    }
}
