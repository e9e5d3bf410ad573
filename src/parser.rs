//! Protobuf parser for GTFS Realtime vehicle position feeds.

use chrono::DateTime;
use gtfs_realtime::FeedMessage;
use prost::Message;

use crate::error::PipelineError;
use crate::model::{GtfsRtObservation, StopStatus};

/// Decodes a protobuf-encoded GTFS-RT [`FeedMessage`] from raw bytes.
///
/// # Errors
///
/// Returns an error if the bytes are not valid protobuf for a `FeedMessage`.
pub fn parse_feed(bytes: &[u8]) -> Result<FeedMessage, PipelineError> {
    Ok(FeedMessage::decode(bytes)?)
}

/// Flattens the vehicle entities of a feed into observations.
///
/// A position without its own timestamp takes the feed header's; positions
/// with neither are skipped.
pub fn observations_from_feed(feed: &FeedMessage) -> Vec<GtfsRtObservation> {
    let header_timestamp = feed.header.timestamp;

    feed.entity
        .iter()
        .filter_map(|e| e.vehicle.as_ref())
        .filter_map(|v| {
            let secs = v.timestamp.or(header_timestamp)?;
            let observed_at = DateTime::from_timestamp(i64::try_from(secs).ok()?, 0)?;
            let trip = v.trip.as_ref();
            let descriptor = v.vehicle.as_ref();

            Some(GtfsRtObservation {
                observed_at,
                trip_id: trip.and_then(|t| t.trip_id.clone()),
                route_id: trip.and_then(|t| t.route_id.clone()),
                direction_id: trip
                    .and_then(|t| t.direction_id)
                    .and_then(|d| u8::try_from(d).ok()),
                start_date: trip.and_then(|t| t.start_date.clone()),
                stop_id: v.stop_id.clone(),
                stop_sequence: v.current_stop_sequence.map(i64::from),
                status: v.current_status.and_then(StopStatus::from_proto),
                vehicle_id: descriptor.and_then(|d| d.id.clone()),
                vehicle_label: descriptor.and_then(|d| d.label.clone()),
            })
        })
        .collect()
}
