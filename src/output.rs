//! Publication of stop visits, per-date summaries and the runs log.
//!
//! A processed service date produces, under the output directory:
//!
//! ```text
//! v<schema>/service_date=YYYY-MM-DD.csv[.gz]
//! v<schema>/service_date=YYYY-MM-DD.summary.json
//! runs.csv
//! ```

use anyhow::{Context, Result};
use aws_sdk_s3::primitives::ByteStream;
use chrono::{DateTime, NaiveDate, Utc};
use csv::WriterBuilder;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::Advisory;
use crate::model::{EnrichedStopVisit, GtfsRtObservation, ScheduleSource};
use crate::pipeline::DateOutcome;
use crate::realtime::NormalizeCounts;
use crate::schedule::CompositionCounts;
use crate::validate::ValidationReport;

/// One published stop visit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopVisitRow {
    pub service_date: NaiveDate,
    pub trip_id: String,
    pub stop_id: Option<String>,
    pub stop_sequence: i64,
    pub stop_count: i64,
    pub plan_stop_sequence: Option<i64>,
    pub plan_stop_count: Option<i64>,
    pub avl_stop_sequence: Option<i64>,
    pub schedule_source: Option<ScheduleSource>,
    pub route_id: Option<String>,
    pub route_type: Option<u16>,
    pub branch_route_id: Option<String>,
    pub trunk_route_id: Option<String>,
    pub service_id: Option<String>,
    pub direction_id: Option<u8>,
    pub block_id: Option<String>,
    pub parent_station: Option<String>,
    pub static_version_key: Option<i64>,
    pub pattern_id: Option<i64>,
    pub pullout_id: Option<i64>,
    pub timepoint_id: Option<i64>,
    pub timepoint_abbr: Option<String>,
    pub timepoint_name: Option<String>,
    pub timepoint_order: Option<i64>,
    pub vehicle_id: Option<String>,
    pub vehicle_label: Option<String>,
    pub waiver_remark: Option<String>,
    pub gtfs_arrival_dt: Option<DateTime<Utc>>,
    pub gtfs_in_transit_dt: Option<DateTime<Utc>>,
    pub avl_arrival_dt: Option<DateTime<Utc>>,
    pub avl_departure_dt: Option<DateTime<Utc>>,
    pub stop_arrival_dt: Option<DateTime<Utc>>,
    pub stop_departure_dt: Option<DateTime<Utc>>,
    pub travel_time_seconds: Option<i64>,
    pub dwell_time_seconds: Option<i64>,
    pub trunk_headway_seconds: Option<i64>,
    pub branch_headway_seconds: Option<i64>,
    pub plan_arrival_dt: Option<DateTime<Utc>>,
    pub plan_departure_dt: Option<DateTime<Utc>>,
    pub plan_travel_time_seconds: Option<i64>,
    pub plan_trunk_headway_seconds: Option<i64>,
    pub plan_branch_headway_seconds: Option<i64>,
}

impl From<&EnrichedStopVisit> for StopVisitRow {
    fn from(v: &EnrichedStopVisit) -> Self {
        let event = &v.event;
        let stop = &event.stop;
        let rt = event.rt.as_ref();
        let avl = event.avl.as_ref();
        StopVisitRow {
            service_date: event.service_date,
            trip_id: stop.trip_id.clone(),
            stop_id: stop.stop_id.clone(),
            stop_sequence: stop.stop_sequence,
            stop_count: stop.stop_count,
            plan_stop_sequence: stop.plan_stop_sequence,
            plan_stop_count: stop.plan_stop_count,
            avl_stop_sequence: stop.avl_stop_sequence,
            schedule_source: stop.source,
            route_id: stop.route_id.clone(),
            route_type: stop.route_type,
            branch_route_id: stop.branch_route_id.clone(),
            trunk_route_id: stop.trunk_route_id.clone(),
            service_id: stop.service_id.clone(),
            direction_id: stop.direction_id,
            block_id: stop.block_id.clone(),
            parent_station: stop.parent_station.clone(),
            static_version_key: stop.static_version_key,
            pattern_id: stop.pattern_id,
            pullout_id: stop.pullout_id,
            timepoint_id: stop.timepoint_id,
            timepoint_abbr: stop.timepoint_abbr.clone(),
            timepoint_name: stop.timepoint_name.clone(),
            timepoint_order: stop.timepoint_order,
            vehicle_id: rt.map(|e| e.vehicle_id.clone()),
            vehicle_label: event.vehicle_label().map(str::to_string),
            waiver_remark: avl.and_then(|o| o.waiver_remark.clone()),
            gtfs_arrival_dt: rt.and_then(|e| e.arrival_observed_at),
            gtfs_in_transit_dt: rt.and_then(|e| e.in_transit_to_at),
            avl_arrival_dt: avl.and_then(|o| o.actual_arrival),
            avl_departure_dt: avl.and_then(|o| o.actual_departure),
            stop_arrival_dt: v.stop_arrival_instant,
            stop_departure_dt: v.stop_departure_instant,
            travel_time_seconds: v.travel_time_seconds,
            dwell_time_seconds: v.dwell_time_seconds,
            trunk_headway_seconds: v.trunk_headway_seconds,
            branch_headway_seconds: v.branch_headway_seconds,
            plan_arrival_dt: v.plan_arrival_instant,
            plan_departure_dt: v.plan_departure_instant,
            plan_travel_time_seconds: v.plan_travel_time_seconds,
            plan_trunk_headway_seconds: v.plan_trunk_headway_seconds,
            plan_branch_headway_seconds: v.plan_branch_headway_seconds,
        }
    }
}

/// Metadata published beside each service date's stop visits.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceDateSummary {
    pub schema_version: u32,
    pub service_date: NaiveDate,
    pub generated_at: DateTime<Utc>,
    pub valid_rows: usize,
    pub rejected_rows: usize,
    pub composition: CompositionCounts,
    pub realtime: NormalizeCounts,
    pub avl_observations: usize,
    pub reports: Vec<ValidationReport>,
    pub advisories: Vec<Advisory>,
}

impl ServiceDateSummary {
    pub fn from_outcome(outcome: &DateOutcome, schema_version: u32) -> Self {
        ServiceDateSummary {
            schema_version,
            service_date: outcome.service_date,
            generated_at: Utc::now(),
            valid_rows: outcome.visits.len(),
            rejected_rows: outcome.rejected_rows(),
            composition: outcome.composition.clone(),
            realtime: outcome.realtime.clone(),
            avl_observations: outcome.avl_observations,
            reports: outcome.reports.clone(),
            advisories: outcome.advisories.clone(),
        }
    }
}

/// Key of a service date's stop-visit file, relative to the output root.
pub fn visits_key(schema_version: u32, service_date: NaiveDate, gzip: bool) -> String {
    let suffix = if gzip { ".gz" } else { "" };
    format!(
        "v{}/service_date={}.csv{}",
        schema_version,
        service_date.format("%Y-%m-%d"),
        suffix
    )
}

pub fn summary_key(schema_version: u32, service_date: NaiveDate) -> String {
    format!(
        "v{}/service_date={}.summary.json",
        schema_version,
        service_date.format("%Y-%m-%d")
    )
}

/// Whether stop visits for `service_date` were already published, plain or
/// compressed.
pub fn output_exists(output_dir: &Path, schema_version: u32, service_date: NaiveDate) -> bool {
    [false, true]
        .iter()
        .any(|&gzip| output_dir.join(visits_key(schema_version, service_date, gzip)).exists())
}

pub fn gzip_bytes(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

/// Writes stop visits as CSV, replacing any existing file.
pub fn write_visits(path: &Path, visits: &[EnrichedStopVisit], gzip: bool) -> Result<()> {
    let mut writer = WriterBuilder::new().from_writer(Vec::new());
    for visit in visits {
        writer.serialize(StopVisitRow::from(visit))?;
    }
    let bytes = writer.into_inner().map_err(|e| e.into_error())?;
    let bytes = if gzip { gzip_bytes(&bytes)? } else { bytes };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))?;
    debug!(path = %path.display(), rows = visits.len(), gzip, "Stop visits written");
    Ok(())
}

pub fn write_summary(path: &Path, summary: &ServiceDateSummary) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_vec_pretty(summary)?)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Writes the stop visits and summary of one service date. Returns the
/// written files with their keys relative to `output_dir`.
#[tracing::instrument(skip(outcome), fields(service_date = %outcome.service_date))]
pub fn write_date_outputs(
    output_dir: &Path,
    outcome: &DateOutcome,
    schema_version: u32,
    gzip: bool,
) -> Result<Vec<(PathBuf, String)>> {
    let visits = visits_key(schema_version, outcome.service_date, gzip);
    let summary = summary_key(schema_version, outcome.service_date);

    write_visits(&output_dir.join(&visits), &outcome.visits, gzip)?;
    write_summary(
        &output_dir.join(&summary),
        &ServiceDateSummary::from_outcome(outcome, schema_version),
    )?;

    info!(rows = outcome.visits.len(), key = %visits, "Service date published");
    Ok(vec![
        (output_dir.join(&visits), visits),
        (output_dir.join(&summary), summary),
    ])
}

/// Appends a record as a row to a CSV file.
///
/// Creates the file with headers if it does not already exist.
pub fn append_record<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    let file_exists = path.exists();
    debug!(path = %path.display(), file_exists, "Appending CSV record");

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().append(true).create(true).open(path)?;

    let mut writer = WriterBuilder::new()
        .has_headers(!file_exists) // IMPORTANT when appending
        .from_writer(file);

    writer.serialize(record)?;
    writer.flush()?;

    Ok(())
}

/// Appends captured vehicle positions to `date=YYYY-MM-DD.csv` partitions
/// under `dir`, by UTC date of observation. Returns the rows written.
pub fn append_observations(dir: &Path, observations: &[GtfsRtObservation]) -> Result<usize> {
    for observation in observations {
        let partition = dir.join(format!(
            "date={}.csv",
            observation.observed_at.format("%Y-%m-%d")
        ));
        append_record(&partition, observation)?;
    }
    Ok(observations.len())
}

/// Uploads local files to S3 under the given keys.
#[tracing::instrument(skip(client, files), fields(file_count = files.len()))]
pub async fn upload_files(
    client: &aws_sdk_s3::Client,
    bucket: &str,
    files: &[(PathBuf, String)],
) -> Result<()> {
    for (path, key) in files {
        let body = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let content_type = if key.ends_with(".json") {
            "application/json"
        } else if key.ends_with(".gz") {
            "application/gzip"
        } else {
            "text/csv"
        };

        client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .with_context(|| format!("uploading s3://{bucket}/{key}"))?;
        debug!(key = %key, "Uploaded");
    }

    info!(upload_count = files.len(), "S3 upload complete");
    Ok(())
}
