//! Local partitioned CSV source.
//!
//! Layout under the root directory:
//!
//! ```text
//! planned/service_date=YYYY-MM-DD.csv
//! avl/schedule/service_date=YYYY-MM-DD.csv
//! avl/crossings/service_date=YYYY-MM-DD.csv
//! avl/reference/{geo_nodes,routes,trips,vehicles,pattern_timepoints,waivers}.csv
//! gtfs_rt/date=YYYY-MM-DD.csv
//! ```
//!
//! Any file may instead be gzip-compressed with a `.gz` suffix.

use chrono::{Duration, NaiveDate};
use flate2::read::GzDecoder;
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::pipeline::ServiceDateInputs;
use crate::reference::ReferenceTables;

/// Reads the CSV at `path` as rows of `T`, decompressing `.gz` files.
pub fn read_csv<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, PipelineError> {
    let file = File::open(path)?;
    let reader: Box<dyn Read> = if path.extension().and_then(|e| e.to_str()) == Some("gz") {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    let mut rdr = csv::Reader::from_reader(reader);
    let mut rows = Vec::new();
    for result in rdr.deserialize() {
        let record: T = result?;
        rows.push(record);
    }

    debug!(path = %path.display(), rows = rows.len(), "CSV read");
    Ok(rows)
}

/// The plain file if present, otherwise its `.gz` sibling.
fn locate(path: &Path) -> Option<PathBuf> {
    if path.exists() {
        return Some(path.to_path_buf());
    }
    let mut gz = path.as_os_str().to_owned();
    gz.push(".gz");
    let gz = PathBuf::from(gz);
    gz.exists().then_some(gz)
}

#[derive(Debug, Clone)]
pub struct LocalSource {
    root: PathBuf,
}

impl LocalSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn service_date_file(&self, dir: &str, service_date: NaiveDate) -> PathBuf {
        self.root
            .join(dir)
            .join(format!("service_date={}.csv", service_date.format("%Y-%m-%d")))
    }

    fn gtfs_rt_file(&self, date: NaiveDate) -> PathBuf {
        self.root
            .join("gtfs_rt")
            .join(format!("date={}.csv", date.format("%Y-%m-%d")))
    }

    fn read_optional<T: DeserializeOwned>(&self, path: &Path) -> Result<Vec<T>, PipelineError> {
        match locate(path) {
            Some(found) => read_csv(&found),
            None => {
                warn!(path = %path.display(), "Input file missing, using an empty set");
                Ok(Vec::new())
            }
        }
    }

    pub fn load_reference(&self) -> Result<ReferenceTables, PipelineError> {
        let dir = self.root.join("avl").join("reference");
        Ok(ReferenceTables {
            geo_nodes: self.read_optional(&dir.join("geo_nodes.csv"))?,
            routes: self.read_optional(&dir.join("routes.csv"))?,
            trips: self.read_optional(&dir.join("trips.csv"))?,
            vehicles: self.read_optional(&dir.join("vehicles.csv"))?,
            pattern_timepoints: self.read_optional(&dir.join("pattern_timepoints.csv"))?,
            waivers: self.read_optional(&dir.join("waivers.csv"))?,
        })
    }

    /// Loads all inputs for `service_date`. GTFS-RT partitions are read for
    /// the `rt_lookback_days` dates on each side, since trips after midnight
    /// land in the next UTC date.
    ///
    /// # Errors
    ///
    /// [`PipelineError::InputAbsent`] when the planned file is missing or no
    /// GTFS-RT row exists in the window.
    #[tracing::instrument(skip(self, config), fields(root = %self.root.display(), service_date = %service_date))]
    pub fn load(
        &self,
        service_date: NaiveDate,
        config: &PipelineConfig,
    ) -> Result<ServiceDateInputs, PipelineError> {
        let planned_path = self.service_date_file("planned", service_date);
        let planned = match locate(&planned_path) {
            Some(found) => read_csv(&found)?,
            None => {
                return Err(PipelineError::InputAbsent {
                    service_date,
                    input: "planned schedule",
                });
            }
        };

        let avl_schedule = self.read_optional(&self.service_date_file("avl/schedule", service_date))?;
        let avl_crossings =
            self.read_optional(&self.service_date_file("avl/crossings", service_date))?;
        let reference = self.load_reference()?;

        let mut gtfs_rt = Vec::new();
        for offset in -config.rt_lookback_days..=config.rt_lookback_days {
            let date = service_date + Duration::days(offset);
            if let Some(found) = locate(&self.gtfs_rt_file(date)) {
                gtfs_rt.extend(read_csv(&found)?);
            }
        }
        if gtfs_rt.is_empty() {
            return Err(PipelineError::InputAbsent {
                service_date,
                input: "gtfs-rt",
            });
        }

        let inputs = ServiceDateInputs {
            planned,
            avl_schedule,
            avl_crossings,
            reference,
            gtfs_rt,
        };
        info!(
            planned = inputs.planned.len(),
            avl_schedule = inputs.avl_schedule.len(),
            avl_crossings = inputs.avl_crossings.len(),
            gtfs_rt = inputs.gtfs_rt.len(),
            "Inputs loaded"
        );
        Ok(inputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GeoNode, StopStatus};
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::env;
    use std::fs;
    use std::io::Write;

    const PLANNED: &str = "trip_id,stop_id,stop_sequence,stop_count,route_id,route_type,branch_route_id,trunk_route_id,service_id,direction_id,block_id,parent_station,plan_arrival_secs,plan_departure_secs,plan_start_secs,static_version_key
T,A,1,1,28,3,,,weekday,0,,,28800,28830,28800,1
";

    const GTFS_RT: &str = "observed_at,trip_id,route_id,direction_id,start_date,stop_id,stop_sequence,status,vehicle_id,vehicle_label
2024-06-03T12:00:00Z,T,28,0,20240603,A,1,STOPPED_AT,y1234,1234
";

    fn temp_root(name: &str) -> PathBuf {
        let root = env::temp_dir().join(format!("bus_events_input_{name}"));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(&root).unwrap();
        root
    }

    fn write(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn write_gz(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(content.as_bytes()).unwrap();
        fs::write(path, encoder.finish().unwrap()).unwrap();
    }

    fn service_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 3).unwrap()
    }

    #[test]
    fn test_load_with_missing_avl_files() {
        let root = temp_root("missing_avl");
        write(&root, "planned/service_date=2024-06-03.csv", PLANNED);
        write(&root, "gtfs_rt/date=2024-06-03.csv", GTFS_RT);

        let inputs = LocalSource::new(&root)
            .load(service_date(), &PipelineConfig::default())
            .unwrap();

        assert_eq!(inputs.planned.len(), 1);
        assert_eq!(inputs.planned[0].route_type, Some(3));
        assert!(inputs.avl_schedule.is_empty());
        assert!(inputs.reference.geo_nodes.is_empty());
        assert_eq!(inputs.gtfs_rt[0].status, Some(StopStatus::StoppedAt));

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_reads_neighbouring_gzip_partitions() {
        let root = temp_root("gzip");
        write(&root, "planned/service_date=2024-06-03.csv", PLANNED);
        write_gz(&root, "gtfs_rt/date=2024-06-04.csv.gz", GTFS_RT);
        write(&root, "gtfs_rt/date=2024-06-02.csv", GTFS_RT);
        write(&root, "gtfs_rt/date=2024-06-05.csv", GTFS_RT);

        let inputs = LocalSource::new(&root)
            .load(service_date(), &PipelineConfig::default())
            .unwrap();

        assert_eq!(inputs.gtfs_rt.len(), 2);

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_missing_planned_is_input_absent() {
        let root = temp_root("missing_planned");
        write(&root, "gtfs_rt/date=2024-06-03.csv", GTFS_RT);

        let err = LocalSource::new(&root)
            .load(service_date(), &PipelineConfig::default())
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InputAbsent {
                input: "planned schedule",
                ..
            }
        ));

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_missing_gtfs_rt_is_input_absent() {
        let root = temp_root("missing_rt");
        write(&root, "planned/service_date=2024-06-03.csv", PLANNED);

        let err = LocalSource::new(&root)
            .load(service_date(), &PipelineConfig::default())
            .unwrap_err();
        assert_eq!(err.kind(), "input_absent");

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_read_reference_table() {
        let root = temp_root("reference");
        write(&root, "avl/reference/geo_nodes.csv", "geo_node_id,geo_node_abbr\n100,stop-a\n101,\n");

        let tables = LocalSource::new(&root).load_reference().unwrap();
        assert_eq!(
            tables.geo_nodes,
            vec![
                GeoNode {
                    geo_node_id: 100,
                    geo_node_abbr: Some("stop-a".to_string()),
                },
                GeoNode {
                    geo_node_id: 101,
                    geo_node_abbr: None,
                },
            ]
        );

        fs::remove_dir_all(&root).unwrap();
    }
}
