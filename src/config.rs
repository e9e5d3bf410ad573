use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::PipelineError;

/// Service days start at 03:00 local time.
pub const DEFAULT_SERVICE_DAY_START_HOUR: u32 = 3;
/// Largest planned/AVL stop-sequence gap still treated as the same stop.
pub const DEFAULT_MAX_SEQUENCE_DIFF: i64 = 2;
/// GTFS `route_type` for bus.
pub const BUS_ROUTE_TYPE: u16 = 3;
/// Version tag of the published stop-visit table.
pub const SCHEMA_VERSION: u32 = 1;

/// Tunables for one pipeline run, loaded from a JSON file:
///
/// ```json
/// {
///   "timezone": "America/New_York",
///   "service_day_start_hour": 3,
///   "max_sequence_diff": 2
/// }
/// ```
///
/// Omitted keys take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Timezone of the operating agency; all metrics are differenced here.
    pub timezone: Tz,
    pub service_day_start_hour: u32,
    pub max_sequence_diff: i64,
    /// Route types whose GTFS-RT positions are reconciled.
    pub bus_route_types: Vec<u16>,
    /// GTFS-RT date partitions read on each side of the service date.
    pub rt_lookback_days: i64,
    pub schema_version: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::America::New_York,
            service_day_start_hour: DEFAULT_SERVICE_DAY_START_HOUR,
            max_sequence_diff: DEFAULT_MAX_SEQUENCE_DIFF,
            bus_route_types: vec![BUS_ROUTE_TYPE],
            rt_lookback_days: 1,
            schema_version: SCHEMA_VERSION,
        }
    }
}

impl PipelineConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, PipelineError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: PipelineConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.service_day_start_hour >= 24 {
            return Err(PipelineError::InvalidConfig(format!(
                "service_day_start_hour must be below 24, got {}",
                self.service_day_start_hour
            )));
        }
        if self.max_sequence_diff < 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "max_sequence_diff must not be negative, got {}",
                self.max_sequence_diff
            )));
        }
        if self.rt_lookback_days < 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "rt_lookback_days must not be negative, got {}",
                self.rt_lookback_days
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.timezone, chrono_tz::America::New_York);
        assert_eq!(config.service_day_start_hour, 3);
        assert_eq!(config.max_sequence_diff, 2);
        assert_eq!(config.bus_route_types, vec![3]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"timezone": "America/Chicago", "max_sequence_diff": 3}"#)
                .unwrap();
        assert_eq!(config.timezone, chrono_tz::America::Chicago);
        assert_eq!(config.max_sequence_diff, 3);
        assert_eq!(config.service_day_start_hour, 3);
    }

    #[test]
    fn test_rejects_bad_hour() {
        let config = PipelineConfig {
            service_day_start_hour: 24,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join("bus_events_test_config.json");
        std::fs::write(&path, r#"{"service_day_start_hour": 4}"#).unwrap();

        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.service_day_start_hour, 4);

        std::fs::remove_file(&path).unwrap();
    }
}
