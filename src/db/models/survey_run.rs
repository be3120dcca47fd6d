use std::str::FromStr;

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SurveyRunStatus {
    Running,
    Completed,
    Cancelled,
    Interrupted,
}

impl SurveyRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SurveyRunStatus::Running => "Running",
            SurveyRunStatus::Completed => "Completed",
            SurveyRunStatus::Cancelled => "Cancelled",
            SurveyRunStatus::Interrupted => "Interrupted",
        }
    }
}

impl FromStr for SurveyRunStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "Running" => Ok(SurveyRunStatus::Running),
            "Completed" => Ok(SurveyRunStatus::Completed),
            "Cancelled" => Ok(SurveyRunStatus::Cancelled),
            "Interrupted" => Ok(SurveyRunStatus::Interrupted),
            other => Err(anyhow!("unknown survey run status {other}")),
        }
    }
}

/// What the observer reported once the survey ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    pub detected: bool,
    /// Compass bearing to the bird, 0-359.
    pub direction_deg: Option<u16>,
    pub distance_m: Option<f64>,
}

impl Detection {
    pub fn none() -> Self {
        Self {
            detected: false,
            direction_deg: None,
            distance_m: None,
        }
    }

    /// A bird answered. Bearing and distance are optional but must be plausible.
    pub fn sighted(direction_deg: Option<u16>, distance_m: Option<f64>) -> Result<Self> {
        let detection = Self {
            detected: true,
            direction_deg,
            distance_m,
        };
        detection.validate()?;
        Ok(detection)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(deg) = self.direction_deg {
            if deg >= 360 {
                bail!("bearing must be 0-359, got {deg}");
            }
        }
        if let Some(m) = self.distance_m {
            if !m.is_finite() || m < 0.0 {
                bail!("distance must be a non-negative number of metres, got {m}");
            }
        }
        Ok(())
    }
}

/// Highest station number inside a quadrat.
pub const STATIONS_PER_QUADRAT: u8 = 16;

/// Where and under which conditions a survey was run. Conditions are kept as the
/// observer entered them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SurveySite {
    pub observer: Option<String>,
    /// Quadrat letter, A-X.
    pub quadrat: Option<String>,
    /// Station number within the quadrat, 1-16.
    pub station: Option<u8>,
    pub cloud: Option<String>,
    pub wind: Option<String>,
    pub noise: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl SurveySite {
    pub fn validate(&self) -> Result<()> {
        if let Some(quadrat) = &self.quadrat {
            if !is_valid_quadrat(quadrat) {
                bail!("quadrat must be a single letter A-X, got '{quadrat}'");
            }
        }
        if let Some(station) = self.station {
            if !(1..=STATIONS_PER_QUADRAT).contains(&station) {
                bail!("station must be 1-{STATIONS_PER_QUADRAT}, got {station}");
            }
        }
        if let Some(lat) = self.latitude {
            if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
                bail!("latitude must be within -90..90, got {lat}");
            }
        }
        if let Some(lon) = self.longitude {
            if !lon.is_finite() || !(-180.0..=180.0).contains(&lon) {
                bail!("longitude must be within -180..180, got {lon}");
            }
        }
        Ok(())
    }

    /// True once the run can be tied to a station.
    pub fn is_located(&self) -> bool {
        self.quadrat.is_some() && self.station.is_some()
    }
}

fn is_valid_quadrat(value: &str) -> bool {
    matches!(value.as_bytes(), [b'A'..=b'X'])
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurveyRun {
    pub id: String,
    pub protocol: String,
    pub debug: bool,
    pub site: SurveySite,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SurveyRunStatus,
    pub phases_total: u64,
    pub phases_completed: u64,
    pub detection: Option<Detection>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_its_name() {
        for status in [
            SurveyRunStatus::Running,
            SurveyRunStatus::Completed,
            SurveyRunStatus::Cancelled,
            SurveyRunStatus::Interrupted,
        ] {
            assert_eq!(status.as_str().parse::<SurveyRunStatus>().expect("parse"), status);
        }
        assert!("Paused".parse::<SurveyRunStatus>().is_err());
    }

    #[test]
    fn sighted_detection_rejects_impossible_values() {
        assert!(Detection::sighted(Some(359), Some(0.0)).is_ok());
        assert!(Detection::sighted(None, None).is_ok());
        assert!(Detection::sighted(Some(360), None).is_err());
        assert!(Detection::sighted(None, Some(-5.0)).is_err());
        assert!(Detection::sighted(None, Some(f64::NAN)).is_err());
    }

    #[test]
    fn site_checks_quadrat_station_and_coordinates() {
        let site = SurveySite {
            quadrat: Some("K".into()),
            station: Some(16),
            latitude: Some(43.07),
            longitude: Some(-89.4),
            ..SurveySite::default()
        };
        assert!(site.validate().is_ok());
        assert!(site.is_located());

        let bad_quadrat = SurveySite {
            quadrat: Some("Y".into()),
            ..SurveySite::default()
        };
        assert!(bad_quadrat.validate().is_err());

        let bad_station = SurveySite {
            station: Some(17),
            ..SurveySite::default()
        };
        assert!(bad_station.validate().is_err());

        let bad_latitude = SurveySite {
            latitude: Some(91.0),
            ..SurveySite::default()
        };
        assert!(bad_latitude.validate().is_err());
        assert!(!SurveySite::default().is_located());
    }
}
