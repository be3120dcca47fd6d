use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::db::{
    helpers::{parse_datetime, parse_optional_datetime, to_i64, to_u64},
    models::{Detection, SurveyRun, SurveyRunStatus, SurveySite},
    Database,
};

const SELECT_COLUMNS: &str = "id, protocol, debug, observer, quadrat, station, cloud, wind, noise,
     latitude, longitude, started_at, ended_at, status, phases_total, phases_completed, detected,
     direction_deg, distance_m, created_at, updated_at";

fn row_to_site(row: &Row) -> Result<SurveySite> {
    Ok(SurveySite {
        observer: row.get("observer")?,
        quadrat: row.get("quadrat")?,
        station: row.get("station")?,
        cloud: row.get("cloud")?,
        wind: row.get("wind")?,
        noise: row.get("noise")?,
        latitude: row.get("latitude")?,
        longitude: row.get("longitude")?,
    })
}

fn row_to_survey_run(row: &Row) -> Result<SurveyRun> {
    let started_at: String = row.get("started_at")?;
    let ended_at: Option<String> = row.get("ended_at")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let status: String = row.get("status")?;
    let phases_total: i64 = row.get("phases_total")?;
    let phases_completed: i64 = row.get("phases_completed")?;
    let detected: Option<bool> = row.get("detected")?;
    let direction_deg: Option<u16> = row.get("direction_deg")?;
    let distance_m: Option<f64> = row.get("distance_m")?;

    Ok(SurveyRun {
        id: row.get("id")?,
        protocol: row.get("protocol")?,
        debug: row.get("debug")?,
        site: row_to_site(row)?,
        started_at: parse_datetime(&started_at, "started_at")?,
        ended_at: parse_optional_datetime(ended_at, "ended_at")?,
        status: status.parse::<SurveyRunStatus>()?,
        phases_total: to_u64(phases_total, "phases_total")?,
        phases_completed: to_u64(phases_completed, "phases_completed")?,
        detection: detected.map(|detected| Detection {
            detected,
            direction_deg,
            distance_m,
        }),
        created_at: parse_datetime(&created_at, "created_at")?,
        updated_at: parse_datetime(&updated_at, "updated_at")?,
    })
}

impl Database {
    pub async fn insert_survey_run(&self, run: &SurveyRun) -> Result<()> {
        run.site.validate()?;
        let record = run.clone();
        self.execute(move |conn| {
            let site = &record.site;
            conn.execute(
                "INSERT INTO survey_runs (id, protocol, debug, observer, quadrat, station, cloud, wind, noise,
                     latitude, longitude, started_at, ended_at, status, phases_total, phases_completed,
                     created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                params![
                    record.id,
                    record.protocol,
                    record.debug,
                    site.observer,
                    site.quadrat,
                    site.station,
                    site.cloud,
                    site.wind,
                    site.noise,
                    site.latitude,
                    site.longitude,
                    record.started_at.to_rfc3339(),
                    record.ended_at.as_ref().map(|dt| dt.to_rfc3339()),
                    record.status.as_str(),
                    to_i64(record.phases_total)?,
                    to_i64(record.phases_completed)?,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )
            .with_context(|| "failed to insert survey run")?;
            Ok(())
        })
        .await
    }

    pub fn submit_phase_progress(&self, run_id: &str, phases_completed: usize) {
        let run_id = run_id.to_string();
        let updated_at = Utc::now();
        self.submit("update survey progress", move |conn| {
            conn.execute(
                "UPDATE survey_runs
                 SET phases_completed = ?1,
                     updated_at = ?2
                 WHERE id = ?3",
                params![
                    to_i64(phases_completed as u64)?,
                    updated_at.to_rfc3339(),
                    run_id
                ],
            )?;
            Ok(())
        });
    }

    pub fn submit_run_status(
        &self,
        run_id: &str,
        status: SurveyRunStatus,
        phases_completed: usize,
        ended_at: Option<DateTime<Utc>>,
    ) {
        let run_id = run_id.to_string();
        let updated_at = Utc::now();
        self.submit("update survey status", move |conn| {
            conn.execute(
                "UPDATE survey_runs
                 SET status = ?1,
                     phases_completed = ?2,
                     ended_at = ?3,
                     updated_at = ?4
                 WHERE id = ?5",
                params![
                    status.as_str(),
                    to_i64(phases_completed as u64)?,
                    ended_at.map(|dt| dt.to_rfc3339()),
                    updated_at.to_rfc3339(),
                    run_id,
                ],
            )?;
            Ok(())
        });
    }

    /// Marks runs a previous process left in `Running` as `Interrupted`.
    pub async fn mark_interrupted_runs(&self, now: DateTime<Utc>) -> Result<usize> {
        self.execute(move |conn| {
            let changed = conn.execute(
                "UPDATE survey_runs
                 SET status = ?1,
                     ended_at = COALESCE(ended_at, ?2),
                     updated_at = ?2
                 WHERE status = ?3",
                params![
                    SurveyRunStatus::Interrupted.as_str(),
                    now.to_rfc3339(),
                    SurveyRunStatus::Running.as_str(),
                ],
            )?;
            Ok(changed)
        })
        .await
    }

    pub async fn get_survey_run(&self, run_id: &str) -> Result<SurveyRun> {
        let run_id = run_id.to_string();
        self.execute(move |conn| {
            let sql = format!("SELECT {SELECT_COLUMNS} FROM survey_runs WHERE id = ?1");
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params![run_id])?;
            match rows.next()? {
                Some(row) => row_to_survey_run(row),
                None => Err(anyhow!("survey run {run_id} not found")),
            }
        })
        .await
    }

    pub async fn list_survey_runs(&self, limit: u32) -> Result<Vec<SurveyRun>> {
        self.execute(move |conn| {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM survey_runs ORDER BY started_at DESC LIMIT ?1"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params![limit])?;
            let mut runs = Vec::new();
            while let Some(row) = rows.next()? {
                runs.push(row_to_survey_run(row)?);
            }
            Ok(runs)
        })
        .await
    }

    /// Most recent run that is no longer running, if any.
    pub async fn latest_finished_run_id(&self) -> Result<Option<String>> {
        self.execute(|conn| {
            let id = conn
                .query_row(
                    "SELECT id FROM survey_runs
                     WHERE status IN ('Completed', 'Cancelled')
                     ORDER BY started_at DESC
                     LIMIT 1",
                    [],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            Ok(id)
        })
        .await
    }

    pub async fn record_detection(&self, run_id: &str, detection: Detection) -> Result<()> {
        detection.validate()?;
        let run_id = run_id.to_string();
        let updated_at = Utc::now();
        self.execute(move |conn| {
            let changed = conn.execute(
                "UPDATE survey_runs
                 SET detected = ?1,
                     direction_deg = ?2,
                     distance_m = ?3,
                     updated_at = ?4
                 WHERE id = ?5",
                params![
                    detection.detected,
                    detection.direction_deg,
                    detection.distance_m,
                    updated_at.to_rfc3339(),
                    run_id,
                ],
            )?;
            if changed == 0 {
                return Err(anyhow!("survey run {run_id} not found"));
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn sample_run(started_at: DateTime<Utc>) -> SurveyRun {
        SurveyRun {
            id: Uuid::new_v4().to_string(),
            protocol: "ThreeCall".into(),
            debug: false,
            site: SurveySite::default(),
            started_at,
            ended_at: None,
            status: SurveyRunStatus::Running,
            phases_total: 4,
            phases_completed: 0,
            detection: None,
            created_at: started_at,
            updated_at: started_at,
        }
    }

    #[tokio::test]
    async fn journals_a_run_through_completion() {
        let db = Database::in_memory().expect("open db");
        let run = sample_run(Utc::now());
        db.insert_survey_run(&run).await.expect("insert");

        db.submit_phase_progress(&run.id, 2);
        db.submit_run_status(&run.id, SurveyRunStatus::Completed, 4, Some(Utc::now()));

        let stored = db.get_survey_run(&run.id).await.expect("load");
        assert_eq!(stored.status, SurveyRunStatus::Completed);
        assert_eq!(stored.phases_completed, 4);
        assert!(stored.ended_at.is_some());
        assert!(stored.detection.is_none());
    }

    #[tokio::test]
    async fn recovers_runs_left_running() {
        let db = Database::in_memory().expect("open db");
        let stale = sample_run(Utc::now());
        db.insert_survey_run(&stale).await.expect("insert");

        let changed = db.mark_interrupted_runs(Utc::now()).await.expect("recover");
        assert_eq!(changed, 1);
        let stored = db.get_survey_run(&stale.id).await.expect("load");
        assert_eq!(stored.status, SurveyRunStatus::Interrupted);
    }

    #[tokio::test]
    async fn records_detection_on_latest_finished_run() {
        let db = Database::in_memory().expect("open db");
        let earlier = sample_run(Utc::now() - chrono::Duration::minutes(30));
        let later = sample_run(Utc::now());
        db.insert_survey_run(&earlier).await.expect("insert earlier");
        db.insert_survey_run(&later).await.expect("insert later");
        db.submit_run_status(&earlier.id, SurveyRunStatus::Completed, 4, Some(Utc::now()));
        db.submit_run_status(&later.id, SurveyRunStatus::Cancelled, 1, Some(Utc::now()));

        let latest = db
            .latest_finished_run_id()
            .await
            .expect("query")
            .expect("a finished run");
        assert_eq!(latest, later.id);

        let detection = Detection {
            detected: true,
            direction_deg: Some(270),
            distance_m: Some(85.0),
        };
        db.record_detection(&latest, detection).await.expect("record");

        let stored = db.get_survey_run(&latest).await.expect("load");
        assert_eq!(stored.detection, Some(detection));
        assert_eq!(db.list_survey_runs(10).await.expect("list").len(), 2);
    }

    #[tokio::test]
    async fn stores_station_and_conditions() {
        let db = Database::in_memory().expect("open db");
        let mut run = sample_run(Utc::now());
        run.site = SurveySite {
            observer: Some("observer@example.org".into()),
            quadrat: Some("K".into()),
            station: Some(7),
            cloud: Some("overcast".into()),
            wind: Some("light".into()),
            noise: Some("quiet".into()),
            latitude: Some(43.0731),
            longitude: Some(-89.4012),
        };
        db.insert_survey_run(&run).await.expect("insert");

        let stored = db.get_survey_run(&run.id).await.expect("load");
        assert_eq!(stored.site, run.site);

        let mut off_grid = sample_run(Utc::now());
        off_grid.site.station = Some(40);
        assert!(db.insert_survey_run(&off_grid).await.is_err());
    }

    #[tokio::test]
    async fn rejects_impossible_detection_values() {
        let db = Database::in_memory().expect("open db");
        let run = sample_run(Utc::now());
        db.insert_survey_run(&run).await.expect("insert");
        db.submit_run_status(&run.id, SurveyRunStatus::Completed, 4, Some(Utc::now()));

        let impossible = Detection {
            detected: true,
            direction_deg: Some(720),
            distance_m: Some(-5.0),
        };
        assert!(db.record_detection(&run.id, impossible).await.is_err());

        let stored = db.get_survey_run(&run.id).await.expect("load");
        assert_eq!(stored.detection, None);
    }

    #[tokio::test]
    async fn detection_for_unknown_run_fails() {
        let db = Database::in_memory().expect("open db");
        assert!(db
            .record_detection("missing", Detection::none())
            .await
            .is_err());
    }
}
