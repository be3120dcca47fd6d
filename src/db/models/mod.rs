pub mod survey_run;

pub use survey_run::{Detection, SurveyRun, SurveyRunStatus, SurveySite, STATIONS_PER_QUADRAT};
