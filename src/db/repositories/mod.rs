pub mod survey_runs;
