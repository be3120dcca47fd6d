use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    audio::{CallPlayer, FailureReceiver},
    db::{Database, Detection, SurveyRun, SurveyRunStatus, SurveySite},
    settings::SurveySettings,
    surface::SurveySurface,
};

use super::{PhasePlan, SurveyEffect, SurveySequencer, SurveySnapshot, SurveyStatus};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

struct SessionState {
    sequencer: SurveySequencer,
    run_id: Option<String>,
    /// Station and conditions journaled with the next run.
    site: SurveySite,
}

struct Ticker {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Owns the single survey session of the process: one sequencer, one ticker task,
/// one call player. Side effects are applied while the session lock is held so a
/// stop can never land between a transition and its effects.
#[derive(Clone)]
pub struct SurveyController {
    state: Arc<Mutex<SessionState>>,
    surface: Arc<dyn SurveySurface>,
    player: Arc<dyn CallPlayer>,
    db: Option<Database>,
    ticker: Arc<Mutex<Option<Ticker>>>,
    tick_interval: Duration,
}

impl SurveyController {
    pub fn new(
        settings: &SurveySettings,
        debug: bool,
        surface: Arc<dyn SurveySurface>,
        player: Arc<dyn CallPlayer>,
        db: Option<Database>,
    ) -> Self {
        let timings = settings.timings_for(debug);
        let plan = PhasePlan::build(settings.protocol, timings, &settings.call_cue());
        Self::with_plan(plan, debug, settings.tick_interval(), surface, player, db)
    }

    pub fn with_plan(
        plan: PhasePlan,
        debug: bool,
        tick_interval: Duration,
        surface: Arc<dyn SurveySurface>,
        player: Arc<dyn CallPlayer>,
        db: Option<Database>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(SessionState {
                sequencer: SurveySequencer::new(plan, debug),
                run_id: None,
                site: SurveySite::default(),
            })),
            surface,
            player,
            db,
            ticker: Arc::new(Mutex::new(None)),
            tick_interval,
        }
    }

    pub async fn get_snapshot(&self) -> SurveySnapshot {
        let guard = self.state.lock().await;
        guard.sequencer.snapshot(now())
    }

    pub async fn status(&self) -> SurveyStatus {
        self.state.lock().await.sequencer.status()
    }

    pub async fn current_run_id(&self) -> Option<String> {
        self.state.lock().await.run_id.clone()
    }

    pub async fn site(&self) -> SurveySite {
        self.state.lock().await.site.clone()
    }

    /// Replaces the station and conditions recorded with surveys started from now on.
    pub async fn set_site(&self, site: SurveySite) -> Result<()> {
        site.validate()?;
        self.state.lock().await.site = site;
        Ok(())
    }

    pub async fn start_survey(&self) -> Result<SurveySnapshot> {
        if self.status().await.is_running() {
            log_warn!("start_survey called while a survey is running");
            return Ok(self.get_snapshot().await);
        }

        // Never two tickers: tear the old one down before anything else.
        self.cancel_ticker().await;

        let run_id = Uuid::new_v4().to_string();
        self.journal_start(&run_id).await;

        {
            let mut state = self.state.lock().await;
            if state.sequencer.status().is_running() {
                log_warn!("another start won the race; discarding run {}", run_id);
                if let Some(db) = &self.db {
                    db.submit_run_status(&run_id, SurveyRunStatus::Cancelled, 0, Some(Utc::now()));
                }
                return Ok(state.sequencer.snapshot(now()));
            }
            state.run_id = Some(run_id);
            let effects = state.sequencer.start(now());
            self.apply_effects(&state, effects);
        }

        self.spawn_ticker().await;
        Ok(self.get_snapshot().await)
    }

    /// Cancels a running survey. Also used to acknowledge a completed one; any
    /// other state makes this a no-op.
    pub async fn stop_survey(&self) -> Result<SurveySnapshot> {
        {
            let mut state = self.state.lock().await;
            match state.sequencer.status() {
                SurveyStatus::Running { .. } => {
                    let effects = state.sequencer.stop(now());
                    self.apply_effects(&state, effects);
                }
                SurveyStatus::Complete => {
                    log_info!("completed survey acknowledged");
                    self.halt_call();
                }
                SurveyStatus::Idle | SurveyStatus::Stopped => {}
            }
        }

        self.cancel_ticker().await;
        Ok(self.get_snapshot().await)
    }

    /// Stores the observer's outcome against the survey that just ended.
    pub async fn record_detection(&self, detection: Detection) -> Result<String> {
        detection.validate()?;
        let db = self
            .db
            .clone()
            .ok_or_else(|| anyhow!("survey journal is not available"))?;

        let run_id = {
            let state = self.state.lock().await;
            match state.sequencer.status() {
                SurveyStatus::Running { .. } => bail!("survey is still running"),
                SurveyStatus::Complete | SurveyStatus::Stopped => state.run_id.clone(),
                SurveyStatus::Idle => None,
            }
        };
        let run_id = match run_id {
            Some(id) => id,
            None => db
                .latest_finished_run_id()
                .await?
                .ok_or_else(|| anyhow!("no finished survey to record against"))?,
        };

        // Bearing and distance only mean something when a bird answered.
        let detection = if detection.detected {
            detection
        } else {
            Detection::none()
        };

        db.record_detection(&run_id, detection).await?;
        log_info!(
            "recorded detection={} for survey {}",
            detection.detected,
            run_id
        );
        Ok(run_id)
    }

    /// Surfaces playback failures to the observer. Failures never reach the
    /// sequencer; the countdown keeps governing the schedule.
    pub fn watch_playback_failures(&self, mut failures: FailureReceiver) -> JoinHandle<()> {
        let surface = self.surface.clone();
        tokio::spawn(async move {
            while let Some(failure) = failures.recv().await {
                log_warn!(
                    "call {} failed to play: {}",
                    failure.clip.display(),
                    failure.reason
                );
                surface.alert(&format!(
                    "Could not play the call ({}). Continue the survey on the timer.",
                    failure.reason
                ));
            }
        })
    }

    async fn journal_start(&self, run_id: &str) {
        let Some(db) = &self.db else {
            return;
        };

        let (protocol, debug, phases_total, site) = {
            let state = self.state.lock().await;
            let plan = state.sequencer.plan();
            (
                plan.protocol().as_str().to_string(),
                state.sequencer.debug(),
                plan.len() as u64,
                state.site.clone(),
            )
        };
        if !site.is_located() {
            log_warn!("survey {} started without a quadrat and station", run_id);
        }
        let started_at = Utc::now();
        let run = SurveyRun {
            id: run_id.to_string(),
            protocol,
            debug,
            site,
            started_at,
            ended_at: None,
            status: SurveyRunStatus::Running,
            phases_total,
            phases_completed: 0,
            detection: None,
            created_at: started_at,
            updated_at: started_at,
        };

        if let Err(err) = db.insert_survey_run(&run).await {
            log_error!("Failed to journal survey start: {:#}", err);
        }
    }

    fn apply_effects(&self, state: &SessionState, effects: Vec<SurveyEffect>) {
        let run_id = state.run_id.as_deref();
        for effect in effects {
            match effect {
                SurveyEffect::ShowRemaining(display) => self.surface.show_remaining(&display),
                SurveyEffect::ShowMessage(message) => self.surface.show_message(&message),
                SurveyEffect::PlayCall(cue) => {
                    if let Err(err) = self.player.play(&cue) {
                        log_error!("Failed to start call {}: {}", cue.clip.display(), err);
                        self.surface.alert(&format!(
                            "Could not play the call ({err}). Continue the survey on the timer."
                        ));
                    }
                }
                SurveyEffect::HaltCall => self.halt_call(),
                SurveyEffect::PhaseStarted { phase_index } => {
                    log_debug!("phase {} started", phase_index);
                }
                SurveyEffect::PhaseCompleted { phase_index } => {
                    if let (Some(db), Some(id)) = (&self.db, run_id) {
                        db.submit_phase_progress(id, phase_index + 1);
                    }
                }
                SurveyEffect::SurveyCompleted => {
                    if let (Some(db), Some(id)) = (&self.db, run_id) {
                        db.submit_run_status(
                            id,
                            SurveyRunStatus::Completed,
                            state.sequencer.phases_completed(),
                            Some(Utc::now()),
                        );
                    }
                }
                SurveyEffect::SurveyStopped { phase_index, remaining } => {
                    log_info!(
                        "survey cancelled in phase {} with {}s left",
                        phase_index,
                        remaining.as_secs()
                    );
                    if let (Some(db), Some(id)) = (&self.db, run_id) {
                        db.submit_run_status(
                            id,
                            SurveyRunStatus::Cancelled,
                            state.sequencer.phases_completed(),
                            Some(Utc::now()),
                        );
                    }
                }
            }
        }
    }

    fn halt_call(&self) {
        if let Err(err) = self.player.stop() {
            log_error!("Failed to stop call playback: {}", err);
        }
    }

    async fn spawn_ticker(&self) {
        let mut ticker_guard = self.ticker.lock().await;
        if let Some(old) = ticker_guard.take() {
            old.cancel.cancel();
            old.handle.abort();
        }

        let controller = self.clone();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let tick_interval = self.tick_interval;

        let handle = tokio::spawn(async move {
            let mut interval = time::interval(tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let mut state = controller.state.lock().await;
                        let effects = state.sequencer.tick(now());
                        controller.apply_effects(&state, effects);
                        if !state.sequencer.status().is_running() {
                            break;
                        }
                    }
                }
            }
        });

        *ticker_guard = Some(Ticker { handle, cancel });
    }

    async fn cancel_ticker(&self) {
        let ticker = self.ticker.lock().await.take();
        if let Some(ticker) = ticker {
            ticker.cancel.cancel();
            if let Err(err) = ticker.handle.await {
                if !err.is_cancelled() {
                    log_error!("survey ticker task failed: {}", err);
                }
            }
        }
    }
}

/// Current instant on the tokio clock, so a paused test runtime drives virtual time.
fn now() -> std::time::Instant {
    Instant::now().into_std()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{failure_channel, PlaybackFailure};
    use crate::survey::{phase::SURVEY_COMPLETE_MESSAGE, CallCue, PhaseTimings, SurveyProtocol};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingSurface {
        remaining: std::sync::Mutex<Vec<String>>,
        messages: std::sync::Mutex<Vec<String>>,
        alerts: std::sync::Mutex<Vec<String>>,
    }

    impl RecordingSurface {
        fn remaining(&self) -> Vec<String> {
            self.remaining.lock().expect("remaining lock").clone()
        }

        fn messages(&self) -> Vec<String> {
            self.messages.lock().expect("messages lock").clone()
        }

        fn alerts(&self) -> Vec<String> {
            self.alerts.lock().expect("alerts lock").clone()
        }
    }

    impl SurveySurface for RecordingSurface {
        fn show_remaining(&self, display: &str) {
            self.remaining.lock().expect("remaining lock").push(display.to_string());
        }

        fn show_message(&self, message: &str) {
            self.messages.lock().expect("messages lock").push(message.to_string());
        }

        fn alert(&self, message: &str) {
            self.alerts.lock().expect("alerts lock").push(message.to_string());
        }
    }

    #[derive(Default)]
    struct RecordingPlayer {
        plays: std::sync::Mutex<Vec<CallCue>>,
        stops: AtomicUsize,
        fail: bool,
    }

    impl RecordingPlayer {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn play_count(&self) -> usize {
            self.plays.lock().expect("plays lock").len()
        }
    }

    impl CallPlayer for RecordingPlayer {
        fn play(&self, cue: &CallCue) -> Result<(), String> {
            self.plays.lock().expect("plays lock").push(cue.clone());
            if self.fail {
                Err("decode error".into())
            } else {
                Ok(())
            }
        }

        fn stop(&self) -> Result<(), String> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn settings() -> SurveySettings {
        SurveySettings {
            call_clip: PathBuf::from("calls/coha-call.mp3"),
            ..SurveySettings::default()
        }
    }

    fn controller(
        debug: bool,
        player: Arc<RecordingPlayer>,
        db: Option<Database>,
    ) -> (SurveyController, Arc<RecordingSurface>) {
        let surface = Arc::new(RecordingSurface::default());
        let controller = SurveyController::new(&settings(), debug, surface.clone(), player, db);
        (controller, surface)
    }

    #[tokio::test(start_paused = true)]
    async fn standard_survey_completes_after_420_seconds_with_three_calls() {
        let player = Arc::new(RecordingPlayer::default());
        let (controller, surface) = controller(false, player.clone(), None);

        controller.start_survey().await.expect("start");
        time::sleep(Duration::from_secs(419)).await;
        assert_eq!(
            controller.status().await,
            SurveyStatus::Running { phase_index: 3 }
        );

        time::sleep(Duration::from_secs(2)).await;
        let snapshot = controller.get_snapshot().await;
        assert_eq!(snapshot.status, SurveyStatus::Complete);
        assert_eq!(snapshot.phases_completed, 4);
        assert_eq!(player.play_count(), 3);

        let completions = surface
            .messages()
            .iter()
            .filter(|m| m.as_str() == SURVEY_COMPLETE_MESSAGE)
            .count();
        assert_eq!(completions, 1);

        // Complete does not auto-advance; nothing new arrives later.
        let updates = surface.remaining().len();
        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(surface.remaining().len(), updates);
        assert_eq!(controller.status().await, SurveyStatus::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_after_ten_seconds_freezes_first_phase() {
        let player = Arc::new(RecordingPlayer::default());
        let (controller, surface) = controller(false, player.clone(), None);

        controller.start_survey().await.expect("start");
        time::sleep(Duration::from_secs(10)).await;
        let snapshot = controller.stop_survey().await.expect("stop");

        assert_eq!(snapshot.status, SurveyStatus::Stopped);
        assert_eq!(snapshot.display, "1:50");
        assert_eq!(surface.remaining().last().map(String::as_str), Some("1:50"));
        assert!(player.stops.load(Ordering::SeqCst) >= 1);

        let updates = surface.remaining().len();
        let messages = surface.messages().len();
        time::sleep(Duration::from_secs(300)).await;
        assert_eq!(surface.remaining().len(), updates);
        assert_eq!(surface.messages().len(), messages);
        assert_eq!(player.play_count(), 0);
        assert_eq!(controller.status().await, SurveyStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn debug_survey_runs_on_short_timings() {
        let player = Arc::new(RecordingPlayer::default());
        let (controller, _surface) = controller(true, player.clone(), None);

        controller.start_survey().await.expect("start");
        time::sleep(Duration::from_secs(4)).await;
        assert_eq!(
            controller.status().await,
            SurveyStatus::Running { phase_index: 1 }
        );

        time::sleep(Duration::from_secs(66)).await;
        assert_eq!(controller.status().await, SurveyStatus::Complete);
        assert_eq!(player.play_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_playback_never_blocks_progress() {
        let player = Arc::new(RecordingPlayer::failing());
        let (controller, surface) = controller(true, player.clone(), None);

        controller.start_survey().await.expect("start");
        time::sleep(Duration::from_secs(70)).await;

        assert_eq!(controller.status().await, SurveyStatus::Complete);
        assert_eq!(player.play_count(), 3);
        assert_eq!(surface.alerts().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn asynchronous_playback_failures_are_alerted() {
        let player = Arc::new(RecordingPlayer::default());
        let (controller, surface) = controller(true, player, None);
        let (tx, rx) = failure_channel();
        let watcher = controller.watch_playback_failures(rx);

        controller.start_survey().await.expect("start");
        time::sleep(Duration::from_secs(4)).await;
        tx.send(PlaybackFailure {
            clip: PathBuf::from("calls/coha-call.mp3"),
            reason: "unsupported format".into(),
        })
        .expect("send failure");
        time::sleep(Duration::from_millis(500)).await;

        assert_eq!(surface.alerts().len(), 1);
        assert!(surface.alerts()[0].contains("unsupported format"));
        assert!(controller.status().await.is_running());

        drop(tx);
        watcher.await.expect("watcher exits when channel closes");
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_sequencing_is_a_no_op() {
        let player = Arc::new(RecordingPlayer::default());
        let (controller, surface) = controller(false, player, None);

        let snapshot = controller.stop_survey().await.expect("stop while idle");
        assert_eq!(snapshot.status, SurveyStatus::Idle);
        assert!(surface.remaining().is_empty());

        controller.start_survey().await.expect("start");
        time::sleep(Duration::from_secs(5)).await;
        let run_id = controller.current_run_id().await;
        controller.start_survey().await.expect("second start");
        assert_eq!(controller.current_run_id().await, run_id);

        let snapshot = controller.get_snapshot().await;
        assert_eq!(snapshot.display, "1:55");
    }

    #[tokio::test(start_paused = true)]
    async fn restart_after_stop_runs_a_fresh_survey() {
        let player = Arc::new(RecordingPlayer::default());
        let (controller, _surface) = controller(true, player.clone(), None);

        controller.start_survey().await.expect("start");
        time::sleep(Duration::from_secs(10)).await;
        controller.stop_survey().await.expect("stop");
        let first_run = controller.current_run_id().await;

        controller.start_survey().await.expect("restart");
        assert_ne!(controller.current_run_id().await, first_run);
        time::sleep(Duration::from_secs(70)).await;
        assert_eq!(controller.status().await, SurveyStatus::Complete);
        // One call from the first attempt plus three from the second.
        assert_eq!(player.play_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn journals_completed_run_and_detection() {
        let db = Database::in_memory().expect("open db");
        let player = Arc::new(RecordingPlayer::default());
        let (controller, _surface) = controller(true, player, Some(db.clone()));

        controller.start_survey().await.expect("start");
        let run_id = controller.current_run_id().await.expect("run id");

        let err = controller
            .record_detection(Detection::none())
            .await
            .expect_err("cannot record while running");
        assert!(err.to_string().contains("still running"));

        time::sleep(Duration::from_secs(70)).await;
        assert_eq!(controller.status().await, SurveyStatus::Complete);

        let recorded = controller
            .record_detection(Detection {
                detected: false,
                direction_deg: Some(90),
                distance_m: Some(40.0),
            })
            .await
            .expect("record");
        assert_eq!(recorded, run_id);

        let run = db.get_survey_run(&run_id).await.expect("load run");
        assert_eq!(run.status, SurveyRunStatus::Completed);
        assert_eq!(run.phases_completed, 4);
        assert!(run.debug);
        assert_eq!(run.detection, Some(Detection::none()));
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_impossible_detection_without_touching_the_journal() {
        let db = Database::in_memory().expect("open db");
        let player = Arc::new(RecordingPlayer::default());
        let (controller, _surface) = controller(true, player, Some(db.clone()));

        controller.start_survey().await.expect("start");
        time::sleep(Duration::from_secs(5)).await;
        controller.stop_survey().await.expect("stop");
        let run_id = controller.current_run_id().await.expect("run id");

        let result = controller
            .record_detection(Detection {
                detected: true,
                direction_deg: Some(720),
                distance_m: Some(-5.0),
            })
            .await;
        assert!(result.is_err());

        let run = db.get_survey_run(&run_id).await.expect("load run");
        assert_eq!(run.detection, None);
    }

    #[tokio::test(start_paused = true)]
    async fn journals_station_and_conditions_with_the_run() {
        let db = Database::in_memory().expect("open db");
        let player = Arc::new(RecordingPlayer::default());
        let (controller, _surface) = controller(true, player, Some(db.clone()));

        let invalid = SurveySite {
            quadrat: Some("Z".into()),
            ..SurveySite::default()
        };
        assert!(controller.set_site(invalid).await.is_err());

        let site = SurveySite {
            observer: Some("observer@example.org".into()),
            quadrat: Some("C".into()),
            station: Some(4),
            wind: Some("calm".into()),
            ..SurveySite::default()
        };
        controller.set_site(site.clone()).await.expect("set site");
        controller.start_survey().await.expect("start");
        let run_id = controller.current_run_id().await.expect("run id");

        let run = db.get_survey_run(&run_id).await.expect("load run");
        assert_eq!(run.site, site);
        assert_eq!(run.status, SurveyRunStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn journals_cancelled_run() {
        let db = Database::in_memory().expect("open db");
        let player = Arc::new(RecordingPlayer::default());
        let (controller, _surface) = controller(false, player, Some(db.clone()));

        controller.start_survey().await.expect("start");
        time::sleep(Duration::from_secs(130)).await;
        controller.stop_survey().await.expect("stop");

        let run_id = controller.current_run_id().await.expect("run id");
        let run = db.get_survey_run(&run_id).await.expect("load run");
        assert_eq!(run.status, SurveyRunStatus::Cancelled);
        assert_eq!(run.phases_completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_protocol_completes_without_calls() {
        let player = Arc::new(RecordingPlayer::default());
        let surface = Arc::new(RecordingSurface::default());
        let plan = PhasePlan::build(
            SurveyProtocol::Silent,
            PhaseTimings::standard(),
            &settings().call_cue(),
        );
        let controller = SurveyController::with_plan(
            plan,
            false,
            Duration::from_millis(250),
            surface.clone(),
            player.clone(),
            None,
        );

        controller.start_survey().await.expect("start");
        time::sleep(Duration::from_secs(121)).await;
        assert_eq!(controller.status().await, SurveyStatus::Complete);
        assert_eq!(player.play_count(), 0);
        assert_eq!(surface.remaining().first().map(String::as_str), Some("2:00"));
    }
}
