mod utils;

pub mod audio;
pub mod db;
pub mod settings;
pub mod surface;
pub mod survey;

use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::Parser;
use log::{info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};

use audio::{default_player, failure_channel, CallPlayer};
use db::{Database, Detection, SurveySite};
use settings::{SettingsStore, DEBUG_ENV_VAR};
use surface::TerminalSurface;
use survey::{format_remaining, SurveyController, SurveyProtocol, SurveyStatus};

pub use utils::logging::init_logging;

#[derive(Parser, Debug)]
#[command(name = "coha-survey", version, about = "Guided Cooper's Hawk call-playback survey")]
pub struct Cli {
    /// Directory holding settings.json and the survey journal.
    #[arg(long, default_value = "coha-data")]
    pub data_dir: PathBuf,

    /// Observer id, usually an email address. Remembered between runs; the
    /// configured debug observer switches on short timings.
    #[arg(long)]
    pub observer: Option<String>,

    /// Quadrat letter A-X. Remembered between runs.
    #[arg(long)]
    pub quadrat: Option<String>,

    /// Station number within the quadrat, 1-16.
    #[arg(long)]
    pub station: Option<u8>,

    #[arg(long, allow_negative_numbers = true)]
    pub latitude: Option<f64>,

    #[arg(long, allow_negative_numbers = true)]
    pub longitude: Option<f64>,

    /// Use the short debug timings.
    #[arg(long)]
    pub debug: bool,

    /// Survey protocol: three-call or silent.
    #[arg(long, value_parser = parse_protocol)]
    pub protocol: Option<SurveyProtocol>,

    /// Call recording to broadcast, overriding settings.json.
    #[arg(long)]
    pub clip: Option<PathBuf>,
}

fn parse_protocol(value: &str) -> Result<SurveyProtocol, String> {
    SurveyProtocol::parse(value).ok_or_else(|| format!("unknown protocol '{value}'"))
}

/// One `key=value` pair of the `site` command.
#[derive(Debug, Clone, PartialEq)]
pub enum SiteField {
    Quadrat(String),
    Station(u8),
    Cloud(String),
    Wind(String),
    Noise(String),
    Latitude(f64),
    Longitude(f64),
}

impl SiteField {
    fn parse(pair: &str) -> Result<Self, String> {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("expected key=value, got '{pair}'"))?;
        let number = |what: &str| {
            value
                .parse::<f64>()
                .map_err(|_| format!("{what} must be a number, got '{value}'"))
        };
        let field = match key.to_ascii_lowercase().as_str() {
            "quadrat" => SiteField::Quadrat(value.to_ascii_uppercase()),
            "station" => SiteField::Station(
                value
                    .parse()
                    .map_err(|_| format!("station must be 1-16, got '{value}'"))?,
            ),
            "cloud" => SiteField::Cloud(value.to_string()),
            "wind" => SiteField::Wind(value.to_string()),
            "noise" => SiteField::Noise(value.to_string()),
            "lat" | "latitude" => SiteField::Latitude(number("latitude")?),
            "lon" | "longitude" => SiteField::Longitude(number("longitude")?),
            other => return Err(format!("unknown site field '{other}'")),
        };
        Ok(field)
    }

    fn apply(self, site: &mut SurveySite) {
        match self {
            SiteField::Quadrat(quadrat) => site.quadrat = Some(quadrat),
            SiteField::Station(station) => site.station = Some(station),
            SiteField::Cloud(cloud) => site.cloud = Some(cloud),
            SiteField::Wind(wind) => site.wind = Some(wind),
            SiteField::Noise(noise) => site.noise = Some(noise),
            SiteField::Latitude(lat) => site.latitude = Some(lat),
            SiteField::Longitude(lon) => site.longitude = Some(lon),
        }
    }
}

/// A line typed by the observer.
#[derive(Debug, Clone, PartialEq)]
pub enum HostCommand {
    Start,
    Stop,
    Status,
    /// Updates station and conditions; no fields shows the current ones.
    Site(Vec<SiteField>),
    Detect(Detection),
    History,
    Help,
    Quit,
}

pub fn parse_command(line: &str) -> Result<HostCommand, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Err("empty command".into());
    };

    let command = match verb.to_ascii_lowercase().as_str() {
        "start" => HostCommand::Start,
        "stop" => HostCommand::Stop,
        "status" => HostCommand::Status,
        "history" => HostCommand::History,
        "help" | "?" => HostCommand::Help,
        "quit" | "exit" => HostCommand::Quit,
        "site" => HostCommand::Site(words.map(SiteField::parse).collect::<Result<Vec<_>, String>>()?),
        "detect" => {
            let answer = words
                .next()
                .ok_or_else(|| "usage: detect yes [bearing] [distance_m] | detect no".to_string())?;
            match answer.to_ascii_lowercase().as_str() {
                "no" | "n" => HostCommand::Detect(Detection::none()),
                "yes" | "y" => {
                    let direction_deg = words
                        .next()
                        .map(|raw| {
                            raw.parse::<u16>()
                                .map_err(|_| format!("bearing must be 0-359, got '{raw}'"))
                        })
                        .transpose()?;
                    let distance_m = words
                        .next()
                        .map(|raw| {
                            raw.parse::<f64>()
                                .map_err(|_| format!("distance must be metres, got '{raw}'"))
                        })
                        .transpose()?;
                    HostCommand::Detect(
                        Detection::sighted(direction_deg, distance_m).map_err(|err| err.to_string())?,
                    )
                }
                other => return Err(format!("expected yes or no, got '{other}'")),
            }
        }
        other => return Err(format!("unknown command '{other}' (try 'help')")),
    };
    Ok(command)
}

const HELP: &str = "commands: start | stop | status | site [quadrat=K station=7 cloud=.. wind=.. noise=.. lat=.. lon=..] | detect yes [bearing] [distance_m] | detect no | history | quit";

pub(crate) struct AppState {
    pub(crate) controller: SurveyController,
    pub(crate) db: Database,
}

impl AppState {
    /// Returns false when the host should exit.
    async fn handle(&self, command: HostCommand) -> Result<bool> {
        match command {
            HostCommand::Start => {
                let snapshot = self.controller.start_survey().await?;
                info!("survey running ({} phases)", snapshot.phase_count);
            }
            HostCommand::Stop => {
                let snapshot = self.controller.stop_survey().await?;
                if snapshot.status == SurveyStatus::Stopped {
                    println!("\nSurvey stopped with {} remaining.", snapshot.display);
                }
            }
            HostCommand::Status => {
                let snapshot = self.controller.get_snapshot().await;
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            }
            HostCommand::Site(fields) if fields.is_empty() => {
                let site = self.controller.site().await;
                println!("{}", serde_json::to_string_pretty(&site)?);
            }
            HostCommand::Site(fields) => {
                let mut site = self.controller.site().await;
                for field in fields {
                    field.apply(&mut site);
                }
                match self.controller.set_site(site).await {
                    Ok(()) => println!("Site updated; it applies to the next survey."),
                    Err(err) => println!("Not updated: {err}"),
                }
            }
            HostCommand::Detect(detection) => match self.controller.record_detection(detection).await {
                Ok(run_id) => println!("Saved detection for survey {run_id}."),
                Err(err) => println!("Not saved: {err}"),
            },
            HostCommand::History => {
                for run in self.db.list_survey_runs(10).await? {
                    let detection = match run.detection {
                        Some(d) if d.detected => "detected",
                        Some(_) => "not detected",
                        None => "no outcome",
                    };
                    let station = match (&run.site.quadrat, run.site.station) {
                        (Some(quadrat), Some(station)) => format!("{quadrat}.{station:02}"),
                        _ => "-".to_string(),
                    };
                    println!(
                        "{}  {:<5} {:<11} {:<9} {}/{} phases  {}",
                        run.started_at.format("%Y-%m-%d %H:%M"),
                        station,
                        run.status.as_str(),
                        run.protocol,
                        run.phases_completed,
                        run.phases_total,
                        detection
                    );
                }
            }
            HostCommand::Help => println!("{HELP}"),
            HostCommand::Quit => return Ok(false),
        }
        Ok(true)
    }
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(log::LevelFilter::Info);

    log::info!("COHA survey starting up...");

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    runtime.block_on(run_host(cli))
}

async fn run_host(cli: Cli) -> Result<()> {
    std::fs::create_dir_all(&cli.data_dir)
        .with_context(|| format!("failed to create {}", cli.data_dir.display()))?;

    let settings_path = cli.data_dir.join("settings.json");
    let first_run = !settings_path.exists();
    let settings_store = SettingsStore::new(settings_path.clone())?;
    if first_run {
        // Leave an editable copy of the defaults behind.
        settings_store.update_survey(settings_store.survey())?;
        info!("Wrote default settings to {}", settings_path.display());
    }
    let mut settings = settings_store.survey();

    // Observer and quadrat carry over between runs, the way a field form remembers them.
    let mut remembered = settings.clone();
    if let Some(observer) = &cli.observer {
        remembered.observer = Some(observer.trim().to_string());
    }
    if let Some(quadrat) = &cli.quadrat {
        remembered.quadrat = Some(quadrat.trim().to_ascii_uppercase());
    }
    let site = SurveySite {
        observer: remembered.observer.clone(),
        quadrat: remembered.quadrat.clone(),
        station: cli.station,
        latitude: cli.latitude,
        longitude: cli.longitude,
        ..SurveySite::default()
    };
    site.validate().context("invalid station settings")?;
    if remembered != settings {
        settings_store.update_survey(remembered.clone())?;
        settings = remembered;
    }

    if let Some(protocol) = cli.protocol {
        settings.protocol = protocol;
    }
    if let Some(clip) = cli.clip {
        settings.call_clip = clip;
    }

    let env_debug = std::env::var(DEBUG_ENV_VAR).ok();
    let debug = settings.debug_enabled(cli.debug, env_debug.as_deref(), site.observer.as_deref());
    if debug {
        warn!("debug mode: using shortened phase timings");
    }

    let database = Database::new(cli.data_dir.join("coha.sqlite3"))?;

    // Finalize surveys that were running when the program last died.
    let recovered = database.mark_interrupted_runs(Utc::now()).await?;
    if recovered > 0 {
        warn!("Marked {recovered} unfinished survey(s) as Interrupted");
    }

    let (failure_tx, failure_rx) = failure_channel();
    let player: Arc<dyn CallPlayer> = Arc::from(default_player(failure_tx));
    let controller = SurveyController::new(
        &settings,
        debug,
        Arc::new(TerminalSurface::new()),
        player,
        Some(database.clone()),
    );
    let _failure_watch = controller.watch_playback_failures(failure_rx);
    controller.set_site(site).await?;

    let app = AppState {
        controller,
        db: database,
    };

    let timings = settings.timings_for(debug);
    println!(
        "COHA survey ready ({}, first listen {}). {HELP}",
        settings.protocol.as_str(),
        format_remaining(std::time::Duration::from_secs(timings.initial_listen_secs))
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_command(&line) {
                    Ok(command) => {
                        if !app.handle(command).await? {
                            break;
                        }
                    }
                    Err(message) => println!("{message}"),
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.map_err(|err| anyhow!("failed to listen for ctrl-c: {err}"))?;
                break;
            }
        }
    }

    // Leaving mid-survey cancels it so the journal does not show it as interrupted.
    app.controller.stop_survey().await?;
    info!("COHA survey shutting down");
    Ok(())
}
