// src/main.rs
//! Fleet Tracker - vehicle tracking, offline sync and trip playback from the terminal

use anyhow::{bail, Context};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use fleet_tracker::{
    config::TrackerConfig,
    display::TerminalDisplay,
    geofence::GeofenceMonitor,
    logging,
    offline::{JsonFileQueueStore, OfflineBuffer},
    playback::PlaybackEngine,
    position::{GpsdSource, Position, PositionSource, ScriptedSource},
    recorder::TrackRecorder,
    sink::{DataSink, DateRange, JsonDirSink},
    snapshot::SnapshotStore,
    tracker::{spawn_dir_probe, FenceSetup, Tracker},
    SessionKey, SessionSummary,
};
use std::{
    io,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{info, warn};

const PROBE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "fleet-tracker", version)]
#[command(
    about = "Track a vehicle, buffer history offline and replay recorded trips",
    long_about = None
)]
struct Cli {
    /// Config file (default: ~/.config/fleet-tracker/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug, Clone)]
struct SessionArgs {
    /// Vehicle or driver key the session is stored under
    #[arg(long)]
    key: String,

    #[arg(long, default_value = "default")]
    route_id: String,

    #[arg(long, default_value = "Unnamed route")]
    route_name: String,

    /// Watch a geofence around the route
    #[arg(long)]
    geofence: bool,

    /// Geofence radius in meters (default from config)
    #[arg(long, requires = "geofence")]
    radius: Option<f64>,

    /// Geofence center latitude (default: first fix)
    #[arg(long, requires_all = ["geofence", "fence_lon"])]
    fence_lat: Option<f64>,

    /// Geofence center longitude (default: first fix)
    #[arg(long, requires_all = ["geofence", "fence_lat"])]
    fence_lon: Option<f64>,

    /// Continue a recent interrupted session if one was saved
    #[arg(long)]
    resume: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Track live positions from gpsd
    Track {
        #[command(flatten)]
        session: SessionArgs,

        #[arg(long)]
        gpsd_host: Option<String>,

        #[arg(long)]
        gpsd_port: Option<u16>,

        /// Log only, no full-screen status
        #[arg(long)]
        no_display: bool,
    },
    /// Record a session from a JSON file of positions
    Simulate {
        #[command(flatten)]
        session: SessionArgs,

        /// JSON array of positions; the first is the starting fix
        #[arg(long)]
        script: PathBuf,

        /// Delay between scripted events
        #[arg(long, default_value = "1000")]
        interval_ms: u64,
    },
    /// Replay a recorded trip
    Replay {
        #[arg(long)]
        key: String,

        /// Only points captured on this day (YYYY-MM-DD, UTC)
        #[arg(long)]
        date: Option<NaiveDate>,

        /// Playback speed multiplier (>= 1)
        #[arg(long, default_value = "1")]
        speed: f64,
    },
    /// Send locally queued history points to the store
    Flush {
        #[arg(long)]
        key: String,
    },
    /// Show or change configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the config file location
    Path,
    /// Set the gpsd endpoint
    SetGpsd { host: String, port: u16 },
    /// Set the data directory
    SetDataDir { dir: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => TrackerConfig::get_config_path()?,
    };
    let mut config = TrackerConfig::load_from(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    if let Some(dir) = &cli.data_dir {
        config.update_storage(dir.clone());
    }

    match cli.command {
        Command::Track {
            session,
            gpsd_host,
            gpsd_port,
            no_display,
        } => {
            let host = gpsd_host.unwrap_or_else(|| config.gpsd.host.clone());
            let port = gpsd_port.unwrap_or(config.gpsd.port);
            info!(%host, port, "Using gpsd source");
            let source = GpsdSource::new(host, port);
            run_session(&config, &source, &session, !no_display, false).await
        }
        Command::Simulate {
            session,
            script,
            interval_ms,
        } => {
            let source = ScriptedSource::from_json_file(&script)
                .with_context(|| format!("reading script {}", script.display()))?
                .with_interval(Duration::from_millis(interval_ms));
            info!(events = source.len(), "Loaded position script");
            run_session(&config, &source, &session, false, true).await
        }
        Command::Replay { key, date, speed } => {
            replay(&config, &SessionKey::new(key), date, speed).await
        }
        Command::Flush { key } => flush(&config, &SessionKey::new(key)).await,
        Command::Config { action } => config_command(config, &config_path, action),
    }
}

fn open_buffer(config: &TrackerConfig, key: &SessionKey) -> anyhow::Result<OfflineBuffer> {
    let queue_path = config.storage.queue_path(&key.file_stem());
    let store = JsonFileQueueStore::open(&queue_path)
        .with_context(|| format!("opening offline queue {}", queue_path.display()))?;
    Ok(OfflineBuffer::open(Box::new(store))?)
}

async fn run_session(
    config: &TrackerConfig,
    source: &dyn PositionSource,
    args: &SessionArgs,
    show_display: bool,
    exit_on_stream_end: bool,
) -> anyhow::Result<()> {
    let key = SessionKey::new(args.key.clone());
    let sink_dir = config.storage.sink_dir();
    let sink: Arc<dyn DataSink> = Arc::new(JsonDirSink::new(&sink_dir));

    let buffer = open_buffer(config, &key)?;
    if !buffer.is_empty() {
        info!(queued = buffer.len(), "Found history points queued by an earlier run");
    }

    let recorder = TrackRecorder::new(key.clone(), sink, buffer, config.recorder.clone())
        .with_position_options(config.position.clone())
        .with_snapshot_store(SnapshotStore::new(config.storage.snapshot_path(&key.file_stem())));
    let geofence = GeofenceMonitor::new(config.geofence.clone());
    let connectivity = spawn_dir_probe(sink_dir, PROBE_INTERVAL);

    let mut tracker = Tracker::new(recorder, geofence, connectivity)
        .exit_on_stream_end(exit_on_stream_end);

    let fence = args.geofence.then(|| FenceSetup {
        center: match (args.fence_lat, args.fence_lon) {
            (Some(lat), Some(lon)) => Some(Position::new(lat, lon, chrono::Utc::now())),
            _ => None,
        },
        radius_meters: args.radius,
    });
    tracker
        .start(source, &args.route_id, &args.route_name, fence, args.resume)
        .await
        .context("starting tracking session")?;

    let running = Arc::new(AtomicBool::new(true));
    let display_task = show_display.then(|| {
        let status = tracker.status();
        let running = Arc::clone(&running);
        tokio::spawn(async move { TerminalDisplay::new().run(status, running).await })
    });

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    let summary = tracker.run(shutdown).await;

    running.store(false, Ordering::Relaxed);
    if let Some(task) = display_task {
        task.await.context("display task")??;
    }

    if let Some(summary) = summary? {
        print_summary(&summary, tracker.recorder().offline_len());
    }
    Ok(())
}

fn print_summary(summary: &SessionSummary, queued: usize) {
    println!("\nSession {} ({})", summary.session_id, summary.route_name);
    println!("  Points:    {}", summary.points);
    println!("  Distance:  {:.2} km", summary.distance_km);
    println!("  Duration:  {}", summary.format_duration());
    match summary.avg_speed {
        Some(speed) => println!("  Avg speed: {:.1} km/h", speed),
        None => println!("  Avg speed: -"),
    }
    if queued > 0 {
        println!(
            "  {} history points are queued locally; run `fleet-tracker flush` when online",
            queued
        );
    }
}

async fn replay(
    config: &TrackerConfig,
    key: &SessionKey,
    date: Option<NaiveDate>,
    speed: f64,
) -> anyhow::Result<()> {
    let sink = JsonDirSink::new(config.storage.sink_dir());
    let range = date.map_or_else(DateRange::all, DateRange::day);

    let mut engine = PlaybackEngine::new(config.playback.clone());
    engine
        .load_from_sink(&sink, key, &range)
        .await
        .with_context(|| format!("no history for {}", key))?;

    println!(
        "Replaying {} points over {} at {}x",
        engine.len(),
        fleet_tracker::playback::format_clock(engine.duration().num_seconds() as f64),
        speed
    );

    let display = TerminalDisplay::new();
    let mut stdout = io::stdout();
    let first = engine.seek(0)?;
    display.render_frame(&mut stdout, &first, engine.len(), engine.duration())?;
    engine.play(speed)?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    while engine.is_playing() {
        tokio::select! {
            frame = engine.advance() => {
                display.render_frame(&mut stdout, &frame, engine.len(), engine.duration())?;
            }
            _ = &mut ctrl_c => {
                engine.pause();
                println!("\nStopped at point {}", engine.current_index() + 1);
                return Ok(());
            }
        }
    }
    println!();
    Ok(())
}

async fn flush(config: &TrackerConfig, key: &SessionKey) -> anyhow::Result<()> {
    let mut buffer = open_buffer(config, key)?;
    if buffer.is_empty() {
        println!("Nothing queued for {}", key);
        return Ok(());
    }

    let sink = JsonDirSink::new(config.storage.sink_dir());
    let queued = buffer.len();
    let flushed = buffer.flush(&sink).await;
    println!("Flushed {} of {} queued history points", flushed, queued);
    if !buffer.is_empty() {
        bail!("{} history points could not be sent", buffer.len());
    }
    Ok(())
}

fn config_command(
    mut config: TrackerConfig,
    path: &std::path::Path,
    action: ConfigAction,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigAction::Path => {
            println!("{}", path.display());
        }
        ConfigAction::SetGpsd { host, port } => {
            config.update_gpsd(host, port);
            config.save_to(path)?;
            println!("Saved gpsd endpoint {}:{}", config.gpsd.host, config.gpsd.port);
        }
        ConfigAction::SetDataDir { dir } => {
            config.update_storage(dir);
            config.save_to(path)?;
            println!("Saved data directory {}", config.storage.data_dir.display());
        }
    }
    Ok(())
}
