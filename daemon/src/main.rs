use anyhow::{Context, Result};
use clap::Parser;
use daemon::canvas::{Canvas, CanvasSettings};
use daemon::config::{CONFIG_FILE, Config};
use daemon::log_and_continue;
use daemon::sensors::{SensorFormatter, Sensors};
use daemon::theme::Theme;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Name of the single-instance lock inside the data directory
const LOCK_FILE: &str = "lcdc.lock";

/// How often finished sessions are reaped
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "lcdc")]
#[command(about = "USB LCD panel daemon", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration directory (defaults to the XDG config directory)
    #[arg(short = 'c', long, env = "LCDC_CONFIG_DIR")]
    config_dir: Option<String>,

    /// Data directory holding the lock file (defaults to the XDG data directory)
    #[arg(short = 's', long, env = "LCDC_DATA_DIR")]
    data_dir: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn resolve_dir(arg: Option<&str>, default: fn() -> Result<PathBuf>) -> Result<PathBuf> {
    match arg {
        Some(dir) => {
            let expanded =
                shellexpand::full(dir).with_context(|| format!("Failed to expand {}", dir))?;
            Ok(PathBuf::from(expanded.as_ref()))
        }
        None => default(),
    }
}

/// Hold an exclusive lock so only one daemon drives the panels.
fn acquire_lock(data_dir: &Path) -> Result<File> {
    fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;
    let path = data_dir.join(LOCK_FILE);
    let file = File::create(&path)
        .with_context(|| format!("Failed to open lock file: {}", path.display()))?;
    file.try_lock()
        .with_context(|| format!("Another lcdc instance holds {}", path.display()))?;
    Ok(file)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_dir = resolve_dir(cli.config_dir.as_deref(), Config::default_config_dir)?;
    let data_dir = resolve_dir(cli.data_dir.as_deref(), Config::default_data_dir)?;

    let config_path = config_dir.join(CONFIG_FILE);
    let config = Config::load_from_path(&config_path);
    let filter = match (&config, cli.debug) {
        (_, true) => "debug".to_string(),
        (Ok(config), false) => config.general.log_level.clone(),
        (Err(_), false) => "info".to_string(),
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    log::info!("Starting lcdc v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Config directory: {}", config_dir.display());
    log::info!("Data directory: {}", data_dir.display());

    let config = config?;
    let _lock = acquire_lock(&data_dir)?;

    let theme_dir = config.theme_dir(&config_dir)?;
    let theme = Theme::load(&theme_dir)?;
    log::info!(
        "Theme {} with {} widget(s), background {}",
        theme.config_path.display(),
        theme.config.widgets.len(),
        theme.background().display()
    );

    let sensors = Arc::new(Sensors::new());
    for (key, description) in sensors.keys() {
        log::debug!("Sensor {}: {}", key, description);
    }
    let formatter: Arc<dyn SensorFormatter> = sensors;

    let settings = CanvasSettings::from_config(&config);
    let mut canvases = Vec::new();
    for display in daemon::device::discover() {
        let mut canvas = Canvas::new(
            display,
            theme.clone(),
            settings.clone(),
            Arc::clone(&formatter),
        );
        match canvas.start() {
            Ok(()) => canvases.push(canvas),
            Err(e) => log::error!("Display {}: failed to start: {}", display.id, e),
        }
    }

    if canvases.is_empty() {
        log::warn!("No panel is being driven, waiting for a signal to exit");
    }

    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to set up SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to set up SIGINT handler")?;
    let mut health = tokio::time::interval(HEALTH_CHECK_INTERVAL);

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                log::info!("Received SIGTERM, shutting down...");
                break;
            }
            _ = sigint.recv() => {
                log::info!("Received SIGINT, shutting down...");
                break;
            }
            _ = health.tick() => {
                // A session that ended on its own is reaped so its error is logged
                for canvas in canvases.iter_mut().filter(|c| !c.is_running()) {
                    let tag = canvas.display().id;
                    log_and_continue!(canvas.wait(), format!("run display {}", tag));
                }
            }
        }
    }

    for canvas in canvases.iter_mut() {
        let tag = canvas.display().id;
        log_and_continue!(canvas.stop(), format!("stop display {}", tag));
    }

    log::info!("Daemon shutting down");
    Ok(())
}
