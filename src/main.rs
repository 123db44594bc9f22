use anyhow::{Context, Result};
use barloop::audio_engine::{EnginePaths, LooperEngine};
use barloop::audio_io::CpalBackend;
use barloop::drum_engine::{DrumConfig, DrumSequencer};
use barloop::drum_kit::DrumPatternLibrary;
use barloop::looper::LooperStatus;
use barloop::scheduler::{Scheduler, SystemClock};
use barloop::settings::{self, SETTINGS_FILE};
use barloop::{audio_device, midi};
use clap::Parser;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const STATUS_INTERVAL: Duration = Duration::from_millis(200);
const QUIT: &str = "quit";

#[derive(Parser)]
#[command(name = "barloop", version, about = "Live looper with a drum backing track")]
struct Args {
    /// Settings file to use instead of AppSettings/settings.json next to the executable
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log the audio hosts and devices, then exit
    #[arg(long)]
    list_devices: bool,
}

/// Forwards stdin lines to the control loop; end of input quits.
fn spawn_stdin_reader(sender: Sender<String>) -> Result<()> {
    thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if sender.send(line).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        log::error!("Failed to read stdin: {}", e);
                        break;
                    }
                }
            }
            sender.send(QUIT.to_string()).ok();
        })
        .context("starting the stdin reader")?;
    Ok(())
}

fn log_status(status: &LooperStatus) {
    log::info!(
        "{:?} | part {} (next {}) | {} layers | length {}",
        status.state,
        status.part_now,
        status.part_next,
        status.layers,
        status.part_length
    );
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if args.list_devices {
        audio_device::log_devices();
        return Ok(());
    }

    let (config_dir, settings_path) = match args.config {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            (dir, path)
        }
        None => {
            let dir = settings::get_config_dir().context("no configuration directory")?;
            let path = dir.join(SETTINGS_FILE);
            (dir, path)
        }
    };
    settings::ensure_config_dir(&config_dir);
    let settings = settings::load_settings(&settings_path);
    if !settings_path.exists() {
        settings::save_settings(&settings, &settings_path);
    }

    let drums_dir = settings.drums_dir(&config_dir);
    let kit_dir = drums_dir.join(&settings.drum_kit);
    let library = DrumPatternLibrary::load(&kit_dir, settings.sample_rate)
        .with_context(|| format!("loading drum kit {}", kit_dir.display()))?;

    let scheduler = Scheduler::spawn(Arc::new(SystemClock::new()));
    let drum = DrumSequencer::new(
        Arc::new(library),
        DrumConfig::from_settings(&settings),
        scheduler.clone(),
    );
    let backend = Arc::new(CpalBackend::from_settings(&settings)?);
    let paths = EnginePaths {
        settings_file: Some(settings_path),
        drums_dir,
        songs_dir: settings.songs_dir(&config_dir),
    };
    let engine = LooperEngine::new(settings.clone(), paths, drum, backend.clone())?;

    let (sender, receiver) = mpsc::channel::<String>();
    let _midi_connection = match &settings.midi_port_name {
        Some(port) => Some(midi::connect_midi(port, &settings.note_map, sender.clone())?),
        None => {
            log::info!("No MIDI port configured");
            None
        }
    };
    spawn_stdin_reader(sender)?;
    log::info!("Ready. Type commands, '{}' to exit.", QUIT);

    let mut last_status: Option<LooperStatus> = None;
    loop {
        match receiver.recv_timeout(STATUS_INTERVAL) {
            Ok(line) => {
                let line = line.trim();
                if line == QUIT {
                    break;
                }
                if !line.is_empty() {
                    engine.process_message(line);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let status = LooperStatus {
            play_index: 0,
            ..engine.status()
        };
        if last_status != Some(status) {
            log_status(&status);
            last_status = Some(status);
        }
    }

    log::info!(
        "Shutting down: {} missed blocks, {} stream errors",
        engine.missed_blocks(),
        backend.xrun_count()
    );
    drop(engine);
    scheduler.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_line_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn parses_config_and_device_listing() {
        let args = Args::try_parse_from(["barloop", "--config", "my/settings.json"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("my/settings.json")));
        assert!(!args.list_devices);

        let args = Args::try_parse_from(["barloop", "--list-devices"]).unwrap();
        assert!(args.list_devices);
        assert!(Args::try_parse_from(["barloop", "--bogus"]).is_err());
        assert!(Args::try_parse_from(["barloop", "--config"]).is_err());
    }
}
