// SPDX-License-Identifier: MPL-2.0

mod engine;
mod error;
mod frame_queue;
mod governor;
mod ipc;
mod media;
mod occlusion;
mod orchestrator;
mod power;
mod session;
mod surface;
mod topology;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use eyre::{Context, bail};
use tracing_subscriber::{EnvFilter, prelude::*};

use crate::{
    ipc::{Request, Response, StatusReport},
    topology::MonitorId,
};

/// Looping video wallpapers for Wayland compositors
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Log debug messages unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Control socket of the daemon
    #[arg(long, global = true)]
    socket: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the wallpaper daemon (the default)
    Daemon,
    /// Play a video on an output
    Apply { output: String, path: PathBuf },
    /// Clear the wallpaper of an output
    Remove { output: String },
    /// Set the playback volume of an output, 0-100
    Volume {
        output: String,
        #[arg(allow_negative_numbers = true)]
        volume: i64,
    },
    /// Mute or unmute an output
    Mute { output: String, state: Switch },
    /// Set the playback rate of an output, 0.25-2.5
    Speed { output: String, speed: f64 },
    /// Pause one output, or every output
    Pause { output: Option<String> },
    /// Resume one output, or lift every user pause
    Resume { output: Option<String> },
    /// Pause playback while on battery
    PowerSave { state: Switch },
    /// Show monitors, assignments and pause reasons
    Status,
    /// Stop the daemon
    Quit,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum Switch {
    On,
    Off,
}

impl Switch {
    fn enabled(self) -> bool {
        self == Self::On
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "warn,live_bg=debug"
    } else {
        "warn,live_bg=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn request_for(command: Command) -> eyre::Result<Request> {
    Ok(match command {
        Command::Daemon => bail!("the daemon is not a request"),
        Command::Apply { output, path } => Request::Apply {
            output: MonitorId::new(output),
            source: std::path::absolute(&path)
                .wrap_err_with(|| format!("invalid path {}", path.display()))?,
        },
        Command::Remove { output } => Request::Remove {
            output: MonitorId::new(output),
        },
        Command::Volume { output, volume } => Request::SetVolume {
            output: MonitorId::new(output),
            volume,
        },
        Command::Mute { output, state } => Request::SetMute {
            output: MonitorId::new(output),
            muted: state.enabled(),
        },
        Command::Speed { output, speed } => Request::SetSpeed {
            output: MonitorId::new(output),
            speed,
        },
        Command::Pause { output: Some(output) } => Request::Pause {
            output: MonitorId::new(output),
        },
        Command::Pause { output: None } => Request::PauseAll,
        Command::Resume { output: Some(output) } => Request::Resume {
            output: MonitorId::new(output),
        },
        Command::Resume { output: None } => Request::ResumeAll,
        Command::PowerSave { state } => Request::SetPowerSave(state.enabled()),
        Command::Status => Request::Status,
        Command::Quit => Request::Quit,
    })
}

fn print_status(report: &StatusReport) {
    println!(
        "power: {}, power saving {}{}",
        if report.on_battery { "battery" } else { "AC" },
        if report.power_save { "on" } else { "off" },
        if report.all_paused { ", all paused" } else { "" },
    );

    for monitor in &report.monitors {
        let state = if monitor.playing {
            "playing".to_owned()
        } else if monitor.reasons.is_empty() {
            "idle".to_owned()
        } else {
            format!("paused ({})", monitor.reasons.join(", "))
        };
        let geometry = monitor
            .geometry
            .map(|g| format!("{}x{}+{}+{}", g.width, g.height, g.x, g.y))
            .unwrap_or_else(|| "detached".to_owned());

        println!("{}: {geometry}, {state}", monitor.monitor);
        if let Some(assignment) = &monitor.assignment {
            println!(
                "    {} (volume {}{}, speed {:.2}x){}",
                assignment.source.display(),
                assignment.volume,
                if assignment.muted { ", muted" } else { "" },
                assignment.speed,
                if assignment.errored { " [errored]" } else { "" },
            );
        }
        if let Some(error) = &monitor.error {
            println!("    error: {error}");
        }
    }
}

fn run_client(socket: &std::path::Path, command: Command) -> eyre::Result<()> {
    let request = request_for(command)?;
    let response = ipc::send(socket, &request)
        .wrap_err_with(|| format!("live-bg is not running on {}", socket.display()))?;

    match response {
        Response::Ok | Response::Pong => Ok(()),
        Response::Status(report) => {
            print_status(&report);
            Ok(())
        }
        Response::Error { kind, message } => bail!("{message} ({kind:?})"),
    }
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_logging(cli.verbose);

    let socket = cli.socket.unwrap_or_else(ipc::socket_path);
    match cli.command.unwrap_or(Command::Daemon) {
        Command::Daemon => engine::run(engine::EngineOptions {
            socket,
            ..Default::default()
        }),
        command => run_client(&socket, command),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Command {
        Cli::try_parse_from(std::iter::once("live-bg").chain(args.iter().copied()))
            .unwrap()
            .command
            .unwrap()
    }

    #[test]
    fn test_daemon_is_the_default() {
        let cli = Cli::try_parse_from(["live-bg", "--verbose"]).unwrap();
        assert!(cli.verbose);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_pause_without_output_pauses_everything() {
        assert_eq!(request_for(parse(&["pause"])).unwrap(), Request::PauseAll);
        assert_eq!(
            request_for(parse(&["resume", "DP-1"])).unwrap(),
            Request::Resume {
                output: MonitorId::new("DP-1")
            }
        );
    }

    #[test]
    fn test_switch_arguments() {
        assert_eq!(
            request_for(parse(&["power-save", "off"])).unwrap(),
            Request::SetPowerSave(false)
        );
        assert_eq!(
            request_for(parse(&["mute", "HDMI-A-1", "on"])).unwrap(),
            Request::SetMute {
                output: MonitorId::new("HDMI-A-1"),
                muted: true
            }
        );
        assert!(Cli::try_parse_from(["live-bg", "power-save", "maybe"]).is_err());
    }

    #[test]
    fn test_apply_sends_absolute_paths() {
        match request_for(parse(&["apply", "DP-1", "videos/loop.mp4"])).unwrap() {
            Request::Apply { output, source } => {
                assert_eq!(output.as_str(), "DP-1");
                assert!(source.is_absolute());
                assert!(source.ends_with("videos/loop.mp4"));
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn test_negative_volume_is_accepted() {
        assert_eq!(
            request_for(parse(&["volume", "DP-1", "-5"])).unwrap(),
            Request::SetVolume {
                output: MonitorId::new("DP-1"),
                volume: -5
            }
        );
    }

    #[test]
    fn test_speed_request() {
        assert_eq!(
            request_for(parse(&["speed", "DP-1", "1.5"])).unwrap(),
            Request::SetSpeed {
                output: MonitorId::new("DP-1"),
                speed: 1.5
            }
        );
        assert!(Cli::try_parse_from(["live-bg", "speed", "DP-1", "fast"]).is_err());
    }
}
