use clap::Parser;
use color_eyre::eyre::{bail, eyre};
use comfy_table::{Attribute, Cell, Color, Table, presets::UTF8_FULL_CONDENSED};
use mcvisor::broadcast::TelemetryEvent;
use mcvisor::cli::{Cli, Command};
use mcvisor::config::{self, ServerConfig};
use mcvisor::console::{Channel, ConsoleLine, Direction};
use mcvisor::launch::LaunchSpec;
use mcvisor::paths::{Paths, config_file};
use mcvisor::state::ProcessState;
use mcvisor::store::HistoryStore;
use mcvisor::supervisor::{ServerStatus, Supervisor};
use mcvisor::sys;
use mcvisor::telemetry::TpsBand;
use owo_colors::OwoColorize;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Lines of persisted console history replayed at startup.
const REPLAY_LINES: usize = 20;

/// How long runtime shutdown waits for blocked tasks such as a pending
/// stdin read, which cannot be cancelled.
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let dir = match &cli.dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };

    match cli.command_or_default() {
        Command::Init => mcvisor::init::run(&dir),
        Command::Check => check(&dir),
        Command::Run {
            headless,
            auto_start,
        } => {
            let runtime = tokio::runtime::Runtime::new()?;
            let result = runtime.block_on(run(&dir, headless, auto_start));
            runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);
            result
        }
    }
}

fn load(dir: &Path) -> color_eyre::Result<ServerConfig> {
    let path = config_file(dir);
    if !path.exists() {
        bail!("{} not found, run `mcvisor init` first", path.display());
    }
    config::load_config(&path).map_err(|e| eyre!("{}: {e}", path.display()))
}

fn check(dir: &Path) -> color_eyre::Result<()> {
    let config = load(dir)?;
    let spec = LaunchSpec::from_config(&config.server).map_err(|e| eyre!("{e}"))?;

    println!("{} {}", "ok".green(), config_file(dir).display());
    println!(
        "  {} {}",
        "working dir:".dimmed(),
        spec.working_dir().display()
    );
    println!("  {} {}", "command:".dimmed(), spec.display_command());
    Ok(())
}

async fn run(dir: &Path, headless: bool, auto_start: bool) -> color_eyre::Result<()> {
    let config = load(dir)?;
    let auto_start = auto_start || config.server.auto_start;

    let paths = Paths::new()?;
    let supervisor = Supervisor::with_store(config, HistoryStore::new(&paths)).await;

    for line in supervisor.get_console_tail(REPLAY_LINES) {
        println!("{}", format_line(&line).dimmed());
    }

    let (subscription, events) = supervisor.subscribe();
    let printer = tokio::spawn(print_events(events));

    if auto_start && let Err(e) = supervisor.start().await {
        warn!(error = %e, "auto-start failed");
    }

    if headless {
        info!("running headless, waiting for a termination signal");
        sys::shutdown_signal().await?;
    } else {
        let console = tokio::spawn(read_console(supervisor.clone()));
        tokio::select! {
            result = sys::shutdown_signal() => result?,
            _ = console => {}
        }
    }

    info!("shutting down");
    supervisor.shutdown().await;
    // Closing the channel lets the printer finish what is queued.
    supervisor.unregister_observer(subscription);
    let _ = printer.await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Console input
// ---------------------------------------------------------------------------

const HELP: &str = "\
.start      start the server
.stop       stop the server
.restart    restart the server
.reload     reload server properties
.status     show state and metrics
.quit       stop the server and exit
anything else is sent to the server (/cmd runs a command, text is chat)";

/// Returns when stdin closes or the operator quits.
async fn read_console(supervisor: Supervisor) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "failed to read stdin");
                return;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let result = match line {
            ".quit" | ".exit" => return,
            ".help" => {
                println!("{HELP}");
                Ok(())
            }
            ".status" => {
                print_status(&supervisor.status());
                Ok(())
            }
            ".start" => supervisor.start().await.map(|_| ()),
            ".stop" => supervisor.stop().await.map(|_| ()),
            ".restart" => supervisor.restart().await.map(|_| ()),
            ".reload" => supervisor.reload().await.map(|_| ()),
            text => supervisor.send_command(text).await.map(|_| ()),
        };
        if let Err(e) = result {
            eprintln!("{} {e}", "error:".red().bold());
        }
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

async fn print_events(mut events: mpsc::Receiver<TelemetryEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            TelemetryEvent::Console(line) => print_line(&line),
            TelemetryEvent::State(state) => {
                println!("{} {}", "state:".dimmed(), colored_state(state));
            }
            TelemetryEvent::Metrics(_) => {}
        }
    }
}

fn format_line(line: &ConsoleLine) -> String {
    let time = line.timestamp.with_timezone(&chrono::Local).format("%H:%M:%S");
    match (line.direction, line.channel) {
        (Direction::Input, _) => format!("{time} > {}", line.text),
        (Direction::Output, Channel::System) => format!("{time} [mcvisor] {}", line.text),
        (Direction::Output, _) => format!("{time} {}", line.text),
    }
}

fn print_line(line: &ConsoleLine) {
    let text = format_line(line);
    match (line.direction, line.channel) {
        (Direction::Input, _) => println!("{}", text.cyan()),
        (Direction::Output, Channel::System) => println!("{}", text.yellow().bold()),
        (Direction::Output, Channel::Stderr) => println!("{}", text.red()),
        (Direction::Output, Channel::Stdout) => println!("{text}"),
    }
}

fn colored_state(state: ProcessState) -> String {
    let text = state.to_string();
    match state {
        ProcessState::Running => text.green().to_string(),
        ProcessState::Starting | ProcessState::Stopping => text.yellow().to_string(),
        ProcessState::Crashed => text.red().to_string(),
        ProcessState::Stopped => text,
    }
}

fn band_color(band: TpsBand) -> Color {
    match band {
        TpsBand::Good => Color::Green,
        TpsBand::Degraded => Color::Yellow,
        TpsBand::Poor => Color::Red,
        TpsBand::Unknown => Color::Reset,
    }
}

fn state_color(state: ProcessState) -> Color {
    match state {
        ProcessState::Running => Color::Green,
        ProcessState::Starting | ProcessState::Stopping => Color::Yellow,
        ProcessState::Crashed => Color::Red,
        ProcessState::Stopped => Color::Reset,
    }
}

fn print_status(status: &ServerStatus) {
    let latest = status.latest.as_ref();

    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec![
        Cell::new("state").add_attribute(Attribute::Bold),
        Cell::new("pid").add_attribute(Attribute::Bold),
        Cell::new("uptime").add_attribute(Attribute::Bold),
        Cell::new("tps").add_attribute(Attribute::Bold),
        Cell::new("avg tps").add_attribute(Attribute::Bold),
        Cell::new("cpu").add_attribute(Attribute::Bold),
        Cell::new("avg cpu").add_attribute(Attribute::Bold),
        Cell::new("mem").add_attribute(Attribute::Bold),
        Cell::new("sys mem").add_attribute(Attribute::Bold),
        Cell::new("players").add_attribute(Attribute::Bold),
    ]);

    let pid = status
        .pid
        .map(|id| id.to_string())
        .unwrap_or_else(|| "-".to_string());
    let players = if status.players.is_empty() {
        "-".to_string()
    } else {
        status.players.join(", ")
    };

    table.add_row(vec![
        Cell::new(status.state.to_string()).fg(state_color(status.state)),
        Cell::new(&pid),
        Cell::new(format_uptime(status.uptime_secs)),
        Cell::new(format_tps(latest.and_then(|s| s.tps))).fg(band_color(status.tps_band)),
        Cell::new(format_tps(status.average_tps)),
        Cell::new(format_cpu(latest.and_then(|s| s.cpu_percent))),
        Cell::new(format_cpu(status.average_cpu)),
        Cell::new(format_memory_bytes(
            latest.and_then(|s| s.server_memory_bytes),
        )),
        Cell::new(format_cpu(latest.and_then(|s| s.system_memory_percent))),
        Cell::new(players).fg(Color::Cyan),
    ]);
    println!("{table}");
}

fn format_tps(tps: Option<f64>) -> String {
    match tps {
        Some(v) => format!("{v:.1}"),
        None => "-".to_string(),
    }
}

fn format_cpu(cpu: Option<f64>) -> String {
    match cpu {
        Some(v) => format!("{v:.1}%"),
        None => "-".to_string(),
    }
}

fn format_memory_bytes(bytes: Option<u64>) -> String {
    match bytes {
        None => "-".to_string(),
        Some(b) if b < 1024 => format!("{b}B"),
        Some(b) if b < 1024 * 1024 => format!("{:.1}K", b as f64 / 1024.0),
        Some(b) if b < 1024 * 1024 * 1024 => format!("{:.1}M", b as f64 / (1024.0 * 1024.0)),
        Some(b) => format!("{:.1}G", b as f64 / (1024.0 * 1024.0 * 1024.0)),
    }
}

fn format_uptime(seconds: Option<u64>) -> String {
    match seconds {
        None => "-".to_string(),
        Some(s) if s < 60 => format!("{s}s"),
        Some(s) if s < 3600 => format!("{}m {}s", s / 60, s % 60),
        Some(s) if s < 86400 => format!("{}h {}m", s / 3600, (s % 3600) / 60),
        Some(s) => format!("{}d {}h", s / 86400, (s % 86400) / 3600),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(None), "-");
        assert_eq!(format_uptime(Some(59)), "59s");
        assert_eq!(format_uptime(Some(90)), "1m 30s");
        assert_eq!(format_uptime(Some(7260)), "2h 1m");
        assert_eq!(format_uptime(Some(90000)), "1d 1h");
    }

    #[test]
    fn test_format_memory_bytes() {
        assert_eq!(format_memory_bytes(None), "-");
        assert_eq!(format_memory_bytes(Some(512)), "512B");
        assert_eq!(format_memory_bytes(Some(1536 * 1024 * 1024)), "1.5G");
    }

    #[test]
    fn test_format_tps_and_cpu() {
        assert_eq!(format_tps(Some(19.87)), "19.9");
        assert_eq!(format_tps(None), "-");
        assert_eq!(format_cpu(Some(12.34)), "12.3%");
    }

    #[test]
    fn test_format_line_marks_input_and_system() {
        let input = format_line(&ConsoleLine::input("list"));
        assert!(input.ends_with("> list"));
        let system = format_line(&ConsoleLine::system("Server stopped"));
        assert!(system.ends_with("[mcvisor] Server stopped"));
        let out = format_line(&ConsoleLine::output(Channel::Stdout, "hello"));
        assert!(out.ends_with(" hello"));
        assert!(!out.contains("[mcvisor]"));
    }
}
