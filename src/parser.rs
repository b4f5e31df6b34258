//! Classification of raw server output lines.
//!
//! `parse` is total: any line it does not recognize is a `GenericLine`.

use regex::Regex;
use std::sync::LazyLock;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Tick-rate ceiling of the platform; reports above it are rejected.
pub const TPS_MAX: f64 = 20.0;
pub const TPS_MIN: f64 = 0.0;

/// Phrasings that precede a TPS value, e.g. Paper's
/// `TPS from last 1m, 5m, 15m: 19.8, ...` or Forge's `Mean TPS: 20.000`.
static TPS_REPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:tps from last 1m, 5m, 15m:|mean tps:|\btps:)\s*\*?\s*(-?[0-9]+(?:\.[0-9]+)?)")
        .expect("TPS pattern is valid")
});

/// `Done (3.456s)! For help, type "help"`
static READY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\bdone \([0-9]+(?:[.,][0-9]+)?s\)!"#).expect("ready pattern is valid")
});

static PLAYER_JOINED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\]:\s+|^)([A-Za-z0-9_.]{1,16}) joined the game\s*$")
        .expect("join pattern is valid")
});

static PLAYER_LEFT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\]:\s+|^)([A-Za-z0-9_.]{1,16}) left the game\s*$")
        .expect("leave pattern is valid")
});

/// Player chat: `[Server thread/INFO]: <Steve> ...`, optionally tagged
/// `[Not Secure]` by servers without chat signing. Players control the rest
/// of the line, so it never carries markers.
static CHAT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\]:\s+|^)(?:\[Not Secure\]\s+)?<[^<>\s]{1,32}>\s")
        .expect("chat pattern is valid")
});

/// Minecraft formatting codes (`§a`, `§l`, ...).
static FORMATTING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"§[0-9A-Za-z]").expect("formatting pattern is valid"));

/// Lower-case fragments of fatal errors that precede the server dying.
pub const CRASH_MARKERS: &[&str] = &[
    "this crash report has been saved to",
    "preparing crash report with uuid",
    "encountered an unexpected exception",
    "exception in server tick loop",
    "failed to start the minecraft server",
    "java.lang.outofmemoryerror",
    "/fatal]",
];

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedEvent {
    TpsSample(f64),
    ReadyMarker,
    CrashMarker,
    PlayerJoined(String),
    PlayerLeft(String),
    GenericLine,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

pub fn parse(line: &str) -> ParsedEvent {
    let clean = FORMATTING.replace_all(line, "");
    let text = clean.trim_end();

    if CHAT.is_match(text) {
        return ParsedEvent::GenericLine;
    }

    if let Some(caps) = TPS_REPORT.captures(text) {
        return match caps[1].parse::<f64>() {
            Ok(tps) if (TPS_MIN..=TPS_MAX).contains(&tps) => ParsedEvent::TpsSample(tps),
            _ => ParsedEvent::GenericLine,
        };
    }

    if READY.is_match(text) {
        return ParsedEvent::ReadyMarker;
    }

    let lower = text.to_lowercase();
    if CRASH_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return ParsedEvent::CrashMarker;
    }

    if let Some(caps) = PLAYER_JOINED.captures(text) {
        return ParsedEvent::PlayerJoined(caps[1].to_string());
    }
    if let Some(caps) = PLAYER_LEFT.captures(text) {
        return ParsedEvent::PlayerLeft(caps[1].to_string());
    }

    ParsedEvent::GenericLine
}
