use crate::config::ServerSection;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// Curated G1 tuning set used when optimized flags are enabled. Replaces the
/// default tuning segment, which is empty.
pub const OPTIMIZED_GC_FLAGS: &[&str] = &[
    "-XX:+UseG1GC",
    "-XX:+ParallelRefProcEnabled",
    "-XX:MaxGCPauseMillis=200",
    "-XX:+UnlockExperimentalVMOptions",
    "-XX:+DisableExplicitGC",
    "-XX:+AlwaysPreTouch",
    "-XX:G1NewSizePercent=30",
    "-XX:G1MaxNewSizePercent=40",
    "-XX:G1HeapRegionSize=8M",
    "-XX:G1ReservePercent=20",
    "-XX:G1HeapWastePercent=5",
    "-XX:G1MixedGCCountTarget=4",
    "-XX:InitiatingHeapOccupancyPercent=15",
    "-XX:G1MixedGCLiveThresholdPercent=90",
    "-XX:G1RSetUpdatingPauseTimePercent=5",
    "-XX:SurvivorRatio=32",
    "-XX:+PerfDisableSharedMem",
    "-XX:MaxTenuringThreshold=1",
];

pub const DEFAULT_GC_FLAGS: &[&str] = &[];

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum LaunchError {
    #[error("invalid memory size `{value}`: {reason}")]
    InvalidMemory { value: String, reason: String },
    #[error("minimum memory {min} exceeds maximum memory {max}")]
    MemoryBounds { min: String, max: String },
    #[error("server jar not found: {0}")]
    JarNotFound(PathBuf),
    #[error("working directory not found: {0}")]
    WorkingDirNotFound(PathBuf),
    #[error("executable path is empty")]
    EmptyExecutable,
    #[error("invalid additional arguments: {0}")]
    InvalidArgs(String),
}

// ---------------------------------------------------------------------------
// Memory sizes
// ---------------------------------------------------------------------------

fn invalid_memory(value: &str, reason: impl Into<String>) -> LaunchError {
    LaunchError::InvalidMemory {
        value: value.to_string(),
        reason: reason.into(),
    }
}

/// Parse sizes like `512M`, `2G`, `1.5GB` or plain bytes.
pub fn parse_memory_string(s: &str) -> Result<u64, LaunchError> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err(invalid_memory(s, "empty memory string"));
    }

    // Find where the numeric part ends and suffix begins
    let suffix_start = trimmed
        .find(|c: char| c.is_alphabetic())
        .unwrap_or(trimmed.len());

    let num_part = &trimmed[..suffix_start];
    let suffix = trimmed[suffix_start..].trim();

    if num_part.is_empty() {
        return Err(invalid_memory(s, "no numeric value"));
    }

    let value: f64 = num_part
        .trim()
        .parse()
        .map_err(|_| invalid_memory(s, format!("invalid number `{num_part}`")))?;

    let multiplier: u64 = match suffix.to_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" => KIB,
        "M" | "MB" => MIB,
        "G" | "GB" => GIB,
        other => return Err(invalid_memory(s, format!("unknown suffix `{other}`"))),
    };

    let bytes = (value * multiplier as f64) as u64;
    if bytes == 0 {
        return Err(invalid_memory(s, "must be positive"));
    }
    Ok(bytes)
}

/// Render a byte count the way the JVM's `-Xms`/`-Xmx` flags expect it.
pub fn jvm_memory_arg(bytes: u64) -> String {
    if bytes % GIB == 0 {
        format!("{}G", bytes / GIB)
    } else if bytes % MIB == 0 {
        format!("{}M", bytes / MIB)
    } else if bytes % KIB == 0 {
        format!("{}K", bytes / KIB)
    } else {
        bytes.to_string()
    }
}

// ---------------------------------------------------------------------------
// LaunchSpec
// ---------------------------------------------------------------------------

/// Everything needed to spawn one run of the server. Built fresh per start.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    executable: PathBuf,
    server_jar: PathBuf,
    memory_min: u64,
    memory_max: u64,
    working_dir: PathBuf,
    extra_args: Vec<String>,
    optimized_flags: bool,
}

impl LaunchSpec {
    pub fn from_config(server: &ServerSection) -> Result<Self, LaunchError> {
        let executable = server.java_path.trim();
        if executable.is_empty() {
            return Err(LaunchError::EmptyExecutable);
        }

        let memory_min = parse_memory_string(&server.memory_min)?;
        let memory_max = parse_memory_string(&server.memory_max)?;
        if memory_min > memory_max {
            return Err(LaunchError::MemoryBounds {
                min: server.memory_min.clone(),
                max: server.memory_max.clone(),
            });
        }

        let server_jar = PathBuf::from(&server.server_jar);
        if !server_jar.is_file() {
            return Err(LaunchError::JarNotFound(server_jar));
        }
        // The child runs in `working_dir`, so a relative jar would resolve twice.
        let server_jar =
            std::path::absolute(&server_jar).map_err(|_| LaunchError::JarNotFound(server_jar))?;

        let working_dir = match &server.working_dir {
            Some(dir) => PathBuf::from(dir),
            None => jar_directory(&server_jar),
        };
        if !working_dir.is_dir() {
            return Err(LaunchError::WorkingDirNotFound(working_dir));
        }

        let extra_args = shell_words::split(&server.additional_args)
            .map_err(|e| LaunchError::InvalidArgs(e.to_string()))?;

        Ok(Self {
            executable: PathBuf::from(executable),
            server_jar,
            memory_min,
            memory_max,
            working_dir,
            extra_args,
            optimized_flags: server.optimized_flags,
        })
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Tuning segment for this spec: the curated set when optimized flags are
    /// on, otherwise the (empty) default set.
    pub fn tuning_flags(&self) -> &'static [&'static str] {
        if self.optimized_flags {
            OPTIMIZED_GC_FLAGS
        } else {
            DEFAULT_GC_FLAGS
        }
    }

    /// Argument vector passed to the executable: memory bounds, tuning flags,
    /// user extras (last, so they can override), then the jar.
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(5 + OPTIMIZED_GC_FLAGS.len() + self.extra_args.len());
        args.push(format!("-Xms{}", jvm_memory_arg(self.memory_min)));
        args.push(format!("-Xmx{}", jvm_memory_arg(self.memory_max)));
        args.extend(self.tuning_flags().iter().map(|flag| flag.to_string()));
        args.extend(self.extra_args.iter().cloned());
        args.push("-jar".to_string());
        args.push(self.server_jar.to_string_lossy().into_owned());
        args.push("nogui".to_string());
        args
    }

    pub fn display_command(&self) -> String {
        let mut words = vec![self.executable.to_string_lossy().into_owned()];
        words.extend(self.args());
        shell_words::join(words)
    }
}

fn jar_directory(jar: &Path) -> PathBuf {
    match jar.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn server_with_jar(dir: &Path) -> ServerSection {
        let jar = dir.join("server.jar");
        std::fs::write(&jar, b"").unwrap();
        ServerSection {
            server_jar: jar.to_string_lossy().into_owned(),
            ..ServerSection::default()
        }
    }

    #[test]
    fn test_parse_megabytes() {
        assert_eq!(parse_memory_string("200M").unwrap(), 200 * MIB);
        assert_eq!(parse_memory_string("200MB").unwrap(), 200 * MIB);
    }

    #[test]
    fn test_parse_gigabytes() {
        assert_eq!(parse_memory_string("1G").unwrap(), GIB);
        assert_eq!(parse_memory_string("2GB").unwrap(), 2 * GIB);
    }

    #[test]
    fn test_parse_kilobytes_and_bytes() {
        assert_eq!(parse_memory_string("512K").unwrap(), 512 * KIB);
        assert_eq!(parse_memory_string("1048576").unwrap(), 1048576);
    }

    #[test]
    fn test_parse_fractional() {
        let expected = (1.5 * GIB as f64) as u64;
        assert_eq!(parse_memory_string("1.5G").unwrap(), expected);
    }

    #[test]
    fn test_parse_case_insensitive_with_whitespace() {
        assert_eq!(parse_memory_string("  200m  ").unwrap(), 200 * MIB);
    }

    #[test]
    fn test_parse_invalid_memory() {
        assert!(parse_memory_string("").is_err());
        assert!(parse_memory_string("200X").is_err());
        assert!(parse_memory_string("MB").is_err());
        assert!(parse_memory_string("0G").is_err());
        assert!(parse_memory_string("-1G").is_err());
    }

    #[test]
    fn test_jvm_memory_arg() {
        assert_eq!(jvm_memory_arg(GIB), "1G");
        assert_eq!(jvm_memory_arg(1536 * MIB), "1536M");
        assert_eq!(jvm_memory_arg(100 * KIB), "100K");
        assert_eq!(jvm_memory_arg(1000), "1000");
    }

    #[test]
    fn test_default_args_have_memory_and_no_tuning() {
        let dir = tempfile::tempdir().unwrap();
        let server = server_with_jar(dir.path());
        let spec = LaunchSpec::from_config(&server).unwrap();
        let args = spec.args();

        assert_eq!(args[0], "-Xms1G");
        assert_eq!(args[1], "-Xmx2G");
        assert!(!args.iter().any(|a| a.starts_with("-XX:")));
        assert_eq!(args[2], "-jar");
        assert_eq!(args.last().unwrap(), "nogui");
    }

    #[test]
    fn test_optimized_flags_replace_tuning_segment() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = server_with_jar(dir.path());
        server.additional_args = "-Dfile.encoding=UTF-8 -XX:MaxGCPauseMillis=50".to_string();
        server.optimized_flags = true;
        let spec = LaunchSpec::from_config(&server).unwrap();
        let args = spec.args();

        assert_eq!(args[0], "-Xms1G");
        assert_eq!(args[1], "-Xmx2G");
        let tuning = &args[2..2 + OPTIMIZED_GC_FLAGS.len()];
        assert_eq!(tuning, OPTIMIZED_GC_FLAGS);

        let extras_at = 2 + OPTIMIZED_GC_FLAGS.len();
        assert_eq!(args[extras_at], "-Dfile.encoding=UTF-8");
        assert_eq!(args[extras_at + 1], "-XX:MaxGCPauseMillis=50");
        assert_eq!(args[extras_at + 2], "-jar");
    }

    #[test]
    fn test_extra_args_follow_memory_without_optimized_flags() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = server_with_jar(dir.path());
        server.additional_args = r#"-Dmotd="hello world""#.to_string();
        let spec = LaunchSpec::from_config(&server).unwrap();
        let args = spec.args();
        assert_eq!(args[2], "-Dmotd=hello world");
        assert_eq!(args[3], "-jar");
    }

    #[test]
    fn test_min_above_max_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = server_with_jar(dir.path());
        server.memory_min = "4G".to_string();
        server.memory_max = "2G".to_string();
        assert!(matches!(
            LaunchSpec::from_config(&server),
            Err(LaunchError::MemoryBounds { .. })
        ));
    }

    #[test]
    fn test_missing_jar_rejected() {
        let server = ServerSection {
            server_jar: "/definitely/not/here/server.jar".to_string(),
            ..ServerSection::default()
        };
        assert!(matches!(
            LaunchSpec::from_config(&server),
            Err(LaunchError::JarNotFound(_))
        ));
    }

    #[test]
    fn test_working_dir_defaults_to_jar_directory() {
        let dir = tempfile::tempdir().unwrap();
        let server = server_with_jar(dir.path());
        let spec = LaunchSpec::from_config(&server).unwrap();
        assert_eq!(spec.working_dir(), dir.path());
    }

    #[test]
    fn test_unbalanced_quotes_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = server_with_jar(dir.path());
        server.additional_args = "\"-Dunterminated".to_string();
        assert!(matches!(
            LaunchSpec::from_config(&server),
            Err(LaunchError::InvalidArgs(_))
        ));
    }

    #[test]
    fn test_display_command_starts_with_executable() {
        let dir = tempfile::tempdir().unwrap();
        let server = server_with_jar(dir.path());
        let spec = LaunchSpec::from_config(&server).unwrap();
        assert!(spec.display_command().starts_with("java -Xms1G -Xmx2G -jar "));
    }
}
