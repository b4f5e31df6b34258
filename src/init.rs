use std::io::{BufRead, IsTerminal, Write};
use std::path::Path;

use color_eyre::eyre::{bail, eyre};

use crate::config::{self, ServerConfig, ServerSection};
use crate::launch::parse_memory_string;
use crate::paths::{CONFIG_FILE_NAME, config_file};

/// Answers collected by either prompt mode.
struct InitAnswers {
    server_jar: String,
    java_path: String,
    memory_min: String,
    memory_max: String,
    optimized_flags: bool,
    auto_start: bool,
}

impl InitAnswers {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            server: ServerSection {
                server_jar: self.server_jar,
                java_path: self.java_path,
                memory_min: self.memory_min,
                memory_max: self.memory_max,
                optimized_flags: self.optimized_flags,
                auto_start: self.auto_start,
                ..ServerSection::default()
            },
            ..ServerConfig::default()
        }
    }
}

fn validate_memory(input: &str) -> Result<(), String> {
    parse_memory_string(input)
        .map(|_| ())
        .map_err(|e| e.to_string())
}

fn finalize(dir: &Path, answers: InitAnswers) -> color_eyre::Result<()> {
    let min = parse_memory_string(&answers.memory_min).map_err(|e| eyre!("{e}"))?;
    let max = parse_memory_string(&answers.memory_max).map_err(|e| eyre!("{e}"))?;
    if min > max {
        bail!(
            "minimum memory {} exceeds maximum memory {}",
            answers.memory_min,
            answers.memory_max
        );
    }

    let config = answers.into_config();
    let content = config::render_config(&config).map_err(|e| eyre!("{e}"))?;
    config::parse_config(&content)
        .map_err(|e| eyre!("generated TOML failed validation: {e}"))?;

    config::save_config(&config_file(dir), &config).map_err(|e| eyre!("{e}"))
}

pub fn run(dir: &Path) -> color_eyre::Result<()> {
    if std::io::stdin().is_terminal() {
        run_interactive(dir)
    } else {
        let stdin = std::io::stdin();
        let mut reader = stdin.lock();
        run_piped(dir, &mut reader)
    }
}

// ── Interactive mode (cliclack) ─────────────────────────────────────

fn run_interactive(dir: &Path) -> color_eyre::Result<()> {
    let config_path = config_file(dir);

    cliclack::intro("mcvisor init")?;

    if config_path.exists() {
        let overwrite: bool =
            cliclack::confirm(format!("{CONFIG_FILE_NAME} already exists. Overwrite?"))
                .initial_value(false)
                .interact()?;
        if !overwrite {
            cliclack::outro_cancel("Aborted.")?;
            bail!("aborted");
        }
    }

    let server_jar: String = cliclack::input("Server jar")
        .placeholder(config::DEFAULT_SERVER_JAR)
        .default_input(config::DEFAULT_SERVER_JAR)
        .interact()?;

    let java_path: String = cliclack::input("Java executable")
        .placeholder(config::DEFAULT_JAVA_PATH)
        .default_input(config::DEFAULT_JAVA_PATH)
        .interact()?;

    let memory_min: String = cliclack::input("Minimum memory")
        .placeholder(config::DEFAULT_MEMORY_MIN)
        .default_input(config::DEFAULT_MEMORY_MIN)
        .validate(|input: &String| validate_memory(input))
        .interact()?;

    let memory_max: String = cliclack::input("Maximum memory")
        .placeholder(config::DEFAULT_MEMORY_MAX)
        .default_input(config::DEFAULT_MEMORY_MAX)
        .validate(|input: &String| validate_memory(input))
        .interact()?;

    let optimized_flags: bool = cliclack::confirm("Use optimized GC flags?")
        .initial_value(false)
        .interact()?;

    let auto_start: bool = cliclack::confirm("Start the server when mcvisor starts?")
        .initial_value(false)
        .interact()?;

    finalize(
        dir,
        InitAnswers {
            server_jar,
            java_path,
            memory_min,
            memory_max,
            optimized_flags,
            auto_start,
        },
    )?;

    cliclack::outro(format!("Created {}", config_path.display()))?;

    Ok(())
}

// ── Piped mode (plain stdin/stderr for E2E tests) ───────────────────

fn plain_prompt(
    reader: &mut impl BufRead,
    prompt: &str,
    default: &str,
) -> color_eyre::Result<String> {
    let stderr = std::io::stderr();
    let mut stderr = stderr.lock();
    write!(stderr, "{prompt} [{default}]: ")?;
    stderr.flush()?;

    let mut line = String::new();
    reader.read_line(&mut line)?;
    let line = line.trim();

    if line.is_empty() {
        return Ok(default.to_string());
    }
    Ok(line.to_string())
}

fn plain_prompt_memory(
    reader: &mut impl BufRead,
    prompt: &str,
    default: &str,
) -> color_eyre::Result<String> {
    loop {
        let value = plain_prompt(reader, prompt, default)?;
        match validate_memory(&value) {
            Ok(()) => return Ok(value),
            // EOF would repeat the same bad answer forever
            Err(e) if value == default => bail!(e),
            Err(e) => eprintln!("{e}"),
        }
    }
}

fn plain_prompt_confirm(
    reader: &mut impl BufRead,
    prompt_text: &str,
    default: bool,
) -> color_eyre::Result<bool> {
    let def_str = if default { "Y/n" } else { "y/N" };
    let stderr = std::io::stderr();
    let mut stderr = stderr.lock();
    write!(stderr, "{prompt_text} [{def_str}]: ")?;
    stderr.flush()?;

    let mut line = String::new();
    reader.read_line(&mut line)?;
    let line = line.trim().to_lowercase();

    match line.as_str() {
        "y" | "yes" => Ok(true),
        "n" | "no" => Ok(false),
        _ => Ok(default),
    }
}

fn run_piped(dir: &Path, reader: &mut impl BufRead) -> color_eyre::Result<()> {
    let config_path = config_file(dir);

    if config_path.exists() {
        let overwrite = plain_prompt_confirm(
            reader,
            &format!("{CONFIG_FILE_NAME} already exists. Overwrite?"),
            false,
        )?;
        if !overwrite {
            bail!("aborted");
        }
    }

    let server_jar = plain_prompt(reader, "Server jar", config::DEFAULT_SERVER_JAR)?;
    let java_path = plain_prompt(reader, "Java executable", config::DEFAULT_JAVA_PATH)?;
    let memory_min = plain_prompt_memory(reader, "Minimum memory", config::DEFAULT_MEMORY_MIN)?;
    let memory_max = plain_prompt_memory(reader, "Maximum memory", config::DEFAULT_MEMORY_MAX)?;
    let optimized_flags = plain_prompt_confirm(reader, "Use optimized GC flags?", false)?;
    let auto_start = plain_prompt_confirm(reader, "Start the server when mcvisor starts?", false)?;

    finalize(
        dir,
        InitAnswers {
            server_jar,
            java_path,
            memory_min,
            memory_max,
            optimized_flags,
            auto_start,
        },
    )?;
    println!("Created {}", config_path.display());

    Ok(())
}
