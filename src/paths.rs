use color_eyre::eyre::bail;
use std::path::{Path, PathBuf};

pub const DATA_DIR_ENV: &str = "MCVISOR_DATA_DIR";
pub const CONFIG_FILE_NAME: &str = "mcvisor.toml";

#[derive(Debug, Clone)]
pub struct Paths {
    data_dir: PathBuf,
}

impl Paths {
    pub fn new() -> color_eyre::Result<Self> {
        if let Ok(path) = std::env::var(DATA_DIR_ENV) {
            return Ok(Self {
                data_dir: PathBuf::from(path),
            });
        }
        let Some(base) = dirs::data_dir() else {
            bail!("could not determine data directory");
        };
        Ok(Self {
            data_dir: base.join("mcvisor"),
        })
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { data_dir: base }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn console_history_file(&self) -> PathBuf {
        self.data_dir.join("console_history.json")
    }

    pub fn metrics_history_file(&self) -> PathBuf {
        self.data_dir.join("metrics_history.json")
    }
}

/// Location of the config file for a working directory.
pub fn config_file(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn test_data_dir_linux() {
        let paths = Paths::new().unwrap();
        let data_dir = paths.data_dir().to_str().unwrap();
        assert!(
            data_dir.ends_with(".local/share/mcvisor") || data_dir.contains("mcvisor"),
            "expected Linux data dir, got: {data_dir}"
        );
    }

    #[test]
    fn test_history_files_under_data_dir() {
        let paths = Paths::with_base(PathBuf::from("/tmp/mcvisor-test"));
        let console = paths.console_history_file();
        let metrics = paths.metrics_history_file();
        assert!(console.starts_with(paths.data_dir()));
        assert!(console.ends_with("console_history.json"));
        assert!(metrics.starts_with(paths.data_dir()));
        assert!(metrics.ends_with("metrics_history.json"));
    }

    #[test]
    fn test_config_file_in_dir() {
        let path = config_file(Path::new("/srv/mc"));
        assert_eq!(path, PathBuf::from("/srv/mc/mcvisor.toml"));
    }
}
