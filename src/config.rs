use std::{env, path::{Path, PathBuf}};

use directories::BaseDirs;
use lazy_static::lazy_static;
use serde::Deserialize;

use crate::core::filter::{
    DEFAULT_CHROMOSOME_COLUMN, DEFAULT_POSITION_COLUMN, VariantColumns,
};

const CONFIG: &str = include_str!("../.config/config.json5");
const CONFIG_FILE: &str = "config.json5";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error("embedded defaults are invalid: {0}")]
    Defaults(#[from] json5::Error),
    #[error("path is not valid UTF-8: {0}")]
    NonUtf8Path(PathBuf),
}

lazy_static! {
    pub static ref PROJECT_NAME: String = env!("CARGO_CRATE_NAME").to_uppercase().to_string();
    pub static ref DATA_FOLDER: Option<PathBuf> =
        env::var(format!("{}_DATA", PROJECT_NAME.clone()))
            .ok()
            .map(PathBuf::from);
    pub static ref CONFIG_FOLDER: Option<PathBuf> =
        env::var(format!("{}_CONFIG", PROJECT_NAME.clone()))
            .ok()
            .map(PathBuf::from);
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Settings {
    #[serde(default = "default_chromosome_column")]
    pub chromosome_column: String,
    #[serde(default = "default_position_column")]
    pub position_column: String,
    #[serde(default = "default_true")]
    pub auto_commit: bool,
    #[serde(default = "default_true")]
    pub count_refresh: bool,
    #[serde(default)]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub config_dir: PathBuf,
}

fn default_chromosome_column() -> String {
    DEFAULT_CHROMOSOME_COLUMN.to_string()
}

fn default_position_column() -> String {
    DEFAULT_POSITION_COLUMN.to_string()
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            chromosome_column: default_chromosome_column(),
            position_column: default_position_column(),
            auto_commit: true,
            count_refresh: true,
            data_dir: get_data_dir(),
            config_dir: get_config_dir(),
        }
    }
}

impl Settings {
    /// Load settings from embedded defaults, then the user file, then the
    /// environment.
    ///
    /// With no explicit path, `config.json5` in the config directory is read
    /// when it exists. An explicit path must exist.
    pub fn from_path(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        // Fail early on broken defaults rather than on a confusing merge error.
        json5::from_str::<Settings>(CONFIG)?;

        let data_dir = get_data_dir();
        let config_dir = get_config_dir();
        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(CONFIG, config::FileFormat::Json5))
            .set_default("data_dir", path_str(&data_dir)?)?
            .set_default("config_dir", path_str(&config_dir)?)?;

        builder = match config_path {
            Some(p) => builder.add_source(
                config::File::from(expand_tilde(p))
                    .format(config::FileFormat::Json5)
                    .required(true),
            ),
            None => builder.add_source(
                config::File::from(config_dir.join(CONFIG_FILE))
                    .format(config::FileFormat::Json5)
                    .required(false),
            ),
        };

        builder = builder.add_source(
            config::Environment::with_prefix(PROJECT_NAME.as_str()).try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }

    pub fn columns(&self) -> VariantColumns {
        VariantColumns {
            chromosome: self.chromosome_column.clone(),
            position: self.position_column.clone(),
        }
    }
}

fn path_str(path: &Path) -> Result<&str, ConfigError> {
    path.to_str()
        .ok_or_else(|| ConfigError::NonUtf8Path(path.to_path_buf()))
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(base) = BaseDirs::new() {
            return base.home_dir().join(rest);
        }
    }
    path.to_path_buf()
}

pub fn get_data_dir() -> PathBuf {
    if let Some(s) = DATA_FOLDER.clone() {
        s
    } else if let Some(base) = BaseDirs::new() {
        base.data_local_dir().join(env!("CARGO_PKG_NAME"))
    } else {
        PathBuf::from(".").join(".data")
    }
}

pub fn get_config_dir() -> PathBuf {
    if let Some(s) = CONFIG_FOLDER.clone() {
        s
    } else if let Some(base) = BaseDirs::new() {
        base.config_dir().join(env!("CARGO_PKG_NAME"))
    } else {
        PathBuf::from(".").join(".config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn embedded_defaults() {
        let settings: Settings = json5::from_str(CONFIG).unwrap();
        assert_eq!(settings.columns(), VariantColumns::default());
        assert!(settings.auto_commit);
        assert!(settings.count_refresh);
    }

    #[test]
    fn user_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".json5").tempfile().unwrap();
        writeln!(
            file,
            "{{ chromosome_column: 'chr', auto_commit: false, // batch edits\n}}"
        )
        .unwrap();

        let settings = Settings::from_path(Some(file.path())).unwrap();
        assert_eq!(settings.chromosome_column, "chr");
        assert_eq!(settings.position_column, DEFAULT_POSITION_COLUMN);
        assert!(!settings.auto_commit);
        assert!(settings.count_refresh);
    }

    #[test]
    fn explicit_file_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.json5");
        assert!(Settings::from_path(Some(&missing)).is_err());
    }

    #[test]
    fn tilde_expands_to_home() {
        let Some(base) = BaseDirs::new() else {
            return;
        };
        assert_eq!(
            expand_tilde(Path::new("~/filters.json5")),
            base.home_dir().join("filters.json5")
        );
        assert_eq!(expand_tilde(Path::new("/tmp/x")), PathBuf::from("/tmp/x"));
    }
}
