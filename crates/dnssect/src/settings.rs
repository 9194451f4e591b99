use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

pub const SETTINGS_FILE_NAME: &str = ".dnssect.yaml";

/// Settings from the settings file and the environment.  Command-line
/// flags override all of these.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Default)]
pub struct Settings {
    pub database: Option<String>,
    #[serde(default)]
    pub resolvers: Resolvers,
    pub concurrent: Option<usize>,
    /// Seconds.
    pub timeout: Option<u64>,
    pub max_attempts: Option<usize>,
    pub transport: Option<String>,
    /// Zone name to primary server, for zone transfers.
    #[serde(default)]
    pub zones: HashMap<String, String>,
}

/// Resolvers can be given as a list, or as one comma-separated string
/// (which is the only way to give them in the environment).
#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Resolvers {
    Many(Vec<String>),
    One(String),
}

impl Default for Resolvers {
    fn default() -> Self {
        Resolvers::Many(Vec::new())
    }
}

impl Resolvers {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Resolvers::Many(resolvers) => resolvers.clone(),
            Resolvers::One(resolvers) => resolvers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
        }
    }
}

impl Settings {
    /// Load settings from `path` if given (it must then exist), or else
    /// from `$HOME/.dnssect.yaml` and `./.dnssect.yaml` if they exist.
    /// `DNSSECT_*` environment variables override the file.
    pub fn new(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml));
        } else {
            if let Some(home) = env::var_os("HOME") {
                let home_file = PathBuf::from(home).join(SETTINGS_FILE_NAME);
                builder = builder.add_source(
                    File::from(home_file)
                        .format(FileFormat::Yaml)
                        .required(false),
                );
            }
            builder = builder.add_source(
                File::from(Path::new(SETTINGS_FILE_NAME))
                    .format(FileFormat::Yaml)
                    .required(false),
            );
        }

        builder
            .add_source(Environment::with_prefix("DNSSECT"))
            .build()?
            .try_deserialize()
    }

    /// The primary server of a zone, looked up with and without the
    /// trailing dot.
    pub fn zone_server(&self, zone: &str) -> Option<&str> {
        let bare = zone.trim_end_matches('.');
        self.zones
            .get(zone)
            .or_else(|| self.zones.get(bare))
            .or_else(|| self.zones.get(&format!("{bare}.")))
            .map(String::as_str)
    }
}
