use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use strum::{Display, EnumString};

use crate::error::ConfigError;

const CONFIG_FILE: &str = "config.toml";
const SECRETS_FILE: &str = "secrets.toml";

pub const API_KEY_ENV: &str = "MONKCHAT_API_KEY";
pub const ASSISTANT_ID_ENV: &str = "MONKCHAT_ASSISTANT_ID";
pub const VECTOR_STORE_ID_ENV: &str = "MONKCHAT_VECTOR_STORE_ID";

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the assistants API
    pub base_url: String,

    /// How runs are driven to completion
    pub driver: DriverConfig,

    /// Personas the user can talk to, in display order
    pub personas: Vec<Persona>,

    /// UI preferences
    pub ui: UiConfig,

    /// monkchat home directory
    #[serde(skip)]
    pub home: PathBuf,
}

/// Whether replies are polled and replayed, or streamed as they are generated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DriveStrategy {
    #[default]
    Poll,
    Stream,
}

/// Run driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub strategy: DriveStrategy,
    pub poll_interval_ms: u64,
    pub max_polls: u32,
    pub timeout_secs: u64,
    pub typing_delay_ms: u64,
    pub request_timeout_secs: u64,
}

/// A named assistant role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Persona {
    pub name: String,
    pub icon: String,
    #[serde(default)]
    pub instructions: Option<String>,
}

/// UI configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    pub user_icon: String,
    pub show_greeting: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            strategy: DriveStrategy::Poll,
            poll_interval_ms: 500,
            max_polls: 120,
            timeout_secs: 60,
            typing_delay_ms: 20,
            request_timeout_secs: 60,
        }
    }
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            user_icon: "🧑🏻‍💻".to_string(),
            show_greeting: true,
        }
    }
}

impl Persona {
    pub fn new(name: impl Into<String>, icon: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            icon: icon.into(),
            instructions: None,
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }
}

/// The monks offered when the config file names none.
pub fn default_personas() -> Vec<Persona> {
    [
        ("스님AI", "🧘"),
        ("불교 경전 선생님", "📚"),
        ("선명상 전문가", "🧘‍♂️"),
        ("MZ스님", "🙏"),
    ]
    .into_iter()
    .map(|(name, icon)| {
        Persona::new(name, icon).with_instructions(format!(
            "당신은 {name}입니다. 불교의 가르침에 따라 답변해주세요."
        ))
    })
    .collect()
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("~"))
            .join(".monkchat");

        Config {
            base_url: "https://api.openai.com/v1".to_string(),
            driver: DriverConfig::default(),
            personas: default_personas(),
            ui: UiConfig::default(),
            home,
        }
    }
}

impl Config {
    /// Load configuration from `~/.monkchat/config.toml`
    pub fn load() -> Result<Self, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHome)?;
        Self::load_from(&home.join(".monkchat"))
    }

    /// Load configuration from a specific home directory, falling back to
    /// defaults when no config file exists there.
    pub fn load_from(home: &Path) -> Result<Self, ConfigError> {
        let config_path = home.join(CONFIG_FILE);

        let mut config = if config_path.exists() {
            let content = fs::read_to_string(&config_path).map_err(|source| ConfigError::Io {
                path: config_path.display().to_string(),
                source,
            })?;
            toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: config_path.display().to_string(),
                source,
            })?
        } else {
            Config::default()
        };

        if config.personas.is_empty() {
            config.personas = default_personas();
        }
        config.home = home.to_path_buf();

        Ok(config)
    }

    pub fn secrets_path(&self) -> PathBuf {
        self.home.join(SECRETS_FILE)
    }

    /// Look up a persona by name
    pub fn persona(&self, name: &str) -> Result<&Persona, ConfigError> {
        self.personas
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| ConfigError::UnknownPersona(name.to_string()))
    }

    /// Persona selected when the user names none
    pub fn default_persona(&self) -> Option<&Persona> {
        self.personas.first()
    }
}

/// Credentials and identifiers read from the secret store at startup.
#[derive(Clone)]
pub struct Secrets {
    pub api_key: String,
    pub assistant_id: String,
    pub vector_store_id: Option<String>,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("api_key", &"<redacted>")
            .field("assistant_id", &self.assistant_id)
            .field("vector_store_id", &self.vector_store_id)
            .finish()
    }
}

#[derive(Debug, Default, Deserialize)]
struct SecretsFile {
    #[serde(default)]
    openai: RawSecrets,
}

#[derive(Debug, Default, Deserialize)]
struct RawSecrets {
    api_key: Option<String>,
    assistant_id: Option<String>,
    vector_store_id: Option<String>,
}

impl Secrets {
    /// Load secrets from the secret file, with environment variables taking precedence
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::resolve(path, |key| std::env::var(key).ok())
    }

    /// Resolve secrets from `path` and an environment lookup.
    ///
    /// A missing file is not an error on its own; a missing required value is.
    pub fn resolve(
        path: &Path,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let file = if path.exists() {
            let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })?;
            toml::from_str::<SecretsFile>(&content).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?
        } else {
            SecretsFile::default()
        };

        let present = |v: String| {
            let v = v.trim().to_string();
            (!v.is_empty()).then_some(v)
        };
        // A blank variable does not hide the file value.
        let pick = |env_key: &str, from_file: Option<String>| {
            env(env_key)
                .and_then(present)
                .or_else(|| from_file.and_then(present))
        };
        let missing = |key: &'static str, var: &'static str| ConfigError::MissingSecret {
            key,
            env: var,
            path: path.display().to_string(),
        };

        let raw = file.openai;
        Ok(Secrets {
            api_key: pick(API_KEY_ENV, raw.api_key)
                .ok_or_else(|| missing("api_key", API_KEY_ENV))?,
            assistant_id: pick(ASSISTANT_ID_ENV, raw.assistant_id)
                .ok_or_else(|| missing("assistant_id", ASSISTANT_ID_ENV))?,
            vector_store_id: pick(VECTOR_STORE_ID_ENV, raw.vector_store_id),
        })
    }
}
