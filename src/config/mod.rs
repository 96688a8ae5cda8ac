// Layered configuration: defaults <- optional TOML file <- environment
use serde::{Deserialize, Serialize};

use crate::dispatch::DispatchMode;
use crate::execution::ExecutorConfig;
use crate::signal::ValidatorConfig;
use crate::strategy::{FixedTargetConfig, TieredConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_secret: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
    /// Trade against the in-process paper venue instead of the live API
    #[serde(default = "default_paper")]
    pub paper: bool,
}

fn default_rest_url() -> String {
    crate::exchange::okx::OKX_REST_URL.to_string()
}

fn default_paper() -> bool {
    true
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_secret: None,
            passphrase: None,
            rest_url: default_rest_url(),
            paper: default_paper(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// parallel | sequential | selective
    #[serde(default = "default_mode")]
    pub mode: String,
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_mode() -> String {
    "parallel".to_string()
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            mode: default_mode(),
        }
    }
}

impl DispatcherConfig {
    pub fn dispatch_mode(&self) -> DispatchMode {
        match self.mode.to_lowercase().as_str() {
            "sequential" => DispatchMode::Sequential,
            "selective" => DispatchMode::Selective,
            _ => DispatchMode::Parallel,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub validator: ValidatorConfig,
    #[serde(default)]
    pub fixed_target: FixedTargetConfig,
    #[serde(default)]
    pub tiered: TieredConfig,
}

/// Load configuration.
///
/// Priority (highest to lowest): `REVERSEBOT__`-prefixed environment
/// variables, the optional TOML file, compiled-in defaults.
pub fn load(config_path: Option<&str>) -> crate::Result<AppConfig> {
    let mut builder = ::config::Config::builder();

    if let Some(path) = config_path {
        builder = builder.add_source(::config::File::with_name(path).required(false));
    }

    builder = builder.add_source(
        ::config::Environment::with_prefix("REVERSEBOT")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    Ok(config.try_deserialize()?)
}
