//! Stakenode App
//!
//! Unified initialization for stakenode services: logging + settings, and the
//! node daemon built on top of them.

pub mod config;
pub mod daemon;

use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};
use stakenode_logging::LogLevel;
use stakenode_settings::{Settings, SettingsError, Validate};
use thiserror::Error;
use tracing::info;

pub use config::{NodeConfig, SchedulerConfig};
pub use daemon::{NodeDaemon, NodeServices};

/// Errors from building the app or the daemon.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Settings error: {0}")]
    SettingsError(#[from] SettingsError),
    #[error("node_address is not configured")]
    MissingNodeAddress,
}

/// Application type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppType {
    Cli,
    Daemon,
}

impl AppType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Cli => "CLI",
            Self::Daemon => "Daemon",
        }
    }
}

/// Initialized application context
pub struct App<T> {
    /// Service name; also the settings directory name.
    pub service: String,
    pub app_type: AppType,
    /// Loaded and validated settings.
    pub settings: Settings<T>,
}

impl App<NodeConfig> {
    /// Build the daemon from the loaded settings.
    pub fn into_daemon(self, services: NodeServices) -> Result<NodeDaemon, AppError> {
        NodeDaemon::new(&self.settings.config, services)
    }
}

/// Builder for constructing an App with configurable options.
pub struct AppBuilder<T> {
    service: String,
    app_type: AppType,
    log_level: Option<LogLevel>,
    skip_logging: bool,
    skip_banner: bool,
    config_path: Option<String>,
    _phantom: std::marker::PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned + Default + Validate> AppBuilder<T> {
    /// Builder for `service`, defaulting to a daemon with logging and banner.
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
            app_type: AppType::Daemon,
            log_level: None,
            skip_logging: false,
            skip_banner: false,
            config_path: None,
            _phantom: std::marker::PhantomData,
        }
    }

    pub fn app_type(mut self, app_type: AppType) -> Self {
        self.app_type = app_type;
        self
    }

    /// Overrides the level from the settings file.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = Some(level);
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        if verbose {
            self.log_level = Some(LogLevel::from_verbose(true));
        }
        self
    }

    pub fn skip_logging(mut self) -> Self {
        self.skip_logging = true;
        self
    }

    pub fn skip_banner(mut self) -> Self {
        self.skip_banner = true;
        self
    }

    /// Use this settings file instead of the default location.
    pub fn config_path(mut self, path: &str) -> Self {
        self.config_path = Some(path.to_string());
        self
    }

    /// Load settings, then initialize logging at `level_of(&config)` unless a
    /// level was set on the builder.
    pub fn build_with(self, level_of: impl FnOnce(&T) -> LogLevel) -> Result<App<T>, AppError> {
        let config_path = self.config_path.as_deref().map(Path::new);
        let settings: Settings<T> = Settings::load_or_default(&self.service, config_path)?;

        if !self.skip_logging {
            let level = self.log_level.unwrap_or_else(|| level_of(&settings.config));
            let _ = stakenode_logging::try_init(level);
        }

        if !self.skip_banner {
            info!(
                service = %self.service,
                version = env!("CARGO_PKG_VERSION"),
                app_type = self.app_type.name(),
                settings = %settings.path().display(),
                "starting"
            );
        }

        Ok(App {
            service: self.service,
            app_type: self.app_type,
            settings,
        })
    }

    /// Build with the default log level.
    pub fn build(self) -> Result<App<T>, AppError> {
        self.build_with(|_| LogLevel::default())
    }
}

impl AppBuilder<NodeConfig> {
    /// Build using the log level stored in the node settings.
    pub fn build_node(self) -> Result<App<NodeConfig>, AppError> {
        self.build_with(|config| config.log_level)
    }
}
