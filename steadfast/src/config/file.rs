//! INI configuration file.
//!
//! ```ini
//! [breaker]
//! failure_threshold = 5
//! recovery_timeout_ms = 30000
//! monitoring_window_ms = 60000
//! success_threshold = 2
//!
//! [recovery]
//! max_retry_attempts = 3
//! retry_delay_ms = 100
//! backoff_multiplier = 2.0
//! max_backoff_delay_ms = 5000
//!
//! [cache]
//! capacity = 1000
//! ttl_ms = none
//!
//! [throttle]
//! performance_budget_ms = 16
//! throttle_rate = 0.0
//! skip_floor = 0.0
//! sample_capacity = 100
//!
//! [dispatch]
//! timeout_ms = 5000
//! coalesce_in_flight = false
//!
//! [logging]
//! level = info
//! file = none
//! ansi = true
//! ```
//!
//! Missing sections and keys keep their defaults. Optional durations accept
//! `none` (or an empty value) to mean "unset".

use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::{Ini, Properties};

use super::EngineConfig;
use crate::error::ConfigError;
use crate::logging::LoggingConfig;

/// Directory under the platform config dir.
pub const CONFIG_DIR_NAME: &str = "steadfast";

/// File name inside [`CONFIG_DIR_NAME`].
pub const CONFIG_FILE_NAME: &str = "config.ini";

const NONE_VALUE: &str = "none";

/// Everything the INI file configures.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigFile {
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
}

impl ConfigFile {
    /// `<config dir>/steadfast/config.ini`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Load and validate `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_file(path).map_err(|source| ConfigError::Load {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_ini(&ini)
    }

    /// Like [`load`](Self::load), but a missing file yields defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse INI text.
    pub fn from_ini_str(text: &str) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_str(text).map_err(|err| ConfigError::Load {
            path: "<inline>".to_string(),
            source: ini::Error::Parse(err),
        })?;
        Self::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(section) = ini.section(Some("breaker")) {
            let breaker = &mut config.engine.breaker;
            read(section, "breaker", "failure_threshold", &mut breaker.failure_threshold)?;
            read_ms(section, "breaker", "recovery_timeout_ms", &mut breaker.recovery_timeout)?;
            read_ms(section, "breaker", "monitoring_window_ms", &mut breaker.monitoring_window)?;
            read(section, "breaker", "success_threshold", &mut breaker.success_threshold)?;
        }

        if let Some(section) = ini.section(Some("recovery")) {
            let recovery = &mut config.engine.recovery;
            read(section, "recovery", "max_retry_attempts", &mut recovery.max_attempts)?;
            read_ms(section, "recovery", "retry_delay_ms", &mut recovery.retry_delay)?;
            read(section, "recovery", "backoff_multiplier", &mut recovery.backoff_multiplier)?;
            read_ms(section, "recovery", "max_backoff_delay_ms", &mut recovery.max_backoff_delay)?;
        }

        if let Some(section) = ini.section(Some("cache")) {
            let cache = &mut config.engine.cache;
            read(section, "cache", "capacity", &mut cache.capacity)?;
            read_optional_ms(section, "cache", "ttl_ms", &mut cache.default_ttl)?;
        }

        if let Some(section) = ini.section(Some("throttle")) {
            let throttle = &mut config.engine.throttle;
            read_ms(
                section,
                "throttle",
                "performance_budget_ms",
                &mut throttle.performance_budget,
            )?;
            read(section, "throttle", "throttle_rate", &mut throttle.throttle_rate)?;
            read(section, "throttle", "skip_floor", &mut throttle.skip_floor)?;
            read(section, "throttle", "sample_capacity", &mut throttle.sample_capacity)?;
        }

        if let Some(section) = ini.section(Some("dispatch")) {
            let dispatch = &mut config.engine.dispatch;
            read_optional_ms(section, "dispatch", "timeout_ms", &mut dispatch.default_timeout)?;
            read(section, "dispatch", "coalesce_in_flight", &mut dispatch.coalesce_in_flight)?;
        }

        if let Some(section) = ini.section(Some("logging")) {
            let logging = &mut config.logging;
            if let Some(level) = section.get("level") {
                logging.level = level.trim().to_string();
            }
            if let Some(file) = section.get("file") {
                let file = file.trim();
                logging.file = if file.is_empty() || file.eq_ignore_ascii_case(NONE_VALUE) {
                    None
                } else {
                    Some(PathBuf::from(file))
                };
            }
            read(section, "logging", "ansi", &mut logging.ansi)?;
        }

        config.engine.validate()?;
        Ok(config)
    }

    /// Render as an [`Ini`] document.
    pub fn to_ini(&self) -> Ini {
        let engine = &self.engine;
        let mut ini = Ini::new();

        ini.with_section(Some("breaker"))
            .set("failure_threshold", engine.breaker.failure_threshold.to_string())
            .set("recovery_timeout_ms", millis(engine.breaker.recovery_timeout))
            .set("monitoring_window_ms", millis(engine.breaker.monitoring_window))
            .set("success_threshold", engine.breaker.success_threshold.to_string());

        ini.with_section(Some("recovery"))
            .set("max_retry_attempts", engine.recovery.max_attempts.to_string())
            .set("retry_delay_ms", millis(engine.recovery.retry_delay))
            .set("backoff_multiplier", format!("{:?}", engine.recovery.backoff_multiplier))
            .set("max_backoff_delay_ms", millis(engine.recovery.max_backoff_delay));

        ini.with_section(Some("cache"))
            .set("capacity", engine.cache.capacity.to_string())
            .set("ttl_ms", optional_millis(engine.cache.default_ttl));

        ini.with_section(Some("throttle"))
            .set("performance_budget_ms", millis(engine.throttle.performance_budget))
            .set("throttle_rate", format!("{:?}", engine.throttle.throttle_rate))
            .set("skip_floor", format!("{:?}", engine.throttle.skip_floor))
            .set("sample_capacity", engine.throttle.sample_capacity.to_string());

        ini.with_section(Some("dispatch"))
            .set("timeout_ms", optional_millis(engine.dispatch.default_timeout))
            .set("coalesce_in_flight", engine.dispatch.coalesce_in_flight.to_string());

        ini.with_section(Some("logging"))
            .set("level", self.logging.level.clone())
            .set(
                "file",
                self.logging
                    .file
                    .as_ref()
                    .map_or_else(|| NONE_VALUE.to_string(), |p| p.display().to_string()),
            )
            .set("ansi", self.logging.ansi.to_string());

        ini
    }

    /// The effective configuration as INI text.
    pub fn to_ini_string(&self) -> Result<String, ConfigError> {
        let mut buffer = Vec::new();
        self.to_ini()
            .write_to(&mut buffer)
            .map_err(ConfigError::Render)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    /// Write to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_error = |source| ConfigError::Write {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_error)?;
        }
        self.to_ini().write_to_file(path).map_err(write_error)
    }
}

fn parse<T>(section: &str, key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim().parse().map_err(|err: T::Err| {
        ConfigError::invalid(format!("{}.{}", section, key), format!("{:?}: {}", raw, err))
    })
}

fn read<T>(props: &Properties, section: &str, key: &str, target: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    if let Some(raw) = props.get(key) {
        *target = parse(section, key, raw)?;
    }
    Ok(())
}

fn read_ms(
    props: &Properties,
    section: &str,
    key: &str,
    target: &mut Duration,
) -> Result<(), ConfigError> {
    if let Some(raw) = props.get(key) {
        *target = Duration::from_millis(parse(section, key, raw)?);
    }
    Ok(())
}

fn read_optional_ms(
    props: &Properties,
    section: &str,
    key: &str,
    target: &mut Option<Duration>,
) -> Result<(), ConfigError> {
    if let Some(raw) = props.get(key) {
        let raw = raw.trim();
        *target = if raw.is_empty() || raw.eq_ignore_ascii_case(NONE_VALUE) {
            None
        } else {
            Some(Duration::from_millis(parse(section, key, raw)?))
        };
    }
    Ok(())
}

fn millis(duration: Duration) -> String {
    duration.as_millis().to_string()
}

fn optional_millis(duration: Option<Duration>) -> String {
    duration.map_or_else(|| NONE_VALUE.to_string(), millis)
}
