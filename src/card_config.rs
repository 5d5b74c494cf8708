//! Static card configuration.
//!
//! A [`CardConfig`] is read once at startup, usually from a TOML file, and
//! validated before it is handed to the
//! [`LifecycleController`](crate::lifecycle_controller::LifecycleController).
//!
//! ```rust
//! use amc13_manager::card_config::CardConfig;
//!
//! let config = CardConfig::from_toml_str(r#"
//!     connection_file = "connections.xml"
//!     card_name = "gem.shelf01.amc13"
//!     amc_input_enable_list = "1-4"
//!     enable_local_ttc = true
//!
//!     [local_trigger]
//!     local_l1a_enabled = true
//!     burst = 10
//!
//!     [[bgo]]
//!     channel = 0
//!     command = 0x14
//!     bunch_crossing = 3000
//! "#)?;
//! assert!(config.signal_config()?.has_used());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::card_connector::{CardConnector, CardIdentity, ConnectorError};
use crate::scan_timer::ScanType;
use crate::trigger_config::{SignalChannel, SignalConfig, TriggerConfig, TriggerConfigError};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable naming the directory that holds connection files.
pub const ADDRESS_TABLE_ENV: &str = "GEM_ADDRESS_TABLE_PATH";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unable to read configuration {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid trigger configuration: {0}")]
    Trigger(#[from] TriggerConfigError),

    #[error("Invalid slot list: {0}")]
    EnableList(#[from] ConnectorError),

    #[error("Scan of type {0} needs a trigger target of at least 1")]
    ScanTarget(&'static str),

    #[error("Card name must not be empty")]
    MissingCardName,
}

/// Scan parameters seeded from the configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    pub scan_type: ScanType,
    pub triggers: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CardConfig {
    /// Connection file, relative to `$GEM_ADDRESS_TABLE_PATH` when set.
    pub connection_file: String,
    pub card_name: String,
    pub amc_input_enable_list: String,
    /// Parsed and checked, not applied to the card.
    pub amc_ignore_tts_list: String,
    pub enable_daq_link: bool,
    pub enable_fake_data: bool,
    pub monitor_back_pressure: bool,
    pub enable_local_ttc: bool,
    pub local_trigger: TriggerConfig,
    pub bgo: Vec<SignalChannel>,
    pub prescale_factor: u32,
    pub bc_offset: u32,
    pub fed_id: u16,
    pub sfp_mask: u32,
    pub slot_mask: u32,
    pub scan: Option<ScanSettings>,
}

impl Default for CardConfig {
    fn default() -> Self {
        Self {
            connection_file: "connections.xml".to_string(),
            card_name: "amc13".to_string(),
            amc_input_enable_list: String::new(),
            amc_ignore_tts_list: String::new(),
            enable_daq_link: false,
            enable_fake_data: false,
            monitor_back_pressure: false,
            enable_local_ttc: false,
            local_trigger: TriggerConfig::default(),
            bgo: Vec::new(),
            prescale_factor: 0,
            bc_offset: 0,
            fed_id: 0,
            sfp_mask: 0,
            slot_mask: 0,
            scan: None,
        }
    }
}

impl CardConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        log::debug!("Loaded card configuration from {}", path.display());
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.card_name.trim().is_empty() {
            return Err(ConfigError::MissingCardName);
        }
        self.local_trigger.validate()?;
        self.signal_config()?;
        CardConnector::parse_input_enable_list(&self.amc_input_enable_list)?;
        CardConnector::parse_input_enable_list(&self.amc_ignore_tts_list)?;
        if let Some(scan) = &self.scan {
            if scan.scan_type != ScanType::None && scan.triggers < 1 {
                return Err(ConfigError::ScanTarget(scan.scan_type.as_str()));
            }
        }
        Ok(())
    }

    /// The BGO definitions arranged in the four-slot table.
    pub fn signal_config(&self) -> Result<SignalConfig, TriggerConfigError> {
        SignalConfig::from_channels(self.bgo.iter().copied())
    }

    /// Locator of the connection file, using the current environment.
    pub fn connection_locator(&self) -> String {
        expand_locator(
            std::env::var(ADDRESS_TABLE_ENV).ok().as_deref(),
            &self.connection_file,
        )
    }

    pub fn identity(&self) -> CardIdentity {
        CardIdentity::new(self.connection_locator(), self.card_name.clone())
    }
}

/// `file://<table path>/<file>` when the address table directory is known,
/// the file name with a literal `${GEM_ADDRESS_TABLE_PATH}` prefix otherwise.
pub fn expand_locator(table_path: Option<&str>, connection_file: &str) -> String {
    match table_path {
        Some(dir) if !dir.is_empty() => {
            format!("file://{}/{}", dir.trim_end_matches('/'), connection_file)
        }
        _ => format!("file://${{{ADDRESS_TABLE_ENV}}}/{connection_file}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger_config::L1AMode;

    const SAMPLE: &str = r#"
        connection_file = "connections_ch.xml"
        card_name = "gem.shelf01.amc13"
        amc_input_enable_list = "1-3,5"
        amc_ignore_tts_list = "2"
        enable_daq_link = true
        enable_local_ttc = true
        prescale_factor = 4
        fed_id = 1467
        sfp_mask = 1

        [local_trigger]
        local_l1a_enabled = true
        mode = 1
        burst = 20
        periodic_period = 400
        use_lemo = true

        [[bgo]]
        channel = 2
        command = 0x2c
        bunch_crossing = 1
        prescale = 1
        is_long = true

        [[bgo]]
        channel = 0
        command = 0x14
        bunch_crossing = 3000
        repeat = true

        [scan]
        scan_type = 2
        triggers = 1000
    "#;

    #[test]
    fn test_parse_full_config() {
        let config = CardConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.card_name, "gem.shelf01.amc13");
        assert_eq!(config.fed_id, 1467);
        assert!(config.enable_daq_link);
        assert!(!config.enable_fake_data);
        assert_eq!(config.local_trigger.mode, L1AMode::PerBunchCrossing);
        assert_eq!(config.local_trigger.burst, 20);
        assert!(config.local_trigger.use_lemo);

        let signals = config.signal_config().unwrap();
        let used: Vec<i8> = signals.used().map(|slot| slot.channel).collect();
        assert_eq!(used, vec![0, 2]);
        assert!(signals.slots()[2].is_long);

        let scan = config.scan.unwrap();
        assert_eq!(scan.scan_type, ScanType::Threshold);
        assert_eq!(scan.triggers, 1000);
    }

    #[test]
    fn test_defaults_for_missing_fields() {
        let config = CardConfig::from_toml_str("card_name = \"amc13\"").unwrap();
        assert_eq!(config.local_trigger, TriggerConfig::default());
        assert!(!config.signal_config().unwrap().has_used());
        assert!(config.scan.is_none());
    }

    #[test]
    fn test_rejects_invalid_values() {
        let zero_burst = "[local_trigger]\nburst = 0";
        assert!(matches!(
            CardConfig::from_toml_str(zero_burst),
            Err(ConfigError::Trigger(TriggerConfigError::BurstTooSmall))
        ));

        let bad_mode = "[local_trigger]\nmode = 9";
        assert!(matches!(
            CardConfig::from_toml_str(bad_mode),
            Err(ConfigError::Parse(_))
        ));

        let duplicate = "[[bgo]]\nchannel = 1\n[[bgo]]\nchannel = 1";
        assert!(matches!(
            CardConfig::from_toml_str(duplicate),
            Err(ConfigError::Trigger(TriggerConfigError::DuplicateChannel(1)))
        ));

        let bad_slots = "amc_input_enable_list = \"1-20\"";
        assert!(matches!(
            CardConfig::from_toml_str(bad_slots),
            Err(ConfigError::EnableList(_))
        ));

        let no_target = "[scan]\nscan_type = 3";
        assert!(matches!(
            CardConfig::from_toml_str(no_target),
            Err(ConfigError::ScanTarget("scurve"))
        ));

        let no_name = "card_name = \"\"";
        assert!(matches!(
            CardConfig::from_toml_str(no_name),
            Err(ConfigError::MissingCardName)
        ));
    }

    #[test]
    fn test_expand_locator() {
        assert_eq!(
            expand_locator(Some("/opt/xhal/etc/"), "connections.xml"),
            "file:///opt/xhal/etc/connections.xml"
        );
        assert_eq!(
            expand_locator(None, "connections.xml"),
            "file://${GEM_ADDRESS_TABLE_PATH}/connections.xml"
        );
        assert_eq!(
            expand_locator(Some(""), "c.xml"),
            "file://${GEM_ADDRESS_TABLE_PATH}/c.xml"
        );
    }

    #[test]
    fn test_load_missing_file() {
        let result = CardConfig::load("/nonexistent/amc13.toml");
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
