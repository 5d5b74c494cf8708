use crate::hardware_session::{BgoSettings, L1AParameters, BGO_CHANNEL_COUNT};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TriggerConfigError {
    #[error("L1A burst must be at least 1")]
    BurstTooSmall,

    #[error("Unknown L1A mode code {0}")]
    UnknownMode(u8),

    #[error("BGO channel {0} out of range, must be -1 (unused) or 0..=3")]
    ChannelOutOfRange(i8),

    #[error("BGO channel {0} is defined more than once")]
    DuplicateChannel(u8),

    #[error("At most 4 BGO channels can be defined, got {0}")]
    TooManyChannels(usize),
}

/// Pattern produced by the local L1A generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(try_from = "u8", into = "u8")]
pub enum L1AMode {
    /// One trigger every `period` orbits.
    #[default]
    PerOrbit,
    /// One trigger every `period` bunch crossings.
    PerBunchCrossing,
    /// Random triggers with mean spacing `period`.
    Random,
}

impl L1AMode {
    pub fn code(&self) -> u8 {
        match self {
            L1AMode::PerOrbit => 0,
            L1AMode::PerBunchCrossing => 1,
            L1AMode::Random => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            L1AMode::PerOrbit => "orbit",
            L1AMode::PerBunchCrossing => "bx",
            L1AMode::Random => "random",
        }
    }
}

impl TryFrom<u8> for L1AMode {
    type Error = TriggerConfigError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(L1AMode::PerOrbit),
            1 => Ok(L1AMode::PerBunchCrossing),
            2 => Ok(L1AMode::Random),
            other => Err(TriggerConfigError::UnknownMode(other)),
        }
    }
}

impl From<L1AMode> for u8 {
    fn from(mode: L1AMode) -> Self {
        mode.code()
    }
}

/// Local trigger settings of the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    pub local_l1a_enabled: bool,
    pub mode: L1AMode,
    pub burst: u32,
    pub periodic_period: u32,
    pub rules: u32,
    pub use_lemo: bool,
    pub send_burst_on_command: bool,
    pub start_continuous_on_command: bool,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            local_l1a_enabled: false,
            mode: L1AMode::PerOrbit,
            burst: 1,
            periodic_period: 1,
            rules: 0,
            use_lemo: false,
            send_burst_on_command: false,
            start_continuous_on_command: false,
        }
    }
}

impl TriggerConfig {
    /// Start from the defaults with the local generator switched on.
    pub fn local() -> Self {
        Self {
            local_l1a_enabled: true,
            ..Self::default()
        }
    }

    pub fn mode(mut self, mode: L1AMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn burst(mut self, burst: u32) -> Self {
        self.burst = burst;
        self
    }

    pub fn periodic_period(mut self, period: u32) -> Self {
        self.periodic_period = period;
        self
    }

    pub fn rules(mut self, rules: u32) -> Self {
        self.rules = rules;
        self
    }

    pub fn lemo(mut self) -> Self {
        self.use_lemo = true;
        self
    }

    pub fn burst_on_command(mut self) -> Self {
        self.send_burst_on_command = true;
        self
    }

    pub fn continuous_on_command(mut self) -> Self {
        self.start_continuous_on_command = true;
        self
    }

    pub fn validate(&self) -> Result<(), TriggerConfigError> {
        if self.burst < 1 {
            return Err(TriggerConfigError::BurstTooSmall);
        }
        Ok(())
    }

    /// Generator parameters as configured.
    pub fn l1a_parameters(&self) -> L1AParameters {
        self.l1a_parameters_with(self.local_l1a_enabled)
    }

    /// Generator parameters with the enable flag overridden.
    pub fn l1a_parameters_with(&self, enabled: bool) -> L1AParameters {
        L1AParameters {
            enabled,
            mode: self.mode.code(),
            burst: self.burst,
            period: self.periodic_period,
            rules: self.rules,
        }
    }
}

/// One BGO slot. `channel == -1` marks the slot unused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalChannel {
    pub channel: i8,
    pub command: u16,
    pub bunch_crossing: u16,
    pub prescale: u16,
    pub repeat: bool,
    pub is_long: bool,
}

impl Default for SignalChannel {
    fn default() -> Self {
        Self::unused()
    }
}

impl SignalChannel {
    pub const fn unused() -> Self {
        Self {
            channel: -1,
            command: 0,
            bunch_crossing: 0,
            prescale: 0,
            repeat: false,
            is_long: false,
        }
    }

    /// Begin a definition for `channel` with short encoding and no repeat.
    pub fn on(channel: u8) -> Self {
        Self {
            channel: i8::try_from(channel).unwrap_or(i8::MAX),
            ..Self::unused()
        }
    }

    pub fn command(mut self, command: u16) -> Self {
        self.command = command;
        self
    }

    pub fn bunch_crossing(mut self, bx: u16) -> Self {
        self.bunch_crossing = bx;
        self
    }

    pub fn prescale(mut self, prescale: u16) -> Self {
        self.prescale = prescale;
        self
    }

    pub fn repeating(mut self) -> Self {
        self.repeat = true;
        self
    }

    pub fn long(mut self) -> Self {
        self.is_long = true;
        self
    }

    pub fn is_used(&self) -> bool {
        self.channel >= 0
    }

    /// Channel number for a used slot.
    pub fn index(&self) -> Option<u8> {
        u8::try_from(self.channel).ok()
    }

    pub fn settings(&self) -> Option<BgoSettings> {
        self.index().map(|channel| BgoSettings {
            channel,
            command: self.command,
            bunch_crossing: self.bunch_crossing,
            prescale: self.prescale,
            repeat: self.repeat,
        })
    }
}

/// The fixed four-slot BGO table. Slot `n` only ever holds channel `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SignalConfig {
    slots: [SignalChannel; BGO_CHANNEL_COUNT as usize],
}

impl SignalConfig {
    /// All slots unused.
    pub fn new() -> Self {
        Self::default()
    }

    /// Place each definition in the slot matching its channel. Unused
    /// definitions are ignored.
    pub fn from_channels<I>(channels: I) -> Result<Self, TriggerConfigError>
    where
        I: IntoIterator<Item = SignalChannel>,
    {
        let channels: Vec<SignalChannel> = channels.into_iter().collect();
        if channels.len() > BGO_CHANNEL_COUNT as usize {
            return Err(TriggerConfigError::TooManyChannels(channels.len()));
        }

        let mut config = Self::new();
        for channel in channels {
            if !channel.is_used() {
                if channel.channel != -1 {
                    return Err(TriggerConfigError::ChannelOutOfRange(channel.channel));
                }
                continue;
            }
            let index = channel
                .index()
                .filter(|index| *index < BGO_CHANNEL_COUNT)
                .ok_or(TriggerConfigError::ChannelOutOfRange(channel.channel))?;
            let slot = &mut config.slots[usize::from(index)];
            if slot.is_used() {
                return Err(TriggerConfigError::DuplicateChannel(index));
            }
            *slot = channel;
        }
        Ok(config)
    }

    pub fn slots(&self) -> &[SignalChannel] {
        &self.slots
    }

    /// Used slots in slot order.
    pub fn used(&self) -> impl Iterator<Item = &SignalChannel> + '_ {
        self.slots.iter().filter(|slot| slot.is_used())
    }

    pub fn has_used(&self) -> bool {
        self.used().next().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_defaults() {
        let config = TriggerConfig::default();
        assert!(!config.local_l1a_enabled);
        assert_eq!(config.burst, 1);
        assert_eq!(config.periodic_period, 1);
        assert_eq!(config.mode, L1AMode::PerOrbit);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_trigger_builder_and_parameters() {
        let config = TriggerConfig::local()
            .mode(L1AMode::PerBunchCrossing)
            .burst(100)
            .periodic_period(400)
            .rules(2)
            .lemo();

        assert!(config.use_lemo);
        let params = config.l1a_parameters();
        assert_eq!(
            params,
            L1AParameters {
                enabled: true,
                mode: 1,
                burst: 100,
                period: 400,
                rules: 2,
            }
        );
        assert!(!config.l1a_parameters_with(false).enabled);
    }

    #[test]
    fn test_zero_burst_rejected() {
        let config = TriggerConfig::local().burst(0);
        assert_eq!(config.validate(), Err(TriggerConfigError::BurstTooSmall));
    }

    #[test]
    fn test_mode_codes() {
        for code in 0..3u8 {
            let mode = L1AMode::try_from(code).expect("known code");
            assert_eq!(mode.code(), code);
        }
        assert_eq!(
            L1AMode::try_from(7),
            Err(TriggerConfigError::UnknownMode(7))
        );
        assert_eq!(L1AMode::Random.as_str(), "random");
    }

    #[test]
    fn test_signal_config_places_channels_by_index() {
        let config = SignalConfig::from_channels([
            SignalChannel::on(2).command(0x2c).long(),
            SignalChannel::unused(),
            SignalChannel::on(0).command(0x14).bunch_crossing(3000),
        ])
        .expect("valid table");

        let slots = config.slots();
        assert_eq!(slots[0].channel, 0);
        assert_eq!(slots[0].bunch_crossing, 3000);
        assert!(!slots[1].is_used());
        assert_eq!(slots[2].channel, 2);
        assert!(slots[2].is_long);
        assert!(!slots[3].is_used());

        let order: Vec<i8> = config.used().map(|slot| slot.channel).collect();
        assert_eq!(order, vec![0, 2]);
    }

    #[test]
    fn test_signal_config_rejects_bad_tables() {
        assert_eq!(
            SignalConfig::from_channels([SignalChannel::on(4)]),
            Err(TriggerConfigError::ChannelOutOfRange(4))
        );
        assert_eq!(
            SignalConfig::from_channels([SignalChannel::on(1), SignalChannel::on(1)]),
            Err(TriggerConfigError::DuplicateChannel(1))
        );
        let negative = SignalChannel {
            channel: -3,
            ..SignalChannel::unused()
        };
        assert_eq!(
            SignalConfig::from_channels([negative]),
            Err(TriggerConfigError::ChannelOutOfRange(-3))
        );
        assert_eq!(
            SignalConfig::from_channels([SignalChannel::unused(); 5]),
            Err(TriggerConfigError::TooManyChannels(5))
        );
    }

    #[test]
    fn test_empty_table_has_no_used_slots() {
        let config = SignalConfig::new();
        assert!(!config.has_used());
        assert_eq!(config.slots().len(), 4);
        assert!(config.slots().iter().all(|slot| slot.settings().is_none()));
    }

    #[test]
    fn test_channel_settings() {
        let settings = SignalChannel::on(3)
            .command(0x1)
            .bunch_crossing(10)
            .prescale(5)
            .repeating()
            .settings()
            .expect("used slot");
        assert_eq!(settings.channel, 3);
        assert_eq!(settings.prescale, 5);
        assert!(settings.repeat);
    }
}
