use serde::Serialize;

/// Register holding the low word of the L1A counter on the T1 endpoint.
pub const L1A_COUNT_REGISTER: &str = "STATUS.GENERAL.L1A_COUNT_LO";

/// Register gating external (LEMO) triggers on the T1 endpoint.
pub const LEMO_GATE_REGISTER: &str = "CONF.TTC.T3_TRIG";

/// Number of BGO (broadcast) channels on the card.
pub const BGO_CHANNEL_COUNT: u8 = 4;

/// The two addressable halves of the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Endpoint {
    /// Control side (trigger, TTC, run control).
    T1,
    /// Data side (link and input handling).
    T2,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::T1 => "T1",
            Endpoint::T2 => "T2",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HardwareError {
    #[error("Unable to open card {card} using {locator}: {reason}")]
    Connection {
        locator: String,
        card: String,
        reason: String,
    },

    #[error("Bus access to {} failed: {reason}", endpoint.as_str())]
    Bus { endpoint: Endpoint, reason: String },

    #[error("Register {register} rejected the access: {reason}")]
    Register { register: String, reason: String },

    #[error("BGO channel {0} out of range (0..=3)")]
    InvalidChannel(u8),

    #[error("Card fault: {0}")]
    Card(String),
}

/// Parameters handed to the local L1A generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct L1AParameters {
    pub enabled: bool,
    pub mode: u8,
    pub burst: u32,
    pub period: u32,
    pub rules: u32,
}

/// One BGO channel as written to the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BgoSettings {
    pub channel: u8,
    pub command: u16,
    pub bunch_crossing: u16,
    pub prescale: u16,
    pub repeat: bool,
}

/// A BGO channel configuration as read back from the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BgoReadback {
    pub command: u16,
    pub bunch_crossing: u16,
    pub prescale: u16,
    pub repeat: bool,
    pub is_long: bool,
}

impl BgoReadback {
    /// Whether the card holds exactly what `settings` asked for.
    pub fn matches(&self, settings: &BgoSettings, is_long: bool) -> bool {
        self.command == settings.command
            && self.bunch_crossing == settings.bunch_crossing
            && self.prescale == settings.prescale
            && self.repeat == settings.repeat
            && self.is_long == is_long
    }
}

/// Snapshot of the card state used by the status pages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BoardStatus {
    pub l1a_count: u64,
    pub run_active: bool,
    pub local_l1a_enabled: bool,
    pub continuous_l1a_running: bool,
    pub lemo_gate: bool,
    pub enabled_bgo_mask: u8,
    pub fed_id: u16,
}

/// Exclusive handle to one physical card.
///
/// Every register-level operation of the manager goes through this trait. An
/// implementation wraps the bus driver; the operations are blocking and may
/// fail with a [`HardwareError`] at any point.
pub trait HardwareSession: Send {
    fn reset(&mut self, endpoint: Endpoint) -> Result<(), HardwareError>;

    /// Enable the AMC inputs selected by `mask` (bit n = slot n + 1).
    fn amc_input_enable(&mut self, mask: u32) -> Result<(), HardwareError>;

    fn enable_all_ttc(&mut self) -> Result<(), HardwareError>;

    fn fake_data_enable(&mut self, enable: bool) -> Result<(), HardwareError>;

    fn daq_link_enable(&mut self, enable: bool) -> Result<(), HardwareError>;

    fn sfp_output_enable(&mut self, mask: u32) -> Result<(), HardwareError>;

    fn local_ttc_signal_enable(&mut self, enable: bool) -> Result<(), HardwareError>;

    fn configure_local_l1a(&mut self, parameters: &L1AParameters) -> Result<(), HardwareError>;

    fn enable_local_l1a(&mut self, enable: bool) -> Result<(), HardwareError>;

    fn start_continuous_l1a(&mut self) -> Result<(), HardwareError>;

    fn stop_continuous_l1a(&mut self) -> Result<(), HardwareError>;

    fn send_l1a_burst(&mut self) -> Result<(), HardwareError>;

    fn configure_bgo_long(&mut self, settings: &BgoSettings) -> Result<(), HardwareError>;

    fn configure_bgo_short(&mut self, settings: &BgoSettings) -> Result<(), HardwareError>;

    fn bgo_config(&mut self, channel: u8) -> Result<BgoReadback, HardwareError>;

    fn enable_bgo(&mut self, channel: u8) -> Result<(), HardwareError>;

    fn disable_bgo(&mut self, channel: u8) -> Result<(), HardwareError>;

    /// Latch all enabled BGO channels at once.
    fn send_bgo(&mut self) -> Result<(), HardwareError>;

    fn mon_buf_back_press_enable(&mut self, enable: bool) -> Result<(), HardwareError>;

    fn configure_prescale(&mut self, mode: u8, factor: u32) -> Result<(), HardwareError>;

    fn set_fed_id(&mut self, fed_id: u16) -> Result<(), HardwareError>;

    fn reset_counters(&mut self) -> Result<(), HardwareError>;

    fn start_run(&mut self) -> Result<(), HardwareError>;

    fn end_run(&mut self) -> Result<(), HardwareError>;

    fn read(&mut self, endpoint: Endpoint, register: &str) -> Result<u64, HardwareError>;

    fn write(&mut self, endpoint: Endpoint, register: &str, value: u64)
        -> Result<(), HardwareError>;

    fn status(&mut self) -> Result<BoardStatus, HardwareError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_as_str() {
        assert_eq!(Endpoint::T1.as_str(), "T1");
        assert_eq!(Endpoint::T2.as_str(), "T2");
    }

    #[test]
    fn test_readback_matches_encoding_and_fields() {
        let settings = BgoSettings {
            channel: 2,
            command: 0x14,
            bunch_crossing: 500,
            prescale: 3,
            repeat: true,
        };
        let readback = BgoReadback {
            command: 0x14,
            bunch_crossing: 500,
            prescale: 3,
            repeat: true,
            is_long: true,
        };
        assert!(readback.matches(&settings, true));
        assert!(!readback.matches(&settings, false));

        let shifted = BgoReadback {
            bunch_crossing: 501,
            ..readback
        };
        assert!(!shifted.matches(&settings, true));
    }

    #[test]
    fn test_error_display_names_endpoint() {
        let err = HardwareError::Bus {
            endpoint: Endpoint::T2,
            reason: "no reply".to_string(),
        };
        assert_eq!(err.to_string(), "Bus access to T2 failed: no reply");
    }
}
