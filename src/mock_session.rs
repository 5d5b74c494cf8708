//! In-memory stand-in for an AMC13 card.
//!
//! [`MockBoard`] is a cheap, cloneable handle to the simulated card state. It
//! records every board operation in issue order, tracks the trigger and BGO
//! state the way the firmware would, and can be told to fail specific
//! operations. [`MockFactory`] hands out [`MockSession`]s bound to one board,
//! and [`MockUpstream`] collects outbound notifications.

use crate::card_connector::{CardIdentity, SessionFactory};
use crate::command_gateway::{NotifyError, Upstream};
use crate::hardware_session::{
    BgoReadback, BgoSettings, BoardStatus, Endpoint, HardwareError, HardwareSession,
    L1AParameters, BGO_CHANNEL_COUNT, L1A_COUNT_REGISTER, LEMO_GATE_REGISTER,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One operation issued against the board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoardOp {
    Reset(Endpoint),
    AmcInputEnable(u32),
    EnableAllTtc,
    FakeDataEnable(bool),
    DaqLinkEnable(bool),
    SfpOutputEnable(u32),
    LocalTtcSignalEnable(bool),
    ConfigureLocalL1A(L1AParameters),
    EnableLocalL1A(bool),
    StartContinuousL1A,
    StopContinuousL1A,
    SendL1ABurst,
    ConfigureBgoLong(BgoSettings),
    ConfigureBgoShort(BgoSettings),
    ReadBgoConfig(u8),
    EnableBgo(u8),
    DisableBgo(u8),
    SendBgo,
    MonBufBackPressEnable(bool),
    ConfigurePrescale { mode: u8, factor: u32 },
    SetFedId(u16),
    ResetCounters,
    StartRun,
    EndRun,
    Read(Endpoint, String),
    Write(Endpoint, String, u64),
    Status,
}

impl BoardOp {
    /// Stable name used for failure injection.
    pub fn name(&self) -> &'static str {
        match self {
            BoardOp::Reset(_) => "reset",
            BoardOp::AmcInputEnable(_) => "amc_input_enable",
            BoardOp::EnableAllTtc => "enable_all_ttc",
            BoardOp::FakeDataEnable(_) => "fake_data_enable",
            BoardOp::DaqLinkEnable(_) => "daq_link_enable",
            BoardOp::SfpOutputEnable(_) => "sfp_output_enable",
            BoardOp::LocalTtcSignalEnable(_) => "local_ttc_signal_enable",
            BoardOp::ConfigureLocalL1A(_) => "configure_local_l1a",
            BoardOp::EnableLocalL1A(_) => "enable_local_l1a",
            BoardOp::StartContinuousL1A => "start_continuous_l1a",
            BoardOp::StopContinuousL1A => "stop_continuous_l1a",
            BoardOp::SendL1ABurst => "send_l1a_burst",
            BoardOp::ConfigureBgoLong(_) => "configure_bgo_long",
            BoardOp::ConfigureBgoShort(_) => "configure_bgo_short",
            BoardOp::ReadBgoConfig(_) => "bgo_config",
            BoardOp::EnableBgo(_) => "enable_bgo",
            BoardOp::DisableBgo(_) => "disable_bgo",
            BoardOp::SendBgo => "send_bgo",
            BoardOp::MonBufBackPressEnable(_) => "mon_buf_back_press_enable",
            BoardOp::ConfigurePrescale { .. } => "configure_prescale",
            BoardOp::SetFedId(_) => "set_fed_id",
            BoardOp::ResetCounters => "reset_counters",
            BoardOp::StartRun => "start_run",
            BoardOp::EndRun => "end_run",
            BoardOp::Read(..) => "read",
            BoardOp::Write(..) => "write",
            BoardOp::Status => "status",
        }
    }

    /// BGO channel touched by a channel-specific operation.
    pub fn bgo_channel(&self) -> Option<u8> {
        match self {
            BoardOp::ConfigureBgoLong(settings) | BoardOp::ConfigureBgoShort(settings) => {
                Some(settings.channel)
            }
            BoardOp::ReadBgoConfig(channel)
            | BoardOp::EnableBgo(channel)
            | BoardOp::DisableBgo(channel) => Some(*channel),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct Board {
    operations: Vec<BoardOp>,
    failing: HashSet<&'static str>,
    registers: HashMap<String, u64>,
    bgo: [Option<BgoReadback>; BGO_CHANNEL_COUNT as usize],
    bgo_enabled: [bool; BGO_CHANNEL_COUNT as usize],
    l1a_count: u64,
    local_l1a_enabled: bool,
    continuous_running: bool,
    lemo_gate: bool,
    run_active: bool,
    fed_id: u16,
    exclusion_violations: u32,
    live_sessions: usize,
    opened_sessions: usize,
}

impl Board {
    fn check_channel(channel: u8) -> Result<usize, HardwareError> {
        if channel < BGO_CHANNEL_COUNT {
            Ok(usize::from(channel))
        } else {
            Err(HardwareError::InvalidChannel(channel))
        }
    }

    fn set_lemo_gate(&mut self, asserted: bool) {
        if asserted && self.continuous_running {
            self.exclusion_violations += 1;
        }
        self.lemo_gate = asserted;
    }
}

/// Shared handle to a simulated card.
#[derive(Debug, Clone, Default)]
pub struct MockBoard {
    inner: Arc<Mutex<Board>>,
}

impl MockBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session on this board directly.
    pub fn session(&self) -> MockSession {
        let mut board = self.inner.lock();
        board.live_sessions += 1;
        board.opened_sessions += 1;
        MockSession {
            board: self.clone(),
        }
    }

    pub fn operations(&self) -> Vec<BoardOp> {
        self.inner.lock().operations.clone()
    }

    pub fn clear_operations(&self) {
        self.inner.lock().operations.clear();
    }

    /// Make every subsequent operation called `name` fail.
    pub fn fail_on(&self, name: &'static str) {
        self.inner.lock().failing.insert(name);
    }

    pub fn clear_failures(&self) {
        self.inner.lock().failing.clear();
    }

    pub fn set_l1a_count(&self, count: u64) {
        self.inner.lock().l1a_count = count;
    }

    pub fn add_triggers(&self, triggers: u64) {
        let mut board = self.inner.lock();
        board.l1a_count = board.l1a_count.saturating_add(triggers);
    }

    pub fn l1a_count(&self) -> u64 {
        self.inner.lock().l1a_count
    }

    pub fn lemo_gate(&self) -> bool {
        self.inner.lock().lemo_gate
    }

    pub fn continuous_running(&self) -> bool {
        self.inner.lock().continuous_running
    }

    pub fn local_l1a_enabled(&self) -> bool {
        self.inner.lock().local_l1a_enabled
    }

    pub fn run_active(&self) -> bool {
        self.inner.lock().run_active
    }

    pub fn bgo_enabled(&self, channel: u8) -> bool {
        self.inner
            .lock()
            .bgo_enabled
            .get(usize::from(channel))
            .copied()
            .unwrap_or(false)
    }

    /// What the card holds for `channel`, `None` until it is configured.
    pub fn bgo_config(&self, channel: u8) -> Option<BgoReadback> {
        self.inner
            .lock()
            .bgo
            .get(usize::from(channel))
            .copied()
            .flatten()
    }

    /// Times the continuous generator and the LEMO gate were active together.
    pub fn exclusion_violations(&self) -> u32 {
        self.inner.lock().exclusion_violations
    }

    /// Sessions opened and not yet dropped.
    pub fn live_sessions(&self) -> usize {
        self.inner.lock().live_sessions
    }

    pub fn opened_sessions(&self) -> usize {
        self.inner.lock().opened_sessions
    }

    fn apply<T>(
        &self,
        op: BoardOp,
        effect: impl FnOnce(&mut Board) -> Result<T, HardwareError>,
    ) -> Result<T, HardwareError> {
        let mut board = self.inner.lock();
        let name = op.name();
        board.operations.push(op);
        if board.failing.contains(name) {
            return Err(HardwareError::Bus {
                endpoint: Endpoint::T1,
                reason: format!("injected failure in {name}"),
            });
        }
        effect(&mut board)
    }
}

/// Session bound to a [`MockBoard`].
#[derive(Debug)]
pub struct MockSession {
    board: MockBoard,
}

impl Drop for MockSession {
    fn drop(&mut self) {
        let mut board = self.board.inner.lock();
        board.live_sessions = board.live_sessions.saturating_sub(1);
    }
}

impl HardwareSession for MockSession {
    fn reset(&mut self, endpoint: Endpoint) -> Result<(), HardwareError> {
        self.board.apply(BoardOp::Reset(endpoint), |_| Ok(()))
    }

    fn amc_input_enable(&mut self, mask: u32) -> Result<(), HardwareError> {
        self.board.apply(BoardOp::AmcInputEnable(mask), |_| Ok(()))
    }

    fn enable_all_ttc(&mut self) -> Result<(), HardwareError> {
        self.board.apply(BoardOp::EnableAllTtc, |_| Ok(()))
    }

    fn fake_data_enable(&mut self, enable: bool) -> Result<(), HardwareError> {
        self.board.apply(BoardOp::FakeDataEnable(enable), |_| Ok(()))
    }

    fn daq_link_enable(&mut self, enable: bool) -> Result<(), HardwareError> {
        self.board.apply(BoardOp::DaqLinkEnable(enable), |_| Ok(()))
    }

    fn sfp_output_enable(&mut self, mask: u32) -> Result<(), HardwareError> {
        self.board.apply(BoardOp::SfpOutputEnable(mask), |_| Ok(()))
    }

    fn local_ttc_signal_enable(&mut self, enable: bool) -> Result<(), HardwareError> {
        self.board
            .apply(BoardOp::LocalTtcSignalEnable(enable), |_| Ok(()))
    }

    fn configure_local_l1a(&mut self, parameters: &L1AParameters) -> Result<(), HardwareError> {
        self.board
            .apply(BoardOp::ConfigureLocalL1A(*parameters), |_| Ok(()))
    }

    fn enable_local_l1a(&mut self, enable: bool) -> Result<(), HardwareError> {
        self.board.apply(BoardOp::EnableLocalL1A(enable), |board| {
            board.local_l1a_enabled = enable;
            Ok(())
        })
    }

    fn start_continuous_l1a(&mut self) -> Result<(), HardwareError> {
        self.board.apply(BoardOp::StartContinuousL1A, |board| {
            if board.lemo_gate {
                board.exclusion_violations += 1;
            }
            board.continuous_running = true;
            Ok(())
        })
    }

    fn stop_continuous_l1a(&mut self) -> Result<(), HardwareError> {
        self.board.apply(BoardOp::StopContinuousL1A, |board| {
            board.continuous_running = false;
            Ok(())
        })
    }

    fn send_l1a_burst(&mut self) -> Result<(), HardwareError> {
        self.board.apply(BoardOp::SendL1ABurst, |_| Ok(()))
    }

    fn configure_bgo_long(&mut self, settings: &BgoSettings) -> Result<(), HardwareError> {
        self.board
            .apply(BoardOp::ConfigureBgoLong(*settings), |board| {
                let slot = Board::check_channel(settings.channel)?;
                board.bgo[slot] = Some(BgoReadback {
                    command: settings.command,
                    bunch_crossing: settings.bunch_crossing,
                    prescale: settings.prescale,
                    repeat: settings.repeat,
                    is_long: true,
                });
                Ok(())
            })
    }

    fn configure_bgo_short(&mut self, settings: &BgoSettings) -> Result<(), HardwareError> {
        self.board
            .apply(BoardOp::ConfigureBgoShort(*settings), |board| {
                let slot = Board::check_channel(settings.channel)?;
                board.bgo[slot] = Some(BgoReadback {
                    command: settings.command,
                    bunch_crossing: settings.bunch_crossing,
                    prescale: settings.prescale,
                    repeat: settings.repeat,
                    is_long: false,
                });
                Ok(())
            })
    }

    fn bgo_config(&mut self, channel: u8) -> Result<BgoReadback, HardwareError> {
        self.board.apply(BoardOp::ReadBgoConfig(channel), |board| {
            let slot = Board::check_channel(channel)?;
            board.bgo[slot].ok_or_else(|| HardwareError::Register {
                register: format!("CONF.BGO{channel}"),
                reason: "channel never configured".to_string(),
            })
        })
    }

    fn enable_bgo(&mut self, channel: u8) -> Result<(), HardwareError> {
        self.board.apply(BoardOp::EnableBgo(channel), |board| {
            let slot = Board::check_channel(channel)?;
            board.bgo_enabled[slot] = true;
            Ok(())
        })
    }

    fn disable_bgo(&mut self, channel: u8) -> Result<(), HardwareError> {
        self.board.apply(BoardOp::DisableBgo(channel), |board| {
            let slot = Board::check_channel(channel)?;
            board.bgo_enabled[slot] = false;
            Ok(())
        })
    }

    fn send_bgo(&mut self) -> Result<(), HardwareError> {
        self.board.apply(BoardOp::SendBgo, |_| Ok(()))
    }

    fn mon_buf_back_press_enable(&mut self, enable: bool) -> Result<(), HardwareError> {
        self.board
            .apply(BoardOp::MonBufBackPressEnable(enable), |_| Ok(()))
    }

    fn configure_prescale(&mut self, mode: u8, factor: u32) -> Result<(), HardwareError> {
        self.board
            .apply(BoardOp::ConfigurePrescale { mode, factor }, |_| Ok(()))
    }

    fn set_fed_id(&mut self, fed_id: u16) -> Result<(), HardwareError> {
        self.board.apply(BoardOp::SetFedId(fed_id), |board| {
            board.fed_id = fed_id;
            Ok(())
        })
    }

    fn reset_counters(&mut self) -> Result<(), HardwareError> {
        self.board.apply(BoardOp::ResetCounters, |board| {
            board.l1a_count = 0;
            Ok(())
        })
    }

    fn start_run(&mut self) -> Result<(), HardwareError> {
        self.board.apply(BoardOp::StartRun, |board| {
            board.run_active = true;
            Ok(())
        })
    }

    fn end_run(&mut self) -> Result<(), HardwareError> {
        self.board.apply(BoardOp::EndRun, |board| {
            board.run_active = false;
            Ok(())
        })
    }

    fn read(&mut self, endpoint: Endpoint, register: &str) -> Result<u64, HardwareError> {
        self.board
            .apply(BoardOp::Read(endpoint, register.to_string()), |board| {
                if endpoint == Endpoint::T1 && register == L1A_COUNT_REGISTER {
                    return Ok(board.l1a_count);
                }
                Ok(board.registers.get(register).copied().unwrap_or(0))
            })
    }

    fn write(
        &mut self,
        endpoint: Endpoint,
        register: &str,
        value: u64,
    ) -> Result<(), HardwareError> {
        self.board.apply(
            BoardOp::Write(endpoint, register.to_string(), value),
            |board| {
                if endpoint == Endpoint::T1 && register == LEMO_GATE_REGISTER {
                    board.set_lemo_gate(value != 0);
                }
                board.registers.insert(register.to_string(), value);
                Ok(())
            },
        )
    }

    fn status(&mut self) -> Result<BoardStatus, HardwareError> {
        self.board.apply(BoardOp::Status, |board| {
            let enabled_bgo_mask = board
                .bgo_enabled
                .iter()
                .enumerate()
                .filter(|(_, enabled)| **enabled)
                .fold(0u8, |mask, (slot, _)| mask | (1 << slot));
            Ok(BoardStatus {
                l1a_count: board.l1a_count,
                run_active: board.run_active,
                local_l1a_enabled: board.local_l1a_enabled,
                continuous_l1a_running: board.continuous_running,
                lemo_gate: board.lemo_gate,
                enabled_bgo_mask,
                fed_id: board.fed_id,
            })
        })
    }
}

/// Factory opening [`MockSession`]s on one board.
#[derive(Debug, Default)]
pub struct MockFactory {
    board: MockBoard,
    refuse: AtomicBool,
}

impl MockFactory {
    pub fn new(board: MockBoard) -> Self {
        Self {
            board,
            refuse: AtomicBool::new(false),
        }
    }

    pub fn board(&self) -> &MockBoard {
        &self.board
    }

    /// Make `open` fail as if the card were unreachable.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::Relaxed);
    }
}

impl SessionFactory for MockFactory {
    fn open(&self, identity: &CardIdentity) -> Result<Box<dyn HardwareSession>, HardwareError> {
        if self.refuse.load(Ordering::Relaxed) {
            return Err(HardwareError::Connection {
                locator: identity.locator.clone(),
                card: identity.card_name.clone(),
                reason: "card not reachable".to_string(),
            });
        }
        Ok(Box::new(self.board.session()))
    }
}

/// Outcome the [`MockUpstream`] reports for the next sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendBehaviour {
    #[default]
    Deliver,
    Reject,
    TransportFailure,
}

#[derive(Debug, Default)]
struct UpstreamLog {
    commands: Vec<String>,
    errors: Vec<String>,
    behaviour: SendBehaviour,
}

/// Upstream coordinator that remembers what it was sent.
#[derive(Debug, Clone, Default)]
pub struct MockUpstream {
    inner: Arc<Mutex<UpstreamLog>>,
}

impl MockUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_behaviour(&self, behaviour: SendBehaviour) {
        self.inner.lock().behaviour = behaviour;
    }

    /// Commands handed to `send_command`, delivered or not.
    pub fn commands(&self) -> Vec<String> {
        self.inner.lock().commands.clone()
    }

    /// Messages of errors raised on the error channel.
    pub fn errors(&self) -> Vec<String> {
        self.inner.lock().errors.clone()
    }
}

impl Upstream for MockUpstream {
    fn send_command(&self, command: &str) -> Result<(), NotifyError> {
        let mut log = self.inner.lock();
        log.commands.push(command.to_string());
        match log.behaviour {
            SendBehaviour::Deliver => Ok(()),
            SendBehaviour::Reject => Err(NotifyError::Rejected {
                command: command.to_string(),
                reason: "coordinator refused the command".to_string(),
            }),
            SendBehaviour::TransportFailure => Err(NotifyError::Transport {
                command: command.to_string(),
                reason: "connection reset".to_string(),
            }),
        }
    }

    fn report_error(&self, error: &dyn std::error::Error) {
        self.inner.lock().errors.push(error.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sessions_are_counted() {
        let board = MockBoard::new();
        let first = board.session();
        let second = board.session();
        assert_eq!(board.live_sessions(), 2);
        drop(first);
        assert_eq!(board.live_sessions(), 1);
        drop(second);
        assert_eq!(board.live_sessions(), 0);
        assert_eq!(board.opened_sessions(), 2);
    }

    #[test]
    fn test_failure_injection_still_records() {
        let board = MockBoard::new();
        board.fail_on("send_bgo");
        let mut session = board.session();

        assert!(session.send_bgo().is_err());
        assert!(session.enable_bgo(1).is_ok());
        assert_eq!(
            board.operations(),
            vec![BoardOp::SendBgo, BoardOp::EnableBgo(1)]
        );

        board.clear_failures();
        assert!(session.send_bgo().is_ok());
    }

    #[test]
    fn test_exclusion_violation_is_detected() {
        let board = MockBoard::new();
        let mut session = board.session();

        session.write(Endpoint::T1, LEMO_GATE_REGISTER, 1).unwrap();
        session.start_continuous_l1a().unwrap();
        assert_eq!(board.exclusion_violations(), 1);

        session.write(Endpoint::T1, LEMO_GATE_REGISTER, 0).unwrap();
        session.write(Endpoint::T1, LEMO_GATE_REGISTER, 1).unwrap();
        assert_eq!(board.exclusion_violations(), 2);
    }

    #[test]
    fn test_counter_register_and_reset() {
        let board = MockBoard::new();
        let mut session = board.session();
        board.add_triggers(42);
        assert_eq!(session.read(Endpoint::T1, L1A_COUNT_REGISTER).unwrap(), 42);
        session.reset_counters().unwrap();
        assert_eq!(session.read(Endpoint::T1, L1A_COUNT_REGISTER).unwrap(), 0);
    }

    #[test]
    fn test_bgo_readback_and_status() {
        let board = MockBoard::new();
        let mut session = board.session();
        let settings = BgoSettings {
            channel: 3,
            command: 0x2c,
            bunch_crossing: 20,
            prescale: 1,
            repeat: false,
        };

        assert!(session.bgo_config(3).is_err());
        session.configure_bgo_short(&settings).unwrap();
        let readback = session.bgo_config(3).unwrap();
        assert!(readback.matches(&settings, false));

        session.enable_bgo(3).unwrap();
        session.enable_bgo(0).unwrap();
        let status = session.status().unwrap();
        assert_eq!(status.enabled_bgo_mask, 0b1001);
        assert!(matches!(
            session.enable_bgo(4),
            Err(HardwareError::InvalidChannel(4))
        ));
    }

    #[test]
    fn test_upstream_behaviours() {
        let upstream = MockUpstream::new();
        assert!(upstream.send_command("EndScanPoint").is_ok());
        upstream.set_behaviour(SendBehaviour::TransportFailure);
        assert!(matches!(
            upstream.send_command("EndScanPoint"),
            Err(NotifyError::Transport { .. })
        ));
        assert_eq!(upstream.commands().len(), 2);
    }
}
