use crate::card_config::{CardConfig, ConfigError};
use crate::card_connector::{CardConnector, CardIdentity, ConnectorError, SessionFactory};
use crate::command_gateway::{NotifyError, Upstream, END_SCAN_POINT};
use crate::hardware_session::{
    BoardStatus, Endpoint, HardwareError, HardwareSession, BGO_CHANNEL_COUNT, L1A_COUNT_REGISTER,
    LEMO_GATE_REGISTER,
};
use crate::scan_timer::{ScanState, ScanTimer, ScanTimerError, ScanType};
use crate::trigger_config::{SignalConfig, TriggerConfig};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Settling time after a T1 reset and after dropping the session.
const SETTLE_DELAY: Duration = Duration::from_micros(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LifecycleState {
    Halted,
    Initialized,
    Configured,
    Running,
    Paused,
    Failed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Halted => "Halted",
            LifecycleState::Initialized => "Initialized",
            LifecycleState::Configured => "Configured",
            LifecycleState::Running => "Running",
            LifecycleState::Paused => "Paused",
            LifecycleState::Failed => "Failed",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle actions invoked by the hosting framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Initialize,
    Configure,
    Start,
    Pause,
    Resume,
    Stop,
    Halt,
    Reset,
    Fail,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Initialize => "initialize",
            Action::Configure => "configure",
            Action::Start => "start",
            Action::Pause => "pause",
            Action::Resume => "resume",
            Action::Stop => "stop",
            Action::Halt => "halt",
            Action::Reset => "reset",
            Action::Fail => "fail",
        }
    }

    pub fn allowed_from(&self, state: LifecycleState) -> bool {
        use LifecycleState::{Configured, Halted, Initialized, Paused, Running};
        match self {
            Action::Initialize => state == Halted,
            Action::Configure => matches!(state, Initialized | Configured),
            Action::Start => state == Configured,
            Action::Pause => state == Running,
            Action::Resume => state == Paused,
            Action::Stop => matches!(state, Running | Paused),
            Action::Halt => matches!(state, Halted | Initialized | Configured),
            Action::Reset | Action::Fail => true,
        }
    }

    pub fn target(&self) -> LifecycleState {
        match self {
            Action::Initialize => LifecycleState::Initialized,
            Action::Configure | Action::Stop => LifecycleState::Configured,
            Action::Start | Action::Resume => LifecycleState::Running,
            Action::Pause => LifecycleState::Paused,
            Action::Halt | Action::Reset => LifecycleState::Halted,
            Action::Fail => LifecycleState::Failed,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Unable to create AMC13 connection: {0}")]
    HardwareUnavailable(#[source] HardwareError),

    #[error("Problem during {operation}: {source}")]
    HardwareProblem {
        operation: &'static str,
        source: HardwareError,
    },

    #[error("{0}")]
    PreconditionNotMet(&'static str),

    #[error("Unable to send {command} upstream: {source}")]
    TransportFault {
        command: &'static str,
        source: NotifyError,
    },

    #[error("Cannot {action} while {from}")]
    InvalidTransition {
        action: Action,
        from: LifecycleState,
    },

    #[error("Invalid configuration: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Scan timer error: {0}")]
    ScanTimer(#[from] ScanTimerError),
}

impl ManagerError {
    /// Errors that leave the card in an unknown state.
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            ManagerError::HardwareProblem { .. } | ManagerError::ScanTimer(_)
        )
    }
}

trait HardwareContext<T> {
    fn during(self, operation: &'static str) -> Result<T, ManagerError>;
}

impl<T> HardwareContext<T> for Result<T, HardwareError> {
    fn during(self, operation: &'static str) -> Result<T, ManagerError> {
        self.map_err(|source| ManagerError::HardwareProblem { operation, source })
    }
}

/// Read-only snapshot for the status pages.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: LifecycleState,
    pub card_name: String,
    pub connected: bool,
    /// AMC inputs enabled at bring-up.
    pub slot_mask: u32,
    pub board: Option<BoardStatus>,
    pub trigger: TriggerConfig,
    pub scan: ScanState,
}

impl StatusReport {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Board settings that never change after construction.
#[derive(Debug, Clone)]
struct BoardSettings {
    identity: CardIdentity,
    input_enable_list: String,
    enable_daq_link: bool,
    enable_fake_data: bool,
    monitor_back_pressure: bool,
    enable_local_ttc: bool,
    prescale_factor: u32,
    fed_id: u16,
    sfp_mask: u32,
    signals: SignalConfig,
}

struct CardState {
    state: LifecycleState,
    session: Option<Box<dyn HardwareSession>>,
    /// Trigger settings applied to the card.
    trigger: TriggerConfig,
    /// Latest loaded trigger settings, picked up by Initialize and Configure.
    loaded_trigger: TriggerConfig,
    scan: ScanState,
    slot_mask: u32,
}

impl CardState {
    fn session(&mut self) -> Result<&mut (dyn HardwareSession + 'static), ManagerError> {
        self.session
            .as_deref_mut()
            .ok_or(ManagerError::PreconditionNotMet("AMC13 not yet connected"))
    }
}

/// State shared with the scan timer thread.
struct Core {
    settings: BoardSettings,
    card: Mutex<CardState>,
    upstream: Arc<dyn Upstream>,
}

/// Lifecycle state machine of one AMC13 card.
///
/// All access to the hardware session, from lifecycle actions, remote
/// commands, status reads and the scan timer, goes through one lock. The scan
/// timer handle has its own lock and is never stopped while the session lock
/// is held, so a tick in flight can always finish.
pub struct LifecycleController {
    core: Arc<Core>,
    factory: Arc<dyn SessionFactory>,
    timer: Mutex<ScanTimer>,
}

impl LifecycleController {
    pub fn new(
        config: &CardConfig,
        factory: Arc<dyn SessionFactory>,
        upstream: Arc<dyn Upstream>,
    ) -> Result<Self, ManagerError> {
        config.validate()?;
        let signals = config.signal_config().map_err(ConfigError::from)?;
        let settings = BoardSettings {
            identity: config.identity(),
            input_enable_list: config.amc_input_enable_list.clone(),
            enable_daq_link: config.enable_daq_link,
            enable_fake_data: config.enable_fake_data,
            monitor_back_pressure: config.monitor_back_pressure,
            enable_local_ttc: config.enable_local_ttc,
            prescale_factor: config.prescale_factor,
            fed_id: config.fed_id,
            sfp_mask: config.sfp_mask,
            signals,
        };
        let scan = config
            .scan
            .map(|scan| ScanState::new(scan.scan_type, scan.triggers))
            .unwrap_or_default();

        Ok(Self {
            core: Arc::new(Core {
                settings,
                card: Mutex::new(CardState {
                    state: LifecycleState::Halted,
                    session: None,
                    trigger: config.local_trigger,
                    loaded_trigger: config.local_trigger,
                    scan,
                    slot_mask: config.slot_mask,
                }),
                upstream,
            }),
            factory,
            timer: Mutex::new(ScanTimer::new()),
        })
    }

    /// Use a different scan poll period.
    pub fn with_scan_period(self, period: Duration) -> Self {
        *self.timer.lock() = ScanTimer::with_period(period);
        self
    }

    pub fn state(&self) -> LifecycleState {
        self.core.card.lock().state
    }

    pub fn has_session(&self) -> bool {
        self.core.card.lock().session.is_some()
    }

    pub fn card_name(&self) -> &str {
        &self.core.settings.identity.card_name
    }

    pub fn scan_timer_active(&self) -> bool {
        self.timer.lock().is_active()
    }

    pub fn trigger_config(&self) -> TriggerConfig {
        self.core.card.lock().trigger
    }

    pub fn status(&self) -> Result<StatusReport, ManagerError> {
        let mut card = self.core.card.lock();
        let board = match card.session.as_deref_mut() {
            Some(session) => Some(session.status().during("status read")?),
            None => None,
        };
        Ok(StatusReport {
            state: card.state,
            card_name: self.core.settings.identity.card_name.clone(),
            connected: board.is_some(),
            slot_mask: card.slot_mask,
            board,
            trigger: card.trigger,
            scan: card.scan,
        })
    }

    /// Set the scan type and per-point trigger target for the next Start.
    /// Rejected while a run is active or after a failure.
    pub fn set_scan(&self, scan_type: ScanType, target: u64) -> Result<(), ManagerError> {
        if scan_type != ScanType::None && target < 1 {
            return Err(ConfigError::ScanTarget(scan_type.as_str()).into());
        }
        let mut card = self.core.card.lock();
        if !matches!(
            card.state,
            LifecycleState::Halted | LifecycleState::Initialized | LifecycleState::Configured
        ) {
            log::warn!("Rejecting scan change while {}", card.state);
            return Err(ManagerError::PreconditionNotMet(
                "scan parameters can only change outside a run",
            ));
        }
        card.scan = ScanState {
            baseline_counter_value: card.scan.baseline_counter_value,
            ..ScanState::new(scan_type, target)
        };
        log::info!("Scan set to {} with {} triggers per point", scan_type.as_str(), target);
        Ok(())
    }

    /// Load new trigger settings. The burst size is applied by the next
    /// Configure, everything else by the next Initialize.
    pub fn update_trigger_config(&self, trigger: TriggerConfig) -> Result<(), ManagerError> {
        trigger.validate().map_err(ConfigError::from)?;
        self.core.card.lock().loaded_trigger = trigger;
        Ok(())
    }

    pub fn initialize(&self) -> Result<(), ManagerError> {
        self.transition(Action::Initialize, Self::initialize_card)
    }

    pub fn configure(&self) -> Result<(), ManagerError> {
        self.transition(Action::Configure, Self::configure_card)
    }

    pub fn start(&self) -> Result<(), ManagerError> {
        self.transition(Action::Start, Self::start_run)
    }

    pub fn pause(&self) -> Result<(), ManagerError> {
        self.transition(Action::Pause, Self::pause_run)
    }

    pub fn resume(&self) -> Result<(), ManagerError> {
        self.transition(Action::Resume, Self::resume_run)
    }

    pub fn stop(&self) -> Result<(), ManagerError> {
        self.transition(Action::Stop, Self::stop_run)
    }

    /// Nothing card specific happens on halt.
    pub fn halt(&self) -> Result<(), ManagerError> {
        self.transition(Action::Halt, |_| Ok(()))
    }

    /// Drop the session and return to `Halted`. Safe without a session.
    pub fn reset(&self) -> Result<(), ManagerError> {
        self.transition(Action::Reset, |this| {
            this.stop_active_scan_timer(Action::Reset);
            this.release_session();
            std::thread::sleep(SETTLE_DELAY);
            Ok(())
        })
    }

    /// Enter `Failed`: stop the scan timer and drop the session.
    pub fn fail(&self) -> Result<(), ManagerError> {
        self.transition(Action::Fail, |this| {
            this.stop_active_scan_timer(Action::Fail);
            this.release_session();
            Ok(())
        })
    }

    /// Send one L1A burst if bursts on command are enabled.
    ///
    /// Returns whether a burst was sent. Nothing touches the card when bursts
    /// are disabled.
    pub fn send_trigger_burst(&self) -> Result<bool, ManagerError> {
        let mut card = self.core.card.lock();
        let trigger = card.trigger;
        if !(trigger.local_l1a_enabled && trigger.send_burst_on_command) {
            log::debug!("Trigger burst requested but bursts on command are disabled");
            return Ok(false);
        }
        card.session()?.send_l1a_burst().during("send L1A burst")?;
        Ok(true)
    }

    pub fn enable_triggers(&self) -> Result<(), ManagerError> {
        let mut card = self.core.card.lock();
        let trigger = card.trigger;
        let session = card.session()?;

        if !trigger.start_continuous_on_command {
            session
                .enable_local_l1a(trigger.local_l1a_enabled)
                .during("enable local L1A")?;
            if trigger.use_lemo {
                set_lemo_gate(session, true)?;
            }
        }
        if trigger.local_l1a_enabled && trigger.start_continuous_on_command {
            if trigger.use_lemo {
                set_lemo_gate(session, true)?;
            } else {
                session
                    .start_continuous_l1a()
                    .during("start continuous L1A")?;
            }
        }
        Ok(())
    }

    pub fn disable_triggers(&self) -> Result<(), ManagerError> {
        let mut card = self.core.card.lock();
        let trigger = card.trigger;
        let session = card.session()?;

        if !trigger.start_continuous_on_command {
            // Switching to the local generator stops externally sourced triggers.
            session
                .enable_local_l1a(!trigger.local_l1a_enabled)
                .during("enable local L1A")?;
            if trigger.use_lemo {
                set_lemo_gate(session, false)?;
            }
        }
        if trigger.local_l1a_enabled && trigger.start_continuous_on_command {
            if trigger.use_lemo {
                set_lemo_gate(session, false)?;
            } else {
                session.stop_continuous_l1a().during("stop continuous L1A")?;
            }
        }
        Ok(())
    }

    fn transition<F>(&self, action: Action, body: F) -> Result<(), ManagerError>
    where
        F: FnOnce(&Self) -> Result<(), ManagerError>,
    {
        let span = tracing::info_span!(
            "lifecycle",
            action = action.as_str(),
            card = %self.core.settings.identity.card_name
        );
        let _entered = span.enter();

        let from = self.state();
        if !action.allowed_from(from) {
            log::warn!("Rejecting {} while {}", action, from);
            return Err(ManagerError::InvalidTransition { action, from });
        }

        log::debug!("Entering {} from {}", action, from);
        match body(self) {
            Ok(()) => {
                let to = action.target();
                self.core.card.lock().state = to;
                log::info!("AMC13 {}: {} -> {}", action, from, to);
                Ok(())
            }
            Err(err) => {
                log::error!("AMC13 {} failed: {}", action, err);
                if err.is_fault() {
                    self.core.card.lock().state = LifecycleState::Failed;
                    self.stop_active_scan_timer(action);
                }
                Err(err)
            }
        }
    }

    fn initialize_card(&self) -> Result<(), ManagerError> {
        let settings = &self.core.settings;

        {
            let mut card = self.core.card.lock();
            if card.session.take().is_some() {
                log::debug!("Dropping previous session before reconnecting");
            }
            card.trigger = card.loaded_trigger;

            let mut session = CardConnector::connect(self.factory.as_ref(), &settings.identity)
                .map_err(ManagerError::HardwareUnavailable)?;
            let bring_up = CardConnector::bring_up(&mut *session, &settings.input_enable_list);
            card.session = Some(session);
            card.slot_mask = bring_up.map_err(|err| match err {
                ConnectorError::Hardware(source) => ManagerError::HardwareProblem {
                    operation: "preinit",
                    source,
                },
                other => ManagerError::Configuration(ConfigError::EnableList(other)),
            })?;
        }

        let mut card = self.core.card.lock();
        let trigger = card.trigger;
        let session = card.session()?;
        log::debug!(
            "Enabling DAQ link with fake data {} and SFP mask 0x{:x}",
            settings.enable_fake_data,
            settings.sfp_mask
        );
        session
            .fake_data_enable(settings.enable_fake_data)
            .during("fake data enable")?;
        session
            .daq_link_enable(settings.enable_daq_link)
            .during("DAQ link enable")?;
        session
            .sfp_output_enable(settings.sfp_mask)
            .during("SFP output enable")?;
        session
            .local_ttc_signal_enable(settings.enable_local_ttc)
            .during("local TTC enable")?;
        session
            .configure_local_l1a(&trigger.l1a_parameters())
            .during("configure local L1A")?;
        session
            .enable_local_l1a(trigger.local_l1a_enabled)
            .during("enable local L1A")?;
        disable_all_bgo(session)?;
        session
            .mon_buf_back_press_enable(settings.monitor_back_pressure)
            .during("back pressure monitor enable")?;
        session
            .configure_prescale(0, settings.prescale_factor)
            .during("configure prescale")?;
        session.set_fed_id(settings.fed_id).during("set FED id")?;
        session.reset(Endpoint::T1).during("T1 reset")?;
        session.reset_counters().during("counter reset")?;
        Ok(())
    }

    fn configure_card(&self) -> Result<(), ManagerError> {
        let settings = &self.core.settings;

        let trigger = {
            let mut card = self.core.card.lock();
            if card.trigger.local_l1a_enabled {
                card.trigger.burst = card.loaded_trigger.burst;
            }
            let trigger = card.trigger;
            card.session()?
                .configure_local_l1a(&trigger.l1a_parameters())
                .during("configure local L1A")?;
            trigger
        };

        if settings.enable_local_ttc {
            log::debug!("Configuring BGO channels");
            for slot in settings.signals.used() {
                let Some(bgo) = slot.settings() else { continue };
                {
                    let mut card = self.core.card.lock();
                    let session = card.session()?;
                    if slot.is_long {
                        session.configure_bgo_long(&bgo).during("configure BGO")?;
                    } else {
                        session.configure_bgo_short(&bgo).during("configure BGO")?;
                    }
                }

                let readback = self
                    .core
                    .card
                    .lock()
                    .session()?
                    .bgo_config(bgo.channel)
                    .during("BGO readback")?;
                if readback.matches(&bgo, slot.is_long) {
                    log::debug!("BGO channel {} verified", bgo.channel);
                } else {
                    log::warn!(
                        "BGO channel {} readback {:?} differs from {:?}",
                        bgo.channel,
                        readback,
                        bgo
                    );
                }
            }
        }

        log::info!("AMC13 configured with L1A burst {}", trigger.burst);
        Ok(())
    }

    fn start_run(&self) -> Result<(), ManagerError> {
        let settings = &self.core.settings;
        let scan = self.core.card.lock().scan;
        if scan.is_continuous() {
            self.stop_scan_timer(Action::Start);
        }

        {
            let mut card = self.core.card.lock();
            let trigger = card.trigger;
            let session = card.session()?;

            session.reset(Endpoint::T1).during("T1 reset")?;
            std::thread::sleep(SETTLE_DELAY);
            session.reset_counters().during("counter reset")?;
            session.start_run().during("start run")?;

            if settings.enable_local_ttc {
                enable_used_bgo(session, &settings.signals)?;
                session.send_bgo().during("send BGO")?;
            }

            if trigger.local_l1a_enabled {
                if trigger.use_lemo {
                    log::debug!("Enabling LEMO trigger");
                    set_lemo_gate(session, true)?;
                } else {
                    session
                        .start_continuous_l1a()
                        .during("start continuous L1A")?;
                }
            } else {
                session
                    .configure_local_l1a(&trigger.l1a_parameters())
                    .during("configure local L1A")?;
            }

            card.scan.rebase(0);
        }

        if scan.is_continuous() {
            log::debug!("Starting scan timer for {} scan", scan.scan_type.as_str());
            let core = Arc::clone(&self.core);
            self.timer.lock().start(move || core.run_scan_tick())?;
        }
        Ok(())
    }

    fn pause_run(&self) -> Result<(), ManagerError> {
        let settings = &self.core.settings;
        let mut card = self.core.card.lock();
        if card.scan.is_continuous() {
            log::info!("Disabling triggers for scan");
        }
        let trigger = card.trigger;
        let session = card.session()?;

        if trigger.local_l1a_enabled {
            if trigger.use_lemo {
                set_lemo_gate(session, false)?;
            } else {
                session.stop_continuous_l1a().during("stop continuous L1A")?;
            }
        } else {
            // External triggers are stopped upstream; switching to the local
            // generator stands in for that here.
            session
                .configure_local_l1a(&trigger.l1a_parameters_with(true))
                .during("configure local L1A")?;
            session
                .enable_local_l1a(true)
                .during("enable local L1A")?;
        }

        if settings.enable_local_ttc {
            disable_used_bgo(session, &settings.signals)?;
        }
        disable_all_bgo(session)
    }

    fn resume_run(&self) -> Result<(), ManagerError> {
        let settings = &self.core.settings;
        let mut card = self.core.card.lock();
        let trigger = card.trigger;
        let session = card.session()?;

        if settings.enable_local_ttc && enable_used_bgo(session, &settings.signals)? > 0 {
            session.send_bgo().during("send BGO")?;
        }

        if trigger.local_l1a_enabled {
            session
                .configure_local_l1a(&trigger.l1a_parameters())
                .during("configure local L1A")?;
            session
                .enable_local_l1a(true)
                .during("enable local L1A")?;
            if trigger.use_lemo {
                set_lemo_gate(session, true)?;
            } else {
                session
                    .start_continuous_l1a()
                    .during("start continuous L1A")?;
            }
        } else {
            session
                .configure_local_l1a(&trigger.l1a_parameters())
                .during("configure local L1A")?;
        }
        Ok(())
    }

    fn stop_run(&self) -> Result<(), ManagerError> {
        let settings = &self.core.settings;
        self.stop_active_scan_timer(Action::Stop);

        let mut card = self.core.card.lock();
        let trigger = card.trigger;
        let session = card.session()?;

        if trigger.local_l1a_enabled {
            session
                .enable_local_l1a(false)
                .during("disable local L1A")?;
            if trigger.use_lemo {
                set_lemo_gate(session, false)?;
            } else {
                session.stop_continuous_l1a().during("stop continuous L1A")?;
            }
        } else {
            session
                .configure_local_l1a(&trigger.l1a_parameters())
                .during("configure local L1A")?;
            session
                .enable_local_l1a(true)
                .during("enable local L1A")?;
        }

        if settings.enable_local_ttc {
            disable_used_bgo(session, &settings.signals)?;
        }
        disable_all_bgo(session)?;
        session.end_run().during("end run")?;

        card.scan.rebase(0);
        Ok(())
    }

    fn release_session(&self) {
        let session = self.core.card.lock().session.take();
        if session.is_some() {
            log::debug!("Releasing AMC13 session");
        }
        drop(session);
    }

    /// Stop the scan timer if it runs, returns whether it did. Must not be
    /// called with the session lock held.
    fn stop_active_scan_timer(&self, action: Action) -> bool {
        let mut timer = self.timer.lock();
        if !timer.is_active() {
            return false;
        }
        match timer.stop() {
            Ok(()) => log::debug!("{}: scan timer stopped", action),
            Err(err) => log::error!("{}: could not stop scan timer: {}", action, err),
        }
        true
    }

    /// Best effort. Must not be called with the session lock held.
    fn stop_scan_timer(&self, action: Action) {
        match self.timer.lock().stop() {
            Ok(()) => log::debug!("{}: scan timer stopped", action),
            Err(ScanTimerError::NotActive) => {
                log::warn!("{}: could not stop scan timer, not active", action);
            }
            Err(err) => log::error!("{}: could not stop scan timer: {}", action, err),
        }
    }

    #[cfg(test)]
    pub(crate) fn run_scan_tick(&self) {
        self.core.run_scan_tick();
    }
}

impl Core {
    fn run_scan_tick(&self) {
        let span = tracing::debug_span!("scan_tick");
        let _entered = span.enter();
        #[cfg(feature = "cpu-profiling")]
        let _zone = tracy_client::Client::running()
            .map(|client| client.span(tracy_client::span_location!("scan_tick"), 0));

        let result = match self.check_scan_point() {
            Ok(true) => self.end_scan_point(),
            Ok(false) => Ok(()),
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            log::error!("Scan tick failed: {}", err);
            self.upstream.report_error(&err);
        }
    }

    /// Poll the L1A counter. When the point is complete, stop the local
    /// triggers and move the baseline to the current counter value.
    fn check_scan_point(&self) -> Result<bool, ManagerError> {
        let mut card = self.card.lock();
        if !matches!(card.state, LifecycleState::Running | LifecycleState::Paused) {
            log::debug!("Scan tick ignored while {}", card.state);
            return Ok(false);
        }
        let trigger = card.trigger;
        let CardState { session, scan, .. } = &mut *card;
        let Some(session) = session.as_deref_mut() else {
            log::warn!("Scan tick without AMC13 session");
            return Ok(false);
        };

        let counter = session
            .read(Endpoint::T1, L1A_COUNT_REGISTER)
            .during("read L1A counter")?;
        log::debug!(
            "Scan tick: {} of {} triggers (baseline {})",
            scan.triggers_since_baseline(counter),
            scan.target_trigger_count,
            scan.baseline_counter_value
        );
        if !scan.point_complete(counter) {
            return Ok(false);
        }

        if trigger.local_l1a_enabled {
            if trigger.use_lemo {
                session
                    .enable_local_l1a(false)
                    .during("disable local L1A")?;
                set_lemo_gate(session, false)?;
            } else {
                session.stop_continuous_l1a().during("stop continuous L1A")?;
            }
        }

        let baseline = session
            .read(Endpoint::T1, L1A_COUNT_REGISTER)
            .during("read L1A counter")?;
        scan.rebase(baseline);
        log::info!("Scan point complete, L1A count {}", baseline);
        Ok(true)
    }

    fn end_scan_point(&self) -> Result<(), ManagerError> {
        log::info!("Sending {}", END_SCAN_POINT);
        match self.upstream.send_command(END_SCAN_POINT) {
            Ok(()) => Ok(()),
            Err(err @ NotifyError::Rejected { .. }) => {
                log::warn!("{} not accepted: {}", END_SCAN_POINT, err);
                Ok(())
            }
            Err(source @ NotifyError::Transport { .. }) => Err(ManagerError::TransportFault {
                command: END_SCAN_POINT,
                source,
            }),
        }
    }
}

fn set_lemo_gate(session: &mut dyn HardwareSession, open: bool) -> Result<(), ManagerError> {
    session
        .write(Endpoint::T1, LEMO_GATE_REGISTER, u64::from(open))
        .during("LEMO gate")
}

/// Enable every used channel in slot order, returns how many were enabled.
fn enable_used_bgo(
    session: &mut dyn HardwareSession,
    signals: &SignalConfig,
) -> Result<usize, ManagerError> {
    let mut enabled = 0;
    for channel in signals.used().filter_map(|slot| slot.index()) {
        log::info!("Enabling BGO channel {}", channel);
        session.enable_bgo(channel).during("enable BGO")?;
        enabled += 1;
    }
    Ok(enabled)
}

fn disable_used_bgo(
    session: &mut dyn HardwareSession,
    signals: &SignalConfig,
) -> Result<(), ManagerError> {
    for channel in signals.used().filter_map(|slot| slot.index()) {
        log::debug!("Disabling BGO channel {}", channel);
        session.disable_bgo(channel).during("disable BGO")?;
    }
    Ok(())
}

/// Disable all four channels whatever the table holds, so nothing stays
/// asserted from an earlier session.
fn disable_all_bgo(session: &mut dyn HardwareSession) -> Result<(), ManagerError> {
    for channel in 0..BGO_CHANNEL_COUNT {
        session.disable_bgo(channel).during("disable BGO")?;
    }
    Ok(())
}
