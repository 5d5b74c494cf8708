//! # AMC13 Manager
//!
//! A Rust library for driving the lifecycle of an AMC13 timing/DAQ
//! concentrator card.
//!
//! The card is brought from disconnected to triggering through an explicit
//! state machine, with every register access serialized through one session
//! lock. Scan runs are supervised by a periodic counter poll that stops the
//! triggers and notifies the run coordinator when a scan point is complete.
//!
//! ## Features
//!
//! - **Lifecycle state machine**: initialize, configure, start, pause, resume,
//!   stop, halt, reset and fail with the card's required operation order
//! - **Trigger configuration**: local L1A generator, LEMO gating and the
//!   four-slot BGO table with builder patterns
//! - **Scan supervision**: background counter poll with `EndScanPoint`
//!   notification
//! - **Remote commands**: trigger burst and enable/disable with soft failure
//!   acknowledgments and hard faults
//! - **Configuration**: plain serde structures loaded from TOML
//! - **Mock card**: an in-memory session for tests and demos
//!
//! ## Examples
//!
//! ### Running a card
//!
//! ```rust
//! use amc13_manager::{
//!     CardConfig, LifecycleController, LifecycleState, MockBoard, MockFactory, MockUpstream,
//! };
//! use std::sync::Arc;
//!
//! let board = MockBoard::new();
//! let config = CardConfig::from_toml_str(r#"
//!     card_name = "gem.shelf01.amc13"
//!     amc_input_enable_list = "1-2"
//!
//!     [local_trigger]
//!     local_l1a_enabled = true
//! "#)?;
//!
//! let controller = LifecycleController::new(
//!     &config,
//!     Arc::new(MockFactory::new(board.clone())),
//!     Arc::new(MockUpstream::new()),
//! )?;
//! controller.initialize()?;
//! controller.configure()?;
//! controller.start()?;
//! assert_eq!(controller.state(), LifecycleState::Running);
//! assert!(board.continuous_running());
//!
//! controller.stop()?;
//! controller.reset()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### BGO table
//!
//! ```rust
//! use amc13_manager::trigger_config::{SignalChannel, SignalConfig};
//!
//! let signals = SignalConfig::from_channels([
//!     SignalChannel::on(0).command(0x14).bunch_crossing(3000),
//!     SignalChannel::on(2).command(0x2c).long().repeating(),
//! ])?;
//!
//! let used: Vec<i8> = signals.used().map(|slot| slot.channel).collect();
//! assert_eq!(used, vec![0, 2]);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Remote commands
//!
//! ```rust
//! use amc13_manager::{
//!     AckStatus, CardConfig, CommandGateway, LifecycleController, MockBoard, MockFactory,
//!     MockUpstream,
//! };
//! use std::sync::Arc;
//!
//! let upstream = Arc::new(MockUpstream::new());
//! let controller = LifecycleController::new(
//!     &CardConfig::default(),
//!     Arc::new(MockFactory::new(MockBoard::new())),
//!     upstream.clone(),
//! )?;
//! let gateway = CommandGateway::new(Arc::new(controller), upstream, "amc13-manager");
//!
//! // No session yet: a soft failure, not a fault.
//! assert_eq!(gateway.enable_triggers().status(), Some(AckStatus::Failed));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod card_config;
pub mod card_connector;
pub mod command_gateway;
pub mod hardware_session;
pub mod lifecycle_controller;
pub mod mock_session;
pub mod scan_timer;
pub mod trigger_config;

// Re-export the main types for convenience
pub use card_config::{CardConfig, ConfigError, ScanSettings};

pub use card_connector::{CardConnector, CardIdentity, ConnectorError, SessionFactory};

pub use command_gateway::{
    AckStatus, CommandGateway, CommandReply, Fault, GatewayError, NotifyError, Upstream,
    END_SCAN_POINT,
};

pub use hardware_session::{BoardStatus, Endpoint, HardwareError, HardwareSession};

pub use lifecycle_controller::{
    Action, LifecycleController, LifecycleState, ManagerError, StatusReport,
};

pub use mock_session::{MockBoard, MockFactory, MockSession, MockUpstream};

pub use scan_timer::{ScanState, ScanTimer, ScanTimerError, ScanType};

pub use trigger_config::{L1AMode, SignalChannel, SignalConfig, TriggerConfig, TriggerConfigError};
