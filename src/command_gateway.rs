//! Remote trigger commands.
//!
//! The gateway turns the three named remote commands into controller calls
//! and shapes the outcome into a reply. A command issued before the card is
//! connected gets a `"Failed"` acknowledgment. A card that is connected but
//! rejects the access produces a [`Fault`].

use crate::lifecycle_controller::{LifecycleController, ManagerError};
use serde::Serialize;
use std::sync::Arc;

/// Command sent upstream when a scan point has collected its triggers.
pub const END_SCAN_POINT: &str = "EndScanPoint";

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Coordinator rejected {command}: {reason}")]
    Rejected { command: String, reason: String },

    #[error("Transport failure sending {command}: {reason}")]
    Transport { command: String, reason: String },
}

/// Channel to the upstream run coordinator and the host's error reporting.
pub trait Upstream: Send + Sync {
    /// Fire and forget. No reply is awaited.
    fn send_command(&self, command: &str) -> Result<(), NotifyError>;

    fn report_error(&self, error: &dyn std::error::Error);
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Null message received!")]
    NullMessage,

    #[error("Command '{0}' not found")]
    CommandNotFound(String),

    #[error("Failed to create reply for command '{command}': {source}")]
    Reply {
        command: &'static str,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AckStatus {
    SentTriggers,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Acknowledgment {
    pub command: &'static str,
    pub status: AckStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Fault {
    pub fault_string: String,
    pub fault_code: String,
    pub detail: String,
    pub fault_actor: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum CommandReply {
    Ack(Acknowledgment),
    Fault(Fault),
}

impl CommandReply {
    pub fn is_fault(&self) -> bool {
        matches!(self, CommandReply::Fault(_))
    }

    pub fn status(&self) -> Option<AckStatus> {
        match self {
            CommandReply::Ack(ack) => Some(ack.status),
            CommandReply::Fault(_) => None,
        }
    }
}

pub struct CommandGateway {
    controller: Arc<LifecycleController>,
    upstream: Arc<dyn Upstream>,
    actor: String,
}

impl CommandGateway {
    const SEND_TRIGGER_BURST: &'static str = "sendTriggerBurst";
    const ENABLE_TRIGGERS: &'static str = "enableTriggers";
    const DISABLE_TRIGGERS: &'static str = "disableTriggers";

    /// `actor` identifies this application in fault replies.
    pub fn new(
        controller: Arc<LifecycleController>,
        upstream: Arc<dyn Upstream>,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            controller,
            upstream,
            actor: actor.into(),
        }
    }

    pub fn controller(&self) -> &Arc<LifecycleController> {
        &self.controller
    }

    pub fn send_trigger_burst(&self) -> CommandReply {
        log::info!("Entering {}", Self::SEND_TRIGGER_BURST);
        match self.controller.send_trigger_burst() {
            Ok(sent) => {
                log::info!(
                    "{} succeeded (burst sent: {})",
                    Self::SEND_TRIGGER_BURST,
                    sent
                );
                ack(Self::SEND_TRIGGER_BURST, AckStatus::SentTriggers)
            }
            Err(err) => self.fault(Self::SEND_TRIGGER_BURST, &err),
        }
    }

    pub fn enable_triggers(&self) -> CommandReply {
        self.toggle_triggers(Self::ENABLE_TRIGGERS, LifecycleController::enable_triggers)
    }

    pub fn disable_triggers(&self) -> CommandReply {
        self.toggle_triggers(Self::DISABLE_TRIGGERS, LifecycleController::disable_triggers)
    }

    /// Dispatch a command by name and encode the reply as JSON.
    pub fn handle(&self, command: &str) -> Result<String, GatewayError> {
        let command = command.trim();
        if command.is_empty() {
            return Err(GatewayError::NullMessage);
        }

        let (name, reply) = match command.to_ascii_lowercase().as_str() {
            "sendtriggerburst" => (Self::SEND_TRIGGER_BURST, self.send_trigger_burst()),
            "enabletriggers" => (Self::ENABLE_TRIGGERS, self.enable_triggers()),
            "disabletriggers" => (Self::DISABLE_TRIGGERS, self.disable_triggers()),
            _ => return Err(GatewayError::CommandNotFound(command.to_string())),
        };

        serde_json::to_string(&reply).map_err(|source| {
            let err = GatewayError::Reply {
                command: name,
                source,
            };
            log::error!("{}", err);
            self.upstream.report_error(&err);
            err
        })
    }

    fn toggle_triggers(
        &self,
        command: &'static str,
        action: fn(&LifecycleController) -> Result<(), ManagerError>,
    ) -> CommandReply {
        log::debug!("{}", command);
        match action(&self.controller) {
            Ok(()) => {
                log::info!("{} succeeded", command);
                ack(command, AckStatus::SentTriggers)
            }
            Err(ManagerError::PreconditionNotMet(reason)) => {
                log::error!("Failed to complete '{}', {}", command, reason);
                ack(command, AckStatus::Failed)
            }
            Err(err) => self.fault(command, &err),
        }
    }

    fn fault(&self, command: &str, err: &ManagerError) -> CommandReply {
        log::error!("{} failed: {}", command, err);
        CommandReply::Fault(Fault {
            fault_string: format!("{command} failed"),
            fault_code: "Client".to_string(),
            detail: format!("Unable to complete {command}: {err}."),
            fault_actor: self.actor.clone(),
        })
    }
}

fn ack(command: &'static str, status: AckStatus) -> CommandReply {
    CommandReply::Ack(Acknowledgment { command, status })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card_config::CardConfig;
    use crate::hardware_session::LEMO_GATE_REGISTER;
    use crate::mock_session::{BoardOp, MockBoard, MockFactory, MockUpstream};
    use crate::trigger_config::TriggerConfig;

    const ACTOR: &str = "http://daq.local:20200/urn:xdaq-application:lid=255";

    fn gateway(trigger: TriggerConfig) -> (CommandGateway, MockBoard, MockUpstream) {
        let board = MockBoard::new();
        let upstream = MockUpstream::new();
        let config = CardConfig {
            local_trigger: trigger,
            ..CardConfig::default()
        };
        let controller = LifecycleController::new(
            &config,
            Arc::new(MockFactory::new(board.clone())),
            Arc::new(upstream.clone()),
        )
        .unwrap();
        let gateway = CommandGateway::new(Arc::new(controller), Arc::new(upstream.clone()), ACTOR);
        (gateway, board, upstream)
    }

    #[test]
    fn test_trigger_commands_without_session_fail_softly() {
        let (gateway, board, _) = gateway(TriggerConfig::local());
        assert_eq!(
            gateway.enable_triggers(),
            ack("enableTriggers", AckStatus::Failed)
        );
        assert_eq!(
            gateway.disable_triggers(),
            ack("disableTriggers", AckStatus::Failed)
        );
        assert!(board.operations().is_empty());
    }

    #[test]
    fn test_disabled_burst_reports_success_without_hardware() {
        let (gateway, board, _) = gateway(TriggerConfig::default().burst_on_command());
        let reply = gateway.send_trigger_burst();
        assert_eq!(reply.status(), Some(AckStatus::SentTriggers));
        assert!(board.operations().is_empty());
    }

    #[test]
    fn test_burst_without_session_is_a_fault() {
        let (gateway, _, _) = gateway(TriggerConfig::local().burst_on_command());
        let CommandReply::Fault(fault) = gateway.send_trigger_burst() else {
            unreachable!("expected a fault reply");
        };
        assert_eq!(fault.fault_string, "sendTriggerBurst failed");
        assert_eq!(fault.fault_code, "Client");
        assert_eq!(fault.fault_actor, ACTOR);
        assert!(fault.detail.contains("not yet connected"));
    }

    #[test]
    fn test_enable_and_disable_with_lemo() {
        let (gateway, board, _) = gateway(TriggerConfig::local().lemo());
        gateway.controller().initialize().unwrap();
        board.clear_operations();

        assert_eq!(
            gateway.enable_triggers().status(),
            Some(AckStatus::SentTriggers)
        );
        assert_eq!(
            board.operations(),
            vec![
                BoardOp::EnableLocalL1A(true),
                BoardOp::Write(
                    crate::hardware_session::Endpoint::T1,
                    LEMO_GATE_REGISTER.to_string(),
                    1
                ),
            ]
        );
        assert!(board.lemo_gate());

        gateway.disable_triggers();
        assert!(!board.lemo_gate());
        assert!(!board.local_l1a_enabled());
    }

    #[test]
    fn test_continuous_on_command() {
        let (gateway, board, _) = gateway(TriggerConfig::local().continuous_on_command());
        gateway.controller().initialize().unwrap();

        gateway.enable_triggers();
        assert!(board.continuous_running());
        gateway.disable_triggers();
        assert!(!board.continuous_running());
        assert_eq!(board.exclusion_violations(), 0);
    }

    #[test]
    fn test_hardware_error_is_a_fault() {
        let (gateway, board, _) = gateway(TriggerConfig::local());
        gateway.controller().initialize().unwrap();
        board.fail_on("enable_local_l1a");

        let reply = gateway.enable_triggers();
        assert!(reply.is_fault());
        let CommandReply::Fault(fault) = reply else {
            unreachable!("expected a fault reply");
        };
        assert!(fault.detail.contains("enable local L1A"));
    }

    #[test]
    fn test_handle_dispatch_and_encoding() {
        let (gateway, _, _) = gateway(TriggerConfig::local());

        let reply: serde_json::Value =
            serde_json::from_str(&gateway.handle("enableTriggers").unwrap()).unwrap();
        assert_eq!(reply["command"], "enableTriggers");
        assert_eq!(reply["status"], "Failed");

        let reply: serde_json::Value =
            serde_json::from_str(&gateway.handle("sendtriggerburst").unwrap()).unwrap();
        assert_eq!(reply["status"], "SentTriggers");

        assert!(matches!(gateway.handle(""), Err(GatewayError::NullMessage)));
        assert!(matches!(
            gateway.handle("startScan"),
            Err(GatewayError::CommandNotFound(name)) if name == "startScan"
        ));
    }

    #[test]
    fn test_fault_encoding_uses_camel_case() {
        let (gateway, _, _) = gateway(TriggerConfig::local().burst_on_command());
        let reply: serde_json::Value =
            serde_json::from_str(&gateway.handle("sendTriggerBurst").unwrap()).unwrap();
        assert_eq!(reply["faultCode"], "Client");
        assert_eq!(reply["faultActor"], ACTOR);
        assert_eq!(reply["faultString"], "sendTriggerBurst failed");
    }
}
