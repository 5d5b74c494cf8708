use crate::hardware_session::{Endpoint, HardwareError, HardwareSession};

/// Number of AMC slots served by the card.
pub const AMC_SLOT_COUNT: u32 = 12;

/// Where a card lives and what it is called in the connection file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardIdentity {
    pub locator: String,
    pub card_name: String,
}

impl CardIdentity {
    pub fn new(locator: impl Into<String>, card_name: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            card_name: card_name.into(),
        }
    }

    /// Device id of the control endpoint.
    pub fn t1_id(&self) -> String {
        format!("{}.{}", self.card_name, Endpoint::T1.as_str())
    }

    /// Device id of the data endpoint.
    pub fn t2_id(&self) -> String {
        format!("{}.{}", self.card_name, Endpoint::T2.as_str())
    }
}

/// Opens sessions to cards. Implemented on top of the bus driver.
pub trait SessionFactory: Send + Sync {
    fn open(&self, identity: &CardIdentity) -> Result<Box<dyn HardwareSession>, HardwareError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("Hardware error: {0}")]
    Hardware(#[from] HardwareError),

    #[error("Invalid entry '{entry}' in AMC enable list '{list}'")]
    InvalidEnableList { entry: String, list: String },

    #[error("AMC slot {slot} out of range (1..=12)")]
    SlotOutOfRange { slot: u32 },
}

pub struct CardConnector;

impl CardConnector {
    /// Open a session to the card described by `identity`.
    pub fn connect(
        factory: &dyn SessionFactory,
        identity: &CardIdentity,
    ) -> Result<Box<dyn HardwareSession>, HardwareError> {
        log::debug!(
            "Trying to create connection to {} in {} ({}, {})",
            identity.card_name,
            identity.locator,
            identity.t1_id(),
            identity.t2_id()
        );
        let session = factory.open(identity)?;
        log::debug!("Connected to {}", identity.card_name);
        Ok(session)
    }

    /// Mandatory bring-up right after the session has been opened: reset the
    /// data endpoint, enable the listed AMC inputs and all TTC inputs.
    ///
    /// Returns the slot mask that was applied.
    pub fn bring_up(
        session: &mut dyn HardwareSession,
        input_enable_list: &str,
    ) -> Result<u32, ConnectorError> {
        session.reset(Endpoint::T2)?;

        let mask = Self::parse_input_enable_list(input_enable_list)?;
        log::debug!("Enabling AMC inputs with mask 0x{:03x}", mask);
        session.amc_input_enable(mask)?;

        session.enable_all_ttc()?;
        Ok(mask)
    }

    /// Parse a slot list such as `"1-3,5,12"` into an input mask where bit
    /// `n` enables slot `n + 1`. An empty list enables nothing.
    pub fn parse_input_enable_list(list: &str) -> Result<u32, ConnectorError> {
        let invalid = |entry: &str| ConnectorError::InvalidEnableList {
            entry: entry.to_string(),
            list: list.to_string(),
        };

        let mut mask = 0u32;
        for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (first, last) = match entry.split_once('-') {
                Some((first, last)) => (
                    first.trim().parse::<u32>().map_err(|_| invalid(entry))?,
                    last.trim().parse::<u32>().map_err(|_| invalid(entry))?,
                ),
                None => {
                    let slot = entry.parse::<u32>().map_err(|_| invalid(entry))?;
                    (slot, slot)
                }
            };
            if first > last {
                return Err(invalid(entry));
            }
            for slot in first..=last {
                if !(1..=AMC_SLOT_COUNT).contains(&slot) {
                    return Err(ConnectorError::SlotOutOfRange { slot });
                }
                mask |= 1 << (slot - 1);
            }
        }
        Ok(mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_session::{BoardOp, MockBoard, MockFactory};

    #[test]
    fn test_identity_endpoints() {
        let identity = CardIdentity::new("file://connections.xml", "gem.shelf01.amc13");
        assert_eq!(identity.t1_id(), "gem.shelf01.amc13.T1");
        assert_eq!(identity.t2_id(), "gem.shelf01.amc13.T2");
    }

    #[test]
    fn test_parse_input_enable_list() {
        assert_eq!(CardConnector::parse_input_enable_list("").unwrap(), 0);
        assert_eq!(CardConnector::parse_input_enable_list("1").unwrap(), 0b1);
        assert_eq!(
            CardConnector::parse_input_enable_list("1-3, 5").unwrap(),
            0b1_0111
        );
        assert_eq!(
            CardConnector::parse_input_enable_list("12").unwrap(),
            1 << 11
        );
        assert_eq!(
            CardConnector::parse_input_enable_list("1-12").unwrap(),
            0xfff
        );
    }

    #[test]
    fn test_parse_input_enable_list_errors() {
        assert!(matches!(
            CardConnector::parse_input_enable_list("N/A"),
            Err(ConnectorError::InvalidEnableList { .. })
        ));
        assert!(matches!(
            CardConnector::parse_input_enable_list("4-2"),
            Err(ConnectorError::InvalidEnableList { .. })
        ));
        assert!(matches!(
            CardConnector::parse_input_enable_list("0"),
            Err(ConnectorError::SlotOutOfRange { slot: 0 })
        ));
        assert!(matches!(
            CardConnector::parse_input_enable_list("2,13"),
            Err(ConnectorError::SlotOutOfRange { slot: 13 })
        ));
    }

    #[test]
    fn test_connect_refused() {
        let board = MockBoard::new();
        let factory = MockFactory::new(board.clone());
        factory.refuse_connections(true);

        let identity = CardIdentity::new("file://missing.xml", "amc13");
        let result = CardConnector::connect(&factory, &identity);
        assert!(matches!(result, Err(HardwareError::Connection { .. })));
        assert_eq!(board.live_sessions(), 0);
    }

    #[test]
    fn test_bring_up_sequence() {
        let board = MockBoard::new();
        let mut session = board.session();

        let mask = CardConnector::bring_up(&mut session, "2,4").unwrap();
        assert_eq!(mask, 0b1010);
        assert_eq!(
            board.operations(),
            vec![
                BoardOp::Reset(Endpoint::T2),
                BoardOp::AmcInputEnable(0b1010),
                BoardOp::EnableAllTtc,
            ]
        );
    }

    #[test]
    fn test_bring_up_stops_at_first_failure() {
        let board = MockBoard::new();
        board.fail_on("amc_input_enable");
        let mut session = board.session();

        let result = CardConnector::bring_up(&mut session, "1");
        assert!(matches!(result, Err(ConnectorError::Hardware(_))));
        assert!(!board.operations().contains(&BoardOp::EnableAllTtc));
    }
}
