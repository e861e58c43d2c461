//-----------------------------------------------------------------------------
// Module error

use thiserror::Error;

use crate::codec::{crc_description, Command, CRC_INTERNAL_TIMEOUT};
use crate::session::SessionState;

/// Error type of all master operations
#[derive(Error, Debug)]
pub enum CcpError {
    /// No matching Command Return Message within the request deadline
    #[error("no command return message within {0} ms")]
    Timeout(u64),

    /// The CAN interface failed to accept the outbound frame
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The slave answered with a non zero command return code
    #[error("{command} rejected by slave: 0x{code:02X} {}", crc_description(*.code))]
    Slave { code: u8, command: Command },

    /// A CRO parameter is out of the range the command allows
    #[error("cannot encode {field}: {reason}")]
    Encode { field: &'static str, reason: &'static str },

    /// A CRM payload field could not be parsed
    #[error("cannot decode CRM data at offset {offset}: {reason}")]
    Decode { offset: usize, reason: &'static str },

    /// The operation is not legal in the current session state
    #[error("session is {actual}, operation requires {expected}")]
    ProtocolViolation { expected: SessionState, actual: SessionState },

    /// The element set does not fit the ODTs the slave provides
    #[error("DAQ list capacity exceeded: {requested} bytes requested, {available} available")]
    Capacity { requested: usize, available: usize },

    /// The request was abandoned by the caller or by session shutdown
    #[error("request cancelled")]
    Cancelled,
}

impl CcpError {
    /// Errors that invalidate the session: the slave is unreachable or lost
    /// its protocol state, the embedder must disconnect and reconnect
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CcpError::Timeout(_) | CcpError::Transport(_) | CcpError::Slave { code: CRC_INTERNAL_TIMEOUT, .. }
        )
    }
}
