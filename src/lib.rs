//-----------------------------------------------------------------------------
// Crate ccp_master
// Path: src/lib.rs
//
// Master side of the CAN Calibration Protocol (CCP 2.1):
// - Frame codec for Command Receive Objects (CRO) and Data Transmission
//   Objects (DTO) over 8 byte CAN 2.0 payloads
// - Command engine with CTR correlation, one request in flight and timeouts
// - Session state machine (connect, exchange id, seed/key, memory transfer)
// - DAQ scheduler and decoder (ODT partitioning, scaled sample emission)
//
// The CAN driver itself is not part of this crate. The embedder provides the
// outbound half as a CanSender implementation and feeds inbound frames into
// a channel, see CcpMaster::new.

// Submodule codec
mod codec;
pub use codec::Command;
pub use codec::Crm;
pub use codec::Cro;
pub use codec::DaqListSize;
pub use codec::Dto;
pub use codec::ExchangeIdInfo;
pub use codec::MtaPointer;
pub use codec::ResourceMask;
pub use codec::SeedInfo;
pub use codec::SessionStatus;
pub use codec::StartStopMode;
pub use codec::{crc_description, ByteOrder};
pub use codec::{CRC_ACKNOWLEDGE, CRC_DAQ_OVERLOAD, CRC_INTERNAL_TIMEOUT};

// Submodule error
mod error;
pub use error::CcpError;

// Submodule transport
mod transport;
pub use transport::{CanFrame, CanSender};

// Submodule engine
mod engine;
pub use engine::DiagSnapshot;

// Submodule session
mod session;
pub use session::CcpConfig;
pub use session::CcpMaster;
pub use session::SessionState;
pub use session::CCP_VERSION;
pub use session::{EventHandler, SlaveEvent};

// Public submodule daq
pub mod daq;
pub use daq::decoder::{LogSink, SampleSink};
pub use daq::{DaqConfig, DaqSession, Element};
