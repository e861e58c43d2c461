//-----------------------------------------------------------------------------
// Module transport
// The CAN driver lives outside this crate. Outbound frames go through the
// CanSender capability, inbound frames arrive on a tokio channel supplied to
// CcpMaster::new. The receive pump filters by the configured DTO identifier,
// so the channel may carry unrelated bus traffic.

use std::io;

/// A classic CAN 2.0 frame as seen by the CCP layer.
/// The payload of every CCP frame is 8 bytes, shorter frames are not valid
/// CCP traffic and must not be put on the inbound channel.
#[derive(Debug, Clone, Copy)]
pub struct CanFrame {
    /// Arbitration id, 11 bit standard or 29 bit extended
    pub id: u32,
    pub data: [u8; 8],
    /// Receive timestamp in microseconds, supplied by the CAN driver.
    /// Carried through to decoded DAQ samples unchanged.
    pub timestamp: u64,
}

impl CanFrame {
    pub fn new(id: u32, data: [u8; 8], timestamp: u64) -> CanFrame {
        CanFrame { id, data, timestamp }
    }
}

/// Outbound half of the CAN interface.
/// The master is the only writer on its CRO identifier; an embedder that
/// multiplexes other protocols on the same bus serializes outside.
pub trait CanSender: Send + Sync + 'static {
    fn send_frame(&self, id: u32, data: [u8; 8]) -> io::Result<()>;
}
