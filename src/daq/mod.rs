//-----------------------------------------------------------------------------
// Module daq
// DAQ scheduler: partitions a set of Elements into the ODTs of a DAQ list,
// arms the slave (SET_DAQ_PTR / WRITE_DAQ per entry, then prepare and
// synchronized start) and owns the ODT map the decoder uses for inbound
// DAQ-DTO frames.

pub mod decoder;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::codec::{ByteOrder, SessionStatus, StartStopMode, ODT_DATA_LEN};
use crate::error::CcpError;
use crate::session::{CcpMaster, SessionState};

//-----------------------------------------------------------------------------
// Element

/// A signal descriptor: where the variable lives in the slave and how its
/// raw bytes translate to an engineering value. Immutable during a DAQ
/// session. Typically produced from an A2L measurement by the embedder.
#[derive(Debug, Clone)]
pub struct Element {
    pub name: String,
    /// Memory address in the slave
    pub address: u32,
    /// Address extension (memory bank or segment), slave specific
    pub extension: u8,
    /// Size in bytes, 1, 2 or 4
    pub size: u8,
    pub is_signed: bool,
    pub byte_order: ByteOrder,
    /// Engineering value = raw * scale + offset
    pub scale: f64,
    pub offset: f64,
}

impl Element {
    /// Create an unsigned big endian element with identity scaling
    pub fn new(name: &str, address: u32, size: u8) -> Result<Element, CcpError> {
        if !matches!(size, 1 | 2 | 4) {
            return Err(CcpError::Encode {
                field: "size",
                reason: "element size is 1, 2 or 4",
            });
        }
        Ok(Element {
            name: name.to_string(),
            address,
            extension: 0,
            size,
            is_signed: false,
            byte_order: ByteOrder::BigEndian,
            scale: 1.0,
            offset: 0.0,
        })
    }

    pub fn with_extension(mut self, extension: u8) -> Self {
        self.extension = extension;
        self
    }

    pub fn signed(mut self) -> Self {
        self.is_signed = true;
        self
    }

    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    pub fn with_scaling(mut self, scale: f64, offset: f64) -> Self {
        self.scale = scale;
        self.offset = offset;
        self
    }
}

//-----------------------------------------------------------------------------
// ODT map

// One armed element: index into the element list and its byte offset within
// the ODT's 7 data bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OdtEntry {
    pub element: usize,
    pub offset: u8,
}

// The decoder's view of an armed DAQ list
#[derive(Debug)]
pub(crate) struct OdtMap {
    pub daq_list: u8,
    pub first_pid: u8,
    pub elements: Vec<Element>,
    pub odts: Vec<Vec<OdtEntry>>,
}

// First fit in caller order: each element goes to the current ODT if its
// size still fits into the 7 data bytes, otherwise a new ODT is opened.
// Elements never straddle an ODT boundary.
pub(crate) fn pack_elements(elements: &[Element]) -> Vec<Vec<OdtEntry>> {
    let mut odts: Vec<Vec<OdtEntry>> = Vec::new();
    let mut current: Vec<OdtEntry> = Vec::new();
    let mut fill: usize = 0;

    for (index, element) in elements.iter().enumerate() {
        let size = element.size as usize;
        if fill + size > ODT_DATA_LEN && !current.is_empty() {
            odts.push(std::mem::take(&mut current));
            fill = 0;
        }
        current.push(OdtEntry {
            element: index,
            offset: fill as u8,
        });
        fill += size;
    }
    if !current.is_empty() {
        odts.push(current);
    }
    odts
}

//-----------------------------------------------------------------------------
// DAQ session

/// Target DAQ list and transmission parameters
#[derive(Debug, Clone, Copy)]
pub struct DaqConfig {
    pub daq_list: u8,
    pub event_channel: u8,
    /// Transmission rate prescaler, > 1 decreases the rate
    pub prescaler: u16,
}

impl Default for DaqConfig {
    fn default() -> DaqConfig {
        DaqConfig {
            daq_list: 0,
            event_channel: 0,
            prescaler: 1,
        }
    }
}

/// DAQ lifecycle handle, obtained from CcpMaster::daq
pub struct DaqSession<'a> {
    master: &'a CcpMaster,
    config: DaqConfig,
}

impl<'a> DaqSession<'a> {
    pub(crate) fn new(master: &'a CcpMaster, config: DaqConfig) -> DaqSession<'a> {
        DaqSession { master, config }
    }

    /// Partition the elements into ODTs, verify them against the slave's
    /// DAQ list size and install them in the slave. Discards a previously
    /// installed map. The element order is the caller's, packing is stable
    /// first fit.
    pub async fn initialize(&self, elements: Vec<Element>) -> Result<(), CcpError> {
        self.master.require_state(SessionState::Ready)?;
        if elements.is_empty() {
            return Err(CcpError::Encode {
                field: "elements",
                reason: "empty element set",
            });
        }

        self.master.discard_odt_map();
        let odts = pack_elements(&elements);

        // The slave decides how many ODTs the list has and which PID its
        // first ODT carries
        let list = self.master.get_daq_size(self.config.daq_list, None).await?;
        if odts.len() > list.odt_count as usize {
            let requested: usize = elements.iter().map(|e| e.size as usize).sum();
            return Err(CcpError::Capacity {
                requested,
                available: list.odt_count as usize * ODT_DATA_LEN,
            });
        }
        debug!(
            "DAQ list {}: {} elements in {} of {} ODTs, first pid 0x{:02X}",
            self.config.daq_list,
            elements.len(),
            odts.len(),
            list.odt_count,
            list.first_pid
        );

        // Announce DAQ list initialization, install every element at its
        // (odt, entry) position, then announce completion
        self.master.set_s_status(SessionStatus::CAL).await?;
        for (odt, entries) in odts.iter().enumerate() {
            for (position, entry) in entries.iter().enumerate() {
                let element = &elements[entry.element];
                self.master
                    .set_daq_ptr(self.config.daq_list, odt as u8, position as u8)
                    .await?;
                self.master
                    .write_daq(element.size, element.extension, element.address)
                    .await?;
                trace!(
                    "armed {} at daq={} odt={} entry={} offset={}",
                    element.name,
                    self.config.daq_list,
                    odt,
                    position,
                    entry.offset
                );
            }
        }
        self.master.set_s_status(SessionStatus::CAL | SessionStatus::DAQ).await?;

        self.master.install_odt_map(OdtMap {
            daq_list: self.config.daq_list,
            first_pid: list.first_pid,
            elements,
            odts,
        });
        Ok(())
    }

    /// Prepare the armed DAQ list and start acquisition synchronized.
    /// Valid again after stop() without a new initialize().
    pub async fn run(&self) -> Result<(), CcpError> {
        self.master.require_state(SessionState::Ready)?;
        let last_odt = match self.master.armed_odt_count() {
            Some(count) => (count - 1) as u8,
            None => {
                error!("DAQ run without an initialized ODT map");
                return Err(CcpError::ProtocolViolation {
                    expected: SessionState::Ready,
                    actual: self.master.state(),
                });
            }
        };

        self.master
            .start_stop(
                StartStopMode::Prepare,
                self.config.daq_list,
                last_odt,
                self.config.event_channel,
                self.config.prescaler,
            )
            .await?;
        self.master.start_stop_all(true).await?;
        self.master.set_state(SessionState::DaqRunning);
        Ok(())
    }

    /// Stop acquisition. The ODT map is retained for a subsequent run().
    pub async fn stop(&self) -> Result<(), CcpError> {
        if self.master.state() != SessionState::DaqRunning {
            debug!("DAQ stop: acquisition not running");
            return Ok(());
        }
        self.master.start_stop_all(false).await?;
        self.master.set_state(SessionState::Ready);
        Ok(())
    }
}

//-----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn elements(sizes: &[u8]) -> Vec<Element> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| Element::new(&format!("e{}", i), 0x1000 + i as u32, size).unwrap())
            .collect()
    }

    fn shape(odts: &[Vec<OdtEntry>], elements: &[Element]) -> Vec<Vec<(u8, u8)>> {
        odts.iter()
            .map(|entries| entries.iter().map(|e| (elements[e.element].size, e.offset)).collect())
            .collect()
    }

    #[test]
    fn test_pack_first_fit_in_order() {
        let elements = elements(&[4, 2, 2, 4, 1]);
        let odts = pack_elements(&elements);
        // The third element does not fit into the 7 byte ODT and opens a new
        // one, the trailing single byte still fits after it
        assert_eq!(
            shape(&odts, &elements),
            vec![vec![(4, 0), (2, 4)], vec![(2, 0), (4, 2), (1, 6)]]
        );
    }

    #[test]
    fn test_pack_full_odt() {
        let elements = elements(&[4, 2, 1]);
        let odts = pack_elements(&elements);
        assert_eq!(shape(&odts, &elements), vec![vec![(4, 0), (2, 4), (1, 6)]]);
    }

    #[test]
    fn test_pack_every_element_once_no_straddle() {
        let elements = elements(&[1, 4, 4, 2, 1, 2, 4, 1, 1, 2]);
        let odts = pack_elements(&elements);
        let mut seen = vec![false; elements.len()];
        for entries in &odts {
            let mut fill = 0usize;
            for entry in entries {
                assert!(!seen[entry.element]);
                seen[entry.element] = true;
                assert_eq!(entry.offset as usize, fill, "entries are packed densely");
                fill += elements[entry.element].size as usize;
            }
            assert!(fill <= ODT_DATA_LEN);
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn test_element_size_validation() {
        assert!(Element::new("a", 0, 3).is_err());
        assert!(Element::new("a", 0, 0).is_err());
        assert!(Element::new("a", 0, 2).is_ok());
    }
}
