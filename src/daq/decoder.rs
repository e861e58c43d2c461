//-----------------------------------------------------------------------------
// Module daq::decoder
// Turns inbound DAQ-DTO frames into scaled engineering values using the
// armed ODT map. Runs on the receive pump and never fails upward, frames
// that cannot be attributed are counted in the session diagnostics.

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use std::sync::atomic::Ordering;

use crate::codec::{ByteOrder, ODT_DATA_LEN};
use crate::daq::OdtMap;
use crate::engine::DiagCounters;

//-----------------------------------------------------------------------------
// Sample sink

/// Consumer of decoded samples. Called on the receive pump for every element
/// of every DAQ-DTO, in frame arrival order. Samples of distinct ODTs of the
/// same acquisition cycle may interleave, consumers regroup by timestamp if
/// they need cycles.
pub trait SampleSink: Send {
    fn on_sample(&mut self, name: &str, value: f64, timestamp: u64);
}

/// Default sink, traces samples to the logger
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl SampleSink for LogSink {
    fn on_sample(&mut self, name: &str, value: f64, timestamp: u64) {
        trace!("DAQ: {} = {} t={}us", name, value, timestamp);
    }
}

//-----------------------------------------------------------------------------
// Decoder

impl OdtMap {
    // Decode one DAQ-DTO. The PID is the ODT number relative to the first
    // PID reported by GET_DAQ_SIZE.
    pub(crate) fn decode(&self, pid: u8, data: &[u8; ODT_DATA_LEN], timestamp: u64, sink: &mut dyn SampleSink, counters: &DiagCounters) {
        let odt = match pid.checked_sub(self.first_pid) {
            Some(odt) if (odt as usize) < self.odts.len() => odt as usize,
            _ => {
                counters.unexpected_pid.fetch_add(1, Ordering::Relaxed);
                trace!("DAQ-DTO pid=0x{:02X} outside armed ODT range of list {}", pid, self.daq_list);
                return;
            }
        };

        for entry in &self.odts[odt] {
            let element = &self.elements[entry.element];
            let offset = entry.offset as usize;
            let raw = raw_value(&data[offset..offset + element.size as usize], element.byte_order, element.is_signed);
            let value = raw * element.scale + element.offset;
            sink.on_sample(&element.name, value, timestamp);
        }
    }
}

// Assemble the raw value from 1, 2 or 4 bytes and sign extend if required
fn raw_value(bytes: &[u8], byte_order: ByteOrder, is_signed: bool) -> f64 {
    let mut raw: u32 = 0;
    match byte_order {
        ByteOrder::BigEndian => {
            for &b in bytes {
                raw = raw << 8 | b as u32;
            }
        }
        ByteOrder::LittleEndian => {
            for &b in bytes.iter().rev() {
                raw = raw << 8 | b as u32;
            }
        }
    }
    if is_signed {
        let shift = 32 - 8 * bytes.len();
        (((raw << shift) as i32) >> shift) as f64
    } else {
        raw as f64
    }
}

//-----------------------------------------------------------------------------
