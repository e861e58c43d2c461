//-----------------------------------------------------------------------------
// Module slave_sim
// A scripted CCP slave for integration testing. Runs as a tokio task wired
// to the master through two channels: CRO payloads out of the master's
// CanSender, DTO frames into the master's inbound channel. Implements a
// small memory model, the DAQ list machinery and optional seed/key
// protection. Addresses are parsed big endian, matching the default master
// configuration.

#![allow(dead_code)] // not every test uses every helper

use std::collections::BTreeMap;
use std::io;
use std::time::Duration;

use tokio::sync::mpsc;

use ccp_master::{CanFrame, CanSender, SampleSink};

//-----------------------------------------------------------------------------
// Bus halves

// Outbound half handed to the master, forwards CRO payloads to the slave task
pub struct SimBus {
    tx: mpsc::UnboundedSender<[u8; 8]>,
}

impl CanSender for SimBus {
    fn send_frame(&self, _id: u32, data: [u8; 8]) -> io::Result<()> {
        self.tx
            .send(data)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "slave gone"))
    }
}

/// Channels connecting a master to a slave task:
/// (sender for the master, CRO receiver for the slave,
///  DTO sender for the slave, DTO receiver for the master)
pub fn sim_bus() -> (SimBus, mpsc::UnboundedReceiver<[u8; 8]>, mpsc::Sender<CanFrame>, mpsc::Receiver<CanFrame>) {
    let (cro_tx, cro_rx) = mpsc::unbounded_channel();
    let (dto_tx, dto_rx) = mpsc::channel(256);
    (SimBus { tx: cro_tx }, cro_rx, dto_tx, dto_rx)
}

//-----------------------------------------------------------------------------
// Sample sink collecting decoded values for assertions

#[derive(Debug, Default)]
pub struct VecSink {
    pub samples: Vec<(String, f64, u64)>,
}

impl SampleSink for VecSink {
    fn on_sample(&mut self, name: &str, value: f64, timestamp: u64) {
        self.samples.push((name.to_string(), value, timestamp));
    }
}

impl VecSink {
    pub fn values_of(&self, name: &str) -> Vec<f64> {
        self.samples.iter().filter(|(n, _, _)| n == name).map(|(_, v, _)| *v).collect()
    }
}

//-----------------------------------------------------------------------------
// Slave simulator

pub struct SlaveSim {
    pub station_address: u16,
    pub dto_id: u32,
    /// Number of ODTs GET_DAQ_SIZE reports for any DAQ list
    pub odt_count: u8,
    /// PID of the first ODT in DAQ-DTO frames
    pub first_pid: u8,
    /// DAQ cycles emitted per START_STOP_ALL(start)
    pub cycles_per_start: usize,
    /// Additionally emit one DAQ-DTO with this PID per start
    pub rogue_pid: Option<u8>,
    /// Refuse memory access with ACCESS_LOCKED until UNLOCK is received
    pub protected: bool,
    pub memory: Vec<u8>,

    mta0: u32,
    unlocked: bool,
    daq_ptr: (u8, u8),
    // (odt, element index) -> (size, address), filled by WRITE_DAQ
    daq_entries: BTreeMap<(u8, u8), (u8, u32)>,
    timestamp: u64,
}

impl SlaveSim {
    pub fn new(station_address: u16, dto_id: u32) -> SlaveSim {
        // Address pattern memory so uploads have predictable content
        let memory = (0..0x10000).map(|i| (i & 0xFF) as u8).collect();
        SlaveSim {
            station_address,
            dto_id,
            odt_count: 10,
            first_pid: 0xF0,
            cycles_per_start: 2,
            rogue_pid: None,
            protected: false,
            memory,
            mta0: 0,
            unlocked: false,
            daq_ptr: (0, 0),
            daq_entries: BTreeMap::new(),
            timestamp: 0,
        }
    }

    pub fn write_memory(&mut self, address: u32, data: &[u8]) {
        let start = address as usize;
        self.memory[start..start + data.len()].copy_from_slice(data);
    }

    /// Process CROs until the master goes away
    pub async fn run(mut self, mut cro_rx: mpsc::UnboundedReceiver<[u8; 8]>, dto_tx: mpsc::Sender<CanFrame>) {
        while let Some(cro) = cro_rx.recv().await {
            if !self.handle_cro(&cro, &dto_tx).await {
                break;
            }
        }
    }

    async fn send_crm(&mut self, dto_tx: &mpsc::Sender<CanFrame>, code: u8, ctr: u8, data: [u8; 5]) -> bool {
        let mut payload = [0u8; 8];
        payload[0] = 0xFF;
        payload[1] = code;
        payload[2] = ctr;
        payload[3..].copy_from_slice(&data);
        self.timestamp += 100;
        dto_tx.send(CanFrame::new(self.dto_id, payload, self.timestamp)).await.is_ok()
    }

    async fn send_daq_dto(&mut self, dto_tx: &mpsc::Sender<CanFrame>, pid: u8, data: [u8; 7]) -> bool {
        let mut payload = [0u8; 8];
        payload[0] = pid;
        payload[1..].copy_from_slice(&data);
        self.timestamp += 100;
        dto_tx.send(CanFrame::new(self.dto_id, payload, self.timestamp)).await.is_ok()
    }

    fn read_memory(&self, address: u32, size: usize) -> [u8; 5] {
        let mut data = [0u8; 5];
        let start = address as usize % self.memory.len();
        for (i, b) in data.iter_mut().take(size).enumerate() {
            *b = self.memory[(start + i) % self.memory.len()];
        }
        data
    }

    fn be_u32(bytes: &[u8]) -> u32 {
        u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    fn locked(&self) -> bool {
        self.protected && !self.unlocked
    }

    async fn handle_cro(&mut self, cro: &[u8; 8], dto_tx: &mpsc::Sender<CanFrame>) -> bool {
        let cmd = cro[0];
        let ctr = cro[1];
        match cmd {
            // CONNECT, station address little endian; other stations stay quiet
            0x01 => {
                let station = u16::from_le_bytes([cro[2], cro[3]]);
                if station != self.station_address {
                    return true;
                }
                self.send_crm(dto_tx, 0x00, ctr, [0; 5]).await
            }
            // GET_CCP_VERSION
            0x1B => self.send_crm(dto_tx, 0x00, ctr, [2, 1, 0, 0, 0]).await,
            // EXCHANGE_ID: id length 4, CAL and DAQ available, nothing protected
            0x17 => {
                let protection = if self.locked() { 0x03 } else { 0x00 };
                self.send_crm(dto_tx, 0x00, ctr, [4, 0, 0x03, protection, 0]).await
            }
            // GET_SEED
            0x12 => {
                let protected = self.locked() as u8;
                self.send_crm(dto_tx, 0x00, ctr, [protected, 0xAA, 0xBB, 0xCC, 0xDD]).await
            }
            // UNLOCK: any key is accepted, nothing remains protected
            0x13 => {
                self.unlocked = true;
                self.send_crm(dto_tx, 0x00, ctr, [0x00, 0, 0, 0, 0]).await
            }
            // SET_MTA
            0x02 => {
                if cro[2] == 0 {
                    self.mta0 = Self::be_u32(&cro[4..8]);
                }
                self.send_crm(dto_tx, 0x00, ctr, [0; 5]).await
            }
            // DNLOAD
            0x03 => {
                if self.locked() {
                    return self.send_crm(dto_tx, 0x35, ctr, [0; 5]).await;
                }
                let size = cro[2] as usize;
                let start = self.mta0 as usize;
                self.memory[start..start + size].copy_from_slice(&cro[3..3 + size]);
                self.mta0 += size as u32;
                let mut data = [0u8; 5];
                data[1..5].copy_from_slice(&self.mta0.to_be_bytes());
                self.send_crm(dto_tx, 0x00, ctr, data).await
            }
            // DNLOAD_6
            0x23 => {
                if self.locked() {
                    return self.send_crm(dto_tx, 0x35, ctr, [0; 5]).await;
                }
                let start = self.mta0 as usize;
                self.memory[start..start + 6].copy_from_slice(&cro[2..8]);
                self.mta0 += 6;
                let mut data = [0u8; 5];
                data[1..5].copy_from_slice(&self.mta0.to_be_bytes());
                self.send_crm(dto_tx, 0x00, ctr, data).await
            }
            // UPLOAD
            0x04 => {
                if self.locked() {
                    return self.send_crm(dto_tx, 0x35, ctr, [0; 5]).await;
                }
                let size = cro[2] as usize;
                let data = self.read_memory(self.mta0, size);
                self.mta0 += size as u32;
                self.send_crm(dto_tx, 0x00, ctr, data).await
            }
            // SHORT_UP
            0x0F => {
                if self.locked() {
                    return self.send_crm(dto_tx, 0x35, ctr, [0; 5]).await;
                }
                let size = cro[2] as usize;
                let address = Self::be_u32(&cro[4..8]);
                let data = self.read_memory(address, size);
                self.send_crm(dto_tx, 0x00, ctr, data).await
            }
            // CLEAR_MEMORY
            0x10 => {
                let size = Self::be_u32(&cro[2..6]) as usize;
                let start = self.mta0 as usize;
                self.memory[start..start + size].fill(0);
                self.send_crm(dto_tx, 0x00, ctr, [0; 5]).await
            }
            // SET_S_STATUS
            0x0C => self.send_crm(dto_tx, 0x00, ctr, [0; 5]).await,
            // GET_DAQ_SIZE
            0x14 => {
                let data = [self.odt_count, self.first_pid, 0, 0, 0];
                self.send_crm(dto_tx, 0x00, ctr, data).await
            }
            // SET_DAQ_PTR
            0x15 => {
                self.daq_ptr = (cro[3], cro[4]);
                self.send_crm(dto_tx, 0x00, ctr, [0; 5]).await
            }
            // WRITE_DAQ
            0x16 => {
                let size = cro[2];
                let address = Self::be_u32(&cro[4..8]);
                self.daq_entries.insert(self.daq_ptr, (size, address));
                self.send_crm(dto_tx, 0x00, ctr, [0; 5]).await
            }
            // START_STOP
            0x06 => self.send_crm(dto_tx, 0x00, ctr, [0; 5]).await,
            // START_STOP_ALL
            0x08 => {
                let start = cro[2] != 0;
                if !self.send_crm(dto_tx, 0x00, ctr, [0; 5]).await {
                    return false;
                }
                if start && !self.emit_daq_cycles(dto_tx).await {
                    return false;
                }
                true
            }
            // DISCONNECT
            0x07 => self.send_crm(dto_tx, 0x00, ctr, [0; 5]).await,
            // Anything else is not implemented by this simulator
            _ => self.send_crm(dto_tx, 0x30, ctr, [0; 5]).await,
        }
    }

    // Emit the armed ODTs from memory, cycles_per_start times
    async fn emit_daq_cycles(&mut self, dto_tx: &mpsc::Sender<CanFrame>) -> bool {
        // Group the armed entries per ODT with ascending element index,
        // offsets accumulate in that order like on the master side
        let mut odts: BTreeMap<u8, Vec<(u8, u32)>> = BTreeMap::new();
        for (&(odt, _element), &entry) in &self.daq_entries {
            odts.entry(odt).or_default().push(entry);
        }

        for _ in 0..self.cycles_per_start {
            for (&odt, entries) in &odts {
                let mut data = [0u8; 7];
                let mut offset = 0usize;
                for &(size, address) in entries {
                    let bytes = self.read_memory(address, size as usize);
                    data[offset..offset + size as usize].copy_from_slice(&bytes[..size as usize]);
                    offset += size as usize;
                }
                if !self.send_daq_dto(dto_tx, self.first_pid + odt, data).await {
                    return false;
                }
            }
            if let Some(pid) = self.rogue_pid {
                if !self.send_daq_dto(dto_tx, pid, [0; 7]).await {
                    return false;
                }
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        true
    }
}
