//-----------------------------------------------------------------------------
// Module session
// The CCP master instance: session lifecycle (connect, exchange id, seed and
// key, disconnect), the mirrored memory transfer address registers and the
// command primitives the DAQ layer builds on. One master talks to one slave,
// bound by the configured CRO/DTO identifier pair. Instantiate one master
// per slave.

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::codec::{crc_description, Cro, Crm, DaqListSize, Dto, ExchangeIdInfo, MtaPointer, ResourceMask, SeedInfo, SessionStatus, StartStopMode};
use crate::codec::{ByteOrder, CRC_DAQ_OVERLOAD};
use crate::daq::decoder::{LogSink, SampleSink};
use crate::daq::{DaqConfig, DaqSession, OdtMap};
use crate::engine::{CommandEngine, DiagCounters, DiagSnapshot};
use crate::error::CcpError;
use crate::transport::{CanFrame, CanSender};

/// Protocol version this master implements
pub const CCP_VERSION: (u8, u8) = (2, 1);

//-----------------------------------------------------------------------------
// Configuration

/// Static per slave configuration of a master instance
#[derive(Debug, Clone)]
pub struct CcpConfig {
    /// CAN id of master to slave CROs
    pub cro_id: u32,
    /// CAN id of slave to master DTOs (CRM, Event and DAQ-DTO share it)
    pub dto_id: u32,
    /// Station address of the slave, little endian in CONNECT/DISCONNECT
    pub station_address: u16,
    /// Byte order of multi byte command parameters, slave dependent
    pub byte_order: ByteOrder,
    /// 29 bit arbitration ids on the bus, informational for the embedder
    pub is_extended_id: bool,
    /// Command response deadline
    pub default_timeout: Duration,
}

impl CcpConfig {
    pub fn new(cro_id: u32, dto_id: u32, station_address: u16) -> CcpConfig {
        CcpConfig {
            cro_id,
            dto_id,
            station_address,
            byte_order: ByteOrder::BigEndian,
            is_extended_id: false,
            default_timeout: Duration::from_millis(250),
        }
    }

    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    pub fn with_extended_id(mut self) -> Self {
        self.is_extended_id = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

//-----------------------------------------------------------------------------
// Session state

/// Lifecycle state of the master/slave session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    Exchanging,
    Ready,
    DaqRunning,
    /// Terminal after a fatal error until disconnect() is called
    Faulted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connected => "connected",
            SessionState::Exchanging => "exchanging",
            SessionState::Ready => "ready",
            SessionState::DaqRunning => "DAQ running",
            SessionState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

//-----------------------------------------------------------------------------
// Slave events

/// Asynchronous Event Message from the slave (DTO with pid 0xFE).
/// Event codes share the command return code table.
#[derive(Debug, Clone, Copy)]
pub struct SlaveEvent {
    pub code: u8,
    /// Frame receive timestamp in microseconds
    pub timestamp: u64,
}

impl fmt::Display for SlaveEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X} ({}) at t={}us", self.code, crc_description(self.code), self.timestamp)
    }
}

/// Receiver of slave events, called on the receive pump in arrival order
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: SlaveEvent);
}

// Default handler if the embedder does not install one
struct LogEvents;

impl EventHandler for LogEvents {
    fn on_event(&self, event: SlaveEvent) {
        debug!("unhandled slave event {}", event);
    }
}

//-----------------------------------------------------------------------------
// Shared state between the command path and the receive pump

type SharedSampleSink = Arc<Mutex<dyn SampleSink>>;

pub(crate) struct SharedState {
    state: Mutex<SessionState>,
    mta: Mutex<[MtaPointer; 2]>,
    daq: Mutex<Option<Arc<OdtMap>>>,
    sink: Mutex<SharedSampleSink>,
    event_handler: Mutex<Arc<dyn EventHandler>>,
    counters: Arc<DiagCounters>,
}

impl SharedState {
    fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn set_state(&self, state: SessionState) {
        let mut current = self.state.lock();
        if *current != state {
            debug!("session state {} -> {}", *current, state);
            *current = state;
        }
    }
}

//-----------------------------------------------------------------------------
// CcpMaster

/// A CCP master bound to one slave.
///
/// Outbound CAN frames go through the CanSender given to new(), inbound
/// frames are read from the channel. The embedder may feed the channel with
/// all bus traffic, frames not carrying the configured DTO id are dropped.
pub struct CcpMaster {
    config: CcpConfig,
    engine: Arc<CommandEngine>,
    shared: Arc<SharedState>,
    frames: Mutex<Option<mpsc::Receiver<CanFrame>>>,
}

impl CcpMaster {
    pub fn new<S: CanSender>(config: CcpConfig, sender: S, frames: mpsc::Receiver<CanFrame>) -> CcpMaster {
        let counters = Arc::new(DiagCounters::default());
        let engine = Arc::new(CommandEngine::new(
            Box::new(sender),
            config.cro_id,
            config.default_timeout,
            Arc::clone(&counters),
        ));
        let shared = Arc::new(SharedState {
            state: Mutex::new(SessionState::Disconnected),
            mta: Mutex::new([MtaPointer::default(); 2]),
            daq: Mutex::new(None),
            sink: Mutex::new(Arc::new(Mutex::new(LogSink)) as SharedSampleSink),
            event_handler: Mutex::new(Arc::new(LogEvents) as Arc<dyn EventHandler>),
            counters,
        });
        CcpMaster {
            config,
            engine,
            shared,
            frames: Mutex::new(Some(frames)),
        }
    }

    /// Install a receiver for slave Event Messages, replacing the default
    /// logging handler
    pub fn set_event_handler(&self, handler: impl EventHandler + 'static) {
        *self.shared.event_handler.lock() = Arc::new(handler);
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Per session diagnostic counters of the receive pump
    pub fn diagnostics(&self) -> DiagSnapshot {
        self.shared.counters.snapshot()
    }

    /// Mirrored MTA0 register (UPLOAD, DNLOAD, CLEAR_MEMORY)
    pub fn mta0(&self) -> MtaPointer {
        self.shared.mta.lock()[0]
    }

    /// Mirrored MTA1 register (MOVE)
    pub fn mta1(&self) -> MtaPointer {
        self.shared.mta.lock()[1]
    }

    /// DAQ lifecycle handle for one DAQ list
    pub fn daq(&self, config: DaqConfig) -> DaqSession<'_> {
        DaqSession::new(self, config)
    }

    //------------------------------------------------------------------------
    // Lifecycle

    /// Connect to the slave. Spawns the receive pump on first use and
    /// installs the sample sink for DAQ acquisition.
    pub async fn connect<S: SampleSink + 'static>(&self, sink: Arc<Mutex<S>>) -> Result<(), CcpError> {
        let actual = self.state();
        if actual != SessionState::Disconnected {
            return Err(CcpError::ProtocolViolation {
                expected: SessionState::Disconnected,
                actual,
            });
        }

        *self.shared.sink.lock() = sink;
        if let Some(frames) = self.frames.lock().take() {
            let engine = Arc::clone(&self.engine);
            let shared = Arc::clone(&self.shared);
            let dto_id = self.config.dto_id;
            tokio::spawn(async move {
                CcpMaster::receive_task(frames, dto_id, engine, shared).await;
            });
        }

        // A connect failure leaves the session disconnected, not faulted
        self.engine.request(Cro::connect(self.config.station_address)).await?;
        *self.shared.mta.lock() = [MtaPointer::default(); 2];
        self.shared.set_state(SessionState::Connected);
        info!("connected to station 0x{:04X}", self.config.station_address);
        Ok(())
    }

    /// End the session. The state goes to Disconnected even if the slave no
    /// longer answers, this is the only way out of Faulted.
    pub async fn disconnect(&self, permanent: bool) -> Result<(), CcpError> {
        if self.state() == SessionState::Disconnected {
            return Ok(());
        }
        let res = self
            .engine
            .request(Cro::disconnect(permanent, self.config.station_address))
            .await;
        self.shared.set_state(SessionState::Disconnected);
        match res {
            Ok(_) => {
                info!("disconnected ({})", if permanent { "permanent" } else { "temporary" });
                Ok(())
            }
            Err(e) => {
                warn!("DISCONNECT not acknowledged: {}", e);
                Err(e)
            }
        }
    }

    /// Negotiate the protocol version, returns the version the slave
    /// implements. Strict slaves require this right after CONNECT.
    pub async fn get_ccp_version(&self, major: u8, minor: u8) -> Result<(u8, u8), CcpError> {
        self.require_online()?;
        let crm = self.command(Cro::get_ccp_version(major, minor)).await?;
        let slave = (crm.data[0], crm.data[1]);
        if slave != (major, minor) {
            info!("slave implements CCP {}.{}", slave.0, slave.1);
        }
        Ok(slave)
    }

    /// Exchange station identifiers. On success the session is ready for
    /// memory transfer and DAQ setup; the returned id_length is meant to be
    /// read with UPLOAD.
    pub async fn exchange_id(&self, device_info: &[u8]) -> Result<ExchangeIdInfo, CcpError> {
        self.require_online()?;
        let entry = self.state();
        if entry == SessionState::Connected {
            self.shared.set_state(SessionState::Exchanging);
        }
        match self.command(Cro::exchange_id(device_info)?).await {
            Ok(crm) => {
                self.shared.set_state(SessionState::Ready);
                Ok(ExchangeIdInfo::parse(&crm))
            }
            Err(e) => {
                if !e.is_fatal() && entry == SessionState::Connected {
                    self.shared.set_state(entry);
                }
                Err(e)
            }
        }
    }

    /// Request a seed for unlocking a protected resource. Key derivation is
    /// slave specific and left to the embedder.
    pub async fn get_seed(&self, resource: ResourceMask) -> Result<SeedInfo, CcpError> {
        self.require_online()?;
        let crm = self.command(Cro::get_seed(resource)).await?;
        Ok(SeedInfo::parse(&crm))
    }

    /// Send the key computed from a seed, returns the resource protection
    /// status after the unlock attempt
    pub async fn unlock(&self, key: &[u8]) -> Result<ResourceMask, CcpError> {
        self.require_online()?;
        let crm = self.command(Cro::unlock(key)?).await?;
        Ok(ResourceMask::from_bits_truncate(crm.data[0]))
    }

    /// Announce the session status to the slave
    pub async fn set_s_status(&self, status: SessionStatus) -> Result<(), CcpError> {
        self.require_online()?;
        self.command(Cro::set_s_status(status)).await?;
        Ok(())
    }

    //------------------------------------------------------------------------
    // Memory transfer

    /// Set a memory transfer address register (0 or 1) in the slave, the
    /// master keeps a mirror for plausibility tracking
    pub async fn set_mta(&self, mta: u8, extension: u8, address: u32) -> Result<(), CcpError> {
        self.require_online()?;
        self.command(Cro::set_mta(mta, extension, address, self.config.byte_order)?).await?;
        self.shared.mta.lock()[mta as usize] = MtaPointer { extension, address };
        Ok(())
    }

    /// Write up to 5 bytes at MTA0, which advances by the transferred size.
    /// Returns the slave's MTA0 after the transfer.
    pub async fn dnload(&self, data: &[u8]) -> Result<MtaPointer, CcpError> {
        self.require_online()?;
        let len = data.len() as u32;
        let crm = self.command(Cro::dnload(data)?).await?;
        let reported = self.parse_mta(&crm)?;
        self.advance_mta0(len, Some(reported));
        Ok(reported)
    }

    /// Write exactly 6 bytes at MTA0
    pub async fn dnload6(&self, data: &[u8; 6]) -> Result<MtaPointer, CcpError> {
        self.require_online()?;
        let crm = self.command(Cro::dnload6(data)).await?;
        let reported = self.parse_mta(&crm)?;
        self.advance_mta0(6, Some(reported));
        Ok(reported)
    }

    /// Read up to 5 bytes at MTA0, which advances by size. Consecutive
    /// uploads read consecutive slave memory.
    pub async fn upload(&self, size: u8) -> Result<Vec<u8>, CcpError> {
        self.require_online()?;
        let crm = self.command(Cro::upload(size)?).await?;
        self.advance_mta0(size as u32, None);
        Ok(crm.data[..size as usize].to_vec())
    }

    /// Ad hoc read of up to 5 bytes from an explicit address, MTA0 is not
    /// affected
    pub async fn short_up(&self, size: u8, extension: u8, address: u32) -> Result<Vec<u8>, CcpError> {
        self.require_online()?;
        let crm = self
            .command(Cro::short_up(size, extension, address, self.config.byte_order)?)
            .await?;
        Ok(crm.data[..size as usize].to_vec())
    }

    /// Erase a memory range starting at MTA0
    pub async fn clear_memory(&self, size: u32) -> Result<(), CcpError> {
        self.require_online()?;
        self.command(Cro::clear_memory(size, self.config.byte_order)).await?;
        Ok(())
    }

    //------------------------------------------------------------------------
    // DAQ command primitives, used by DaqSession

    /// Query the ODT capacity and first PID of a DAQ list. The DTO id
    /// defaults to the configured one.
    pub async fn get_daq_size(&self, daq_list: u8, dto_id: Option<u32>) -> Result<DaqListSize, CcpError> {
        self.require_online()?;
        let dto_id = dto_id.unwrap_or(self.config.dto_id);
        let crm = self.command(Cro::get_daq_size(daq_list, dto_id, self.config.byte_order)).await?;
        Ok(DaqListSize::parse(&crm))
    }

    /// Point the slave's DAQ write pointer at one ODT entry
    pub async fn set_daq_ptr(&self, daq_list: u8, odt: u8, element: u8) -> Result<(), CcpError> {
        self.require_online()?;
        self.command(Cro::set_daq_ptr(daq_list, odt, element)).await?;
        Ok(())
    }

    /// Install one element at the current DAQ pointer
    pub async fn write_daq(&self, size: u8, extension: u8, address: u32) -> Result<(), CcpError> {
        self.require_online()?;
        self.command(Cro::write_daq(size, extension, address, self.config.byte_order)?).await?;
        Ok(())
    }

    /// Start, stop or prepare one DAQ list
    pub async fn start_stop(&self, mode: StartStopMode, daq_list: u8, last_odt: u8, event_channel: u8, prescaler: u16) -> Result<(), CcpError> {
        self.require_online()?;
        self.command(Cro::start_stop(mode, daq_list, last_odt, event_channel, prescaler)).await?;
        Ok(())
    }

    /// Synchronized start or stop of all prepared DAQ lists
    pub async fn start_stop_all(&self, start: bool) -> Result<(), CcpError> {
        self.require_online()?;
        self.command(Cro::start_stop_all(start)).await?;
        Ok(())
    }

    //------------------------------------------------------------------------
    // Internal

    // Send one CRO and fault the session on errors that invalidate it
    async fn command(&self, cro: Cro) -> Result<Crm, CcpError> {
        let res = self.engine.request(cro).await;
        if let Err(e) = &res {
            if e.is_fatal() {
                error!("fatal session error: {}", e);
                self.shared.set_state(SessionState::Faulted);
            }
        }
        res
    }

    fn require_online(&self) -> Result<(), CcpError> {
        let actual = self.state();
        match actual {
            SessionState::Disconnected | SessionState::Faulted => Err(CcpError::ProtocolViolation {
                expected: SessionState::Connected,
                actual,
            }),
            _ => Ok(()),
        }
    }

    pub(crate) fn require_state(&self, expected: SessionState) -> Result<(), CcpError> {
        let actual = self.state();
        if actual != expected {
            return Err(CcpError::ProtocolViolation { expected, actual });
        }
        Ok(())
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.shared.set_state(state);
    }

    pub(crate) fn install_odt_map(&self, map: OdtMap) {
        *self.shared.daq.lock() = Some(Arc::new(map));
    }

    pub(crate) fn discard_odt_map(&self) {
        self.shared.daq.lock().take();
    }

    pub(crate) fn armed_odt_count(&self) -> Option<usize> {
        self.shared.daq.lock().as_ref().map(|map| map.odts.len())
    }

    fn parse_mta(&self, crm: &Crm) -> Result<MtaPointer, CcpError> {
        MtaPointer::parse(crm, self.config.byte_order).inspect_err(|_| {
            self.shared.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
        })
    }

    // Advance the MTA0 mirror after a data transfer. The slave's value is
    // authoritative, the mirror only serves plausibility checks.
    fn advance_mta0(&self, len: u32, reported: Option<MtaPointer>) {
        let mut mta = self.shared.mta.lock();
        mta[0].address = mta[0].address.wrapping_add(len);
        if let Some(reported) = reported {
            if reported != mta[0] {
                warn!(
                    "MTA0 mirror {}:0x{:08X} diverges from slave {}:0x{:08X}",
                    mta[0].extension, mta[0].address, reported.extension, reported.address
                );
                mta[0] = reported;
            }
        }
    }

    //------------------------------------------------------------------------
    // Receive pump
    // The only execution context that completes requests, dispatches events
    // and feeds the DAQ decoder. Runs until the frame source closes.

    async fn receive_task(mut frames: mpsc::Receiver<CanFrame>, dto_id: u32, engine: Arc<CommandEngine>, shared: Arc<SharedState>) {
        debug!("receive task started, DTO id 0x{:X}", dto_id);
        while let Some(frame) = frames.recv().await {
            if frame.id != dto_id {
                continue; // unrelated bus traffic
            }
            match Dto::parse(&frame.data) {
                Dto::Crm(crm) => engine.complete(crm),
                Dto::Event { code } => {
                    info!("slave event 0x{:02X}: {}", code, crc_description(code));
                    if code == CRC_DAQ_OVERLOAD && shared.state() == SessionState::DaqRunning {
                        warn!("DAQ processor overload while acquisition is running, stop the DAQ session");
                    }
                    let handler = shared.event_handler.lock().clone();
                    handler.on_event(SlaveEvent {
                        code,
                        timestamp: frame.timestamp,
                    });
                }
                Dto::Daq { pid, data } => {
                    let map = shared.daq.lock().clone();
                    match map {
                        Some(map) => {
                            let sink = shared.sink.lock().clone();
                            map.decode(pid, &data, frame.timestamp, &mut *sink.lock(), &shared.counters);
                        }
                        None => {
                            shared.counters.unexpected_pid.fetch_add(1, Ordering::Relaxed);
                            trace!("DAQ-DTO pid=0x{:02X} with no armed DAQ list", pid);
                        }
                    }
                }
            }
        }
        // Frame source gone: abandon a pending request, the session cannot
        // continue without inbound frames
        engine.abort_pending();
        if shared.state() != SessionState::Disconnected {
            shared.set_state(SessionState::Faulted);
        }
        debug!("receive task: frame source closed");
    }
}
