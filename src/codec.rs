//-----------------------------------------------------------------------------
// Module codec
// CCP 2.1 frame codec: CRO builders and DTO parsers over fixed 8 byte CAN
// payloads. Multi byte CRO parameters and CRM return fields are serialized
// in the slave's declared byte order; the station address in CONNECT and
// DISCONNECT is always little endian per the CCP standard.

use bytes::{BufMut, BytesMut};
use std::fmt;

use crate::error::CcpError;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

//-----------------------------------------------------------------------------
// Frame geometry

/// Payload length of every CCP frame, unused trailing bytes are zero filled
pub const CCP_DLC: usize = 8;
/// Return bytes of a CRM after PID, ERR and CTR
pub const CRM_DATA_LEN: usize = 5;
/// Signal bytes of a DAQ-DTO after the PID
pub const ODT_DATA_LEN: usize = 7;

/// DTO discriminator byte for a Command Return Message
pub const PID_CRM: u8 = 0xFF;
/// DTO discriminator byte for an Event Message
pub const PID_EVENT: u8 = 0xFE;

//-----------------------------------------------------------------------------
// Command return codes

pub const CRC_ACKNOWLEDGE: u8 = 0x00;
pub const CRC_DAQ_OVERLOAD: u8 = 0x01;
pub const CRC_COMMAND_BUSY: u8 = 0x10;
pub const CRC_DAQ_BUSY: u8 = 0x11;
pub const CRC_INTERNAL_TIMEOUT: u8 = 0x12;
pub const CRC_KEY_REQUEST: u8 = 0x18;
pub const CRC_SESSION_STATUS_REQUEST: u8 = 0x19;
pub const CRC_COLD_START_REQUEST: u8 = 0x20;
pub const CRC_CAL_INIT_REQUEST: u8 = 0x21;
pub const CRC_DAQ_INIT_REQUEST: u8 = 0x22;
pub const CRC_CODE_UPDATE_REQUEST: u8 = 0x23;
pub const CRC_UNKNOWN_COMMAND: u8 = 0x30;
pub const CRC_COMMAND_SYNTAX: u8 = 0x31;
pub const CRC_OUT_OF_RANGE: u8 = 0x32;
pub const CRC_ACCESS_DENIED: u8 = 0x33;
pub const CRC_OVERLOAD: u8 = 0x34;
pub const CRC_ACCESS_LOCKED: u8 = 0x35;
pub const CRC_NOT_AVAILABLE: u8 = 0x36;

/// Human readable text for a command return code (also used for the event
/// codes of Event Messages, which share the same table)
pub fn crc_description(code: u8) -> &'static str {
    match code {
        CRC_ACKNOWLEDGE => "acknowledge",
        CRC_DAQ_OVERLOAD => "DAQ processor overload",
        CRC_COMMAND_BUSY => "command processor busy",
        CRC_DAQ_BUSY => "DAQ processor busy",
        CRC_INTERNAL_TIMEOUT => "internal timeout",
        CRC_KEY_REQUEST => "key request",
        CRC_SESSION_STATUS_REQUEST => "session status request",
        CRC_COLD_START_REQUEST => "cold start request",
        CRC_CAL_INIT_REQUEST => "calibration data initialization request",
        CRC_DAQ_INIT_REQUEST => "DAQ list initialization request",
        CRC_CODE_UPDATE_REQUEST => "code update request",
        CRC_UNKNOWN_COMMAND => "unknown command",
        CRC_COMMAND_SYNTAX => "command syntax error",
        CRC_OUT_OF_RANGE => "parameter out of range",
        CRC_ACCESS_DENIED => "access denied",
        CRC_OVERLOAD => "overload",
        CRC_ACCESS_LOCKED => "access locked",
        CRC_NOT_AVAILABLE => "resource or function not available",
        _ => "unknown return code",
    }
}

//-----------------------------------------------------------------------------
// Byte order

/// Byte order used for multi byte CRO parameters and CRM return fields.
/// Most CCP slaves are Motorola devices, so big endian is the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    #[default]
    BigEndian,
    LittleEndian,
}

//-----------------------------------------------------------------------------
// Command codes

/// CCP command codes, mandatory and optional command set of CCP 2.1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Connect = 0x01,
    SetMta = 0x02,
    Dnload = 0x03,
    Upload = 0x04,
    Test = 0x05,
    StartStop = 0x06,
    Disconnect = 0x07,
    StartStopAll = 0x08,
    GetActiveCalPage = 0x09,
    SetSStatus = 0x0C,
    GetSStatus = 0x0D,
    BuildChksum = 0x0E,
    ShortUp = 0x0F,
    ClearMemory = 0x10,
    SelectCalPage = 0x11,
    GetSeed = 0x12,
    Unlock = 0x13,
    GetDaqSize = 0x14,
    SetDaqPtr = 0x15,
    WriteDaq = 0x16,
    ExchangeId = 0x17,
    Program = 0x18,
    Move = 0x19,
    GetCcpVersion = 0x1B,
    DiagService = 0x20,
    ActionService = 0x21,
    Program6 = 0x22,
    Dnload6 = 0x23,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Connect => "CONNECT",
            Command::SetMta => "SET_MTA",
            Command::Dnload => "DNLOAD",
            Command::Upload => "UPLOAD",
            Command::Test => "TEST",
            Command::StartStop => "START_STOP",
            Command::Disconnect => "DISCONNECT",
            Command::StartStopAll => "START_STOP_ALL",
            Command::GetActiveCalPage => "GET_ACTIVE_CAL_PAGE",
            Command::SetSStatus => "SET_S_STATUS",
            Command::GetSStatus => "GET_S_STATUS",
            Command::BuildChksum => "BUILD_CHKSUM",
            Command::ShortUp => "SHORT_UP",
            Command::ClearMemory => "CLEAR_MEMORY",
            Command::SelectCalPage => "SELECT_CAL_PAGE",
            Command::GetSeed => "GET_SEED",
            Command::Unlock => "UNLOCK",
            Command::GetDaqSize => "GET_DAQ_SIZE",
            Command::SetDaqPtr => "SET_DAQ_PTR",
            Command::WriteDaq => "WRITE_DAQ",
            Command::ExchangeId => "EXCHANGE_ID",
            Command::Program => "PROGRAM",
            Command::Move => "MOVE",
            Command::GetCcpVersion => "GET_CCP_VERSION",
            Command::DiagService => "DIAG_SERVICE",
            Command::ActionService => "ACTION_SERVICE",
            Command::Program6 => "PROGRAM_6",
            Command::Dnload6 => "DNLOAD_6",
        };
        f.write_str(name)
    }
}

//-----------------------------------------------------------------------------
// START_STOP mode

/// Mode parameter of START_STOP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StartStopMode {
    Stop = 0,
    Start = 1,
    /// Prepare for a synchronized start by START_STOP_ALL
    Prepare = 2,
}

//-----------------------------------------------------------------------------
// Resource and session status masks

bitflags::bitflags! {
    /// Resource availability and protection mask (EXCHANGE_ID, GET_SEED, UNLOCK)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ResourceMask: u8 {
        const CAL = 0x01;
        const DAQ = 0x02;
        const PGM = 0x40;
    }
}

bitflags::bitflags! {
    /// Session status bits announced to the slave with SET_S_STATUS
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SessionStatus: u8 {
        const CAL = 0x01;
        const DAQ = 0x02;
        const RESUME = 0x04;
        const STORE = 0x40;
        const RUN = 0x80;
    }
}

//-----------------------------------------------------------------------------
// CRO payload builder

// Internal builder for the fixed 8 byte CRO payload [CMD, CTR, p0..p5].
// The CTR byte is left 0 here, the command engine patches it when the CRO
// is taken off the queue and sent.
struct CroBuilder {
    command: Command,
    data: BytesMut,
    byte_order: ByteOrder,
}

impl CroBuilder {
    fn new(command: Command, byte_order: ByteOrder) -> CroBuilder {
        let mut cro = CroBuilder {
            command,
            data: BytesMut::with_capacity(CCP_DLC),
            byte_order,
        };
        cro.data.put_u8(command as u8);
        cro.data.put_u8(0); // CTR, patched at send time
        cro
    }

    fn add_u8(mut self, value: u8) -> Self {
        self.data.put_u8(value);
        self
    }

    fn add_u16(mut self, value: u16) -> Self {
        match self.byte_order {
            ByteOrder::BigEndian => self.data.put_u16(value),
            ByteOrder::LittleEndian => self.data.put_u16_le(value),
        }
        self
    }

    // Station addresses are little endian on the wire regardless of the
    // slave's declared byte order
    fn add_u16_le(mut self, value: u16) -> Self {
        self.data.put_u16_le(value);
        self
    }

    fn add_u32(mut self, value: u32) -> Self {
        match self.byte_order {
            ByteOrder::BigEndian => self.data.put_u32(value),
            ByteOrder::LittleEndian => self.data.put_u32_le(value),
        }
        self
    }

    fn add_slice(mut self, value: &[u8]) -> Self {
        self.data.put_slice(value);
        self
    }

    // Parameter ranges are validated by the per command constructors, an
    // overlong payload here is a codec bug
    fn build(self) -> Cro {
        assert!(self.data.len() <= CCP_DLC, "CRO payload overflow");
        let mut data = [0u8; CCP_DLC];
        data[..self.data.len()].copy_from_slice(&self.data);
        Cro {
            command: self.command,
            data,
        }
    }
}

//-----------------------------------------------------------------------------
// CRO

/// An encoded Command Receive Object, ready for CTR assignment and transmit
#[derive(Debug, Clone, Copy)]
pub struct Cro {
    pub command: Command,
    pub data: [u8; CCP_DLC],
}

impl Cro {
    /// Patch the command counter into the payload
    pub(crate) fn set_ctr(&mut self, ctr: u8) {
        self.data[1] = ctr;
    }

    pub fn connect(station_address: u16) -> Cro {
        // Infallible, 2 parameter bytes
        CroBuilder::new(Command::Connect, ByteOrder::LittleEndian)
            .add_u16_le(station_address)
            .build()
    }

    pub fn get_ccp_version(major: u8, minor: u8) -> Cro {
        CroBuilder::new(Command::GetCcpVersion, ByteOrder::BigEndian)
            .add_u8(major)
            .add_u8(minor)
            .build()
    }

    /// Master device identifier, up to 6 implementation specific bytes
    pub fn exchange_id(device_info: &[u8]) -> Result<Cro, CcpError> {
        if device_info.len() > 6 {
            return Err(CcpError::Encode {
                field: "device_info",
                reason: "at most 6 bytes",
            });
        }
        Ok(CroBuilder::new(Command::ExchangeId, ByteOrder::BigEndian)
            .add_slice(device_info)
            .build())
    }

    pub fn get_seed(resource: ResourceMask) -> Cro {
        CroBuilder::new(Command::GetSeed, ByteOrder::BigEndian)
            .add_u8(resource.bits())
            .build()
    }

    pub fn unlock(key: &[u8]) -> Result<Cro, CcpError> {
        if key.is_empty() || key.len() > 6 {
            return Err(CcpError::Encode {
                field: "key",
                reason: "1 to 6 bytes",
            });
        }
        Ok(CroBuilder::new(Command::Unlock, ByteOrder::BigEndian)
            .add_slice(key)
            .build())
    }

    pub fn set_mta(mta: u8, extension: u8, address: u32, byte_order: ByteOrder) -> Result<Cro, CcpError> {
        if mta > 1 {
            return Err(CcpError::Encode {
                field: "mta",
                reason: "MTA number is 0 or 1",
            });
        }
        Ok(CroBuilder::new(Command::SetMta, byte_order)
            .add_u8(mta)
            .add_u8(extension)
            .add_u32(address)
            .build())
    }

    pub fn dnload(data: &[u8]) -> Result<Cro, CcpError> {
        if data.is_empty() || data.len() > 5 {
            return Err(CcpError::Encode {
                field: "data",
                reason: "DNLOAD transfers 1 to 5 bytes",
            });
        }
        Ok(CroBuilder::new(Command::Dnload, ByteOrder::BigEndian)
            .add_u8(data.len() as u8)
            .add_slice(data)
            .build())
    }

    pub fn dnload6(data: &[u8; 6]) -> Cro {
        CroBuilder::new(Command::Dnload6, ByteOrder::BigEndian)
            .add_slice(data)
            .build()
    }

    pub fn upload(size: u8) -> Result<Cro, CcpError> {
        if size == 0 || size as usize > CRM_DATA_LEN {
            return Err(CcpError::Encode {
                field: "size",
                reason: "UPLOAD transfers 1 to 5 bytes",
            });
        }
        Ok(CroBuilder::new(Command::Upload, ByteOrder::BigEndian)
            .add_u8(size)
            .build())
    }

    pub fn short_up(size: u8, extension: u8, address: u32, byte_order: ByteOrder) -> Result<Cro, CcpError> {
        if size == 0 || size as usize > CRM_DATA_LEN {
            return Err(CcpError::Encode {
                field: "size",
                reason: "SHORT_UP transfers 1 to 5 bytes",
            });
        }
        Ok(CroBuilder::new(Command::ShortUp, byte_order)
            .add_u8(size)
            .add_u8(extension)
            .add_u32(address)
            .build())
    }

    pub fn clear_memory(size: u32, byte_order: ByteOrder) -> Cro {
        CroBuilder::new(Command::ClearMemory, byte_order)
            .add_u32(size)
            .build()
    }

    pub fn get_daq_size(daq_list: u8, dto_id: u32, byte_order: ByteOrder) -> Cro {
        CroBuilder::new(Command::GetDaqSize, byte_order)
            .add_u8(daq_list)
            .add_u8(0)
            .add_u32(dto_id)
            .build()
    }

    pub fn set_daq_ptr(daq_list: u8, odt: u8, element: u8) -> Cro {
        CroBuilder::new(Command::SetDaqPtr, ByteOrder::BigEndian)
            .add_u8(daq_list)
            .add_u8(odt)
            .add_u8(element)
            .build()
    }

    pub fn write_daq(size: u8, extension: u8, address: u32, byte_order: ByteOrder) -> Result<Cro, CcpError> {
        if !matches!(size, 1 | 2 | 4) {
            return Err(CcpError::Encode {
                field: "size",
                reason: "DAQ element size is 1, 2 or 4",
            });
        }
        Ok(CroBuilder::new(Command::WriteDaq, byte_order)
            .add_u8(size)
            .add_u8(extension)
            .add_u32(address)
            .build())
    }

    /// The transmission rate prescaler is a big endian word per CCP 2.1
    pub fn start_stop(mode: StartStopMode, daq_list: u8, last_odt: u8, event_channel: u8, prescaler: u16) -> Cro {
        CroBuilder::new(Command::StartStop, ByteOrder::BigEndian)
            .add_u8(mode as u8)
            .add_u8(daq_list)
            .add_u8(last_odt)
            .add_u8(event_channel)
            .add_u16(prescaler)
            .build()
    }

    pub fn start_stop_all(start: bool) -> Cro {
        CroBuilder::new(Command::StartStopAll, ByteOrder::BigEndian)
            .add_u8(start as u8)
            .build()
    }

    pub fn set_s_status(status: SessionStatus) -> Cro {
        CroBuilder::new(Command::SetSStatus, ByteOrder::BigEndian)
            .add_u8(status.bits())
            .build()
    }

    pub fn disconnect(permanent: bool, station_address: u16) -> Cro {
        CroBuilder::new(Command::Disconnect, ByteOrder::LittleEndian)
            .add_u8(permanent as u8)
            .add_u8(0)
            .add_u16_le(station_address)
            .build()
    }
}

//-----------------------------------------------------------------------------
// DTO

/// Command Return Message, the slave's synchronous response to a CRO
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crm {
    pub return_code: u8,
    pub ctr: u8,
    pub data: [u8; CRM_DATA_LEN],
}

impl Crm {
    /// Encode to a DTO payload, the inverse of Dto::parse
    pub fn encode(&self) -> [u8; CCP_DLC] {
        let mut payload = [0u8; CCP_DLC];
        payload[0] = PID_CRM;
        payload[1] = self.return_code;
        payload[2] = self.ctr;
        payload[3..].copy_from_slice(&self.data);
        payload
    }

    pub fn u16_at(&self, offset: usize, byte_order: ByteOrder) -> Result<u16, CcpError> {
        let b: [u8; 2] = self
            .data
            .get(offset..offset + 2)
            .and_then(|s| s.try_into().ok())
            .ok_or(CcpError::Decode {
                offset,
                reason: "u16 beyond CRM data",
            })?;
        Ok(match byte_order {
            ByteOrder::BigEndian => u16::from_be_bytes(b),
            ByteOrder::LittleEndian => u16::from_le_bytes(b),
        })
    }

    pub fn u32_at(&self, offset: usize, byte_order: ByteOrder) -> Result<u32, CcpError> {
        let b: [u8; 4] = self
            .data
            .get(offset..offset + 4)
            .and_then(|s| s.try_into().ok())
            .ok_or(CcpError::Decode {
                offset,
                reason: "u32 beyond CRM data",
            })?;
        Ok(match byte_order {
            ByteOrder::BigEndian => u32::from_be_bytes(b),
            ByteOrder::LittleEndian => u32::from_le_bytes(b),
        })
    }
}

/// Inbound DTO payload discriminated by its first byte
#[derive(Debug, Clone, Copy)]
pub enum Dto {
    Crm(Crm),
    Event { code: u8 },
    Daq { pid: u8, data: [u8; ODT_DATA_LEN] },
}

impl Dto {
    pub fn parse(payload: &[u8; CCP_DLC]) -> Dto {
        match payload[0] {
            PID_CRM => {
                let mut data = [0u8; CRM_DATA_LEN];
                data.copy_from_slice(&payload[3..]);
                Dto::Crm(Crm {
                    return_code: payload[1],
                    ctr: payload[2],
                    data,
                })
            }
            PID_EVENT => Dto::Event { code: payload[1] },
            pid => {
                let mut data = [0u8; ODT_DATA_LEN];
                data.copy_from_slice(&payload[1..]);
                Dto::Daq { pid, data }
            }
        }
    }
}

//-----------------------------------------------------------------------------
// Typed CRM payload views

/// EXCHANGE_ID return data
#[derive(Debug, Clone, Copy)]
pub struct ExchangeIdInfo {
    /// Length of the slave device identifier in bytes, read it with UPLOAD
    pub id_length: u8,
    /// Data type qualifier of the slave device identifier
    pub data_type: u8,
    pub availability: ResourceMask,
    pub protection: ResourceMask,
}

impl ExchangeIdInfo {
    pub(crate) fn parse(crm: &Crm) -> ExchangeIdInfo {
        ExchangeIdInfo {
            id_length: crm.data[0],
            data_type: crm.data[1],
            availability: ResourceMask::from_bits_truncate(crm.data[2]),
            protection: ResourceMask::from_bits_truncate(crm.data[3]),
        }
    }
}

/// GET_DAQ_SIZE return data
#[derive(Debug, Clone, Copy)]
pub struct DaqListSize {
    /// Number of ODTs available in the DAQ list
    pub odt_count: u8,
    /// PID of the list's first ODT in DAQ-DTO frames
    pub first_pid: u8,
}

impl DaqListSize {
    pub(crate) fn parse(crm: &Crm) -> DaqListSize {
        DaqListSize {
            odt_count: crm.data[0],
            first_pid: crm.data[1],
        }
    }
}

/// Slave side MTA0 pointer as reported by DNLOAD / DNLOAD_6
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MtaPointer {
    pub extension: u8,
    pub address: u32,
}

impl MtaPointer {
    pub(crate) fn parse(crm: &Crm, byte_order: ByteOrder) -> Result<MtaPointer, CcpError> {
        Ok(MtaPointer {
            extension: crm.data[0],
            address: crm.u32_at(1, byte_order)?,
        })
    }
}

/// GET_SEED return data
#[derive(Debug, Clone, Copy)]
pub struct SeedInfo {
    /// True while the requested resource is still locked
    pub protected: bool,
    pub seed: [u8; 4],
}

impl SeedInfo {
    pub(crate) fn parse(crm: &Crm) -> SeedInfo {
        let mut seed = [0u8; 4];
        seed.copy_from_slice(&crm.data[1..5]);
        SeedInfo {
            protected: crm.data[0] != 0,
            seed,
        }
    }
}

//-----------------------------------------------------------------------------
