//-----------------------------------------------------------------------------
// Module engine
// Master side command state machine. Owns the command counter and the single
// outstanding request slot. CROs are sent strictly in request() call order,
// the matching CRM is correlated by CTR. The receive pump is the only caller
// of complete(), request() only installs and abandons the slot.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::timeout;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::codec::{Command, Crm, Cro, CRC_ACKNOWLEDGE};
use crate::error::CcpError;
use crate::transport::CanSender;

//-----------------------------------------------------------------------------
// Diagnostic counters

// Written by the receive pump, read by anyone
#[derive(Debug, Default)]
pub(crate) struct DiagCounters {
    pub crm_mismatched_ctr: AtomicU32,
    pub unexpected_pid: AtomicU32,
    pub decode_errors: AtomicU32,
}

/// Snapshot of the per session diagnostic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiagSnapshot {
    /// CRMs discarded because their CTR matched no pending request
    pub crm_mismatched_ctr: u32,
    /// DAQ-DTOs whose PID was outside any armed ODT range
    pub unexpected_pid: u32,
    /// Inbound frames that could not be decoded
    pub decode_errors: u32,
}

impl DiagCounters {
    pub fn snapshot(&self) -> DiagSnapshot {
        DiagSnapshot {
            crm_mismatched_ctr: self.crm_mismatched_ctr.load(Ordering::Relaxed),
            unexpected_pid: self.unexpected_pid.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }
}

//-----------------------------------------------------------------------------
// Command engine

struct PendingRequest {
    ctr: u8,
    command: Command,
    done: oneshot::Sender<Crm>,
}

// Serialized part of the engine: the guard is held across the whole
// request/response cycle, queued callers proceed in FIFO order
struct CtrState {
    next_ctr: u8,
}

pub(crate) struct CommandEngine {
    sender: Box<dyn CanSender>,
    cro_id: u32,
    default_timeout: Duration,
    serial: tokio::sync::Mutex<CtrState>,
    pending: Mutex<Option<PendingRequest>>,
    counters: Arc<DiagCounters>,
}

impl CommandEngine {
    pub fn new(sender: Box<dyn CanSender>, cro_id: u32, default_timeout: Duration, counters: Arc<DiagCounters>) -> CommandEngine {
        CommandEngine {
            sender,
            cro_id,
            default_timeout,
            serial: tokio::sync::Mutex::new(CtrState { next_ctr: 0 }),
            pending: Mutex::new(None),
            counters,
        }
    }

    /// Send a CRO and wait for its CRM, with the engine's default deadline
    pub async fn request(&self, cro: Cro) -> Result<Crm, CcpError> {
        self.request_with_timeout(cro, self.default_timeout).await
    }

    /// Send a CRO and wait for its CRM. At most one request is in flight,
    /// concurrent callers are queued FIFO. A non zero command return code is
    /// mapped to CcpError::Slave.
    pub async fn request_with_timeout(&self, mut cro: Cro, deadline: Duration) -> Result<Crm, CcpError> {
        let mut serial = self.serial.lock().await;
        let ctr = serial.next_ctr;
        serial.next_ctr = ctr.wrapping_add(1);

        cro.set_ctr(ctr);
        let (done, wait) = oneshot::channel();
        *self.pending.lock() = Some(PendingRequest {
            ctr,
            command: cro.command,
            done,
        });

        trace!("TX CRO {} ctr={} data={:02X?}", cro.command, ctr, cro.data);
        if let Err(e) = self.sender.send_frame(self.cro_id, cro.data) {
            self.pending.lock().take();
            error!("{}: transport send failed: {}", cro.command, e);
            return Err(CcpError::Transport(e));
        }

        let crm = match timeout(deadline, wait).await {
            Ok(Ok(crm)) => crm,
            Ok(Err(_)) => {
                // Completion sender dropped without a CRM, the pump has shut
                // down and abandoned the slot
                return Err(CcpError::Cancelled);
            }
            Err(_) => {
                // Abandon the slot, a CRM with this CTR arriving later is
                // discarded by the pump
                self.pending.lock().take();
                warn!("{} ctr={}: no CRM within {} ms", cro.command, ctr, deadline.as_millis());
                return Err(CcpError::Timeout(deadline.as_millis() as u64));
            }
        };

        trace!("RX CRM ctr={} crc=0x{:02X} data={:02X?}", crm.ctr, crm.return_code, crm.data);
        if crm.return_code != CRC_ACKNOWLEDGE {
            return Err(CcpError::Slave {
                code: crm.return_code,
                command: cro.command,
            });
        }
        Ok(crm)
    }

    /// Hand an inbound CRM to the pending request. Called by the receive
    /// pump only. A CRM that matches no pending CTR is stale or duplicate
    /// and is counted and dropped.
    pub fn complete(&self, crm: Crm) {
        let mut slot = self.pending.lock();
        if let Some(pending) = slot.take_if(|p| p.ctr == crm.ctr) {
            if pending.done.send(crm).is_err() {
                // The caller stopped waiting between deadline and delivery
                debug!("CRM ctr={} arrived for an abandoned {} request", crm.ctr, pending.command);
            }
        } else {
            self.counters.crm_mismatched_ctr.fetch_add(1, Ordering::Relaxed);
            match slot.as_ref() {
                Some(p) => warn!("discarding CRM ctr={} while {} ctr={} is pending", crm.ctr, p.command, p.ctr),
                None => debug!("discarding CRM ctr={}, no request pending", crm.ctr),
            }
        }
    }

    /// Abandon a pending request on pump shutdown, the waiting caller
    /// observes CcpError::Cancelled
    pub fn abort_pending(&self) {
        if let Some(pending) = self.pending.lock().take() {
            debug!("aborting pending {} ctr={}", pending.command, pending.ctr);
        }
    }
}

//-----------------------------------------------------------------------------
