// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! State shared by host and controller queue pairs.

use crate::capsule::Capsule;
use crate::spec;
use crate::transport::ByteStream;
use crate::transport::TransportHandoff;
use crate::transport::TransportQueue;
use crate::Association;
use std::sync::Arc;

/// Per queue pair counters.
#[derive(Debug, Default, Clone)]
pub struct QueueStats {
    /// Commands sent (host) or received (controller).
    pub submitted: u64,
    /// Responses received (host) or sent (controller).
    pub completed: u64,
    /// Commands refused because the submission queue was full.
    pub queue_full: u64,
    /// Discovery log page fetches restarted because the log changed.
    pub discovery_log_retries: u64,
}

/// Queue state of an established queue pair, for handing it off to another
/// owner.
#[derive(Debug, Clone)]
pub struct QueueHandoff {
    pub admin: bool,
    pub qid: u16,
    pub qsize: u32,
    pub sqhd: u16,
    pub sqtail: u16,
    /// Next command id to assign. Host only.
    pub cid: u16,
    pub cntlid: u16,
    pub kato: u32,
    pub flow_control: bool,
}

/// An established queue pair, detached from this library.
pub struct Handoff {
    pub queue: QueueHandoff,
    pub transport: TransportHandoff,
    pub stream: Box<dyn ByteStream>,
}

impl std::fmt::Debug for Handoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handoff")
            .field("queue", &self.queue)
            .field("transport", &self.transport)
            .finish()
    }
}

pub(crate) struct QueuePair {
    pub association: Arc<Association>,
    pub transport: Box<dyn TransportQueue>,
    pub qid: u16,
    pub qsize: u32,
    pub sqhd: u32,
    pub sqtail: u32,
    /// Commands sent whose responses have not arrived yet.
    pub pending: u32,
    pub next_cid: u16,
    pub cntlid: u16,
    pub kato: u32,
    pub flow_control: bool,
    pub stats: QueueStats,
}

impl QueuePair {
    pub fn new(
        association: Arc<Association>,
        transport: Box<dyn TransportQueue>,
        qid: u16,
        qsize: u32,
    ) -> Self {
        Self {
            association,
            transport,
            qid,
            qsize,
            sqhd: 0,
            sqtail: 0,
            pending: 0,
            next_cid: 0,
            cntlid: 0,
            kato: 0,
            flow_control: false,
            stats: QueueStats::default(),
        }
    }

    pub fn admin(&self) -> bool {
        self.qid == 0
    }

    /// Returns true if the submission queue has no free slot.
    pub fn is_full(&self) -> bool {
        (self.sqtail + 1) % self.qsize == self.sqhd
    }

    /// Allocates the next command id, skipping the all-ones value.
    pub fn allocate_cid(&mut self) -> u16 {
        let cid = self.next_cid;
        self.next_cid = cid.wrapping_add(1);
        if self.next_cid == 0xffff {
            self.next_cid = 0;
        }
        cid
    }

    /// The generic checks of a received command, followed by the transport
    /// specific ones.
    pub fn validate_command_capsule(&self, capsule: &Capsule<'_>) -> Result<(), spec::Status> {
        let sqe = capsule
            .sqe()
            .ok_or(spec::Status::INVALID_FIELD_IN_COMMAND)?;
        if sqe.cdw0.psdt() != spec::Psdt::SGL_MPTR_CONTIGUOUS.0 {
            return Err(spec::Status::INVALID_FIELD_IN_COMMAND);
        }
        self.transport.validate_command_capsule(capsule)
    }

    pub fn into_handoff(self) -> Handoff {
        let queue = QueueHandoff {
            admin: self.admin(),
            qid: self.qid,
            qsize: self.qsize,
            sqhd: self.sqhd as u16,
            sqtail: self.sqtail as u16,
            cid: self.next_cid,
            cntlid: self.cntlid,
            kato: self.kato,
            flow_control: self.flow_control,
        };
        let (transport, stream) = self.transport.handoff();
        Handoff {
            queue,
            transport,
            stream,
        }
    }
}
