// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Host queue pairs and the commands a host issues over them.

use crate::capsule::Capsule;
use crate::nqn::nqn_to_field;
use crate::nqn_valid;
use crate::queue_pair::Handoff;
use crate::queue_pair::QueuePair;
use crate::queue_pair::QueueStats;
use crate::spec;
use crate::spec::fabrics::ConnectAttributes;
use crate::spec::fabrics::ConnectCommand;
use crate::spec::fabrics::ConnectData;
use crate::spec::fabrics::ConnectResponseDw0;
use crate::spec::fabrics::DiscoveryLogEntry;
use crate::spec::fabrics::DiscoveryLogPageHeader;
use crate::spec::fabrics::FabricsCommandType;
use crate::spec::fabrics::InvalidParameterDw0;
use crate::spec::fabrics::PropertyAttributes;
use crate::spec::fabrics::PropertyGetCommand;
use crate::spec::fabrics::PropertySetCommand;
use crate::spec::fabrics::CNTLID_DYNAMIC;
use crate::spec::fabrics::CNTLID_STATIC_ANY;
use crate::spec::fabrics::CNTLID_STATIC_MAX;
use crate::spec::fabrics::CONNECT_RECFMT;
use crate::spec::fabrics::PROPERTY_SIZE_4;
use crate::spec::fabrics::PROPERTY_SIZE_8;
use crate::spec::fabrics::SQHD_FLOW_CONTROL_DISABLED;
use crate::spec::nvm::IdentifyNamespace;
use crate::transport;
use crate::transport::ByteStream;
use crate::Association;
use crate::Error;
use crate::NvmeError;
use std::collections::VecDeque;
use std::sync::Arc;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

/// Discovery logs with more records than this are refused.
pub const MAX_DISCOVERY_LOG_RECORDS: u64 = 1024;
/// Number of times a discovery log fetch restarts because the log changed
/// while it was being read.
pub const MAX_DISCOVERY_LOG_RETRIES: u32 = 8;

/// Parameters of a queue pair to connect.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    /// Zero for the admin queue.
    pub qid: u16,
    /// Submission queue size, 1's based.
    pub queue_size: u32,
    pub hostid: [u8; 16],
    /// Requested controller id. [`CNTLID_DYNAMIC`] on the admin queue of a
    /// dynamic controller; the id returned by the admin queue's CONNECT for
    /// I/O queues.
    pub cntlid: u16,
    pub subnqn: String,
    pub hostnqn: String,
    /// Keep alive timeout in milliseconds. Admin queue only.
    pub kato: u32,
}

impl Default for ConnectParams {
    fn default() -> Self {
        Self {
            qid: 0,
            queue_size: 32,
            hostid: [0; 16],
            cntlid: CNTLID_DYNAMIC,
            subnqn: String::new(),
            hostnqn: String::new(),
            kato: 0,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HostState {
    Connected,
    /// Reaping outstanding responses before closing.
    Draining,
    Closed,
}

/// A discovery log page.
#[derive(Debug, Clone)]
pub struct DiscoveryLog {
    pub header: DiscoveryLogPageHeader,
    pub entries: Vec<DiscoveryLogEntry>,
}

/// The host end of a connected queue pair.
pub struct HostQueuePair {
    qp: QueuePair,
    state: HostState,
    /// Responses received while waiting for a different command.
    responses: VecDeque<Capsule<'static>>,
}

impl std::fmt::Debug for HostQueuePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostQueuePair")
            .field("qid", &self.qp.qid)
            .field("state", &self.state)
            .field("qsize", &self.qp.qsize)
            .field("sqhd", &self.qp.sqhd)
            .field("sqtail", &self.qp.sqtail)
            .field("pending", &self.qp.pending)
            .field("buffered", &self.responses.len())
            .finish()
    }
}

fn validate_connect_params(association: &Association, params: &ConnectParams) -> Result<(), Error> {
    let admin = params.qid == 0;
    let (min, max) = if admin {
        (
            spec::fabrics::MIN_ADMIN_QUEUE_SIZE as u32,
            spec::fabrics::MAX_ADMIN_QUEUE_SIZE as u32,
        )
    } else {
        (
            spec::fabrics::MIN_IO_QUEUE_SIZE,
            spec::fabrics::MAX_IO_QUEUE_SIZE,
        )
    };
    if !(min..=max).contains(&params.queue_size) {
        return Err(Error::InvalidArgument("invalid queue size"));
    }
    if !admin && params.kato != 0 {
        return Err(Error::InvalidArgument("keep alive timeout on an I/O queue"));
    }
    if !nqn_valid(&params.subnqn) {
        return Err(Error::InvalidArgument("invalid subsystem NQN"));
    }
    if !nqn_valid(&params.hostnqn) {
        return Err(Error::InvalidArgument("invalid host NQN"));
    }
    if params.hostid.iter().all(|&b| b == 0) {
        return Err(Error::InvalidArgument("invalid host id"));
    }
    let cntlid_valid = if admin && association.params().dynamic_controller_model {
        params.cntlid == CNTLID_DYNAMIC
    } else if admin {
        params.cntlid <= CNTLID_STATIC_MAX || params.cntlid == CNTLID_STATIC_ANY
    } else {
        params.cntlid <= CNTLID_STATIC_MAX
    };
    if !cntlid_valid {
        return Err(Error::InvalidArgument("invalid controller id"));
    }
    Ok(())
}

impl HostQueuePair {
    /// Connects a queue pair over `stream`: the transport's connection
    /// initialization followed by a Fabrics CONNECT.
    ///
    /// Handshake failures are also recorded on the association; see
    /// [`Association::last_error`].
    pub fn connect(
        association: &Arc<Association>,
        stream: impl ByteStream + 'static,
        params: &ConnectParams,
    ) -> Result<Self, Error> {
        let _span = tracing::info_span!("nvmf_connect", qid = params.qid).entered();
        if association.is_controller() {
            return Err(Error::InvalidArgument("not a host association"));
        }
        validate_connect_params(association, params)?;

        let fail = |message: String| {
            tracing::error!(reason = %message, "connect failed");
            association.set_error(message.clone());
            Error::Handshake(message)
        };

        let transport = transport::connect_queue(association, Box::new(stream), params.qid)
            .inspect_err(|err| {
                association.set_error(format!("failed to initialize connection: {err}"));
            })?;
        let mut qp = QueuePair::new(association.clone(), transport, params.qid, params.queue_size);
        qp.kato = params.kato;
        let mut this = Self {
            qp,
            state: HostState::Connected,
            responses: VecDeque::new(),
        };

        let mut cmd = ConnectCommand::new_zeroed();
        cmd.cdw0.set_opcode(spec::AdminOpcode::FABRICS_COMMANDS.0);
        cmd.fctype = FabricsCommandType::CONNECT;
        cmd.recfmt = CONNECT_RECFMT;
        cmd.qid = params.qid;
        cmd.sqsize = (params.queue_size - 1) as u16;
        cmd.cattr = ConnectAttributes::new()
            .with_disable_sq_flow_control(!association.params().sq_flow_control);
        cmd.kato = params.kato;

        let data = ConnectData {
            hostid: params.hostid,
            cntlid: params.cntlid,
            rsvd1: [0; 238],
            subnqn: nqn_to_field(&params.subnqn),
            hostnqn: nqn_to_field(&params.hostnqn),
            rsvd2: [0; 256],
        };

        let mut cc = Capsule::command(zerocopy::transmute!(cmd));
        cc.append_data(data.as_bytes())?;
        let cid = this.transmit_command(&mut cc).inspect_err(|err| {
            association.set_error(format!("failed to send CONNECT: {err}"));
        })?;
        let rc = this.qp.transport.receive_capsule().inspect_err(|err| {
            association.set_error(format!("failed to receive CONNECT response: {err}"));
        })?;
        this.qp.pending = 0;
        let Some(cqe) = rc.cqe().copied() else {
            return Err(fail("unexpected command capsule".into()));
        };

        let status = rc.status();
        if status != spec::Status::SUCCESS {
            let message = if status == spec::Status::CONNECT_INVALID_PARAMETERS {
                let dw0 = InvalidParameterDw0::from(cqe.dw0);
                format!(
                    "CONNECT invalid parameter IATTR: {:#x} IPO: {:#x}",
                    dw0.data() as u8,
                    dw0.ipo()
                )
            } else {
                format!("CONNECT failed, status {:#x}", status.0)
            };
            return Err(fail(message));
        }
        if cqe.cid != cid {
            return Err(fail(format!(
                "CONNECT response cid mismatch: {:#x} != {:#x}",
                cqe.cid, cid
            )));
        }
        if !rc.sqhd_valid() {
            return Err(fail("CONNECT response without SQHD".into()));
        }
        if cqe.sqhd == SQHD_FLOW_CONTROL_DISABLED {
            if association.params().sq_flow_control {
                return Err(fail("controller disabled SQ flow control".into()));
            }
            this.qp.flow_control = false;
            this.qp.sqhd = 0;
            this.qp.sqtail = 0;
        } else {
            this.qp.flow_control = true;
            this.qp.sqhd = cqe.sqhd as u32;
            this.qp.sqtail = cqe.sqhd as u32;
        }

        let dw0 = ConnectResponseDw0::from(cqe.dw0);
        if dw0.authreq() != 0 {
            return Err(fail("CONNECT requires unsupported authentication".into()));
        }
        this.qp.cntlid = dw0.cntlid();
        this.qp.stats.completed += 1;

        tracing::info!(
            cntlid = this.qp.cntlid,
            qsize = this.qp.qsize,
            flow_control = this.qp.flow_control,
            "connected"
        );
        Ok(this)
    }

    pub fn association(&self) -> &Arc<Association> {
        &self.qp.association
    }

    pub fn qid(&self) -> u16 {
        self.qp.qid
    }

    pub fn is_admin(&self) -> bool {
        self.qp.admin()
    }

    pub fn qsize(&self) -> u32 {
        self.qp.qsize
    }

    pub fn cntlid(&self) -> u16 {
        self.qp.cntlid
    }

    pub fn kato(&self) -> u32 {
        self.qp.kato
    }

    pub fn sqhd(&self) -> u32 {
        self.qp.sqhd
    }

    pub fn sqtail(&self) -> u32 {
        self.qp.sqtail
    }

    pub fn flow_control(&self) -> bool {
        self.qp.flow_control
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    pub fn stats(&self) -> &QueueStats {
        &self.qp.stats
    }

    /// Commands sent whose responses have not been received.
    pub fn outstanding(&self) -> u32 {
        self.qp.pending
    }

    /// Assigns a command id to `capsule` and sends it. Fails with
    /// [`Error::QueueFull`] rather than waiting for a free slot.
    pub fn transmit_command(&mut self, capsule: &mut Capsule<'_>) -> Result<u16, Error> {
        if self.state != HostState::Connected {
            return Err(Error::ConnectionReset);
        }
        if !capsule.is_command() {
            return Err(Error::InvalidCapsuleType);
        }
        if self.qp.is_full() {
            self.qp.stats.queue_full += 1;
            return Err(Error::QueueFull);
        }
        let cid = self.qp.allocate_cid();
        capsule.set_cid(cid);
        self.qp.transport.transmit_capsule(capsule)?;
        self.qp.sqtail = (self.qp.sqtail + 1) % self.qp.qsize;
        self.qp.pending += 1;
        self.qp.stats.submitted += 1;
        Ok(cid)
    }

    /// Receives the next response from the transport, updating the
    /// submission queue head.
    fn receive(&mut self) -> Result<Capsule<'static>, Error> {
        let rc = match self.qp.transport.receive_capsule() {
            Ok(rc) => rc,
            Err(err) => {
                if err.is_connection_lost() {
                    self.state = HostState::Closed;
                }
                return Err(err);
            }
        };
        let cqe = rc.cqe().ok_or(Error::InvalidCapsuleType)?;
        if self.qp.flow_control {
            if rc.sqhd_valid() {
                self.qp.sqhd = cqe.sqhd as u32 % self.qp.qsize;
            }
        } else {
            // Without flow control, the head only tracks the number of
            // outstanding commands.
            self.qp.sqhd = (self.qp.sqhd + 1) % self.qp.qsize;
        }
        self.qp.pending = self.qp.pending.saturating_sub(1);
        self.qp.stats.completed += 1;
        Ok(rc)
    }

    /// Returns the next response, in arrival order.
    pub fn receive_response(&mut self) -> Result<Capsule<'static>, Error> {
        if let Some(rc) = self.responses.pop_front() {
            return Ok(rc);
        }
        if self.qp.pending == 0 {
            return Err(Error::NoOutstandingCommands);
        }
        self.receive()
    }

    /// Waits for the response to `capsule`, copying any received data into
    /// its receive buffer. Other responses are kept for
    /// [`Self::receive_response`].
    pub fn wait_for_response(
        &mut self,
        capsule: &mut Capsule<'_>,
    ) -> Result<Capsule<'static>, Error> {
        let cid = capsule.cid();
        let rc = if let Some(rc) = self
            .responses
            .iter()
            .position(|rc| rc.cid() == cid)
            .and_then(|i| self.responses.remove(i))
        {
            rc
        } else {
            loop {
                let rc = self.receive()?;
                if rc.cid() == cid {
                    break rc;
                }
                tracing::debug!(cid = rc.cid(), waiting = cid, "queueing response");
                self.responses.push_back(rc);
            }
        };
        capsule.complete_from(&rc);
        Ok(rc)
    }

    /// Sends a command, waits for its response, and fails on an error
    /// status.
    fn execute(&mut self, mut capsule: Capsule<'_>) -> Result<spec::Completion, Error> {
        self.transmit_command(&mut capsule)?;
        let rc = self.wait_for_response(&mut capsule)?;
        let cqe = *rc.cqe().ok_or(Error::InvalidCapsuleType)?;
        let status = rc.status();
        if status != spec::Status::SUCCESS {
            tracing::debug!(
                qid = self.qp.qid,
                cid = cqe.cid,
                status = status.0,
                "command failed"
            );
            return Err(Error::Nvme(NvmeError::from(status)));
        }
        Ok(cqe)
    }

    pub fn keep_alive(&mut self) -> Result<(), Error> {
        if !self.is_admin() {
            return Err(Error::InvalidArgument("keep alive on an I/O queue"));
        }
        self.execute(Capsule::command(spec::admin_cmd(
            spec::AdminOpcode::KEEP_ALIVE,
        )))?;
        Ok(())
    }

    fn property_attributes(size: u8) -> Result<PropertyAttributes, Error> {
        let size = match size {
            4 => PROPERTY_SIZE_4,
            8 => PROPERTY_SIZE_8,
            _ => return Err(Error::InvalidArgument("property size must be 4 or 8")),
        };
        Ok(PropertyAttributes::new().with_size(size))
    }

    /// Reads a 4 or 8 byte controller property.
    pub fn read_property(&mut self, offset: u32, size: u8) -> Result<u64, Error> {
        let mut cmd = PropertyGetCommand::new_zeroed();
        cmd.cdw0.set_opcode(spec::AdminOpcode::FABRICS_COMMANDS.0);
        cmd.fctype = FabricsCommandType::PROPERTY_GET;
        cmd.attrib = Self::property_attributes(size)?;
        cmd.ofst = offset;
        let cqe = self.execute(Capsule::command(zerocopy::transmute!(cmd)))?;
        Ok(if size == 8 {
            cqe.dw0 as u64 | ((cqe.dw1 as u64) << 32)
        } else {
            cqe.dw0 as u64
        })
    }

    /// Writes a 4 or 8 byte controller property.
    pub fn write_property(&mut self, offset: u32, size: u8, value: u64) -> Result<(), Error> {
        let mut cmd = PropertySetCommand::new_zeroed();
        cmd.cdw0.set_opcode(spec::AdminOpcode::FABRICS_COMMANDS.0);
        cmd.fctype = FabricsCommandType::PROPERTY_SET;
        cmd.attrib = Self::property_attributes(size)?;
        cmd.ofst = offset;
        cmd.value = if size == 8 { value } else { value as u32 as u64 };
        self.execute(Capsule::command(zerocopy::transmute!(cmd)))?;
        Ok(())
    }

    pub fn identify_controller(&mut self) -> Result<spec::IdentifyController, Error> {
        let mut identify = spec::IdentifyController::new_zeroed();
        let mut sqe = spec::admin_cmd(spec::AdminOpcode::IDENTIFY);
        sqe.cdw10 = spec::Cdw10Identify::new()
            .with_cns(spec::Cns::CONTROLLER.0)
            .into();
        let mut cc = Capsule::command(sqe);
        cc.append_receive_buffer(identify.as_mut_bytes())?;
        self.execute(cc)?;
        Ok(identify)
    }

    pub fn identify_namespace(&mut self, nsid: u32) -> Result<IdentifyNamespace, Error> {
        let mut identify = IdentifyNamespace::new_zeroed();
        let mut sqe = spec::admin_cmd(spec::AdminOpcode::IDENTIFY);
        sqe.nsid = nsid;
        sqe.cdw10 = spec::Cdw10Identify::new()
            .with_cns(spec::Cns::NAMESPACE.0)
            .into();
        let mut cc = Capsule::command(sqe);
        cc.append_receive_buffer(identify.as_mut_bytes())?;
        self.execute(cc)?;
        Ok(identify)
    }

    /// Reads `buf.len()` bytes of a log page starting at byte `offset`.
    pub fn get_log_page(
        &mut self,
        lid: spec::LogPageIdentifier,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        if buf.is_empty() || buf.len() % 4 != 0 || offset % 4 != 0 {
            return Err(Error::InvalidArgument("log page reads are whole dwords"));
        }
        let numd = (buf.len() / 4 - 1) as u32;
        let mut sqe = spec::admin_cmd(spec::AdminOpcode::GET_LOG_PAGE);
        sqe.cdw10 = spec::Cdw10GetLogPage::new()
            .with_lid(lid.0)
            .with_numdl_z(numd as u16)
            .into();
        sqe.cdw11 = spec::Cdw11GetLogPage::new()
            .with_numdu((numd >> 16) as u16)
            .into();
        sqe.cdw12 = offset as u32;
        sqe.cdw13 = (offset >> 32) as u32;
        let mut cc = Capsule::command(sqe);
        cc.append_receive_buffer(buf)?;
        self.execute(cc)?;
        Ok(())
    }

    fn discovery_log_header(&mut self) -> Result<DiscoveryLogPageHeader, Error> {
        let mut header = DiscoveryLogPageHeader::new_zeroed();
        self.get_log_page(
            spec::LogPageIdentifier::DISCOVERY,
            0,
            header.as_mut_bytes(),
        )?;
        Ok(header)
    }

    /// Fetches the complete discovery log page, restarting if it changes
    /// between reading the header and reading the entries.
    pub fn fetch_discovery_log_page(&mut self) -> Result<DiscoveryLog, Error> {
        let mut retries = 0;
        loop {
            let header = self.discovery_log_header()?;
            if header.numrec > MAX_DISCOVERY_LOG_RECORDS {
                tracing::warn!(numrec = header.numrec, "discovery log too large");
                return Err(Error::TooLarge);
            }

            let mut entries = vec![DiscoveryLogEntry::new_zeroed(); header.numrec as usize];
            if !entries.is_empty() {
                self.get_log_page(
                    spec::LogPageIdentifier::DISCOVERY,
                    size_of::<DiscoveryLogPageHeader>() as u64,
                    entries.as_mut_slice().as_mut_bytes(),
                )?;
            }

            let check = self.discovery_log_header()?;
            if check.genctr == header.genctr && check.numrec == header.numrec {
                return Ok(DiscoveryLog {
                    header: check,
                    entries,
                });
            }

            retries += 1;
            self.qp.stats.discovery_log_retries += 1;
            tracing::debug!(
                genctr = header.genctr,
                new_genctr = check.genctr,
                retries,
                "discovery log changed"
            );
            if retries > MAX_DISCOVERY_LOG_RETRIES {
                return Err(Error::DiscoveryLogUnstable(retries));
            }
        }
    }

    /// Requests `count` I/O queues, returning the number the controller
    /// allocated.
    pub fn request_queues(&mut self, count: u32) -> Result<u32, Error> {
        // The 0's based counts are 16 bits, and 0xffff is reserved.
        if !(1..=0xffff).contains(&count) {
            return Err(Error::InvalidArgument("invalid queue count"));
        }
        let mut sqe = spec::admin_cmd(spec::AdminOpcode::SET_FEATURES);
        sqe.cdw10 = spec::Cdw10SetFeatures::new()
            .with_fid(spec::Feature::NUMBER_OF_QUEUES.0)
            .into();
        sqe.cdw11 = spec::Cdw11FeatureNumberOfQueues::new()
            .with_nsq_z((count - 1) as u16)
            .with_ncq_z((count - 1) as u16)
            .into();
        let cqe = self.execute(Capsule::command(sqe))?;
        let dw0 = spec::Cdw11FeatureNumberOfQueues::from(cqe.dw0);
        Ok(dw0.nsq_z().min(dw0.ncq_z()) as u32 + 1)
    }

    /// Adopts the capsule sizes from a controller's Identify data, before
    /// any I/O queues are connected.
    pub fn update_association(&self, identify: &spec::IdentifyController) -> Result<(), Error> {
        if identify.ioccsz < 4 {
            return Err(Error::InvalidArgument("invalid ioccsz"));
        }
        self.qp.association.set_ioccsz(identify.ioccsz);
        Ok(())
    }

    /// Reaps outstanding responses, then shuts down the connection. Errors
    /// while draining are logged and otherwise ignored.
    pub fn close(&mut self) {
        if self.state == HostState::Closed {
            return;
        }
        self.state = HostState::Draining;
        while self.qp.pending > 0 {
            match self.receive() {
                Ok(rc) => tracing::debug!(cid = rc.cid(), "reaped response"),
                Err(err) => {
                    tracing::debug!(
                        error = &err as &dyn std::error::Error,
                        "error draining queue"
                    );
                    break;
                }
            }
        }
        self.responses.clear();
        self.qp.transport.shutdown();
        self.state = HostState::Closed;
    }

    /// Detaches the queue pair and its stream for use by another owner.
    pub fn into_handoff(self) -> Handoff {
        self.qp.into_handoff()
    }
}
