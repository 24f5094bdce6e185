// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Controller queue pairs and helpers for emulating a fabrics controller.

use crate::capsule::Capsule;
use crate::error::CommandResult;
use crate::nqn::nqn_from_field;
use crate::nqn_valid;
use crate::queue_pair::Handoff;
use crate::queue_pair::QueuePair;
use crate::queue_pair::QueueStats;
use crate::spec;
use crate::spec::fabrics::ConnectCommand;
use crate::spec::fabrics::ConnectData;
use crate::spec::fabrics::ConnectResponseDw0;
use crate::spec::fabrics::DiscoveryLogEntry;
use crate::spec::fabrics::FabricsCommandType;
use crate::spec::fabrics::InvalidParameterDw0;
use crate::spec::fabrics::PropertyGetCommand;
use crate::spec::fabrics::PropertySetCommand;
use crate::spec::fabrics::TransportRequirements;
use crate::spec::fabrics::CNTLID_DYNAMIC;
use crate::spec::fabrics::CNTLID_STATIC_ANY;
use crate::spec::fabrics::CNTLID_STATIC_MAX;
use crate::spec::fabrics::CONNECT_DATA_SIZE;
use crate::spec::fabrics::CONNECT_RECFMT;
use crate::spec::fabrics::MAX_ADMIN_QUEUE_SIZE;
use crate::spec::fabrics::MIN_ADMIN_QUEUE_SIZE;
use crate::spec::fabrics::MIN_IO_QUEUE_SIZE;
use crate::spec::fabrics::PROPERTY_SIZE_4;
use crate::spec::fabrics::PROPERTY_SIZE_8;
use crate::spec::fabrics::SQHD_FLOW_CONTROL_DISABLED;
use crate::transport;
use crate::transport::ByteStream;
use crate::transport::ControllerData;
use crate::Association;
use crate::Error;
use crate::NvmeError;
use std::mem::offset_of;
use std::sync::Arc;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

/// The NVMe version reported in the VS property, 2.0.
pub const NVME_VERSION: u32 = 0x00020000;

/// The only supported submission and completion queue entry sizes, as
/// powers of two.
const IOSQES: u8 = 6;
const IOCQES: u8 = 4;

/// Why a CONNECT was refused.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Rejection {
    Status(spec::Status),
    /// A field of the command, or of the CONNECT data when `data` is set,
    /// at byte offset `offset`.
    InvalidParameter { data: bool, offset: u16 },
}

impl Rejection {
    fn command(offset: usize) -> Self {
        Self::InvalidParameter {
            data: false,
            offset: offset as u16,
        }
    }

    fn data(offset: usize) -> Self {
        Self::InvalidParameter {
            data: true,
            offset: offset as u16,
        }
    }
}

/// Accepts a new queue pair on `stream`, validating the host's CONNECT.
///
/// Invalid CONNECTs are answered with an error response before returning
/// [`Error::Rejected`]. A valid one is returned without a response so the
/// caller can authorize the host and pick a controller id; see
/// [`PendingConnect::finish_accept`].
pub fn accept(
    association: &Arc<Association>,
    stream: impl ByteStream + 'static,
) -> Result<PendingConnect, Error> {
    let _span = tracing::info_span!("nvmf_accept").entered();
    if !association.is_controller() {
        return Err(Error::InvalidArgument("not a controller association"));
    }

    let transport = transport::accept_queue(association, Box::new(stream))?;
    let mut qp = QueuePair::new(association.clone(), transport, 0, 0);
    let capsule = qp.transport.receive_capsule()?;

    match validate_connect(&mut qp, &capsule) {
        Ok(pending) => {
            let (cmd, data, subnqn, hostnqn) = pending;
            qp.qid = cmd.qid;
            qp.transport.set_qid(cmd.qid);
            qp.qsize = cmd.sqsize as u32 + 1;
            qp.flow_control = association.params().sq_flow_control
                || !cmd.cattr.disable_sq_flow_control();
            qp.sqhd = 0;
            qp.kato = cmd.kato;
            qp.stats.submitted += 1;
            tracing::debug!(
                qid = qp.qid,
                qsize = qp.qsize,
                kato = qp.kato,
                flow_control = qp.flow_control,
                hostnqn = %hostnqn,
                "valid connect"
            );
            Ok(PendingConnect {
                qp,
                capsule,
                data,
                subnqn,
                hostnqn,
            })
        }
        Err(rejection) => {
            let (status, dw0) = match rejection {
                Rejection::Status(status) => (status, 0),
                Rejection::InvalidParameter { data, offset } => (
                    spec::Status::CONNECT_INVALID_PARAMETERS,
                    InvalidParameterDw0::new()
                        .with_ipo(offset)
                        .with_data(data)
                        .into(),
                ),
            };
            tracing::warn!(?rejection, "rejecting connect");
            association.set_error(format!("CONNECT rejected: {rejection:?}"));
            if let Err(err) = send_connect_response(&mut qp, &capsule, status, dw0, 0) {
                tracing::debug!(
                    error = &err as &dyn std::error::Error,
                    "failed to send connect rejection"
                );
            }
            Err(Error::Rejected(NvmeError::from(status)))
        }
    }
}

type ValidConnect = (ConnectCommand, ConnectData, String, String);

fn validate_connect(qp: &mut QueuePair, capsule: &Capsule<'_>) -> Result<ValidConnect, Rejection> {
    let params = qp.association.params();
    qp.validate_command_capsule(capsule)
        .map_err(Rejection::Status)?;
    let sqe = capsule
        .sqe()
        .ok_or(Rejection::Status(spec::Status::INVALID_FIELD_IN_COMMAND))?;
    let cmd: ConnectCommand = zerocopy::transmute!(*sqe);

    if cmd.cdw0.opcode() != spec::AdminOpcode::FABRICS_COMMANDS.0
        || cmd.fctype != FabricsCommandType::CONNECT
    {
        return Err(Rejection::Status(spec::Status::INVALID_COMMAND_OPCODE));
    }
    if cmd.recfmt != CONNECT_RECFMT {
        return Err(Rejection::Status(
            spec::Status::CONNECT_INCOMPATIBLE_FORMAT,
        ));
    }

    let qsize = cmd.sqsize as u32 + 1;
    if cmd.qid == 0 {
        if qsize < MIN_ADMIN_QUEUE_SIZE as u32
            || qsize > MAX_ADMIN_QUEUE_SIZE as u32
            || qsize > params.max_admin_qsize as u32
        {
            return Err(Rejection::command(offset_of!(ConnectCommand, sqsize)));
        }
    } else {
        if qp.association.is_discovery() {
            return Err(Rejection::command(offset_of!(ConnectCommand, qid)));
        }
        if qsize < MIN_IO_QUEUE_SIZE || qsize > params.max_io_qsize {
            return Err(Rejection::command(offset_of!(ConnectCommand, sqsize)));
        }
        if cmd.kato != 0 {
            return Err(Rejection::command(offset_of!(ConnectCommand, kato)));
        }
    }

    if qp.transport.capsule_data_len(capsule) != CONNECT_DATA_SIZE {
        return Err(Rejection::command(offset_of!(ConnectCommand, sgl1)));
    }
    let mut data = ConnectData::new_zeroed();
    if let Err(err) = qp
        .transport
        .receive_controller_data(capsule, 0, data.as_mut_bytes())
    {
        tracing::warn!(
            error = &err as &dyn std::error::Error,
            "failed to receive connect data"
        );
        return Err(Rejection::Status(spec::Status::DATA_TRANSFER_ERROR));
    }

    if data.hostid.iter().all(|&b| b == 0) {
        return Err(Rejection::data(offset_of!(ConnectData, hostid)));
    }
    let cntlid_valid = if cmd.qid == 0 && params.dynamic_controller_model {
        data.cntlid == CNTLID_DYNAMIC
    } else if cmd.qid == 0 {
        data.cntlid <= CNTLID_STATIC_MAX || data.cntlid == CNTLID_STATIC_ANY
    } else {
        data.cntlid <= CNTLID_STATIC_MAX
    };
    if !cntlid_valid {
        return Err(Rejection::data(offset_of!(ConnectData, cntlid)));
    }
    let subnqn = match nqn_from_field(&data.subnqn) {
        Some(nqn) if nqn_valid(nqn) => nqn.to_owned(),
        _ => return Err(Rejection::data(offset_of!(ConnectData, subnqn))),
    };
    let hostnqn = match nqn_from_field(&data.hostnqn) {
        Some(nqn) if nqn_valid(nqn) => nqn.to_owned(),
        _ => return Err(Rejection::data(offset_of!(ConnectData, hostnqn))),
    };

    Ok((cmd, data, subnqn, hostnqn))
}

fn send_connect_response(
    qp: &mut QueuePair,
    capsule: &Capsule<'_>,
    status: spec::Status,
    dw0: u32,
    sqhd: u16,
) -> Result<(), Error> {
    let mut cqe = spec::Completion::new_zeroed();
    cqe.cid = capsule.cid();
    cqe.sqid = qp.qid;
    cqe.sqhd = sqhd;
    cqe.dw0 = dw0;
    cqe.status = spec::CompletionStatus::new().with_status(status.0);
    qp.transport.transmit_capsule(&Capsule::response(cqe))?;
    qp.stats.completed += 1;
    Ok(())
}

/// A validated CONNECT that has not been answered yet.
pub struct PendingConnect {
    qp: QueuePair,
    capsule: Capsule<'static>,
    data: ConnectData,
    subnqn: String,
    hostnqn: String,
}

impl std::fmt::Debug for PendingConnect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingConnect")
            .field("qid", &self.qp.qid)
            .field("qsize", &self.qp.qsize)
            .field("subnqn", &self.subnqn)
            .field("hostnqn", &self.hostnqn)
            .finish()
    }
}

impl PendingConnect {
    pub fn qid(&self) -> u16 {
        self.qp.qid
    }

    pub fn qsize(&self) -> u32 {
        self.qp.qsize
    }

    pub fn kato(&self) -> u32 {
        self.qp.kato
    }

    pub fn hostid(&self) -> &[u8; 16] {
        &self.data.hostid
    }

    /// The controller id the host asked for.
    pub fn cntlid(&self) -> u16 {
        self.data.cntlid
    }

    pub fn subnqn(&self) -> &str {
        &self.subnqn
    }

    pub fn hostnqn(&self) -> &str {
        &self.hostnqn
    }

    pub fn capsule(&self) -> &Capsule<'static> {
        &self.capsule
    }

    /// Completes the CONNECT successfully, assigning `cntlid`.
    pub fn finish_accept(self, cntlid: u16) -> Result<ControllerQueuePair, Error> {
        let mut qp = self.qp;
        qp.cntlid = cntlid;
        let sqhd = if qp.flow_control {
            qp.sqhd as u16
        } else {
            SQHD_FLOW_CONTROL_DISABLED
        };
        let dw0 = ConnectResponseDw0::new().with_cntlid(cntlid).into();
        send_connect_response(&mut qp, &self.capsule, spec::Status::SUCCESS, dw0, sqhd)?;
        tracing::info!(
            qid = qp.qid,
            cntlid,
            qsize = qp.qsize,
            flow_control = qp.flow_control,
            "accepted queue"
        );
        Ok(ControllerQueuePair { qp })
    }

    /// Refuses the CONNECT with `status`.
    pub fn reject(self, status: spec::Status) -> Result<(), Error> {
        let mut qp = self.qp;
        qp.association
            .set_error(format!("CONNECT rejected, status {:#x}", status.0));
        send_connect_response(&mut qp, &self.capsule, status, 0, 0)
    }

    /// Refuses the CONNECT, pointing at the field at byte `offset` of the
    /// command, or of the CONNECT data if `data` is set.
    pub fn reject_invalid_parameter(self, data: bool, offset: u16) -> Result<(), Error> {
        let mut qp = self.qp;
        qp.association.set_error(format!(
            "CONNECT rejected, invalid parameter at {} offset {offset:#x}",
            if data { "data" } else { "command" }
        ));
        let dw0 = InvalidParameterDw0::new()
            .with_ipo(offset)
            .with_data(data)
            .into();
        send_connect_response(
            &mut qp,
            &self.capsule,
            spec::Status::CONNECT_INVALID_PARAMETERS,
            dw0,
            0,
        )
    }
}

/// The controller end of a connected queue pair.
pub struct ControllerQueuePair {
    qp: QueuePair,
}

impl std::fmt::Debug for ControllerQueuePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerQueuePair")
            .field("qid", &self.qp.qid)
            .field("cntlid", &self.qp.cntlid)
            .field("qsize", &self.qp.qsize)
            .field("sqhd", &self.qp.sqhd)
            .finish()
    }
}

impl ControllerQueuePair {
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

    pub fn flow_control(&self) -> bool {
        self.qp.flow_control
    }

    pub fn stats(&self) -> &QueueStats {
        &self.qp.stats
    }

    /// Waits for the next command.
    pub fn receive_command(&mut self) -> Result<Capsule<'static>, Error> {
        let capsule = self.qp.transport.receive_capsule()?;
        if !capsule.is_command() {
            return Err(Error::InvalidCapsuleType);
        }
        if self.qp.flow_control {
            self.qp.sqhd = (self.qp.sqhd + 1) % self.qp.qsize;
        }
        self.qp.stats.submitted += 1;
        Ok(capsule)
    }

    /// Checks the data descriptor of a received command.
    pub fn validate_command_capsule(&self, capsule: &Capsule<'_>) -> Result<(), spec::Status> {
        self.qp.validate_command_capsule(capsule)
    }

    /// The length of the data a command transfers.
    pub fn capsule_data_len(&self, capsule: &Capsule<'_>) -> usize {
        self.qp.transport.capsule_data_len(capsule)
    }

    /// Fetches `buf.len()` bytes of a command's data starting at `offset`,
    /// from the capsule or from the host.
    pub fn receive_controller_data(
        &mut self,
        capsule: &Capsule<'_>,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        self.qp
            .transport
            .receive_controller_data(capsule, offset, buf)
    }

    /// Sends `buf` to the host as a command's data starting at `offset`.
    ///
    /// Without SQ flow control, data ending the transfer also completes the
    /// command, and [`ControllerData::SuccessSent`] is returned. No response
    /// may be sent for the command in that case.
    pub fn send_controller_data(
        &mut self,
        capsule: &Capsule<'_>,
        offset: u32,
        buf: &[u8],
    ) -> Result<ControllerData, Error> {
        let result =
            self.qp
                .transport
                .send_controller_data(capsule, offset, buf, !self.qp.flow_control)?;
        if result == ControllerData::SuccessSent {
            self.qp.stats.completed += 1;
        }
        Ok(result)
    }

    pub fn send_response(
        &mut self,
        capsule: &Capsule<'_>,
        status: spec::Status,
        dw: [u32; 2],
    ) -> Result<(), Error> {
        let mut cqe = spec::Completion::new_zeroed();
        cqe.cid = capsule.cid();
        cqe.sqid = self.qp.qid;
        cqe.sqhd = if self.qp.flow_control {
            self.qp.sqhd as u16
        } else {
            0
        };
        cqe.dw0 = dw[0];
        cqe.dw1 = dw[1];
        cqe.status = spec::CompletionStatus::new().with_status(status.0);
        self.qp.transport.transmit_capsule(&Capsule::response(cqe))?;
        self.qp.stats.completed += 1;
        Ok(())
    }

    pub fn send_result(
        &mut self,
        capsule: &Capsule<'_>,
        result: CommandResult,
    ) -> Result<(), Error> {
        self.send_response(capsule, result.status, result.dw)
    }

    pub fn send_success(&mut self, capsule: &Capsule<'_>) -> Result<(), Error> {
        self.send_response(capsule, spec::Status::SUCCESS, [0; 2])
    }

    pub fn send_error(&mut self, capsule: &Capsule<'_>, status: spec::Status) -> Result<(), Error> {
        self.send_response(capsule, status, [0; 2])
    }

    pub fn send_generic_error(&mut self, capsule: &Capsule<'_>, sc: u8) -> Result<(), Error> {
        self.send_error(
            capsule,
            spec::Status::new(spec::StatusCodeType::GENERIC, sc),
        )
    }

    /// Fills in the address fields of a discovery log entry describing the
    /// port this queue pair is connected through.
    pub fn populate_discovery_entry(&self, entry: &mut DiscoveryLogEntry) {
        self.qp.transport.populate_discovery_entry(entry);
        let params = self.qp.association.params();
        entry.treq = TransportRequirements::new()
            .with_disable_sq_flow_control(!params.sq_flow_control);
        entry.aqsz = params.max_admin_qsize - 1;
    }

    pub fn into_handoff(self) -> Handoff {
        self.qp.into_handoff()
    }
}

/// Identify data reported by an emulated controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub serial: String,
    pub model: String,
    pub firmware: String,
    pub subnqn: String,
    /// Number of namespaces.
    pub nn: u32,
    /// Maximum data transfer size, as a power of two of the minimum page
    /// size. Zero for no limit.
    pub mdts: u8,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            serial: String::new(),
            model: "nvmf".into(),
            firmware: "1.0".into(),
            subnqn: String::new(),
            nn: 0,
            mdts: 0,
        }
    }
}

/// Copies `s` into a space padded ASCII field.
fn pad_ascii(field: &mut [u8], s: &str) {
    field.fill(b' ');
    for (dst, src) in field.iter_mut().zip(s.bytes().filter(u8::is_ascii)) {
        *dst = src;
    }
}

fn init_common_controller_data(
    config: &ControllerConfig,
    cntlid: u16,
    subnqn: &str,
) -> spec::IdentifyController {
    let mut cdata = spec::IdentifyController::new_zeroed();
    pad_ascii(&mut cdata.sn, &config.serial);
    pad_ascii(&mut cdata.mn, &config.model);
    pad_ascii(&mut cdata.fr, &config.firmware);
    cdata.mdts = config.mdts;
    cdata.cntlid = cntlid;
    cdata.ver = NVME_VERSION;
    let len = subnqn.len().min(cdata.subnqn.len() - 1);
    cdata.subnqn[..len].copy_from_slice(&subnqn.as_bytes()[..len]);
    cdata.sgls = spec::Sgls::new()
        .with_supported(1)
        .with_address_as_offset(true)
        .with_transport_data_block(true);
    // Fabrics capsule sizes.
    cdata.iorcsz = 1;
    cdata.icdoff = 0;
    cdata.msdbd = 1;
    cdata
}

/// Identify Controller data for an I/O controller.
pub fn init_io_controller_data(
    config: &ControllerConfig,
    cntlid: u16,
    association: &Association,
) -> spec::IdentifyController {
    let params = association.params();
    let mut cdata = init_common_controller_data(config, cntlid, &config.subnqn);
    cdata.cntrltype = spec::ControllerType::IO_CONTROLLER;
    cdata.sqes = spec::QueueEntrySize::new()
        .with_min(IOSQES)
        .with_max(IOSQES);
    cdata.cqes = spec::QueueEntrySize::new()
        .with_min(IOCQES)
        .with_max(IOCQES);
    cdata.maxcmd = params.max_io_qsize.min(u16::MAX as u32) as u16;
    cdata.nn = config.nn;
    cdata.kas = 1;
    cdata.ioccsz = association.ioccsz();
    cdata
}

/// Identify Controller data for a discovery controller.
pub fn init_discovery_controller_data(
    config: &ControllerConfig,
    cntlid: u16,
) -> spec::IdentifyController {
    let mut cdata = init_common_controller_data(config, cntlid, spec::fabrics::DISCOVERY_NQN);
    cdata.cntrltype = spec::ControllerType::DISCOVERY_CONTROLLER;
    cdata.kas = 1;
    cdata.maxcmd = MAX_ADMIN_QUEUE_SIZE;
    cdata
}

/// The CAP, VS, CC and CSTS properties of an emulated controller.
#[derive(Debug, Clone)]
pub struct ControllerRegisters {
    cap: spec::Cap,
    vs: u32,
    cc: spec::Cc,
    csts: spec::Csts,
    io_queues: bool,
}

impl ControllerRegisters {
    /// Computes the properties for a controller on `association`, with a
    /// ready timeout of `timeout` 500ms units.
    pub fn new(association: &Association, timeout: u8) -> Self {
        let params = association.params();
        let io_queues = !association.is_discovery();
        let mqes = if io_queues {
            params.max_io_qsize
        } else {
            params.max_admin_qsize as u32
        };
        let cap = spec::Cap::new()
            .with_mqes_z((mqes - 1) as u16)
            .with_cqr(true)
            .with_to(timeout)
            .with_css_nvm(true)
            .with_mpsmin(0)
            .with_mpsmax(0);
        Self {
            cap,
            vs: NVME_VERSION,
            cc: spec::Cc::new(),
            csts: spec::Csts::new(),
            io_queues,
        }
    }

    pub fn cap(&self) -> spec::Cap {
        self.cap
    }

    pub fn cc(&self) -> spec::Cc {
        self.cc
    }

    pub fn csts(&self) -> spec::Csts {
        self.csts
    }

    /// Returns true if `new` is an acceptable value for CC.
    pub fn validate_cc(&self, new: spec::Cc) -> bool {
        let old = self.cc;
        if new.iocqes() != 0 && new.iocqes() != IOCQES {
            return false;
        }
        if new.iosqes() != 0 && new.iosqes() != IOSQES {
            return false;
        }
        // I/O queue entry sizes must be set before enabling an I/O
        // controller.
        if self.io_queues && new.en() && !old.en() && (new.iocqes() == 0 || new.iosqes() == 0) {
            return false;
        }
        if new.shn() == 3 {
            return false;
        }
        if new.ams() != 0 {
            return false;
        }
        if new.mps() < self.cap.mpsmin() || new.mps() > self.cap.mpsmax() {
            return false;
        }
        if new.css() != 0 && new.css() != 6 {
            return false;
        }
        if old.en()
            && new.en()
            && (old.ams() != new.ams() || old.mps() != new.mps() || old.css() != new.css())
        {
            return false;
        }
        true
    }

    pub fn read_property(&self, offset: u32, size: u8) -> Result<u64, spec::Status> {
        let value = match (spec::Register(offset), size) {
            (spec::Register::CAP, 8) => self.cap.into(),
            (spec::Register::CAP, 4) => u64::from(self.cap) & 0xffff_ffff,
            (spec::Register(4), 4) => u64::from(self.cap) >> 32,
            (spec::Register::VS, 4) => self.vs.into(),
            (spec::Register::CC, 4) => u32::from(self.cc).into(),
            (spec::Register::CSTS, 4) => u32::from(self.csts).into(),
            _ => return Err(spec::Status::INVALID_FIELD_IN_COMMAND),
        };
        Ok(value)
    }

    pub fn write_property(
        &mut self,
        offset: u32,
        size: u8,
        value: u64,
    ) -> Result<(), spec::Status> {
        if spec::Register(offset) != spec::Register::CC || size != 4 {
            return Err(spec::Status::INVALID_FIELD_IN_COMMAND);
        }
        let cc = spec::Cc::from(value as u32);
        if !self.validate_cc(cc) {
            tracing::warn!(?cc, "invalid cc");
            return Err(spec::Status::INVALID_FIELD_IN_COMMAND);
        }
        tracing::debug!(?cc, "set cc");
        self.cc = cc;
        self.csts.set_rdy(cc.en());
        if cc.shn() != 0 {
            // Shutdown completes immediately.
            self.csts.set_shst(0b10);
        } else {
            self.csts.set_shst(0);
        }
        Ok(())
    }

    /// Handles a Property Get or Property Set command.
    pub fn handle_property_command(&mut self, sqe: &spec::Command) -> CommandResult {
        let fabrics: spec::fabrics::FabricsCommand = zerocopy::transmute!(*sqe);
        let property_size = |size: u8| match size {
            PROPERTY_SIZE_4 => Some(4),
            PROPERTY_SIZE_8 => Some(8),
            _ => None,
        };
        match fabrics.fctype {
            FabricsCommandType::PROPERTY_GET => {
                let cmd: PropertyGetCommand = zerocopy::transmute!(*sqe);
                let Some(size) = property_size(cmd.attrib.size()) else {
                    return spec::Status::INVALID_FIELD_IN_COMMAND.into();
                };
                match self.read_property(cmd.ofst, size) {
                    Ok(value) => CommandResult::new(
                        spec::Status::SUCCESS,
                        [value as u32, (value >> 32) as u32],
                    ),
                    Err(status) => status.into(),
                }
            }
            FabricsCommandType::PROPERTY_SET => {
                let cmd: PropertySetCommand = zerocopy::transmute!(*sqe);
                let Some(size) = property_size(cmd.attrib.size()) else {
                    return spec::Status::INVALID_FIELD_IN_COMMAND.into();
                };
                match self.write_property(cmd.ofst, size, cmd.value) {
                    Ok(()) => spec::Status::SUCCESS.into(),
                    Err(status) => status.into(),
                }
            }
            _ => spec::Status::INVALID_FIELD_IN_COMMAND.into(),
        }
    }
}
