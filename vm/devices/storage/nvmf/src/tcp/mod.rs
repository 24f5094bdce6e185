// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The NVMe/TCP transport binding.

pub mod buffer;
pub mod pdu;

use self::buffer::CommandBuffer;
use self::buffer::CommandBuffers;
use self::buffer::Direction;
use self::buffer::SegmentError;
use self::pdu::HeaderError;
use self::pdu::PduHeader;
use self::pdu::ReceivedPdu;
use crate::association::AssociationParams;
use crate::association::Role;
use crate::capsule::Capsule;
use crate::capsule::DataBuffer;
use crate::digest::compute_digest;
use crate::spec;
use crate::spec::fabrics::AddressFamily;
use crate::spec::fabrics::DiscoveryLogEntry;
use crate::spec::fabrics::SglDescriptor;
use crate::spec::fabrics::SglType;
use crate::spec::fabrics::TcpSecurityType;
use crate::spec::fabrics::TransportType;
use crate::spec::tcp::C2HData;
use crate::spec::tcp::CapsuleCmd;
use crate::spec::tcp::CapsuleResp;
use crate::spec::tcp::CommonHeader;
use crate::spec::tcp::DigestFlags;
use crate::spec::tcp::FatalErrorStatus;
use crate::spec::tcp::H2CData;
use crate::spec::tcp::IcReq;
use crate::spec::tcp::IcResp;
use crate::spec::tcp::PduType;
use crate::spec::tcp::TermReq;
use crate::spec::tcp::DIGEST_LEN;
use crate::spec::tcp::MAX_PDA;
use crate::spec::tcp::MIN_MAXH2CDATA;
use crate::spec::tcp::PFV_1_0;
use crate::spec::tcp::R2T;
use crate::transport::ByteStream;
use crate::transport::ControllerData;
use crate::transport::TransportHandoff;
use crate::transport::TransportQueue;
use crate::Association;
use crate::Error;
use std::collections::VecDeque;
use std::io::Read;
use std::io::Write;
use std::mem::offset_of;
use zerocopy::FromZeros;

/// In-capsule data limit on the admin queue.
pub const ADMIN_MAX_ICD: u32 = 8192;

pub(crate) fn validate_params(role: Role, params: &AssociationParams) -> Result<(), Error> {
    let tcp = &params.tcp;
    if tcp.pda > MAX_PDA {
        return Err(Error::InvalidArgument("pda out of range"));
    }
    if tcp.max_c2hdata == 0 {
        return Err(Error::InvalidArgument("max_c2hdata must be nonzero"));
    }
    if role == Role::Controller
        && (tcp.maxh2cdata < MIN_MAXH2CDATA || tcp.maxh2cdata % 4 != 0)
    {
        return Err(Error::InvalidArgument("invalid maxh2cdata"));
    }
    Ok(())
}

/// Largest in-capsule data length for a queue.
fn max_icd(qid: u16, ioccsz: u32) -> u32 {
    if qid == 0 {
        ADMIN_MAX_ICD
    } else {
        ioccsz.saturating_sub(4).saturating_mul(16)
    }
}

/// Connection settings negotiated by the Initialize Connection exchange.
#[derive(Debug, Clone)]
pub struct TcpHandoff {
    pub txpda: u32,
    pub rxpda: u32,
    pub header_digests: bool,
    pub data_digests: bool,
    pub maxr2t: u32,
    pub maxh2cdata: u32,
    pub max_c2hdata: u32,
    pub max_icd: u32,
}

/// A fatal error to report against a field of a received PDU header.
#[derive(Debug, Copy, Clone)]
struct PduError {
    fes: FatalErrorStatus,
    fei: u32,
}

impl PduError {
    fn invalid_field(fei: usize) -> Self {
        Self {
            fes: FatalErrorStatus::INVALID_HEADER_FIELD,
            fei: fei as u32,
        }
    }

    fn segment(err: SegmentError, range_fei: usize, order_fei: usize) -> Self {
        let fei = match err {
            SegmentError::OutOfRange { .. } => range_fei,
            SegmentError::OutOfOrder { .. } => order_fei,
            SegmentError::LastPduMismatch => pdu::FEI_FLAGS as usize,
        };
        Self {
            fes: err.fes(),
            fei: fei as u32,
        }
    }
}

fn read_le32(bytes: &[u8]) -> u32 {
    let mut v = [0; 4];
    v.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(v)
}

fn header<T: PduHeader>(pdu: &ReceivedPdu) -> Result<T, Error> {
    pdu.header::<T>().ok_or(Error::UnexpectedPdu(T::TYPE))
}

/// One NVMe/TCP connection.
pub(crate) struct TcpQueue {
    role: Role,
    stream: Box<dyn ByteStream>,
    closed: bool,
    qid: u16,
    ioccsz: u32,
    txpda: u32,
    rxpda: u32,
    header_digests: bool,
    data_digests: bool,
    maxr2t: u32,
    maxh2cdata: u32,
    max_c2hdata: u32,
    max_icd: u32,
    next_ttag: u16,
    rx_buffers: CommandBuffers,
    tx_buffers: CommandBuffers,
    received: VecDeque<Capsule<'static>>,
}

impl std::fmt::Debug for TcpQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpQueue")
            .field("role", &self.role)
            .field("qid", &self.qid)
            .field("closed", &self.closed)
            .field("header_digests", &self.header_digests)
            .field("data_digests", &self.data_digests)
            .field("max_icd", &self.max_icd)
            .finish()
    }
}

impl TcpQueue {
    fn new(association: &Association, stream: Box<dyn ByteStream>, qid: u16) -> Self {
        let tcp = &association.params().tcp;
        let ioccsz = association.ioccsz();
        Self {
            role: association.role(),
            stream,
            closed: false,
            qid,
            ioccsz,
            // Updated from the peer's alignment by the handshake.
            txpda: 4,
            rxpda: (tcp.pda as u32 + 1) * 4,
            header_digests: false,
            data_digests: false,
            maxr2t: tcp.maxr2t,
            maxh2cdata: tcp.maxh2cdata,
            max_c2hdata: tcp.max_c2hdata,
            max_icd: max_icd(qid, ioccsz),
            next_ttag: 0,
            rx_buffers: CommandBuffers::new(Direction::Receive),
            tx_buffers: CommandBuffers::new(Direction::Send),
            received: VecDeque::new(),
        }
    }

    /// Performs the host side of the Initialize Connection exchange.
    pub fn connect(
        association: &Association,
        stream: Box<dyn ByteStream>,
        qid: u16,
    ) -> Result<Self, Error> {
        let tcp = &association.params().tcp;
        let mut queue = Self::new(association, stream, qid);

        let mut req = IcReq::new_zeroed();
        req.pfv = PFV_1_0;
        req.hpda = tcp.pda;
        req.dgst = DigestFlags::new()
            .with_hdgst_enable(tcp.header_digests)
            .with_ddgst_enable(tcp.data_digests);
        req.maxr2t = tcp.maxr2t;
        let pdu = pdu::encode_pdu(req, &[], false, false, queue.txpda);
        queue.write_pdu(&pdu)?;

        let pdu = queue.read_pdu()?;
        let resp: IcResp = queue.expect_ic(&pdu)?;
        let check = || {
            if resp.pfv != PFV_1_0 {
                return Err(PduError {
                    fes: FatalErrorStatus::UNSUPPORTED_PARAMETER,
                    fei: offset_of!(IcResp, pfv) as u32,
                });
            }
            if resp.cpda > MAX_PDA {
                return Err(PduError::invalid_field(offset_of!(IcResp, cpda)));
            }
            if resp.dgst.into_bits() & !0b11 != 0 {
                return Err(PduError::invalid_field(offset_of!(IcResp, dgst)));
            }
            if (resp.dgst.hdgst_enable() && !tcp.header_digests)
                || (resp.dgst.ddgst_enable() && !tcp.data_digests)
            {
                return Err(PduError {
                    fes: FatalErrorStatus::UNSUPPORTED_PARAMETER,
                    fei: offset_of!(IcResp, dgst) as u32,
                });
            }
            if resp.maxh2cdata < MIN_MAXH2CDATA || resp.maxh2cdata % 4 != 0 {
                return Err(PduError::invalid_field(offset_of!(IcResp, maxh2cdata)));
            }
            Ok(())
        };
        if let Err(err) = check() {
            return Err(queue.report_error(err.fes, err.fei, pdu.header_bytes()));
        }

        queue.txpda = (resp.cpda as u32 + 1) * 4;
        queue.header_digests = resp.dgst.hdgst_enable();
        queue.data_digests = resp.dgst.ddgst_enable();
        queue.maxh2cdata = resp.maxh2cdata;
        tracing::debug!(
            qid,
            txpda = queue.txpda,
            header_digests = queue.header_digests,
            data_digests = queue.data_digests,
            maxh2cdata = queue.maxh2cdata,
            "initialized connection"
        );
        Ok(queue)
    }

    /// Performs the controller side of the Initialize Connection exchange.
    /// The queue is treated as an admin queue until [`Self::set_qid`].
    pub fn accept(association: &Association, stream: Box<dyn ByteStream>) -> Result<Self, Error> {
        let tcp = &association.params().tcp;
        let mut queue = Self::new(association, stream, 0);

        let pdu = queue.read_pdu()?;
        let req: IcReq = queue.expect_ic(&pdu)?;
        let check = || {
            if req.pfv != PFV_1_0 {
                return Err(PduError {
                    fes: FatalErrorStatus::UNSUPPORTED_PARAMETER,
                    fei: offset_of!(IcReq, pfv) as u32,
                });
            }
            if req.hpda > MAX_PDA {
                return Err(PduError::invalid_field(offset_of!(IcReq, hpda)));
            }
            if req.dgst.into_bits() & !0b11 != 0 {
                return Err(PduError::invalid_field(offset_of!(IcReq, dgst)));
            }
            Ok(())
        };
        if let Err(err) = check() {
            return Err(queue.report_error(err.fes, err.fei, pdu.header_bytes()));
        }

        let header_digests = req.dgst.hdgst_enable() && tcp.header_digests;
        let data_digests = req.dgst.ddgst_enable() && tcp.data_digests;
        queue.txpda = (req.hpda as u32 + 1) * 4;
        queue.maxr2t = req.maxr2t;

        let mut resp = IcResp::new_zeroed();
        resp.pfv = PFV_1_0;
        resp.cpda = tcp.pda;
        resp.dgst = DigestFlags::new()
            .with_hdgst_enable(header_digests)
            .with_ddgst_enable(data_digests);
        resp.maxh2cdata = tcp.maxh2cdata;
        let pdu = pdu::encode_pdu(resp, &[], false, false, queue.txpda);
        queue.write_pdu(&pdu)?;

        queue.header_digests = header_digests;
        queue.data_digests = data_digests;
        tracing::debug!(
            txpda = queue.txpda,
            header_digests,
            data_digests,
            maxr2t = queue.maxr2t,
            "accepted connection"
        );
        Ok(queue)
    }

    fn expect_ic<T: PduHeader>(&mut self, pdu: &ReceivedPdu) -> Result<T, Error> {
        match pdu.pdu_type() {
            t if t == T::TYPE => header(pdu),
            PduType::H2C_TERM_REQ | PduType::C2H_TERM_REQ => Err(self.handle_term_req(pdu)),
            _ => Err(self.report_error(
                FatalErrorStatus::INVALID_HEADER_FIELD,
                pdu::FEI_PDU_TYPE,
                pdu.header_bytes(),
            )),
        }
    }

    fn write_pdu(&mut self, pdu: &[u8]) -> Result<(), Error> {
        if self.closed {
            return Err(Error::ConnectionReset);
        }
        self.stream.write_all(pdu)?;
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        if self.closed {
            return Err(Error::ConnectionReset);
        }
        self.stream.read_exact(buf)?;
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.stream.shutdown();
            self.closed = true;
            self.rx_buffers.release_all();
            self.tx_buffers.release_all();
        }
    }

    /// Sends a termination request for a bad PDU and closes the connection.
    fn report_error(&mut self, fes: FatalErrorStatus, fei: u32, header: &[u8]) -> Error {
        tracing::warn!(qid = self.qid, ?fes, fei, "peer protocol error");
        let pdu_type = match self.role {
            Role::Host => PduType::H2C_TERM_REQ,
            Role::Controller => PduType::C2H_TERM_REQ,
        };
        let pdu = pdu::encode_term_req(pdu_type, fes, fei, header);
        if let Err(err) = self.write_pdu(&pdu) {
            tracing::debug!(
                error = &err as &dyn std::error::Error,
                "failed to send termination request"
            );
        }
        self.close();
        Error::Protocol { fes, fei }
    }

    fn handle_term_req(&mut self, pdu: &ReceivedPdu) -> Error {
        match pdu.header::<TermReq>() {
            Some(hdr) => tracing::error!(
                qid = self.qid,
                fes = ?hdr.fes,
                fei = hdr.fei.get(),
                "received termination request"
            ),
            None => tracing::error!(qid = self.qid, "received termination request"),
        }
        self.close();
        Error::ConnectionReset
    }

    /// Reads and validates one PDU.
    fn read_pdu(&mut self) -> Result<ReceivedPdu, Error> {
        let mut ch_bytes = [0u8; size_of::<CommonHeader>()];
        self.read_exact(&mut ch_bytes)?;
        let ch: CommonHeader = zerocopy::transmute!(ch_bytes);

        let data_len = match pdu::validate_header(
            &ch,
            self.role,
            self.header_digests,
            self.data_digests,
            self.rxpda,
        ) {
            Ok(n) => n,
            Err(HeaderError::Reset) => {
                tracing::error!(qid = self.qid, plen = ch.plen, "malformed termination request");
                self.close();
                return Err(Error::ConnectionReset);
            }
            Err(HeaderError::Report { fes, fei }) => {
                return Err(self.report_error(fes, fei, &ch_bytes));
            }
        };

        let limit = match ch.pdu_type {
            PduType::CAPSULE_CMD => Some(self.max_icd),
            PduType::H2C_DATA => Some(self.maxh2cdata),
            PduType::C2H_DATA => Some(self.max_c2hdata),
            _ => None,
        };
        if limit.is_some_and(|limit| data_len > limit) {
            return Err(self.report_error(
                FatalErrorStatus::DATA_TRANSFER_LIMIT_EXCEEDED,
                pdu::FEI_PLEN,
                &ch_bytes,
            ));
        }

        let plen = ch.plen as usize;
        let mut bytes = vec![0; plen];
        bytes[..ch_bytes.len()].copy_from_slice(&ch_bytes);
        self.read_exact(&mut bytes[ch_bytes.len()..])?;

        let hlen = ch.hlen as usize;
        let mut full_hlen = hlen;
        if ch.flags.hdgstf() {
            let digest = read_le32(&bytes[hlen..]);
            if digest != compute_digest(&bytes[..hlen]) {
                return Err(self.report_error(
                    FatalErrorStatus::HDGST_ERROR,
                    0,
                    &bytes[..hlen],
                ));
            }
            full_hlen += DIGEST_LEN;
        }

        let data_start = if ch.pdo != 0 { ch.pdo as usize } else { full_hlen };
        let data_len = data_len as usize;
        if ch.flags.ddgstf() {
            let data = &bytes[data_start..data_start + data_len];
            if read_le32(&bytes[data_start + data_len..]) != compute_digest(data) {
                tracing::error!(qid = self.qid, pdu_type = ?ch.pdu_type, "data digest mismatch");
                self.close();
                return Err(Error::DataDigest);
            }
        }

        tracing::trace!(qid = self.qid, pdu_type = ?ch.pdu_type, plen, "received pdu");
        Ok(ReceivedPdu::new(bytes, hlen, data_start, data_len))
    }

    /// Receives and processes one PDU. Complete capsules are queued.
    fn receive_pdu(&mut self) -> Result<(), Error> {
        let pdu = self.read_pdu()?;
        match pdu.pdu_type() {
            PduType::H2C_TERM_REQ | PduType::C2H_TERM_REQ => Err(self.handle_term_req(&pdu)),
            PduType::IC_REQ | PduType::IC_RESP => Err(self.report_error(
                FatalErrorStatus::INVALID_HEADER_FIELD,
                pdu::FEI_PDU_TYPE,
                pdu.header_bytes(),
            )),
            PduType::CAPSULE_CMD => {
                let hdr: CapsuleCmd = header(&pdu)?;
                let icd = pdu.into_data();
                tracing::debug!(
                    qid = self.qid,
                    cid = hdr.ccsqe.cdw0.cid(),
                    icd = icd.len(),
                    "received command"
                );
                self.received
                    .push_back(Capsule::received_command(hdr.ccsqe, icd));
                Ok(())
            }
            PduType::CAPSULE_RESP => {
                let hdr: CapsuleResp = header(&pdu)?;
                let cqe = hdr.rccqe;
                // A response ends every transfer for the command.
                let data = self
                    .rx_buffers
                    .purge(cqe.cid)
                    .map(CommandBuffer::into_data)
                    .unwrap_or_default();
                self.tx_buffers.purge(cqe.cid);
                tracing::debug!(
                    qid = self.qid,
                    cid = cqe.cid,
                    status = cqe.status.status(),
                    "received response"
                );
                self.received
                    .push_back(Capsule::received_response(cqe, data, true));
                Ok(())
            }
            PduType::H2C_DATA => self.handle_h2c_data(pdu),
            PduType::C2H_DATA => self.handle_c2h_data(pdu),
            PduType::R2T => self.handle_r2t(pdu),
            pdu_type => Err(Error::UnexpectedPdu(pdu_type)),
        }
    }

    fn handle_h2c_data(&mut self, pdu: ReceivedPdu) -> Result<(), Error> {
        let hdr: H2CData = header(&pdu)?;
        let data = pdu.data();
        let result = match self.rx_buffers.lookup(hdr.cccid, hdr.ttag) {
            None => Err(PduError::invalid_field(offset_of!(H2CData, ttag))),
            Some(_) if hdr.datal as usize != data.len() => {
                Err(PduError::invalid_field(offset_of!(H2CData, datal)))
            }
            Some(cb) => cb
                .on_data_segment(hdr.datao, data, hdr.ch.flags.last_pdu())
                .map_err(|err| {
                    PduError::segment(
                        err,
                        offset_of!(H2CData, datao),
                        offset_of!(H2CData, datao),
                    )
                }),
        };
        if let Err(err) = result {
            return Err(self.report_error(err.fes, err.fei, pdu.header_bytes()));
        }
        Ok(())
    }

    fn handle_c2h_data(&mut self, pdu: ReceivedPdu) -> Result<(), Error> {
        let hdr: C2HData = header(&pdu)?;
        let data = pdu.data();
        let result = match self.rx_buffers.lookup(hdr.cccid, 0) {
            None => Err(PduError::invalid_field(offset_of!(C2HData, cccid))),
            Some(_) if hdr.datal as usize != data.len() => {
                Err(PduError::invalid_field(offset_of!(C2HData, datal)))
            }
            Some(cb) => cb
                .on_data_segment(hdr.datao, data, hdr.ch.flags.last_pdu())
                .map_err(|err| {
                    PduError::segment(
                        err,
                        offset_of!(C2HData, datao),
                        offset_of!(C2HData, datao),
                    )
                }),
        };
        if let Err(err) = result {
            return Err(self.report_error(err.fes, err.fei, pdu.header_bytes()));
        }

        if hdr.ch.flags.success() {
            // The command completed without a response capsule.
            let mut cqe = spec::Completion::new_zeroed();
            cqe.cid = hdr.cccid;
            let data = self
                .rx_buffers
                .purge(hdr.cccid)
                .map(CommandBuffer::into_data)
                .unwrap_or_default();
            self.tx_buffers.purge(hdr.cccid);
            tracing::debug!(qid = self.qid, cid = hdr.cccid, "command completed by data");
            self.received
                .push_back(Capsule::received_response(cqe, data, false));
        }
        Ok(())
    }

    fn handle_r2t(&mut self, pdu: ReceivedPdu) -> Result<(), Error> {
        let hdr: R2T = header(&pdu)?;
        let result = match self.tx_buffers.lookup(hdr.cccid, 0) {
            None => Err(PduError::invalid_field(offset_of!(R2T, cccid))),
            Some(cb) => cb
                .start_transfer(hdr.r2to, hdr.r2tl)
                .map(<[u8]>::to_vec)
                .map_err(|err| {
                    PduError::segment(err, offset_of!(R2T, r2tl), offset_of!(R2T, r2to))
                }),
        };
        let data = match result {
            Ok(data) => data,
            Err(err) => return Err(self.report_error(err.fes, err.fei, pdu.header_bytes())),
        };

        tracing::debug!(
            qid = self.qid,
            cid = hdr.cccid,
            ttag = hdr.ttag,
            offset = hdr.r2to,
            len = hdr.r2tl,
            "r2t"
        );
        let chunk_size = self.maxh2cdata as usize;
        let count = data.len().div_ceil(chunk_size);
        for (i, chunk) in data.chunks(chunk_size).enumerate() {
            let mut h2c = H2CData::new_zeroed();
            h2c.cccid = hdr.cccid;
            h2c.ttag = hdr.ttag;
            h2c.datao = hdr.r2to + (i * chunk_size) as u32;
            h2c.datal = chunk.len() as u32;
            h2c.ch.flags.set_last_pdu(i + 1 == count);
            let pdu = pdu::encode_pdu(
                h2c,
                chunk,
                self.header_digests,
                self.data_digests,
                self.txpda,
            );
            self.write_pdu(&pdu)?;
        }
        Ok(())
    }

    fn transmit_command(&mut self, capsule: &Capsule<'_>) -> Result<(), Error> {
        let mut sqe = *capsule.sqe().ok_or(Error::InvalidCapsuleType)?;
        let cid = sqe.cdw0.cid();
        let data_len = capsule.data_len();

        let icd = match capsule.data() {
            Some(DataBuffer::Send(buf))
                if !buf.is_empty() && buf.len() <= self.max_icd as usize =>
            {
                Some(*buf)
            }
            _ => None,
        };
        let sgl = SglDescriptor {
            address: 0,
            length: data_len as u32,
            rsvd: [0; 3],
            sgl_type: if icd.is_some() {
                SglType::IN_CAPSULE_DATA
            } else {
                SglType::COMMAND_BUFFER
            },
        };
        sqe.dptr = zerocopy::transmute!(sgl);

        match capsule.data() {
            Some(DataBuffer::Send(buf)) if icd.is_none() && !buf.is_empty() => {
                self.tx_buffers
                    .register(CommandBuffer::new_send(cid, 0, buf.to_vec()));
            }
            Some(DataBuffer::Receive(buf)) if !buf.is_empty() => {
                self.rx_buffers
                    .register(CommandBuffer::new_receive(cid, 0, 0, buf.len() as u32));
            }
            _ => {}
        }

        let mut hdr = CapsuleCmd::new_zeroed();
        hdr.ccsqe = sqe;
        let pdu = pdu::encode_pdu(
            hdr,
            icd.unwrap_or(&[]),
            self.header_digests,
            self.data_digests,
            self.txpda,
        );
        tracing::debug!(
            qid = self.qid,
            cid,
            opcode = sqe.cdw0.opcode(),
            data_len,
            icd = icd.is_some(),
            "sending command"
        );
        if let Err(err) = self.write_pdu(&pdu) {
            self.rx_buffers.purge(cid);
            self.tx_buffers.purge(cid);
            return Err(err);
        }
        Ok(())
    }

    fn transmit_response(&mut self, capsule: &Capsule<'_>) -> Result<(), Error> {
        let cqe = *capsule.cqe().ok_or(Error::InvalidCapsuleType)?;
        let mut hdr = CapsuleResp::new_zeroed();
        hdr.rccqe = cqe;
        let pdu = pdu::encode_pdu(hdr, &[], self.header_digests, false, self.txpda);
        tracing::debug!(
            qid = self.qid,
            cid = cqe.cid,
            status = cqe.status.status(),
            "sending response"
        );
        self.write_pdu(&pdu)
    }

    fn allocate_ttag(&mut self) -> u16 {
        let ttag = self.next_ttag;
        self.next_ttag = self.next_ttag.wrapping_add(1);
        if self.next_ttag == 0xffff {
            self.next_ttag = 0;
        }
        ttag
    }

    fn export(&self) -> TcpHandoff {
        TcpHandoff {
            txpda: self.txpda,
            rxpda: self.rxpda,
            header_digests: self.header_digests,
            data_digests: self.data_digests,
            maxr2t: self.maxr2t,
            maxh2cdata: self.maxh2cdata,
            max_c2hdata: self.max_c2hdata,
            max_icd: self.max_icd,
        }
    }
}

impl TransportQueue for TcpQueue {
    fn transport_type(&self) -> TransportType {
        TransportType::TCP
    }

    fn set_qid(&mut self, qid: u16) {
        self.qid = qid;
        self.max_icd = max_icd(qid, self.ioccsz);
    }

    fn transmit_capsule(&mut self, capsule: &Capsule<'_>) -> Result<(), Error> {
        match (self.role, capsule.is_command()) {
            (Role::Host, true) => self.transmit_command(capsule),
            (Role::Controller, false) => self.transmit_response(capsule),
            _ => Err(Error::InvalidCapsuleType),
        }
    }

    fn receive_capsule(&mut self) -> Result<Capsule<'static>, Error> {
        loop {
            if let Some(capsule) = self.received.pop_front() {
                return Ok(capsule);
            }
            self.receive_pdu()?;
        }
    }

    fn validate_command_capsule(&self, capsule: &Capsule<'_>) -> Result<(), spec::Status> {
        let sgl = capsule
            .sgl1()
            .ok_or(spec::Status::INVALID_FIELD_IN_COMMAND)?;
        let icd_len = capsule.received_data().len();
        match sgl.sgl_type {
            SglType::IN_CAPSULE_DATA => {
                if sgl.length as usize != icd_len {
                    return Err(spec::Status::DATA_SGL_LENGTH_INVALID);
                }
            }
            SglType::COMMAND_BUFFER => {
                if icd_len != 0 {
                    return Err(spec::Status::INVALID_FIELD_IN_COMMAND);
                }
            }
            _ => return Err(spec::Status::SGL_DESCRIPTOR_TYPE_INVALID),
        }
        if sgl.address != 0 {
            return Err(spec::Status::SGL_OFFSET_INVALID);
        }
        Ok(())
    }

    fn capsule_data_len(&self, capsule: &Capsule<'_>) -> usize {
        capsule.sgl1().map_or(0, |sgl| sgl.length as usize)
    }

    fn receive_controller_data(
        &mut self,
        capsule: &Capsule<'_>,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        let sgl = capsule.sgl1().ok_or(Error::InvalidCapsuleType)?;
        let end = offset as u64 + buf.len() as u64;
        if end > sgl.length as u64 {
            return Err(Error::TooLarge);
        }

        if sgl.sgl_type == SglType::IN_CAPSULE_DATA {
            let icd = capsule
                .received_data()
                .get(offset as usize..end as usize)
                .ok_or(Error::TooLarge)?;
            buf.copy_from_slice(icd);
            return Ok(());
        }
        if buf.is_empty() {
            return Ok(());
        }

        let cid = capsule.cid();
        let ttag = self.allocate_ttag();
        self.rx_buffers.register(CommandBuffer::new_receive(
            cid,
            ttag,
            offset,
            buf.len() as u32,
        ));

        let mut r2t = R2T::new_zeroed();
        r2t.cccid = cid;
        r2t.ttag = ttag;
        r2t.r2to = offset;
        r2t.r2tl = buf.len() as u32;
        let pdu = pdu::encode_pdu(r2t, &[], self.header_digests, false, self.txpda);
        tracing::debug!(qid = self.qid, cid, ttag, offset, len = buf.len(), "sending r2t");

        let result = self.write_pdu(&pdu).and_then(|()| loop {
            match self.rx_buffers.lookup(cid, ttag) {
                Some(cb) if cb.is_complete() => break Ok(()),
                Some(_) => self.receive_pdu()?,
                None => break Err(Error::ConnectionReset),
            }
        });
        let cb = self.rx_buffers.remove(cid, ttag);
        result?;
        let data = cb.ok_or(Error::ConnectionReset)?.into_data();
        buf.copy_from_slice(&data);
        Ok(())
    }

    fn send_controller_data(
        &mut self,
        capsule: &Capsule<'_>,
        offset: u32,
        buf: &[u8],
        complete_on_success: bool,
    ) -> Result<ControllerData, Error> {
        let sgl = capsule.sgl1().ok_or(Error::InvalidCapsuleType)?;
        let end = offset as u64 + buf.len() as u64;
        if end > sgl.length as u64 {
            return Err(Error::TooLarge);
        }
        if buf.is_empty() {
            return Ok(ControllerData::Sent);
        }

        let cid = capsule.cid();
        let ends_transfer = end == sgl.length as u64;
        let success = complete_on_success && ends_transfer;
        let chunk_size = self.max_c2hdata as usize;
        let count = buf.len().div_ceil(chunk_size);
        for (i, chunk) in buf.chunks(chunk_size).enumerate() {
            let last = i + 1 == count && ends_transfer;
            let mut c2h = C2HData::new_zeroed();
            c2h.cccid = cid;
            c2h.datao = offset + (i * chunk_size) as u32;
            c2h.datal = chunk.len() as u32;
            c2h.ch.flags.set_last_pdu(last);
            c2h.ch.flags.set_success(last && success);
            let pdu = pdu::encode_pdu(
                c2h,
                chunk,
                self.header_digests,
                self.data_digests,
                self.txpda,
            );
            self.write_pdu(&pdu)?;
        }
        tracing::debug!(qid = self.qid, cid, offset, len = buf.len(), success, "sent data");
        Ok(if success {
            ControllerData::SuccessSent
        } else {
            ControllerData::Sent
        })
    }

    fn populate_discovery_entry(&self, entry: &mut DiscoveryLogEntry) {
        entry.trtype = TransportType::TCP;
        if let Some(addr) = self.stream.local_addr() {
            entry.adrfam = if addr.is_ipv4() {
                AddressFamily::IPV4
            } else {
                AddressFamily::IPV6
            };
            let traddr = addr.ip().to_string();
            entry.traddr = [0; 256];
            entry.traddr[..traddr.len()].copy_from_slice(traddr.as_bytes());
            let trsvcid = addr.port().to_string();
            entry.trsvcid = [0; 32];
            entry.trsvcid[..trsvcid.len()].copy_from_slice(trsvcid.as_bytes());
        }
        entry.tsas = [0; 256];
        entry.tsas[0] = TcpSecurityType::NONE.0;
    }

    fn shutdown(&mut self) {
        self.close();
    }

    fn handoff(self: Box<Self>) -> (TransportHandoff, Box<dyn ByteStream>) {
        let handoff = TransportHandoff::Tcp(self.export());
        (handoff, self.stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_helpers::init_tracing;
    use crate::tests::test_helpers::ScriptedStream;
    use crate::TcpParams;
    use std::sync::Arc;
    use zerocopy::FromBytes;

    fn association(role: Role, tcp: TcpParams) -> Arc<Association> {
        let params = AssociationParams {
            tcp,
            ..Default::default()
        };
        Association::new(role, TransportType::TCP, params).unwrap()
    }

    fn ic_resp(cpda: u8, hdgst: bool, maxh2cdata: u32) -> Vec<u8> {
        let mut resp = IcResp::new_zeroed();
        resp.cpda = cpda;
        resp.dgst = DigestFlags::new().with_hdgst_enable(hdgst);
        resp.maxh2cdata = maxh2cdata;
        pdu::encode_pdu(resp, &[], false, false, 4)
    }

    fn term_req(output: &[u8]) -> TermReq {
        TermReq::read_from_prefix(output).unwrap().0
    }

    #[test]
    fn host_handshake() {
        init_tracing();
        let na = association(
            Role::Host,
            TcpParams {
                header_digests: true,
                pda: 1,
                ..Default::default()
            },
        );
        let (stream, output) = ScriptedStream::new(ic_resp(3, true, 8192));
        let queue = TcpQueue::connect(&na, Box::new(stream), 0).unwrap();
        assert!(queue.header_digests);
        assert!(!queue.data_digests);
        assert_eq!(queue.txpda, 16);
        assert_eq!(queue.rxpda, 8);
        assert_eq!(queue.maxh2cdata, 8192);
        assert_eq!(queue.max_icd, ADMIN_MAX_ICD);

        let output = output.lock();
        let (req, _) = IcReq::read_from_prefix(&output).unwrap();
        assert_eq!(output.len(), 128);
        assert_eq!(req.ch.pdu_type, PduType::IC_REQ);
        assert_eq!(req.hpda, 1);
        assert!(req.dgst.hdgst_enable());
    }

    #[test]
    fn host_rejects_unrequested_digest() {
        init_tracing();
        let na = association(Role::Host, TcpParams::default());
        let (stream, output) = ScriptedStream::new(ic_resp(0, true, 8192));
        let err = TcpQueue::connect(&na, Box::new(stream), 0).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol {
                fes: FatalErrorStatus::UNSUPPORTED_PARAMETER,
                fei: 11
            }
        ));
        let output = output.lock();
        let term = term_req(&output[128..]);
        assert_eq!(term.ch.pdu_type, PduType::H2C_TERM_REQ);
        assert_eq!(term.fei.get(), 11);
        // The offending IC response header follows.
        assert_eq!(term.ch.plen, 24 + 128);
    }

    #[test]
    fn host_rejects_small_maxh2cdata() {
        init_tracing();
        let na = association(Role::Host, TcpParams::default());
        let (stream, _output) = ScriptedStream::new(ic_resp(0, false, 2048));
        let err = TcpQueue::connect(&na, Box::new(stream), 0).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol {
                fes: FatalErrorStatus::INVALID_HEADER_FIELD,
                fei: 12
            }
        ));
    }

    #[test]
    fn controller_grants_digest_intersection() {
        init_tracing();
        let na = association(
            Role::Controller,
            TcpParams {
                header_digests: true,
                data_digests: false,
                maxh2cdata: 4096,
                ..Default::default()
            },
        );
        let mut req = IcReq::new_zeroed();
        req.hpda = 7;
        req.dgst = DigestFlags::new()
            .with_hdgst_enable(true)
            .with_ddgst_enable(true);
        let (stream, output) = ScriptedStream::new(pdu::encode_pdu(req, &[], false, false, 4));
        let queue = TcpQueue::accept(&na, Box::new(stream)).unwrap();
        assert!(queue.header_digests);
        assert!(!queue.data_digests);
        assert_eq!(queue.txpda, 32);

        let output = output.lock();
        let (resp, _) = IcResp::read_from_prefix(&output).unwrap();
        assert_eq!(resp.ch.pdu_type, PduType::IC_RESP);
        assert!(resp.dgst.hdgst_enable());
        assert!(!resp.dgst.ddgst_enable());
        assert_eq!(resp.maxh2cdata, 4096);
    }

    #[test]
    fn controller_rejects_bad_pfv() {
        init_tracing();
        let na = association(Role::Controller, TcpParams::default());
        let mut req = IcReq::new_zeroed();
        req.pfv = 1;
        let (stream, output) = ScriptedStream::new(pdu::encode_pdu(req, &[], false, false, 4));
        let err = TcpQueue::accept(&na, Box::new(stream)).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol {
                fes: FatalErrorStatus::UNSUPPORTED_PARAMETER,
                fei: 8
            }
        ));
        let term = term_req(&output.lock());
        assert_eq!(term.ch.pdu_type, PduType::C2H_TERM_REQ);
    }

    #[test]
    fn malformed_term_req_resets_silently() {
        init_tracing();
        let na = association(Role::Host, TcpParams::default());
        // A C2H termination request with a plen below the minimum.
        let bytes = vec![0x03, 0, 24, 0, 8, 0, 0, 0];
        let (stream, output) = ScriptedStream::new(bytes);
        let err = TcpQueue::connect(&na, Box::new(stream), 0).unwrap_err();
        assert!(matches!(err, Error::ConnectionReset));
        // Only the IC request went out.
        assert_eq!(output.lock().len(), 128);
    }

    #[test]
    fn header_digest_mismatch_reported() {
        init_tracing();
        let na = association(
            Role::Host,
            TcpParams {
                header_digests: true,
                ..Default::default()
            },
        );
        let mut script = ic_resp(0, true, 8192);
        let mut resp = pdu::encode_pdu(CapsuleResp::new_zeroed(), &[], true, false, 4);
        resp[24] ^= 1;
        script.extend_from_slice(&resp);
        let (stream, output) = ScriptedStream::new(script);
        let mut queue = TcpQueue::connect(&na, Box::new(stream), 0).unwrap();
        let err = queue.receive_capsule().unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol {
                fes: FatalErrorStatus::HDGST_ERROR,
                fei: 0
            }
        ));
        let term = term_req(&output.lock()[128..]);
        assert_eq!(term.fes, FatalErrorStatus::HDGST_ERROR);
        assert!(queue.closed);
    }

    #[test]
    fn data_digest_mismatch_closes() {
        init_tracing();
        let na = association(
            Role::Host,
            TcpParams {
                data_digests: true,
                ..Default::default()
            },
        );
        let mut script = {
            let mut resp = IcResp::new_zeroed();
            resp.dgst = DigestFlags::new().with_ddgst_enable(true);
            resp.maxh2cdata = 8192;
            pdu::encode_pdu(resp, &[], false, false, 4)
        };
        let mut c2h = C2HData::new_zeroed();
        c2h.cccid = 0;
        c2h.datal = 16;
        c2h.ch.flags.set_last_pdu(true);
        let mut pdu = pdu::encode_pdu(c2h, &[0xaa; 16], false, true, 4);
        let n = pdu.len();
        pdu[n - 1] ^= 0xff;
        script.extend_from_slice(&pdu);

        let (stream, output) = ScriptedStream::new(script);
        let mut queue = TcpQueue::connect(&na, Box::new(stream), 0).unwrap();
        let mut buf = [0u8; 16];
        let mut cc = Capsule::command(spec::Command::new_zeroed());
        cc.append_receive_buffer(&mut buf).unwrap();
        queue.transmit_capsule(&cc).unwrap();
        let sent = output.lock().len();

        let err = queue.receive_capsule().unwrap_err();
        assert!(matches!(err, Error::DataDigest));
        // No termination request for a data digest error.
        assert_eq!(output.lock().len(), sent);
        assert!(queue.rx_buffers.is_empty());
    }

    #[test]
    fn c2h_for_unknown_command() {
        init_tracing();
        let na = association(Role::Host, TcpParams::default());
        let mut script = ic_resp(0, false, 8192);
        let mut c2h = C2HData::new_zeroed();
        c2h.cccid = 9;
        c2h.datal = 4;
        c2h.ch.flags.set_last_pdu(true);
        script.extend_from_slice(&pdu::encode_pdu(c2h, &[1, 2, 3, 4], false, false, 4));
        let (stream, _output) = ScriptedStream::new(script);
        let mut queue = TcpQueue::connect(&na, Box::new(stream), 0).unwrap();
        let err = queue.receive_capsule().unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol {
                fes: FatalErrorStatus::INVALID_HEADER_FIELD,
                fei: 8
            }
        ));
    }

    #[test]
    fn c2h_success_synthesizes_response() {
        init_tracing();
        let na = association(Role::Host, TcpParams::default());
        let mut script = ic_resp(0, false, 8192);
        for (offset, last) in [(0u32, false), (8, true)] {
            let mut c2h = C2HData::new_zeroed();
            c2h.cccid = 0;
            c2h.datao = offset;
            c2h.datal = 8;
            c2h.ch.flags.set_last_pdu(last);
            c2h.ch.flags.set_success(last);
            script.extend_from_slice(&pdu::encode_pdu(c2h, &[offset as u8; 8], false, false, 4));
        }
        let (stream, output) = ScriptedStream::new(script);
        let mut queue = TcpQueue::connect(&na, Box::new(stream), 0).unwrap();

        let mut buf = [0u8; 16];
        let mut cc = Capsule::command(spec::Command::new_zeroed());
        cc.append_receive_buffer(&mut buf).unwrap();
        queue.transmit_capsule(&cc).unwrap();

        // A receive buffer is always described by a command buffer SGL.
        let output = output.lock();
        let (cmd, _) = CapsuleCmd::read_from_prefix(&output[128..]).unwrap();
        let sgl: SglDescriptor = zerocopy::transmute!(cmd.ccsqe.dptr);
        assert_eq!(sgl.sgl_type, SglType::COMMAND_BUFFER);
        assert_eq!(sgl.length, 16);
        assert_eq!(cmd.ch.plen, 72);
        drop(output);

        let rc = queue.receive_capsule().unwrap();
        assert!(!rc.sqhd_valid());
        assert_eq!(rc.cid(), 0);
        assert_eq!(rc.status(), spec::Status::SUCCESS);
        cc.complete_from(&rc);
        drop(cc);
        assert_eq!(buf, [0, 0, 0, 0, 0, 0, 0, 0, 8, 8, 8, 8, 8, 8, 8, 8]);
    }

    #[test]
    fn small_send_is_in_capsule() {
        init_tracing();
        let na = association(Role::Host, TcpParams::default());
        let (stream, output) = ScriptedStream::new(ic_resp(0, false, 8192));
        let mut queue = TcpQueue::connect(&na, Box::new(stream), 0).unwrap();

        let data = [0x11u8; 100];
        let mut cc = Capsule::command(spec::Command::new_zeroed());
        cc.append_data(&data).unwrap();
        queue.transmit_capsule(&cc).unwrap();
        assert!(queue.tx_buffers.is_empty());

        let output = output.lock();
        let (cmd, _) = CapsuleCmd::read_from_prefix(&output[128..]).unwrap();
        let sgl: SglDescriptor = zerocopy::transmute!(cmd.ccsqe.dptr);
        assert_eq!(sgl.sgl_type, SglType::IN_CAPSULE_DATA);
        assert_eq!(sgl.length, 100);
        assert_eq!(cmd.ch.pdo, 72);
        assert_eq!(cmd.ch.plen, 172);
    }

    #[test]
    fn validate_command_sgl() {
        let na = association(Role::Controller, TcpParams::default());
        let (stream, _output) = ScriptedStream::new(Vec::new());
        let queue = TcpQueue::new(&na, Box::new(stream), 0);

        let capsule = |sgl_type, length, address, icd: Vec<u8>| {
            let mut sqe = spec::Command::new_zeroed();
            sqe.dptr = zerocopy::transmute!(SglDescriptor {
                address,
                length,
                rsvd: [0; 3],
                sgl_type,
            });
            Capsule::received_command(sqe, icd)
        };

        assert_eq!(
            queue.validate_command_capsule(&capsule(SglType::IN_CAPSULE_DATA, 4, 0, vec![0; 4])),
            Ok(())
        );
        assert_eq!(
            queue.validate_command_capsule(&capsule(SglType::IN_CAPSULE_DATA, 8, 0, vec![0; 4])),
            Err(spec::Status::DATA_SGL_LENGTH_INVALID)
        );
        assert_eq!(
            queue.validate_command_capsule(&capsule(SglType::COMMAND_BUFFER, 8, 0, vec![0; 4])),
            Err(spec::Status::INVALID_FIELD_IN_COMMAND)
        );
        assert_eq!(
            queue.validate_command_capsule(&capsule(SglType::DATA_BLOCK, 8, 0, Vec::new())),
            Err(spec::Status::SGL_DESCRIPTOR_TYPE_INVALID)
        );
        assert_eq!(
            queue.validate_command_capsule(&capsule(SglType::COMMAND_BUFFER, 8, 4096, Vec::new())),
            Err(spec::Status::SGL_OFFSET_INVALID)
        );
        assert_eq!(
            queue.capsule_data_len(&capsule(SglType::COMMAND_BUFFER, 8, 0, Vec::new())),
            8
        );
    }

    #[test]
    fn ttag_skips_reserved() {
        let na = association(Role::Controller, TcpParams::default());
        let (stream, _output) = ScriptedStream::new(Vec::new());
        let mut queue = TcpQueue::new(&na, Box::new(stream), 0);
        queue.next_ttag = 0xfffe;
        assert_eq!(queue.allocate_ttag(), 0xfffe);
        assert_eq!(queue.allocate_ttag(), 0);
    }

    #[test]
    fn io_queue_icd_limit() {
        assert_eq!(max_icd(0, 4), ADMIN_MAX_ICD);
        assert_eq!(max_icd(1, 516), 8192);
        assert_eq!(max_icd(1, 4), 0);
        assert_eq!(max_icd(1, 0), 0);
    }
}
