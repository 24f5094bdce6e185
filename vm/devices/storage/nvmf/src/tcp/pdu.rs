// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! NVMe/TCP PDU validation and encoding.

use crate::association::Role;
use crate::digest::compute_digest;
use crate::spec::tcp::C2HData;
use crate::spec::tcp::CapsuleCmd;
use crate::spec::tcp::CapsuleResp;
use crate::spec::tcp::CommonHeader;
use crate::spec::tcp::FatalErrorStatus;
use crate::spec::tcp::H2CData;
use crate::spec::tcp::IcReq;
use crate::spec::tcp::IcResp;
use crate::spec::tcp::PduFlags;
use crate::spec::tcp::PduType;
use crate::spec::tcp::TermReq;
use crate::spec::tcp::DIGEST_LEN;
use crate::spec::tcp::R2T;
use crate::spec::tcp::TERM_REQ_MAX_DATA;
use crate::spec::tcp::TERM_REQ_MAX_PLEN;
use crate::spec::tcp::TERM_REQ_MIN_PLEN;
use std::mem::offset_of;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub const FEI_PDU_TYPE: u32 = offset_of!(CommonHeader, pdu_type) as u32;
pub const FEI_FLAGS: u32 = offset_of!(CommonHeader, flags) as u32;
pub const FEI_HLEN: u32 = offset_of!(CommonHeader, hlen) as u32;
pub const FEI_PDO: u32 = offset_of!(CommonHeader, pdo) as u32;
pub const FEI_PLEN: u32 = offset_of!(CommonHeader, plen) as u32;

/// A common header that failed validation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HeaderError {
    /// Report the error to the peer with a termination request.
    Report { fes: FatalErrorStatus, fei: u32 },
    /// A malformed termination request. Drop the connection without
    /// reporting anything.
    Reset,
}

fn invalid(fei: u32) -> HeaderError {
    HeaderError::Report {
        fes: FatalErrorStatus::INVALID_HEADER_FIELD,
        fei,
    }
}

const HDGSTF: u8 = PduFlags::new().with_hdgstf(true).into_bits();
const DDGSTF: u8 = PduFlags::new().with_ddgstf(true).into_bits();
const LAST_PDU: u8 = PduFlags::new().with_last_pdu(true).into_bits();
const SUCCESS: u8 = PduFlags::new().with_success(true).into_bits();

/// Validates a received common header, returning the length of the PDU's
/// data excluding any data digest.
///
/// The checks run in a fixed order and the first failure determines the
/// reported field.
pub fn validate_header(
    ch: &CommonHeader,
    role: Role,
    header_digests: bool,
    data_digests: bool,
    rxpda: u32,
) -> Result<u32, HeaderError> {
    let plen = ch.plen;

    // Controllers receive even PDU types, hosts odd ones.
    if ch.pdu_type.is_controller_to_host() != (role == Role::Host) {
        return Err(invalid(FEI_PDU_TYPE));
    }

    let (hlen, valid_flags) = match ch.pdu_type {
        PduType::IC_REQ | PduType::IC_RESP => (size_of::<IcReq>(), 0),
        PduType::H2C_TERM_REQ | PduType::C2H_TERM_REQ => {
            if !(TERM_REQ_MIN_PLEN..=TERM_REQ_MAX_PLEN).contains(&plen) {
                return Err(HeaderError::Reset);
            }
            (size_of::<TermReq>(), 0)
        }
        PduType::CAPSULE_CMD => (size_of::<CapsuleCmd>(), HDGSTF | DDGSTF),
        PduType::CAPSULE_RESP => (size_of::<CapsuleResp>(), HDGSTF),
        PduType::H2C_DATA => (size_of::<H2CData>(), HDGSTF | DDGSTF | LAST_PDU),
        PduType::C2H_DATA => (size_of::<C2HData>(), HDGSTF | DDGSTF | LAST_PDU | SUCCESS),
        PduType::R2T => (size_of::<R2T>(), HDGSTF),
        _ => return Err(invalid(FEI_PDU_TYPE)),
    };
    let hlen = hlen as u32;

    let flags = ch.flags.into_bits();
    if flags & !valid_flags != 0 {
        return Err(invalid(FEI_FLAGS));
    }
    // Digest flags must match what was negotiated. There is never a data
    // digest without data.
    if valid_flags & HDGSTF != 0 && ch.flags.hdgstf() != header_digests {
        return Err(invalid(FEI_FLAGS));
    }
    let full_hlen = hlen + if ch.flags.hdgstf() { DIGEST_LEN as u32 } else { 0 };
    let has_data = plen > full_hlen;
    let ddgst_expected = data_digests && valid_flags & DDGSTF != 0 && has_data;
    if ch.flags.ddgstf() != ddgst_expected {
        return Err(invalid(FEI_FLAGS));
    }

    if ch.flags.success() && !ch.flags.last_pdu() {
        return Err(invalid(FEI_FLAGS));
    }

    if ch.hlen as u32 != hlen {
        return Err(invalid(FEI_HLEN));
    }

    let pdo = ch.pdo as u32;
    match ch.pdu_type {
        PduType::CAPSULE_CMD | PduType::H2C_DATA | PduType::C2H_DATA => {
            if !(pdo == 0 && !has_data)
                && (pdo < full_hlen || pdo > plen || pdo % rxpda != 0)
            {
                return Err(invalid(FEI_PDO));
            }
        }
        _ => {
            if pdo != 0 {
                return Err(invalid(FEI_PDO));
            }
        }
    }

    if plen < full_hlen {
        return Err(invalid(FEI_PLEN));
    }
    let mut data_len = if pdo == 0 { plen - full_hlen } else { plen - pdo };
    match ch.pdu_type {
        PduType::IC_REQ | PduType::IC_RESP => {
            if data_len != 0 {
                return Err(invalid(FEI_PLEN));
            }
        }
        PduType::CAPSULE_RESP | PduType::R2T => {
            if data_len != 0 {
                return Err(invalid(FEI_PDO));
            }
        }
        PduType::H2C_DATA | PduType::C2H_DATA => {
            if data_len == 0 {
                return Err(invalid(FEI_PLEN));
            }
        }
        _ => {}
    }

    if ch.flags.ddgstf() {
        if data_len <= DIGEST_LEN as u32 {
            return Err(invalid(FEI_PLEN));
        }
        data_len -= DIGEST_LEN as u32;
    }

    Ok(data_len)
}

/// A fixed PDU header type.
pub(crate) trait PduHeader: IntoBytes + FromBytes + Immutable + KnownLayout {
    const TYPE: PduType;
    fn ch_mut(&mut self) -> &mut CommonHeader;
}

macro_rules! pdu_header {
    ($($ty:ty => $pdu_type:ident),* $(,)?) => {
        $(
            impl PduHeader for $ty {
                const TYPE: PduType = PduType::$pdu_type;
                fn ch_mut(&mut self) -> &mut CommonHeader {
                    &mut self.ch
                }
            }
        )*
    };
}

pdu_header! {
    IcReq => IC_REQ,
    IcResp => IC_RESP,
    CapsuleCmd => CAPSULE_CMD,
    CapsuleResp => CAPSULE_RESP,
    H2CData => H2C_DATA,
    C2HData => C2H_DATA,
    R2T => R2T,
    // Only used to read received termination requests, which may be
    // either type.
    TermReq => C2H_TERM_REQ,
}

/// Serializes a PDU: the header, an optional header digest, padding to the
/// data offset, the data, and an optional data digest.
///
/// Type specific flags must already be set in `hdr`; the common header's
/// length, offset, and digest fields are filled in here.
pub(crate) fn encode_pdu<T: PduHeader>(
    mut hdr: T,
    data: &[u8],
    header_digest: bool,
    data_digest: bool,
    txpda: u32,
) -> Vec<u8> {
    let hlen = size_of::<T>();
    let data_digest = data_digest && !data.is_empty();
    let mut plen = hlen + if header_digest { DIGEST_LEN } else { 0 };
    let pdo = if data.is_empty() {
        0
    } else {
        plen.next_multiple_of(txpda as usize)
    };
    if !data.is_empty() {
        plen = pdo + data.len() + if data_digest { DIGEST_LEN } else { 0 };
    }

    let ch = hdr.ch_mut();
    ch.pdu_type = T::TYPE;
    ch.flags.set_hdgstf(header_digest);
    ch.flags.set_ddgstf(data_digest);
    ch.hlen = hlen as u8;
    ch.pdo = pdo as u8;
    ch.plen = plen as u32;

    let mut pdu = Vec::with_capacity(plen);
    pdu.extend_from_slice(hdr.as_bytes());
    if header_digest {
        pdu.extend_from_slice(&compute_digest(hdr.as_bytes()).to_le_bytes());
    }
    if !data.is_empty() {
        pdu.resize(pdo, 0);
        pdu.extend_from_slice(data);
        if data_digest {
            pdu.extend_from_slice(&compute_digest(data).to_le_bytes());
        }
    }
    pdu
}

/// Serializes a termination request carrying up to 128 bytes of the
/// offending PDU header.
pub(crate) fn encode_term_req(
    pdu_type: PduType,
    fes: FatalErrorStatus,
    fei: u32,
    offending: &[u8],
) -> Vec<u8> {
    let offending = &offending[..offending.len().min(TERM_REQ_MAX_DATA)];
    let mut hdr = TermReq::new_zeroed();
    hdr.ch.pdu_type = pdu_type;
    hdr.ch.hlen = size_of::<TermReq>() as u8;
    hdr.ch.plen = (size_of::<TermReq>() + offending.len()) as u32;
    hdr.fes = fes;
    hdr.fei.set(fei);
    let mut pdu = hdr.as_bytes().to_vec();
    pdu.extend_from_slice(offending);
    pdu
}

/// A received and validated PDU.
#[derive(Debug)]
pub(crate) struct ReceivedPdu {
    bytes: Vec<u8>,
    hlen: usize,
    data_start: usize,
    data_len: usize,
}

impl ReceivedPdu {
    pub fn new(bytes: Vec<u8>, hlen: usize, data_start: usize, data_len: usize) -> Self {
        Self {
            bytes,
            hlen,
            data_start,
            data_len,
        }
    }

    pub fn ch(&self) -> CommonHeader {
        // The buffer always holds at least the common header.
        CommonHeader::read_from_prefix(&self.bytes)
            .map(|(ch, _)| ch)
            .unwrap_or_else(|_| CommonHeader::new_zeroed())
    }

    pub fn pdu_type(&self) -> PduType {
        self.ch().pdu_type
    }

    pub fn header<T: PduHeader>(&self) -> Option<T> {
        T::read_from_prefix(&self.bytes[..self.hlen]).ok().map(|(h, _)| h)
    }

    /// The header bytes, as echoed back in a termination request.
    pub fn header_bytes(&self) -> &[u8] {
        &self.bytes[..self.hlen]
    }

    pub fn data(&self) -> &[u8] {
        &self.bytes[self.data_start..self.data_start + self.data_len]
    }

    pub fn into_data(mut self) -> Vec<u8> {
        self.bytes.truncate(self.data_start + self.data_len);
        self.bytes.drain(..self.data_start);
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::tcp::TERM_REQ_MIN_PLEN;

    fn ch(pdu_type: PduType, flags: u8, hlen: usize, pdo: u8, plen: u32) -> CommonHeader {
        CommonHeader {
            pdu_type,
            flags: PduFlags::from_bits(flags),
            hlen: hlen as u8,
            pdo,
            plen,
        }
    }

    fn report(fei: u32) -> Result<u32, HeaderError> {
        Err(invalid(fei))
    }

    const CMD_HLEN: usize = size_of::<CapsuleCmd>();
    const DATA_HLEN: usize = size_of::<H2CData>();

    #[test]
    fn command_without_data() {
        let h = ch(PduType::CAPSULE_CMD, 0, CMD_HLEN, 0, CMD_HLEN as u32);
        assert_eq!(validate_header(&h, Role::Controller, false, false, 4), Ok(0));
    }

    #[test]
    fn command_with_data_and_digests() {
        // 72 byte header + 4 byte digest, padded to 128, 512 bytes + digest.
        let h = ch(
            PduType::CAPSULE_CMD,
            HDGSTF | DDGSTF,
            CMD_HLEN,
            128,
            128 + 512 + 4,
        );
        assert_eq!(validate_header(&h, Role::Controller, true, true, 128), Ok(512));
        assert_eq!(
            validate_header(&h, Role::Controller, true, true, 256),
            report(FEI_PDO)
        );
    }

    #[test]
    fn direction_checked_first() {
        // Wrong direction and a wrong header length: the direction wins.
        let h = ch(PduType::CAPSULE_RESP, 0, 99, 0, 24);
        assert_eq!(
            validate_header(&h, Role::Controller, false, false, 4),
            report(FEI_PDU_TYPE)
        );
        assert_eq!(
            validate_header(&h, Role::Host, false, false, 4),
            report(FEI_HLEN)
        );
    }

    #[test]
    fn unknown_type() {
        let h = ch(PduType(0x08), 0, 24, 0, 24);
        assert_eq!(
            validate_header(&h, Role::Controller, false, false, 4),
            report(FEI_PDU_TYPE)
        );
    }

    #[test]
    fn flags_before_hlen() {
        // Illegal LAST_PDU on a command and a bad hlen.
        let h = ch(PduType::CAPSULE_CMD, LAST_PDU, 10, 0, 72);
        assert_eq!(
            validate_header(&h, Role::Controller, false, false, 4),
            report(FEI_FLAGS)
        );
    }

    #[test]
    fn digest_flags_must_match() {
        let h = ch(PduType::CAPSULE_RESP, 0, 24, 0, 24);
        assert_eq!(
            validate_header(&h, Role::Host, true, false, 4),
            report(FEI_FLAGS)
        );
        let h = ch(PduType::CAPSULE_RESP, HDGSTF, 24, 0, 28);
        assert_eq!(validate_header(&h, Role::Host, true, false, 4), Ok(0));
        assert_eq!(
            validate_header(&h, Role::Host, false, false, 4),
            report(FEI_FLAGS)
        );

        // A data digest is required on data bearing PDUs only.
        let h = ch(PduType::C2H_DATA, LAST_PDU, DATA_HLEN, 24, 24 + 16);
        assert_eq!(
            validate_header(&h, Role::Host, false, true, 4),
            report(FEI_FLAGS)
        );
        let h = ch(PduType::CAPSULE_CMD, 0, CMD_HLEN, 0, CMD_HLEN as u32);
        assert_eq!(validate_header(&h, Role::Controller, false, true, 4), Ok(0));
    }

    #[test]
    fn success_requires_last() {
        let h = ch(PduType::C2H_DATA, SUCCESS, 99, 24, 40);
        assert_eq!(
            validate_header(&h, Role::Host, false, false, 4),
            report(FEI_FLAGS)
        );
        let h = ch(PduType::C2H_DATA, SUCCESS | LAST_PDU, DATA_HLEN, 24, 40);
        assert_eq!(validate_header(&h, Role::Host, false, false, 4), Ok(16));
    }

    #[test]
    fn pdo_rules() {
        // Misaligned.
        let h = ch(PduType::H2C_DATA, LAST_PDU, DATA_HLEN, 26, 64);
        assert_eq!(
            validate_header(&h, Role::Controller, false, false, 4),
            report(FEI_PDO)
        );
        // Inside the header.
        let h = ch(PduType::H2C_DATA, LAST_PDU, DATA_HLEN, 20, 64);
        assert_eq!(
            validate_header(&h, Role::Controller, false, false, 4),
            report(FEI_PDO)
        );
        // Past the end, and with a bad plen: pdo is reported.
        let h = ch(PduType::H2C_DATA, LAST_PDU, DATA_HLEN, 128, 64);
        assert_eq!(
            validate_header(&h, Role::Controller, false, false, 4),
            report(FEI_PDO)
        );
        // Zero with data present.
        let h = ch(PduType::CAPSULE_CMD, 0, CMD_HLEN, 0, 100);
        assert_eq!(
            validate_header(&h, Role::Controller, false, false, 4),
            report(FEI_PDO)
        );
        // Must be zero on R2T.
        let h = ch(PduType::R2T, 0, 24, 24, 24);
        assert_eq!(
            validate_header(&h, Role::Host, false, false, 4),
            report(FEI_PDO)
        );
    }

    #[test]
    fn plen_rules() {
        let h = ch(PduType::CAPSULE_RESP, 0, 24, 0, 20);
        assert_eq!(
            validate_header(&h, Role::Host, false, false, 4),
            report(FEI_PLEN)
        );
        // Responses carry no data.
        let h = ch(PduType::CAPSULE_RESP, 0, 24, 0, 32);
        assert_eq!(
            validate_header(&h, Role::Host, false, false, 4),
            report(FEI_PDO)
        );
        // Data digest with nothing but the digest.
        let h = ch(PduType::H2C_DATA, DDGSTF | LAST_PDU, DATA_HLEN, 24, 28);
        assert_eq!(
            validate_header(&h, Role::Controller, false, true, 4),
            report(FEI_PLEN)
        );
    }

    #[test]
    fn term_req_bounds() {
        let h = ch(PduType::C2H_TERM_REQ, 0, 24, 0, TERM_REQ_MIN_PLEN - 1);
        assert_eq!(
            validate_header(&h, Role::Host, false, false, 4),
            Err(HeaderError::Reset)
        );
        let h = ch(PduType::C2H_TERM_REQ, 0, 24, 0, TERM_REQ_MAX_PLEN + 1);
        assert_eq!(
            validate_header(&h, Role::Host, false, false, 4),
            Err(HeaderError::Reset)
        );
        let h = ch(PduType::C2H_TERM_REQ, 0, 24, 0, TERM_REQ_MIN_PLEN + 8);
        assert_eq!(validate_header(&h, Role::Host, false, false, 4), Ok(8));
    }

    #[test]
    fn encode_layout() {
        let hdr = CapsuleCmd::new_zeroed();
        let data = [0x5au8; 100];
        let pdu = encode_pdu(hdr, &data, true, true, 8);
        let (ch, _) = CommonHeader::read_from_prefix(&pdu).unwrap();
        assert_eq!(ch.pdu_type, PduType::CAPSULE_CMD);
        assert_eq!(ch.hlen as usize, CMD_HLEN);
        // 72 + 4 rounded up to 8.
        assert_eq!(ch.pdo, 80);
        assert_eq!(ch.plen as usize, 80 + 100 + 4);
        assert_eq!(pdu.len(), ch.plen as usize);
        assert!(ch.flags.hdgstf() && ch.flags.ddgstf());

        let hdgst = u32::from_le_bytes(pdu[CMD_HLEN..CMD_HLEN + 4].try_into().unwrap());
        assert_eq!(hdgst, compute_digest(&pdu[..CMD_HLEN]));
        assert!(pdu[CMD_HLEN + 4..80].iter().all(|&b| b == 0));
        assert_eq!(&pdu[80..180], &data);
        let ddgst = u32::from_le_bytes(pdu[180..184].try_into().unwrap());
        assert_eq!(ddgst, compute_digest(&data));

        assert_eq!(
            validate_header(&ch, Role::Controller, true, true, 8),
            Ok(100)
        );
    }

    #[test]
    fn encode_without_data() {
        let pdu = encode_pdu(CapsuleResp::new_zeroed(), &[], false, true, 4);
        let (ch, _) = CommonHeader::read_from_prefix(&pdu).unwrap();
        assert_eq!(ch.pdo, 0);
        assert_eq!(ch.plen, 24);
        assert!(!ch.flags.ddgstf());
        assert_eq!(validate_header(&ch, Role::Host, false, true, 4), Ok(0));
    }

    #[test]
    fn term_req_truncates() {
        let pdu = encode_term_req(
            PduType::H2C_TERM_REQ,
            FatalErrorStatus::INVALID_HEADER_FIELD,
            2,
            &[0xee; 200],
        );
        assert_eq!(pdu.len(), TERM_REQ_MAX_PLEN as usize);
        let (hdr, _) = TermReq::read_from_prefix(&pdu).unwrap();
        assert_eq!(hdr.fes, FatalErrorStatus::INVALID_HEADER_FIELD);
        assert_eq!(hdr.fei.get(), 2);
        assert_eq!(hdr.ch.plen, TERM_REQ_MAX_PLEN);
    }
}
