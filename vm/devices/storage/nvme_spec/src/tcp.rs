// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! NVMe/TCP PDU definitions.
//!
//! TCP transport 1.0c, section 3.6.

use crate::Command;
use crate::Completion;
use bitfield_struct::bitfield;
use open_enum::open_enum;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

type U32LE = zerocopy::U32<zerocopy::LE>;

/// Size of a header or data digest.
pub const DIGEST_LEN: usize = 4;
/// The only defined PDU format version.
pub const PFV_1_0: u16 = 0;
/// Largest PDU data alignment value a peer may request (in dwords, zero
/// based).
pub const MAX_PDA: u8 = 31;
/// Smallest MAXH2CDATA a controller may advertise.
pub const MIN_MAXH2CDATA: u32 = 4096;
/// A termination request carries at most this much of the offending PDU.
pub const TERM_REQ_MAX_DATA: usize = 128;
pub const TERM_REQ_MIN_PLEN: u32 = size_of::<TermReq>() as u32;
pub const TERM_REQ_MAX_PLEN: u32 = TERM_REQ_MIN_PLEN + TERM_REQ_MAX_DATA as u32;

/// PDU types. Bit 0 is set for PDUs sent from controller to host.
#[open_enum]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
#[repr(u8)]
pub enum PduType {
    IC_REQ = 0x00,
    IC_RESP = 0x01,
    H2C_TERM_REQ = 0x02,
    C2H_TERM_REQ = 0x03,
    CAPSULE_CMD = 0x04,
    CAPSULE_RESP = 0x05,
    H2C_DATA = 0x06,
    C2H_DATA = 0x07,
    R2T = 0x09,
}

impl PduType {
    /// True if this PDU travels from controller to host.
    pub fn is_controller_to_host(&self) -> bool {
        self.0 & 1 != 0
    }
}

#[bitfield(u8)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct PduFlags {
    /// Header digest present.
    pub hdgstf: bool,
    /// Data digest present.
    pub ddgstf: bool,
    /// Last data PDU of a transfer. H2C and C2H data only.
    pub last_pdu: bool,
    /// The command completed successfully and no response capsule follows.
    /// C2H data only.
    pub success: bool,
    #[bits(4)]
    _rsvd: u8,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CommonHeader {
    pub pdu_type: PduType,
    pub flags: PduFlags,
    /// Header length, excluding the header digest.
    pub hlen: u8,
    /// PDU data offset.
    pub pdo: u8,
    /// Total PDU length, including digests and padding.
    pub plen: u32,
}

const _: () = assert!(size_of::<CommonHeader>() == 8);

#[bitfield(u8)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct DigestFlags {
    pub hdgst_enable: bool,
    pub ddgst_enable: bool,
    #[bits(6)]
    _rsvd: u8,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct IcReq {
    pub ch: CommonHeader,
    pub pfv: u16,
    /// Host PDU data alignment, in dwords, zero based.
    pub hpda: u8,
    pub dgst: DigestFlags,
    pub maxr2t: u32,
    pub rsvd: [u8; 112],
}

const _: () = assert!(size_of::<IcReq>() == 128);

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct IcResp {
    pub ch: CommonHeader,
    pub pfv: u16,
    /// Controller PDU data alignment, in dwords, zero based.
    pub cpda: u8,
    pub dgst: DigestFlags,
    pub maxh2cdata: u32,
    pub rsvd: [u8; 112],
}

const _: () = assert!(size_of::<IcResp>() == 128);

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct TermReq {
    pub ch: CommonHeader,
    pub fes: FatalErrorStatus,
    pub fei: U32LE,
    pub rsvd: [u8; 10],
}

const _: () = assert!(size_of::<TermReq>() == 24);

/// Fatal error status carried in a termination request.
#[open_enum]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
#[repr(u16)]
pub enum FatalErrorStatus {
    INVALID_HEADER_FIELD = 0x01,
    PDU_SEQUENCE_ERROR = 0x02,
    HDGST_ERROR = 0x03,
    DATA_TRANSFER_OUT_OF_RANGE = 0x04,
    DATA_TRANSFER_LIMIT_EXCEEDED = 0x05,
    UNSUPPORTED_PARAMETER = 0x06,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CapsuleCmd {
    pub ch: CommonHeader,
    pub ccsqe: Command,
}

const _: () = assert!(size_of::<CapsuleCmd>() == 72);

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CapsuleResp {
    pub ch: CommonHeader,
    pub rccqe: Completion,
}

const _: () = assert!(size_of::<CapsuleResp>() == 24);

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct H2CData {
    pub ch: CommonHeader,
    pub cccid: u16,
    pub ttag: u16,
    pub datao: u32,
    pub datal: u32,
    pub rsvd: [u8; 4],
}

const _: () = assert!(size_of::<H2CData>() == 24);

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct C2HData {
    pub ch: CommonHeader,
    pub cccid: u16,
    pub rsvd1: u16,
    pub datao: u32,
    pub datal: u32,
    pub rsvd2: [u8; 4],
}

const _: () = assert!(size_of::<C2HData>() == 24);

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct R2T {
    pub ch: CommonHeader,
    pub cccid: u16,
    pub ttag: u16,
    pub r2to: u32,
    pub r2tl: u32,
    pub rsvd: [u8; 4],
}

const _: () = assert!(size_of::<R2T>() == 24);
