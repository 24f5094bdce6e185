// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! NVMe over Fabrics command set definitions.
//!
//! Base 2.0c, section 6 (Fabrics Command Set) and section 5.16.1.23
//! (Discovery log page).

use crate::Cdw0;
use bitfield_struct::bitfield;
use open_enum::open_enum;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Size of the NQN fields in the CONNECT data and discovery log entries.
pub const NQN_FIELD_SIZE: usize = 256;
/// Maximum length of an NQN, excluding the terminating NUL.
pub const NQN_MAX_LEN: usize = 223;
/// Well-known NQN of a discovery controller.
pub const DISCOVERY_NQN: &str = "nqn.2014-08.org.nvmexpress.discovery";

/// Requested controller id for the dynamic controller model.
pub const CNTLID_DYNAMIC: u16 = 0xffff;
/// Highest controller id a static controller may have.
pub const CNTLID_STATIC_MAX: u16 = 0xffef;
/// Any static controller may be allocated.
pub const CNTLID_STATIC_ANY: u16 = 0xfffe;

/// SQHD value in a CONNECT response when SQ flow control is disabled.
pub const SQHD_FLOW_CONTROL_DISABLED: u16 = 0xffff;

/// Admin queue sizes (1's based) a CONNECT may request.
pub const MIN_ADMIN_QUEUE_SIZE: u16 = 2;
pub const MAX_ADMIN_QUEUE_SIZE: u16 = 4096;
/// I/O queue sizes (1's based) a CONNECT may request.
pub const MIN_IO_QUEUE_SIZE: u32 = 2;
pub const MAX_IO_QUEUE_SIZE: u32 = 65536;

#[open_enum]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
#[repr(u8)]
pub enum FabricsCommandType {
    PROPERTY_SET = 0x00,
    CONNECT = 0x01,
    PROPERTY_GET = 0x04,
    AUTHENTICATION_SEND = 0x05,
    AUTHENTICATION_RECEIVE = 0x06,
    DISCONNECT = 0x08,
}

/// SGL descriptor identifier byte: the descriptor type in the high nibble,
/// the subtype in the low nibble.
#[open_enum]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
#[repr(u8)]
pub enum SglType {
    DATA_BLOCK = 0x00,
    /// Data block, offset subtype. Used for in-capsule data.
    IN_CAPSULE_DATA = 0x01,
    /// Transport SGL data block, transport-specific subtype. Used for data
    /// transferred through a command buffer.
    COMMAND_BUFFER = 0x5a,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct SglDescriptor {
    pub address: u64,
    pub length: u32,
    pub rsvd: [u8; 3],
    pub sgl_type: SglType,
}

const _: () = assert!(size_of::<SglDescriptor>() == 16);

/// The common layout of every fabrics command.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct FabricsCommand {
    pub cdw0: Cdw0,
    pub fctype: FabricsCommandType,
    pub rsvd1: [u8; 19],
    pub sgl1: SglDescriptor,
    pub fcs: [u8; 24],
}

const _: () = assert!(size_of::<FabricsCommand>() == 64);

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ConnectCommand {
    pub cdw0: Cdw0,
    pub fctype: FabricsCommandType,
    pub rsvd1: [u8; 19],
    pub sgl1: SglDescriptor,
    /// Record format, always zero.
    pub recfmt: u16,
    pub qid: u16,
    /// Submission queue size. Zero based.
    pub sqsize: u16,
    pub cattr: ConnectAttributes,
    pub rsvd2: u8,
    /// Keep alive timeout in milliseconds. Admin queue only.
    pub kato: u32,
    pub rsvd3: [u8; 12],
}

const _: () = assert!(size_of::<ConnectCommand>() == 64);

#[bitfield(u8)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ConnectAttributes {
    #[bits(2)]
    pub priority_class: u8,
    pub disable_sq_flow_control: bool,
    pub io_queue_deletion: bool,
    #[bits(4)]
    _rsvd: u8,
}

/// CONNECT record format supported by this revision.
pub const CONNECT_RECFMT: u16 = 0;

#[repr(C)]
#[derive(Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ConnectData {
    pub hostid: [u8; 16],
    pub cntlid: u16,
    pub rsvd1: [u8; 238],
    pub subnqn: [u8; NQN_FIELD_SIZE],
    pub hostnqn: [u8; NQN_FIELD_SIZE],
    pub rsvd2: [u8; 256],
}

pub const CONNECT_DATA_SIZE: usize = 1024;

const _: () = assert!(size_of::<ConnectData>() == CONNECT_DATA_SIZE);

/// Dword 0 of a successful CONNECT response.
#[bitfield(u32)]
pub struct ConnectResponseDw0 {
    pub cntlid: u16,
    pub authreq: u16,
}

/// Dword 0 of a CONNECT response with
/// [`Status::CONNECT_INVALID_PARAMETERS`](crate::Status::CONNECT_INVALID_PARAMETERS).
#[bitfield(u32)]
pub struct InvalidParameterDw0 {
    /// Byte offset of the invalid parameter.
    pub ipo: u16,
    /// The offset is into the CONNECT data rather than the command.
    pub data: bool,
    #[bits(15)]
    _rsvd: u16,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct PropertyGetCommand {
    pub cdw0: Cdw0,
    pub fctype: FabricsCommandType,
    pub rsvd1: [u8; 35],
    pub attrib: PropertyAttributes,
    pub rsvd2: [u8; 3],
    pub ofst: u32,
    pub rsvd3: [u8; 16],
}

const _: () = assert!(size_of::<PropertyGetCommand>() == 64);

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct PropertySetCommand {
    pub cdw0: Cdw0,
    pub fctype: FabricsCommandType,
    pub rsvd1: [u8; 35],
    pub attrib: PropertyAttributes,
    pub rsvd2: [u8; 3],
    pub ofst: u32,
    pub value: u64,
    pub rsvd3: [u8; 8],
}

const _: () = assert!(size_of::<PropertySetCommand>() == 64);

#[bitfield(u8)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct PropertyAttributes {
    /// 0 for a 4 byte property, 1 for an 8 byte property.
    #[bits(3)]
    pub size: u8,
    #[bits(5)]
    _rsvd: u8,
}

pub const PROPERTY_SIZE_4: u8 = 0;
pub const PROPERTY_SIZE_8: u8 = 1;

#[open_enum]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
#[repr(u8)]
pub enum TransportType {
    RDMA = 1,
    FC = 2,
    TCP = 3,
    INTRA_HOST = 0xfe,
}

impl TransportType {
    pub fn name(&self) -> &'static str {
        match *self {
            Self::RDMA => "RDMA",
            Self::FC => "Fibre Channel",
            Self::TCP => "TCP",
            Self::INTRA_HOST => "Intra-host",
            _ => "unknown",
        }
    }
}

#[open_enum]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
#[repr(u8)]
pub enum AddressFamily {
    IPV4 = 1,
    IPV6 = 2,
    IB = 3,
    FC = 4,
    INTRA_HOST = 0xfe,
}

#[open_enum]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
#[repr(u8)]
pub enum SubsystemType {
    /// Referral to another discovery subsystem.
    DISCOVERY_REFERRAL = 1,
    NVME = 2,
    CURRENT_DISCOVERY = 3,
}

#[bitfield(u8)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct TransportRequirements {
    #[bits(2)]
    pub secure_channel: u8,
    pub disable_sq_flow_control: bool,
    #[bits(5)]
    _rsvd: u8,
}

#[repr(C)]
#[derive(Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct DiscoveryLogPageHeader {
    /// Generation counter.
    pub genctr: u64,
    /// Number of records.
    pub numrec: u64,
    pub recfmt: u16,
    pub rsvd: [u8; 1006],
}

const _: () = assert!(size_of::<DiscoveryLogPageHeader>() == 1024);

#[repr(C)]
#[derive(Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct DiscoveryLogEntry {
    pub trtype: TransportType,
    pub adrfam: AddressFamily,
    pub subtype: SubsystemType,
    pub treq: TransportRequirements,
    pub portid: u16,
    pub cntlid: u16,
    /// Admin maximum submission queue size.
    pub aqsz: u16,
    pub rsvd1: [u8; 22],
    pub trsvcid: [u8; 32],
    pub rsvd2: [u8; 192],
    pub subnqn: [u8; NQN_FIELD_SIZE],
    pub traddr: [u8; 256],
    pub tsas: [u8; 256],
}

const _: () = assert!(size_of::<DiscoveryLogEntry>() == 1024);

/// Security type in the TCP transport specific address subtype.
#[open_enum]
#[derive(Copy, Clone, Debug)]
#[repr(u8)]
pub enum TcpSecurityType {
    NONE = 0,
    TLS_1_2 = 1,
    TLS_1_3 = 2,
}
