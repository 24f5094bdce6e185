// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Definitions from the NVMe specifications:
//!
//! Base 2.0c: <https://nvmexpress.org/wp-content/uploads/NVM-Express-Base-Specification-2.0c-2022.10.04-Ratified.pdf>
//! TCP transport 1.0c: <https://nvmexpress.org/wp-content/uploads/NVM-Express-TCP-Transport-Specification-1.0c-2022.10.03-Ratified.pdf>
//!
//! The fabrics command set lives in [`fabrics`], the NVMe/TCP PDU layouts in
//! [`tcp`]. All multi-byte fields are little endian on the wire.

#![no_std]

pub mod fabrics;
pub mod nvm;
pub mod tcp;

use bitfield_struct::bitfield;
use open_enum::open_enum;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

type U128LE = zerocopy::U128<zerocopy::LE>;

/// Controller properties, addressed by offset through Property Get/Set.
#[open_enum]
#[derive(Copy, Clone, Debug)]
#[repr(u32)]
pub enum Register {
    CAP = 0x0,
    VS = 0x8,
    INTMS = 0xc,
    INTMC = 0x10,
    CC = 0x14,
    CSTS = 0x1c,
    NSSR = 0x20,
}

/// Controller capabilities.
#[bitfield(u64)]
pub struct Cap {
    /// Maximum queue entries supported. Zero based.
    pub mqes_z: u16,
    pub cqr: bool,
    pub ams_weighted_round_robin_with_urgent: bool,
    pub ams_vendor_specific: bool,
    #[bits(5)]
    pub reserved: u8,
    /// Worst-case time to become ready, in 500ms units.
    pub to: u8,
    #[bits(4)]
    pub dstrd: u8,
    pub nssrs: bool,
    pub css_nvm: bool,
    #[bits(5)]
    pub css_reserved: u8,
    pub multiple_io: bool,
    pub admin_only: bool,
    pub bps: bool,
    #[bits(2)]
    pub cps: u8,
    #[bits(4)]
    pub mpsmin: u8,
    #[bits(4)]
    pub mpsmax: u8,
    pub pmrs: bool,
    pub cmbs: bool,
    pub nsss: bool,
    pub crwms: bool,
    pub crims: bool,
    #[bits(3)]
    pub reserved2: u64,
}

/// Controller configuration.
#[bitfield(u32)]
pub struct Cc {
    pub en: bool,
    #[bits(3)]
    pub reserved: u8,
    #[bits(3)]
    pub css: u8,
    #[bits(4)]
    pub mps: u8,
    #[bits(3)]
    pub ams: u8,
    #[bits(2)]
    pub shn: u8,
    #[bits(4)]
    pub iosqes: u8,
    #[bits(4)]
    pub iocqes: u8,
    pub crime: bool,
    #[bits(7)]
    pub reserved2: u8,
}

/// Controller status.
#[bitfield(u32)]
pub struct Csts {
    pub rdy: bool,
    pub cfs: bool,
    #[bits(2)]
    pub shst: u8,
    pub nssro: bool,
    pub pp: bool,
    pub st: bool,
    #[bits(25)]
    pub reserved: u32,
}

/// A submission queue entry.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Command {
    pub cdw0: Cdw0,
    pub nsid: u32,
    pub cdw2: u32,
    pub cdw3: u32,
    pub mptr: u64,
    pub dptr: [u64; 2],
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

const _: () = assert!(size_of::<Command>() == 64);

#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Cdw0 {
    pub opcode: u8,
    #[bits(2)]
    pub fuse: u8,
    #[bits(4)]
    pub reserved: u8,
    #[bits(2)]
    pub psdt: u8,
    pub cid: u16,
}

/// PRP or SGL for data transfer.
#[open_enum]
#[derive(Copy, Clone, Debug)]
#[repr(u8)]
pub enum Psdt {
    PRP = 0,
    SGL_MPTR_CONTIGUOUS = 1,
    SGL_MPTR_SGL = 2,
}

#[repr(C)]
pub struct Opcode(pub u8);

impl Opcode {
    pub fn transfer_controller_to_host(&self) -> bool {
        self.0 & 0b10 != 0
    }

    pub fn transfer_host_to_controller(&self) -> bool {
        self.0 & 0b01 != 0
    }
}

#[open_enum]
#[derive(Copy, Clone, Debug)]
#[repr(u8)]
pub enum AdminOpcode {
    DELETE_IO_SUBMISSION_QUEUE = 0x00,
    CREATE_IO_SUBMISSION_QUEUE = 0x01,
    GET_LOG_PAGE = 0x02,
    DELETE_IO_COMPLETION_QUEUE = 0x04,
    CREATE_IO_COMPLETION_QUEUE = 0x05,
    IDENTIFY = 0x06,
    ABORT = 0x08,
    SET_FEATURES = 0x09,
    GET_FEATURES = 0x0a,
    ASYNCHRONOUS_EVENT_REQUEST = 0x0c,
    KEEP_ALIVE = 0x18,
    FABRICS_COMMANDS = 0x7f,
}

/// A completion queue entry.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Completion {
    pub dw0: u32,
    pub dw1: u32,
    pub sqhd: u16,
    pub sqid: u16,
    pub cid: u16,
    pub status: CompletionStatus,
}

const _: () = assert!(size_of::<Completion>() == 16);

#[bitfield(u16)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CompletionStatus {
    pub phase: bool,
    /// 8 bits of status code followed by 3 bits of the status code type.
    #[bits(11)]
    pub status: u16,
    #[bits(2)]
    pub crd: u8,
    pub more: bool,
    pub dnr: bool,
}

#[open_enum]
#[derive(Copy, Clone, Debug)]
#[repr(u8)]
pub enum StatusCodeType {
    GENERIC = 0,
    COMMAND_SPECIFIC = 1,
    MEDIA_ERROR = 2,
    PATH_RELATED = 3,
    VENDOR_SPECIFIC = 7,
}

/// A status code combined with its status code type, as stored in
/// [`CompletionStatus::status`].
#[open_enum]
#[derive(Copy, Clone, Debug)]
#[repr(u16)]
pub enum Status {
    SUCCESS = 0x00,
    INVALID_COMMAND_OPCODE = 0x01,
    INVALID_FIELD_IN_COMMAND = 0x02,
    COMMAND_ID_CONFLICT = 0x03,
    DATA_TRANSFER_ERROR = 0x04,
    INTERNAL_ERROR = 0x06,
    COMMAND_ABORT_REQUESTED = 0x07,
    COMMAND_SEQUENCE_ERROR = 0x0c,
    INVALID_SGL_SEGMENT_DESCRIPTOR = 0x0d,
    INVALID_NUMBER_OF_SGL_DESCRIPTORS = 0x0e,
    DATA_SGL_LENGTH_INVALID = 0x0f,
    METADATA_SGL_LENGTH_INVALID = 0x10,
    SGL_DESCRIPTOR_TYPE_INVALID = 0x11,
    SGL_OFFSET_INVALID = 0x16,
    HOST_IDENTIFIER_INCONSISTENT_FORMAT = 0x18,
    KEEP_ALIVE_TIMER_EXPIRED = 0x19,
    KEEP_ALIVE_TIMEOUT_INVALID = 0x1a,
    COMMAND_INTERRUPTED = 0x21,
    TRANSIENT_TRANSPORT_ERROR = 0x22,

    LBA_OUT_OF_RANGE = 0x80,
    CAPACITY_EXCEEDED = 0x81,
    NAMESPACE_NOT_READY = 0x82,

    COMPLETION_QUEUE_INVALID = 0x100,
    INVALID_QUEUE_IDENTIFIER = 0x101,
    INVALID_QUEUE_SIZE = 0x102,
    INVALID_LOG_PAGE = 0x109,

    // Fabrics command-specific status values.
    CONNECT_INCOMPATIBLE_FORMAT = 0x180,
    CONNECT_CONTROLLER_BUSY = 0x181,
    CONNECT_INVALID_PARAMETERS = 0x182,
    CONNECT_RESTART_DISCOVERY = 0x183,
    CONNECT_INVALID_HOST = 0x184,
    DISCOVER_RESTART = 0x190,
    AUTHENTICATION_REQUIRED = 0x191,

    MEDIA_WRITE_FAULT = 0x280,
    MEDIA_UNRECOVERED_READ_ERROR = 0x281,
}

impl Status {
    pub fn new(sct: StatusCodeType, sc: u8) -> Self {
        Self(((sct.0 as u16) << 8) | sc as u16)
    }

    pub fn status_code(&self) -> u8 {
        self.0 as u8
    }

    pub fn status_code_type(&self) -> StatusCodeType {
        StatusCodeType((self.0 >> 8) as u8)
    }
}

// Identify
#[bitfield(u32)]
pub struct Cdw10Identify {
    pub cns: u8,
    pub reserved: u8,
    pub cntid: u16,
}

#[open_enum]
#[derive(Copy, Clone, Debug)]
#[repr(u8)]
pub enum Cns {
    NAMESPACE = 0x0,
    CONTROLLER = 0x1,
    ACTIVE_NAMESPACES = 0x2,
    DESCRIPTOR_NAMESPACE = 0x3,
}

/// Size of every Identify data structure.
pub const IDENTIFY_DATA_SIZE: usize = 4096;

#[repr(C)]
#[derive(Debug, IntoBytes, Immutable, KnownLayout, FromBytes, Clone)]
pub struct IdentifyController {
    pub vid: u16,
    pub ssvid: u16,
    pub sn: [u8; 20],
    pub mn: [u8; 40],
    pub fr: [u8; 8],
    pub rab: u8,
    pub ieee: [u8; 3],
    pub cmic: u8,
    /// Maximum data transfer size (in minimum page size units, as power of
    /// two).
    pub mdts: u8,
    pub cntlid: u16,
    pub ver: u32,
    pub rtd3r: u32,
    pub rtd3e: u32,
    pub oaes: u32,
    pub ctratt: u32,
    pub rrls: u16,
    pub rsvd1: [u8; 9],
    pub cntrltype: ControllerType,
    pub fguid: [u8; 16],
    pub crdt1: u16,
    pub crdt2: u16,
    pub crdt3: u16,
    pub rsvd2: [u8; 106],
    pub rsvd3: [u8; 13],
    pub nvmsr: u8,
    pub vwci: u8,
    pub mec: u8,
    pub oacs: u16,
    pub acl: u8,
    pub aerl: u8,
    pub frmw: u8,
    pub lpa: u8,
    pub elpe: u8,
    pub npss: u8,
    pub avscc: u8,
    pub apsta: u8,
    pub wctemp: u16,
    pub cctemp: u16,
    pub mtfa: u16,
    pub hmpre: u32,
    pub hmmin: u32,
    pub tnvmcap: U128LE,
    pub unvmcap: U128LE,
    pub rpmbs: u32,
    pub edstt: u16,
    pub dsto: u8,
    pub fwug: u8,
    /// Keep alive granularity, in 100ms units.
    pub kas: u16,
    pub hctma: u16,
    pub mntmt: u16,
    pub mxtmt: u16,
    pub sanicap: u32,
    pub hmminds: u32,
    pub hmmaxd: u16,
    pub nsetidmax: u16,
    pub endgidmax: u16,
    pub anatt: u8,
    pub anacap: u8,
    pub anagrpmax: u32,
    pub nanagrpid: u32,
    pub pels: u32,
    pub domain_id: u16,
    pub rsvd4: [u8; 10],
    pub megcap: U128LE,
    pub rsvd5: [u8; 128],
    pub sqes: QueueEntrySize,
    pub cqes: QueueEntrySize,
    pub maxcmd: u16,
    pub nn: u32,
    pub oncs: u16,
    pub fuses: u16,
    pub fna: u8,
    pub vwc: u8,
    pub awun: u16,
    pub awupf: u16,
    pub icsvscc: u8,
    pub nwpc: u8,
    pub acwu: u16,
    pub copy_descriptor_fmt: u16,
    pub sgls: Sgls,
    pub mnan: u32,
    pub maxdna: U128LE,
    pub maxcna: u32,
    pub rsvd6: [u8; 204],
    pub subnqn: [u8; 256],
    pub rsvd7: [u8; 768],
    /// I/O queue command capsule supported size, in 16 byte units.
    pub ioccsz: u32,
    /// I/O queue response capsule supported size, in 16 byte units.
    pub iorcsz: u32,
    /// In-capsule data offset, in 16 byte units.
    pub icdoff: u16,
    pub fcatt: u8,
    /// Maximum SGL data block descriptors.
    pub msdbd: u8,
    pub ofcs: u16,
    pub rsvd8: [u8; 242],
    pub power: [u8; 1024],
    pub vendor: [u8; 1024],
}

const _: () = assert!(size_of::<IdentifyController>() == IDENTIFY_DATA_SIZE);

#[bitfield(u8)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct QueueEntrySize {
    #[bits(4)]
    pub min: u8,
    #[bits(4)]
    pub max: u8,
}

/// SGL support.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Sgls {
    /// 1 = supported without alignment requirement, 2 = dword aligned.
    #[bits(2)]
    pub supported: u8,
    pub keyed_data_block: bool,
    #[bits(13)]
    _rsvd: u16,
    pub bit_bucket: bool,
    pub byte_aligned_metadata: bool,
    pub metadata_larger_than_data: bool,
    pub mptr_single_descriptor: bool,
    pub address_as_offset: bool,
    pub transport_data_block: bool,
    #[bits(10)]
    _rsvd2: u16,
}

#[open_enum]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
#[repr(u8)]
pub enum ControllerType {
    RESERVED = 0,
    IO_CONTROLLER = 1,
    DISCOVERY_CONTROLLER = 2,
    ADMINISTRATIVE_CONTROLLER = 3,
}

#[bitfield(u32)]
pub struct Cdw10SetFeatures {
    pub fid: u8,
    #[bits(23)]
    _rsvd: u32,
    pub save: bool,
}

#[open_enum]
#[derive(Copy, Clone, Debug)]
#[repr(u8)]
pub enum Feature {
    ARBITRATION = 0x01,
    POWER_MANAGEMENT = 0x02,
    TEMPERATURE_THRESHOLD = 0x04,
    VOLATILE_WRITE_CACHE = 0x06,
    NUMBER_OF_QUEUES = 0x07,
    ASYNC_EVENT_CONFIG = 0x0b,
    TIMESTAMP = 0x0e,
    KEEP_ALIVE = 0x0f,
    NVM_HOST_IDENTIFIER = 0x81,
}

#[bitfield(u32)]
pub struct Cdw11FeatureNumberOfQueues {
    pub nsq_z: u16,
    pub ncq_z: u16,
}

#[bitfield(u32)]
pub struct Cdw10GetLogPage {
    /// Log page identifier
    pub lid: u8,
    #[bits(7)]
    pub lsp: u8,
    /// Retain asynchronous event
    pub rae: bool,
    pub numdl_z: u16,
}

#[bitfield(u32)]
pub struct Cdw11GetLogPage {
    pub numdu: u16,
    pub lsi: u16,
}

#[open_enum]
#[derive(Copy, Clone, Debug)]
#[repr(u8)]
pub enum LogPageIdentifier {
    SUPPORTED_LOG_PAGES = 0,
    ERROR_INFORMATION = 1,
    HEALTH_INFORMATION = 2,
    FIRMWARE_SLOT_INFORMATION = 3,
    CHANGED_NAMESPACE_LIST = 4,
    DISCOVERY = 0x70,
}

/// Builds an admin command with the given opcode and everything else zeroed.
pub fn admin_cmd(opcode: AdminOpcode) -> Command {
    Command {
        cdw0: Cdw0::new().with_opcode(opcode.0),
        ..zerocopy::FromZeros::new_zeroed()
    }
}
