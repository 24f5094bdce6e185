// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error and result related types.

use crate::spec;
use crate::spec::tcp::FatalErrorStatus;
use crate::spec::tcp::PduType;
use thiserror::Error;

/// An error from a fabrics operation.
#[derive(Debug, Error)]
pub enum Error {
    /// The peer violated the transport protocol. A termination request has
    /// already been sent and the connection is closed.
    #[error("transport protocol error {fes:?} at offset {fei}")]
    Protocol { fes: FatalErrorStatus, fei: u32 },
    #[error("data digest mismatch")]
    DataDigest,
    #[error("unexpected {0:?} pdu")]
    UnexpectedPdu(PduType),
    #[error("submission queue full")]
    QueueFull,
    #[error("no outstanding commands")]
    NoOutstandingCommands,
    #[error("capsule already has data attached")]
    Busy,
    #[error("operation not valid for this capsule type")]
    InvalidCapsuleType,
    #[error("data transfer out of range for command")]
    TooLarge,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("connection reset")]
    ConnectionReset,
    #[error("transport i/o error")]
    Io(#[source] std::io::Error),
    #[error("connection setup failed: {0}")]
    Handshake(String),
    #[error("connect rejected")]
    Rejected(#[source] NvmeError),
    #[error("nvme error")]
    Nvme(#[source] NvmeError),
    #[error("discovery log page changed on each of {0} attempts")]
    DiscoveryLogUnstable(u32),
}

impl Error {
    /// Returns true if the operation failed for lack of a resource and may
    /// succeed if retried after more responses have been reaped.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::QueueFull | Error::NoOutstandingCommands)
    }

    /// Returns true if the error tore down the underlying connection.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            Error::Protocol { .. }
                | Error::DataDigest
                | Error::UnexpectedPdu(_)
                | Error::ConnectionReset
                | Error::Io(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => Error::ConnectionReset,
            _ => Error::Io(err),
        }
    }
}

/// A failed NVMe completion status.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NvmeError(spec::Status);

impl NvmeError {
    pub fn status(&self) -> spec::Status {
        self.0
    }
}

impl From<spec::Status> for NvmeError {
    fn from(value: spec::Status) -> Self {
        Self(value)
    }
}

impl std::error::Error for NvmeError {}

impl std::fmt::Display for NvmeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.status_code_type() {
            spec::StatusCodeType::GENERIC => write!(f, "general error {:#x?}", self.0),
            spec::StatusCodeType::COMMAND_SPECIFIC => {
                write!(f, "command-specific error {:#x?}", self.0)
            }
            spec::StatusCodeType::MEDIA_ERROR => {
                write!(f, "media error {:#x?}", self.0)
            }
            _ => write!(f, "{:#x?}", self.0),
        }
    }
}

/// The outcome of a command handled by the controller, ready to be sent as a
/// response.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub status: spec::Status,
    pub dw: [u32; 2],
}

impl CommandResult {
    pub fn new(status: impl Into<spec::Status>, dw: [u32; 2]) -> Self {
        Self {
            status: status.into(),
            dw,
        }
    }
}

impl From<spec::Status> for CommandResult {
    fn from(status: spec::Status) -> Self {
        Self::new(status, [0; 2])
    }
}
