// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! NVMe over Fabrics session and transport library.
//!
//! This implements both sides of an NVMe-oF association over the TCP
//! transport binding: the Initialize Connection exchange, the Fabrics CONNECT
//! handshake, capsule framing, submission queue flow control, and in-capsule
//! or R2T/H2C/C2H data transfer.
//!
//! All operations are blocking. A queue pair is driven by a single thread at
//! a time; callers that want concurrency run each queue pair on its own
//! thread.

#![forbid(unsafe_code)]

pub mod association;
pub mod capsule;
pub mod controller;
pub mod digest;
mod error;
pub mod host;
mod nqn;
pub mod queue_pair;
pub mod tcp;
pub mod transport;

#[cfg(test)]
mod tests;

pub use association::Association;
pub use association::AssociationParams;
pub use association::Role;
pub use association::TcpParams;
pub use capsule::Capsule;
pub use controller::accept;
pub use controller::ControllerConfig;
pub use controller::ControllerQueuePair;
pub use controller::ControllerRegisters;
pub use controller::PendingConnect;
pub use error::CommandResult;
pub use error::Error;
pub use error::NvmeError;
pub use host::ConnectParams;
pub use host::DiscoveryLog;
pub use host::HostQueuePair;
pub use host::HostState;
pub use nqn::host_nqn_from_uuid;
pub use nqn::nqn_valid;
pub use queue_pair::Handoff;
pub use queue_pair::QueueStats;
pub use transport::ByteStream;

use nvme_spec as spec;
