// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The interface between the fabrics core and a transport binding.

use crate::association::AssociationParams;
use crate::association::Role;
use crate::capsule::Capsule;
use crate::spec;
use crate::spec::fabrics::DiscoveryLogEntry;
use crate::spec::fabrics::TransportType;
use crate::tcp;
use crate::Association;
use crate::Error;
use std::io::Read;
use std::io::Write;
use std::net::SocketAddr;
use std::net::TcpStream;
use std::sync::Arc;

/// A connected, blocking byte stream.
pub trait ByteStream: Read + Write + Send {
    /// The local address, for populating discovery log entries.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Shuts down both directions of the stream.
    fn shutdown(&mut self) {}
}

impl ByteStream for TcpStream {
    fn local_addr(&self) -> Option<SocketAddr> {
        TcpStream::local_addr(self).ok()
    }

    fn shutdown(&mut self) {
        let _ = TcpStream::shutdown(self, std::net::Shutdown::Both);
    }
}

impl ByteStream for Box<dyn ByteStream> {
    fn local_addr(&self) -> Option<SocketAddr> {
        (**self).local_addr()
    }

    fn shutdown(&mut self) {
        (**self).shutdown()
    }
}

/// The outcome of sending controller to host data.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ControllerData {
    /// The data was sent. The command still needs a response capsule.
    Sent,
    /// The data was sent with the SUCCESS flag, which completes the command.
    /// No response capsule may be sent.
    SuccessSent,
}

/// Transport specific settings of an established queue, exported for
/// handing the queue off to another owner.
#[derive(Debug, Clone)]
pub enum TransportHandoff {
    Tcp(tcp::TcpHandoff),
}

/// One transport connection backing a queue pair.
pub trait TransportQueue: Send {
    fn transport_type(&self) -> TransportType;

    /// Records the queue id once it is known. Controllers learn it from the
    /// CONNECT command.
    fn set_qid(&mut self, qid: u16);

    fn transmit_capsule(&mut self, capsule: &Capsule<'_>) -> Result<(), Error>;

    /// Blocks until a complete capsule arrives, handling data transfer PDUs
    /// along the way.
    fn receive_capsule(&mut self) -> Result<Capsule<'static>, Error>;

    /// Transport specific checks of a received command's data descriptor.
    fn validate_command_capsule(&self, capsule: &Capsule<'_>) -> Result<(), spec::Status>;

    /// Total data length described by a received command.
    fn capsule_data_len(&self, capsule: &Capsule<'_>) -> usize;

    /// Fetches `buf.len()` bytes of a received command's data, starting at
    /// `offset`.
    fn receive_controller_data(
        &mut self,
        capsule: &Capsule<'_>,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<(), Error>;

    /// Sends `buf` as a received command's data, starting at `offset`. When
    /// `complete_on_success` is set and `buf` ends the transfer, the
    /// transport may complete the command itself.
    fn send_controller_data(
        &mut self,
        capsule: &Capsule<'_>,
        offset: u32,
        buf: &[u8],
        complete_on_success: bool,
    ) -> Result<ControllerData, Error>;

    /// Fills in the transport address fields of a discovery log entry.
    fn populate_discovery_entry(&self, entry: &mut DiscoveryLogEntry);

    /// Shuts down the connection. Later sends and receives fail.
    fn shutdown(&mut self);

    fn handoff(self: Box<Self>) -> (TransportHandoff, Box<dyn ByteStream>);
}

pub(crate) fn validate_association(
    transport: TransportType,
    role: Role,
    params: &AssociationParams,
) -> Result<(), Error> {
    match transport {
        TransportType::TCP => tcp::validate_params(role, params),
        _ => Err(Error::InvalidArgument("unsupported transport")),
    }
}

/// Establishes the transport connection for a new host queue pair.
pub(crate) fn connect_queue(
    association: &Arc<Association>,
    stream: Box<dyn ByteStream>,
    qid: u16,
) -> Result<Box<dyn TransportQueue>, Error> {
    match association.transport_type() {
        TransportType::TCP => Ok(Box::new(tcp::TcpQueue::connect(
            association,
            stream,
            qid,
        )?)),
        _ => Err(Error::InvalidArgument("unsupported transport")),
    }
}

/// Accepts the transport connection for a new controller queue pair.
pub(crate) fn accept_queue(
    association: &Arc<Association>,
    stream: Box<dyn ByteStream>,
) -> Result<Box<dyn TransportQueue>, Error> {
    match association.transport_type() {
        TransportType::TCP => Ok(Box::new(tcp::TcpQueue::accept(association, stream)?)),
        _ => Err(Error::InvalidArgument("unsupported transport")),
    }
}
