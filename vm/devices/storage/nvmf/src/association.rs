// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Associations: the state shared by every queue pair connected to one
//! fabrics endpoint.

use crate::spec;
use crate::spec::fabrics::TransportType;
use crate::transport;
use crate::Error;
use parking_lot::Mutex;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Which end of the association this is.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Host,
    Controller,
}

/// Parameters negotiated per association.
#[derive(Debug, Clone)]
pub struct AssociationParams {
    /// Require SQ flow control. A host asks the controller to keep it
    /// enabled; a controller refuses to disable it.
    pub sq_flow_control: bool,
    /// Controller ids are allocated by the controller on the admin queue.
    pub dynamic_controller_model: bool,
    /// Largest admin queue a controller accepts.
    pub max_admin_qsize: u16,
    /// Largest I/O queue a controller accepts. Zero for a discovery
    /// controller, which has no I/O queues.
    pub max_io_qsize: u32,
    /// I/O queue command capsule size, in 16 byte units. Hosts replace this
    /// with the value from the Identify Controller data.
    pub ioccsz: u32,
    pub tcp: TcpParams,
}

impl Default for AssociationParams {
    fn default() -> Self {
        Self {
            sq_flow_control: true,
            dynamic_controller_model: true,
            max_admin_qsize: spec::fabrics::MAX_ADMIN_QUEUE_SIZE,
            max_io_qsize: spec::fabrics::MAX_IO_QUEUE_SIZE,
            ioccsz: DEFAULT_IOCCSZ,
            tcp: TcpParams::default(),
        }
    }
}

/// Room for a command plus 8KiB of in-capsule data.
pub const DEFAULT_IOCCSZ: u32 = (size_of::<spec::Command>() as u32 + 8192) / 16;

/// TCP transport parameters.
#[derive(Debug, Clone)]
pub struct TcpParams {
    /// Requested PDU data alignment, in dwords, zero based.
    pub pda: u8,
    pub header_digests: bool,
    pub data_digests: bool,
    /// Maximum outstanding R2Ts per command, zero based. Host only.
    pub maxr2t: u32,
    /// Largest H2C data PDU accepted. Controller only.
    pub maxh2cdata: u32,
    /// Largest C2H data PDU a controller sends, and a host accepts.
    pub max_c2hdata: u32,
}

impl Default for TcpParams {
    fn default() -> Self {
        Self {
            pda: 0,
            header_digests: false,
            data_digests: false,
            maxr2t: 0,
            maxh2cdata: 256 * 1024,
            max_c2hdata: 256 * 1024,
        }
    }
}

/// An association with a single remote endpoint.
///
/// Every queue pair holds an `Arc` to its association, so the association
/// outlives all of its queue pairs.
#[derive(Debug)]
pub struct Association {
    role: Role,
    transport: TransportType,
    params: AssociationParams,
    ioccsz: AtomicU32,
    last_error: Mutex<Option<String>>,
}

impl Association {
    pub fn new(
        role: Role,
        transport: TransportType,
        params: AssociationParams,
    ) -> Result<Arc<Self>, Error> {
        transport::validate_association(transport, role, &params)?;
        if role == Role::Controller {
            if params.max_admin_qsize < spec::fabrics::MIN_ADMIN_QUEUE_SIZE
                || params.max_admin_qsize > spec::fabrics::MAX_ADMIN_QUEUE_SIZE
            {
                return Err(Error::InvalidArgument("invalid maximum admin queue size"));
            }
            if params.max_io_qsize != 0
                && (params.max_io_qsize < spec::fabrics::MIN_IO_QUEUE_SIZE
                    || params.max_io_qsize > spec::fabrics::MAX_IO_QUEUE_SIZE)
            {
                return Err(Error::InvalidArgument("invalid maximum I/O queue size"));
            }
        }
        Ok(Arc::new(Self {
            role,
            transport,
            ioccsz: AtomicU32::new(params.ioccsz),
            params,
            last_error: Mutex::new(None),
        }))
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_controller(&self) -> bool {
        self.role == Role::Controller
    }

    pub fn transport_type(&self) -> TransportType {
        self.transport
    }

    pub fn params(&self) -> &AssociationParams {
        &self.params
    }

    /// A discovery controller association has no I/O queues.
    pub fn is_discovery(&self) -> bool {
        self.params.max_io_qsize == 0
    }

    pub fn ioccsz(&self) -> u32 {
        self.ioccsz.load(Ordering::Relaxed)
    }

    pub(crate) fn set_ioccsz(&self, ioccsz: u32) {
        self.ioccsz.store(ioccsz, Ordering::Relaxed);
    }

    /// Returns the first connection setup failure recorded since the last
    /// call to [`Self::clear_error`].
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn clear_error(&self) {
        *self.last_error.lock() = None;
    }

    pub(crate) fn set_error(&self, message: impl Into<String>) {
        let mut last_error = self.last_error.lock();
        if last_error.is_none() {
            *last_error = Some(message.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_error_wins() {
        let na = Association::new(Role::Host, TransportType::TCP, Default::default()).unwrap();
        assert!(na.last_error().is_none());
        na.set_error("first");
        na.set_error("second");
        assert_eq!(na.last_error().as_deref(), Some("first"));
        na.clear_error();
        na.set_error("third");
        assert_eq!(na.last_error().as_deref(), Some("third"));
    }

    #[test]
    fn unsupported_transport() {
        let r = Association::new(Role::Host, TransportType::RDMA, Default::default());
        assert!(matches!(r, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn controller_limits() {
        let params = AssociationParams {
            max_admin_qsize: 1,
            ..Default::default()
        };
        assert!(Association::new(Role::Controller, TransportType::TCP, params).is_err());

        let params = AssociationParams {
            tcp: TcpParams {
                maxh2cdata: 4098,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(Association::new(Role::Controller, TransportType::TCP, params).is_err());

        let params = AssociationParams {
            max_io_qsize: 0,
            ..Default::default()
        };
        let na = Association::new(Role::Controller, TransportType::TCP, params).unwrap();
        assert!(na.is_discovery());
    }
}
