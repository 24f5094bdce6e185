// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Queue pair establishment between a host and a controller.

use super::test_helpers::connect_params;
use super::test_helpers::controller_association;
use super::test_helpers::host_association;
use super::test_helpers::init_tracing;
use super::test_helpers::socket_pair;
use super::test_helpers::spawn_controller;
use super::test_helpers::TestController;
use super::test_helpers::HOSTID;
use super::test_helpers::SUBNQN;
use crate::nqn::nqn_to_field;
use crate::spec;
use crate::spec::fabrics::ConnectCommand;
use crate::spec::fabrics::ConnectData;
use crate::spec::fabrics::FabricsCommandType;
use crate::spec::fabrics::InvalidParameterDw0;
use crate::spec::fabrics::PropertyGetCommand;
use crate::spec::fabrics::CNTLID_DYNAMIC;
use crate::spec::fabrics::DISCOVERY_NQN;
use crate::tcp::TcpQueue;
use crate::transport::TransportQueue;
use crate::AssociationParams;
use crate::Capsule;
use crate::Error;
use crate::HostQueuePair;
use crate::HostState;
use crate::TcpParams;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

fn discovery_params(header_digests: bool) -> AssociationParams {
    AssociationParams {
        max_admin_qsize: 32,
        max_io_qsize: 0,
        tcp: TcpParams {
            header_digests,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn connect_command(qid: u16, sqsize: u16) -> ConnectCommand {
    let mut cmd = ConnectCommand::new_zeroed();
    cmd.cdw0.set_opcode(spec::AdminOpcode::FABRICS_COMMANDS.0);
    cmd.fctype = FabricsCommandType::CONNECT;
    cmd.qid = qid;
    cmd.sqsize = sqsize;
    cmd
}

fn connect_data(cntlid: u16, subnqn: &str) -> ConnectData {
    ConnectData {
        hostid: HOSTID,
        cntlid,
        rsvd1: [0; 238],
        subnqn: nqn_to_field(subnqn),
        hostnqn: nqn_to_field(&crate::host_nqn_from_uuid(&HOSTID)),
        rsvd2: [0; 256],
    }
}

/// Sends `sqe` with `data` as the first command on a new queue, bypassing
/// the host's CONNECT checks, and returns the controller's response and the
/// result of its accept.
fn raw_first_command(
    controller: AssociationParams,
    sqe: spec::Command,
    data: &[u8],
) -> (spec::Completion, Result<(), Error>) {
    let (host_stream, controller_stream) = socket_pair();
    let na = controller_association(controller);
    let thread = std::thread::spawn(move || crate::accept(&na, controller_stream).map(drop));

    let host = host_association(AssociationParams::default());
    let mut queue = TcpQueue::connect(&host, Box::new(host_stream), 0).unwrap();
    let mut cc = Capsule::command(sqe);
    if !data.is_empty() {
        cc.append_data(data).unwrap();
    }
    queue.transmit_capsule(&cc).unwrap();
    let rc = queue.receive_capsule().unwrap();
    let cqe = *rc.cqe().unwrap();
    (cqe, thread.join().unwrap())
}

#[test]
fn discovery_admin_queue() {
    init_tracing();
    let (host_stream, controller_stream) = socket_pair();
    let controller = controller_association(discovery_params(true));
    let test_controller = TestController::new(&controller);
    let thread = spawn_controller(controller, controller_stream, move |qp| {
        assert_eq!(qp.qid(), 0);
        assert_eq!(qp.qsize(), 32);
        assert!(qp.flow_control());
        test_controller.run(qp)
    });

    let host = host_association(AssociationParams {
        tcp: TcpParams {
            header_digests: true,
            ..Default::default()
        },
        ..Default::default()
    });
    let mut params = connect_params(0, 32, CNTLID_DYNAMIC);
    params.subnqn = DISCOVERY_NQN.into();
    let mut qp = HostQueuePair::connect(&host, host_stream, &params).unwrap();
    assert_eq!(qp.cntlid(), 1);
    assert!(qp.flow_control());
    assert_eq!(qp.sqhd(), 0);

    // MQES reflects the admin queue limit on a discovery controller.
    let cap = spec::Cap::from(qp.read_property(0, 8).unwrap());
    assert_eq!(cap.mqes_z(), 31);
    assert_eq!(qp.read_property(8, 4).unwrap(), 0x00020000);

    let cc = spec::Cc::new().with_en(true);
    qp.write_property(0x14, 4, u32::from(cc) as u64).unwrap();
    let csts = spec::Csts::from(qp.read_property(0x1c, 4).unwrap() as u32);
    assert!(csts.rdy());

    let err = qp.read_property(0x20, 4).unwrap_err();
    assert!(matches!(
        err,
        Error::Nvme(ref nvme) if nvme.status() == spec::Status::INVALID_FIELD_IN_COMMAND
    ));

    let identify = qp.identify_controller().unwrap();
    assert_eq!(
        identify.cntrltype,
        spec::ControllerType::DISCOVERY_CONTROLLER
    );
    qp.keep_alive().unwrap();
    assert_eq!(qp.stats().submitted, 8);
    assert_eq!(qp.outstanding(), 0);

    qp.close();
    assert_eq!(qp.state(), HostState::Closed);
    drop(qp);
    thread.join().unwrap();
}

#[test]
fn connect_without_flow_control() {
    init_tracing();
    let (host_stream, controller_stream) = socket_pair();
    let controller = controller_association(AssociationParams {
        sq_flow_control: false,
        ..discovery_params(false)
    });
    let test_controller = TestController::new(&controller);
    let thread = spawn_controller(controller, controller_stream, move |qp| {
        assert!(!qp.flow_control());
        test_controller.run(qp)
    });

    let host = host_association(AssociationParams {
        sq_flow_control: false,
        ..Default::default()
    });
    let mut qp =
        HostQueuePair::connect(&host, host_stream, &connect_params(0, 8, CNTLID_DYNAMIC)).unwrap();
    assert!(!qp.flow_control());
    for _ in 0..20 {
        qp.keep_alive().unwrap();
    }
    assert_eq!(qp.outstanding(), 0);
    drop(qp);
    thread.join().unwrap();
}

#[test]
fn flow_control_unless_host_disables() {
    init_tracing();
    let (host_stream, controller_stream) = socket_pair();
    // The controller can run without SQ flow control, but only does so when
    // the host asks.
    let controller = controller_association(AssociationParams {
        sq_flow_control: false,
        ..discovery_params(false)
    });
    let thread = std::thread::spawn(move || {
        let pending = crate::accept(&controller, controller_stream).unwrap();
        pending.finish_accept(1).map(drop)
    });

    let host = host_association(AssociationParams::default());
    let qp =
        HostQueuePair::connect(&host, host_stream, &connect_params(0, 8, CNTLID_DYNAMIC)).unwrap();
    assert!(qp.flow_control());
    drop(qp);
    thread.join().unwrap().unwrap();
}

#[test]
fn oversized_admin_queue_rejected() {
    init_tracing();
    let (host_stream, controller_stream) = socket_pair();
    let controller = controller_association(discovery_params(false));
    let thread = std::thread::spawn(move || {
        crate::accept(&controller, controller_stream)
            .map(drop)
            .unwrap_err()
    });

    let host = host_association(AssociationParams::default());
    let err = HostQueuePair::connect(&host, host_stream, &connect_params(0, 64, CNTLID_DYNAMIC))
        .unwrap_err();
    assert!(matches!(err, Error::Handshake(_)));
    assert_eq!(
        host.last_error().as_deref(),
        Some("CONNECT invalid parameter IATTR: 0x0 IPO: 0x2c")
    );

    let err = thread.join().unwrap();
    assert!(matches!(
        err,
        Error::Rejected(ref nvme) if nvme.status() == spec::Status::CONNECT_INVALID_PARAMETERS
    ));
}

#[test]
fn io_queue_on_discovery_controller_rejected() {
    init_tracing();
    let cmd = connect_command(1, 31);
    let data = connect_data(1, SUBNQN);
    let (cqe, result) = raw_first_command(
        discovery_params(false),
        zerocopy::transmute!(cmd),
        data.as_bytes(),
    );
    assert_eq!(
        spec::Status(cqe.status.status()),
        spec::Status::CONNECT_INVALID_PARAMETERS
    );
    let dw0 = InvalidParameterDw0::from(cqe.dw0);
    assert!(!dw0.data());
    assert_eq!(dw0.ipo(), 42);
    assert!(matches!(result, Err(Error::Rejected(_))));
}

#[test]
fn first_command_must_be_connect() {
    init_tracing();
    let mut cmd = PropertyGetCommand::new_zeroed();
    cmd.cdw0.set_opcode(spec::AdminOpcode::FABRICS_COMMANDS.0);
    cmd.fctype = FabricsCommandType::PROPERTY_GET;
    let (cqe, result) = raw_first_command(discovery_params(false), zerocopy::transmute!(cmd), &[]);
    assert_eq!(
        spec::Status(cqe.status.status()),
        spec::Status::INVALID_COMMAND_OPCODE
    );
    assert!(matches!(result, Err(Error::Rejected(_))));
}

#[test]
fn connect_record_format_checked() {
    init_tracing();
    let mut cmd = connect_command(0, 31);
    cmd.recfmt = 1;
    let data = connect_data(CNTLID_DYNAMIC, SUBNQN);
    let (cqe, _) = raw_first_command(
        discovery_params(false),
        zerocopy::transmute!(cmd),
        data.as_bytes(),
    );
    assert_eq!(
        spec::Status(cqe.status.status()),
        spec::Status::CONNECT_INCOMPATIBLE_FORMAT
    );
}

#[test]
fn connect_data_fields_checked() {
    init_tracing();
    // A static controller id on a dynamic controller.
    let data = connect_data(1, SUBNQN);
    let (cqe, _) = raw_first_command(
        discovery_params(false),
        zerocopy::transmute!(connect_command(0, 31)),
        data.as_bytes(),
    );
    let dw0 = InvalidParameterDw0::from(cqe.dw0);
    assert!(dw0.data());
    assert_eq!(dw0.ipo(), 16);

    let data = connect_data(CNTLID_DYNAMIC, "not-an-nqn");
    let (cqe, _) = raw_first_command(
        discovery_params(false),
        zerocopy::transmute!(connect_command(0, 31)),
        data.as_bytes(),
    );
    let dw0 = InvalidParameterDw0::from(cqe.dw0);
    assert!(dw0.data());
    assert_eq!(dw0.ipo(), 256);

    // The CONNECT data must be exactly 1024 bytes.
    let (cqe, _) = raw_first_command(
        discovery_params(false),
        zerocopy::transmute!(connect_command(0, 31)),
        &data.as_bytes()[..512],
    );
    let dw0 = InvalidParameterDw0::from(cqe.dw0);
    assert!(!dw0.data());
    assert_eq!(dw0.ipo(), 24);
}

#[test]
fn controller_rejects_unknown_subsystem() {
    init_tracing();
    let (host_stream, controller_stream) = socket_pair();
    let controller = controller_association(discovery_params(false));
    let thread = std::thread::spawn(move || {
        let pending = crate::accept(&controller, controller_stream).unwrap();
        assert_eq!(pending.qid(), 0);
        assert_eq!(pending.hostid(), &HOSTID);
        assert_eq!(pending.cntlid(), CNTLID_DYNAMIC);
        assert_eq!(pending.subnqn(), "nqn.2024-01.com.example:other");
        pending.reject_invalid_parameter(true, 256).unwrap();
    });

    let host = host_association(AssociationParams::default());
    let mut params = connect_params(0, 8, CNTLID_DYNAMIC);
    params.subnqn = "nqn.2024-01.com.example:other".into();
    let err = HostQueuePair::connect(&host, host_stream, &params).unwrap_err();
    assert!(matches!(err, Error::Handshake(_)));
    assert_eq!(
        host.last_error().as_deref(),
        Some("CONNECT invalid parameter IATTR: 0x1 IPO: 0x100")
    );
    thread.join().unwrap();
}

#[test]
fn host_validates_connect_params() {
    let host = host_association(AssociationParams::default());
    let (host_stream, _controller_stream) = socket_pair();
    let mut params = connect_params(1, 32, CNTLID_DYNAMIC);
    // I/O queues need a static controller id.
    let err = HostQueuePair::connect(&host, host_stream, &params).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    let (host_stream, _controller_stream) = socket_pair();
    params.cntlid = 1;
    params.kato = 1000;
    let err = HostQueuePair::connect(&host, host_stream, &params).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    let controller = controller_association(discovery_params(false));
    let (host_stream, _controller_stream) = socket_pair();
    let err = HostQueuePair::connect(&controller, host_stream, &connect_params(0, 8, 0xffff))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}
