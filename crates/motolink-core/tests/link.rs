use motolink_core::events::{Event, EventReceiver, EventSender};
use motolink_core::protocol::{
    Command, Connector, ErrorKind, LinkConfig, LinkError, LinkManager, LinkState, Operation,
    TcpConnector, Transport,
};
use motolink_core::sim::{SimConnector, SimulatedEcu};
use motolink_core::telemetry::{ParameterCatalog, TelemetryConfig, TelemetryReader};
use std::collections::BTreeSet;
use std::io::{self, Read, Write};
use std::net::TcpListener;
use std::thread;
use std::time::Duration;

fn manager(ecu: &SimulatedEcu) -> (LinkManager, EventReceiver) {
    let (events, rx) = EventSender::channel(64);
    (
        LinkManager::new(SimConnector::new("sim0", ecu.clone()), events),
        rx,
    )
}

fn drain(rx: &mut EventReceiver) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn reader(link: &LinkManager) -> TelemetryReader {
    TelemetryReader::new(
        link.clone(),
        ParameterCatalog::motorcycle_defaults(),
        TelemetryConfig::default(),
    )
}

#[test]
fn test_connect_disconnect_cycle() {
    let ecu = SimulatedEcu::new();
    let (link, mut rx) = manager(&ecu);

    let status = link.connect("sim0", LinkConfig::default()).expect("connect");
    assert_eq!(status.state, LinkState::Connected);
    assert_eq!(status.port_identifier.as_deref(), Some("sim0"));
    assert!(ecu.is_open());

    link.disconnect();
    assert_eq!(link.state(), LinkState::Disconnected);
    assert!(!ecu.is_open());

    let events = drain(&mut rx);
    assert!(matches!(events[0], Event::Connected { .. }));
    assert!(matches!(events[1], Event::Disconnected { reason: None, .. }));
}

#[test]
fn test_double_disconnect_is_a_no_op() {
    let ecu = SimulatedEcu::new();
    let (link, mut rx) = manager(&ecu);
    link.connect("sim0", LinkConfig::default()).expect("connect");

    link.disconnect();
    link.disconnect();

    let disconnects = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, Event::Disconnected { .. }))
        .count();
    assert_eq!(disconnects, 1);
    assert_eq!(link.state(), LinkState::Disconnected);
}

#[test]
fn test_disconnect_when_never_connected() {
    let (link, mut rx) = manager(&SimulatedEcu::new());
    link.disconnect();
    assert_eq!(link.state(), LinkState::Disconnected);
    assert!(drain(&mut rx).is_empty());
}

#[test]
fn test_unknown_port_is_unavailable() {
    let (link, mut rx) = manager(&SimulatedEcu::new());

    let err = link
        .connect("/dev/ttyUSB9", LinkConfig::default())
        .expect_err("no such port");
    assert!(matches!(err, LinkError::PortUnavailable { .. }));
    assert_eq!(err.kind(), ErrorKind::Transport);

    let status = link.status();
    assert_eq!(status.state, LinkState::Disconnected);
    assert!(status.last_error.is_some());
    assert!(matches!(
        drain(&mut rx).as_slice(),
        [Event::Error(report)] if report.kind == ErrorKind::Transport
    ));
}

#[test]
fn test_reconnect_replaces_connection() {
    let ecu = SimulatedEcu::new().with_parameter(0x10, 1000);
    let (link, mut rx) = manager(&ecu);
    link.connect("sim0", LinkConfig::default()).expect("connect");
    link.connect("sim0", LinkConfig::default()).expect("reconnect");

    let kinds: Vec<_> = drain(&mut rx)
        .into_iter()
        .map(|e| match e {
            Event::Connected { .. } => "connected",
            Event::Disconnected { .. } => "disconnected",
            _ => "other",
        })
        .collect();
    assert_eq!(kinds, vec!["connected", "disconnected", "connected"]);

    let samples: Vec<_> = reader(&link)
        .read_parameters(&BTreeSet::from([0x10]))
        .expect("begin")
        .collect();
    assert!(samples[0].is_ok());
}

#[test]
fn test_connect_while_busy_is_rejected() {
    let ecu = SimulatedEcu::new();
    let (link, _rx) = manager(&ecu);
    link.connect("sim0", LinkConfig::default()).expect("connect");
    let _guard = link.begin(Operation::Flash).expect("begin");

    assert!(matches!(
        link.connect("sim0", LinkConfig::default()),
        Err(LinkError::OperationInProgress(_))
    ));
    assert_eq!(link.state(), LinkState::Busy(Operation::Flash));
}

#[test]
fn test_batch_started_before_reconnect_stops() {
    let ecu = SimulatedEcu::new()
        .with_parameter(0x10, 1000)
        .with_parameter(0x11, 200);
    let (link, _rx) = manager(&ecu);
    link.connect("sim0", LinkConfig::default()).expect("connect");
    let reader = reader(&link);

    let mut reads = reader
        .read_parameters(&BTreeSet::from([0x10, 0x11]))
        .expect("begin");
    assert!(reads.next().expect("first read").is_ok());

    link.disconnect();
    link.connect("sim0", LinkConfig::default()).expect("reconnect");

    assert!(matches!(reads.next(), Some(Err(LinkError::NotConnected))));
    assert!(reads.next().is_none());
    assert_eq!(ecu.received().len(), 1);
}

#[test]
fn test_requests_need_a_connection() {
    let (link, _rx) = manager(&SimulatedEcu::new());
    assert!(matches!(
        link.begin(Operation::ReadParameters),
        Err(LinkError::NotConnected)
    ));
}

#[test]
fn test_invalid_config_rejected_before_opening() {
    let ecu = SimulatedEcu::new();
    let (link, _rx) = manager(&ecu);
    let config = LinkConfig {
        max_payload: 0,
        ..LinkConfig::default()
    };
    assert!(matches!(
        link.connect("sim0", config),
        Err(LinkError::Config(_))
    ));
    assert!(!ecu.is_open());
}

#[test]
fn test_unplugged_cable_tears_down_link() {
    let ecu = SimulatedEcu::new().with_parameter(0x10, 1000);
    let (link, mut rx) = manager(&ecu);
    link.connect("sim0", LinkConfig::default()).expect("connect");
    drain(&mut rx);

    ecu.unplug();
    let results: Vec<_> = reader(&link)
        .read_parameters(&BTreeSet::from([0x10, 0x11]))
        .expect("begin")
        .collect();

    // The batch stops at the first transport failure
    assert_eq!(results.len(), 1);
    assert!(matches!(results[0], Err(LinkError::TransportClosed(_))));
    assert_eq!(link.state(), LinkState::Disconnected);

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(e, Event::Disconnected { reason: Some(_), .. })));
    assert!(events.iter().any(|e| matches!(e, Event::Error(_))));
}

#[test]
fn test_stale_duplicate_replies_are_discarded() {
    let ecu = SimulatedEcu::new()
        .with_parameter(0x10, 1000)
        .with_parameter(0x11, 200)
        .with_duplicate_replies();
    let (link, _rx) = manager(&ecu);
    link.connect("sim0", LinkConfig::default()).expect("connect");

    let samples: Vec<_> = reader(&link)
        .read_parameters(&BTreeSet::from([0x10, 0x11]))
        .expect("begin")
        .map(|r| r.expect("sample"))
        .collect();

    assert_eq!(samples[0].raw_value, 1000);
    assert_eq!(samples[1].raw_value, 200);
    assert!(link.status().counters.stale_frames >= 1);
}

#[test]
fn test_counters_track_traffic() {
    let ecu = SimulatedEcu::new().with_parameter(0x10, 1);
    let (link, _rx) = manager(&ecu);
    link.connect("sim0", LinkConfig::default()).expect("connect");

    let guard = link.begin(Operation::ReadParameters).expect("begin");
    guard
        .transact(Command::ReadParam, &[0x10, 0x00], Duration::from_millis(500))
        .expect("response");

    let counters = link.status().counters;
    assert_eq!(counters.tx_frames, 1);
    assert_eq!(counters.rx_frames, 1);
    assert!(counters.tx_bytes > 0 && counters.rx_bytes > 0);
}

/// Relay a TCP connection to a simulated ECU, like a serial-over-TCP bridge
fn tcp_bridge(ecu: SimulatedEcu) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();

    thread::spawn(move || {
        let Ok((mut stream, _)) = listener.accept() else {
            return;
        };
        let mut device = SimConnector::new("bridge", ecu)
            .open("bridge", 115200, Duration::ZERO)
            .expect("open simulated device");
        stream
            .set_read_timeout(Some(Duration::from_millis(2)))
            .expect("read timeout");

        let mut buf = [0u8; 512];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => return,
                Ok(n) => device.write_all(&buf[..n], Duration::ZERO).expect("to device"),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) => {}
                Err(_) => return,
            }
            let n = device
                .read(&mut buf, Duration::from_millis(1))
                .expect("from device");
            if n > 0 && stream.write_all(&buf[..n]).is_err() {
                return;
            }
        }
    });

    addr
}

#[test]
fn test_tcp_transport_exchange() {
    let ecu = SimulatedEcu::new().with_parameter(0x10, 5600);
    let addr = tcp_bridge(ecu.clone());

    let link = LinkManager::new(TcpConnector, EventSender::disabled());
    link.connect(&addr, LinkConfig::default()).expect("connect");

    let sample = reader(&link)
        .read_parameters(&BTreeSet::from([0x10]))
        .expect("begin")
        .next()
        .expect("one read")
        .expect("sample");
    assert_eq!(sample.raw_value, 5600);
    assert_eq!(ecu.received().len(), 1);

    link.disconnect();
    assert_eq!(link.state(), LinkState::Disconnected);
}
