use motolink_core::events::{Event, EventReceiver, EventSender};
use motolink_core::flash::{FirmwareFlasher, FirmwareImage, FlashConfig, FlashState};
use motolink_core::protocol::{
    crc32, Command, ErrorKind, LinkConfig, LinkError, LinkManager, LinkState, Operation,
};
use motolink_core::sim::{SimConnector, SimulatedEcu};
use pretty_assertions::assert_eq;
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const KEY: &[u8] = b"MOTO";
const BLOCK: usize = 64;

fn config() -> FlashConfig {
    FlashConfig {
        block_size: BLOCK,
        unlock_key: KEY.to_vec(),
        block_timeout_ms: 200,
        ..FlashConfig::default()
    }
}

fn setup(ecu: &SimulatedEcu) -> (FirmwareFlasher, EventReceiver) {
    let (events, rx) = EventSender::channel(4096);
    let link = LinkManager::new(SimConnector::new("sim0", ecu.clone()), events);
    link.connect("sim0", LinkConfig::default()).expect("connect");
    (FirmwareFlasher::new(link, config()), rx)
}

fn image(blocks: usize) -> FirmwareImage {
    FirmwareImage::new((0..blocks * BLOCK).map(|i| (i * 7 % 251) as u8).collect())
}

fn drain(rx: &mut EventReceiver) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn wait_for_busy(link: &LinkManager) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while link.state() != LinkState::Busy(Operation::Flash) {
        assert!(Instant::now() < deadline, "flash never started");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_block_retry_then_success() {
    let ecu = SimulatedEcu::new()
        .with_unlock_key(KEY)
        .with_block_nacks(7, 2);
    let (flasher, mut rx) = setup(&ecu);
    let image = image(20);
    let data = image.data().to_vec();

    let report = flasher
        .flash(image, &CancellationToken::new())
        .expect("flash");

    assert_eq!(report.total_blocks, 20);
    assert_eq!(report.block_retries, 2);
    assert_eq!(report.image_checksum, crc32(&data));
    assert_eq!(ecu.flash_contents(), data);

    let summary = flasher.last_session().expect("summary");
    assert_eq!(summary.blocks_written, 20);
    assert_eq!(summary.state, FlashState::Done);

    // Block 7 was sent three times, every other block once
    let block_writes: Vec<u32> = ecu
        .received()
        .iter()
        .filter(|f| f.command == Command::WriteBlock)
        .map(|f| u32::from_le_bytes([f.body()[0], f.body()[1], f.body()[2], f.body()[3]]))
        .collect();
    assert_eq!(block_writes.len(), 22);
    assert_eq!(block_writes.iter().filter(|&&i| i == 7).count(), 3);
    assert!(block_writes.windows(2).all(|w| w[1] == w[0] || w[1] == w[0] + 1));

    let progress: Vec<u32> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            Event::FlashProgress(p) => Some(p.blocks_written),
            _ => None,
        })
        .collect();
    assert_eq!(progress, (1..=20).collect::<Vec<_>>());
}

#[test]
fn test_verify_mismatch_aborts() {
    let ecu = SimulatedEcu::new()
        .with_unlock_key(KEY)
        .with_verify_checksum(0xDEAD_BEEF);
    let (flasher, mut rx) = setup(&ecu);
    let image = image(4);
    let expected = image.checksum();

    let result = flasher.flash(image, &CancellationToken::new());

    match result {
        Err(LinkError::VerificationFailed { expected: e, actual }) => {
            assert_eq!(e, expected);
            assert_eq!(actual, 0xDEAD_BEEF);
        }
        other => panic!("expected verification failure, got {other:?}"),
    }
    let summary = flasher.last_session().expect("summary");
    assert_eq!(summary.state, FlashState::Aborted);
    assert_eq!(summary.blocks_written, 4);

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        Event::FlashStateChanged { state: FlashState::Aborted, .. }
    )));
    assert!(!events.iter().any(|e| matches!(
        e,
        Event::FlashStateChanged { state: FlashState::Done, .. }
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        Event::Error(report) if report.kind == ErrorKind::FlashIntegrity
    )));
}

#[test]
fn test_second_flash_while_busy_is_rejected() {
    let ecu = SimulatedEcu::new()
        .with_unlock_key(KEY)
        .with_response_delay(Duration::from_millis(2));
    let (flasher, _rx) = setup(&ecu);

    let first = {
        let flasher = flasher.clone();
        thread::spawn(move || flasher.flash(image(16), &CancellationToken::new()))
    };
    wait_for_busy(flasher.link());

    let second = flasher.flash(image(2), &CancellationToken::new());
    let err = second.expect_err("link is busy");
    assert!(matches!(err, LinkError::OperationInProgress(_)));
    assert_eq!(err.kind(), ErrorKind::Sequence);

    let report = first.join().expect("flash thread").expect("first flash");
    assert_eq!(report.total_blocks, 16);
    assert_eq!(flasher.last_session().map(|s| s.state), Some(FlashState::Done));
    assert_eq!(flasher.link().state(), LinkState::Connected);
}

#[test]
fn test_cancel_between_blocks() {
    let ecu = SimulatedEcu::new()
        .with_unlock_key(KEY)
        .with_response_delay(Duration::from_millis(2));
    let (flasher, _rx) = setup(&ecu);
    let cancel = CancellationToken::new();

    let task = {
        let flasher = flasher.clone();
        let cancel = cancel.clone();
        thread::spawn(move || flasher.flash(image(200), &cancel))
    };
    wait_for_busy(flasher.link());
    thread::sleep(Duration::from_millis(30));
    cancel.cancel();

    let result = task.join().expect("flash thread");
    assert!(matches!(result, Err(LinkError::Cancelled)));

    let summary = flasher.last_session().expect("summary");
    assert_eq!(summary.state, FlashState::Aborted);
    assert!(summary.blocks_written < 200);
    assert_eq!(flasher.link().state(), LinkState::Connected);
    assert!(!ecu
        .received()
        .iter()
        .any(|f| f.command == Command::VerifyBlock));
}

#[test]
fn test_disconnect_during_flash_aborts() {
    let ecu = SimulatedEcu::new()
        .with_unlock_key(KEY)
        .with_response_delay(Duration::from_millis(2));
    let (flasher, mut rx) = setup(&ecu);

    let task = {
        let flasher = flasher.clone();
        thread::spawn(move || flasher.flash(image(200), &CancellationToken::new()))
    };
    wait_for_busy(flasher.link());
    thread::sleep(Duration::from_millis(20));
    flasher.link().disconnect();

    let result = task.join().expect("flash thread");
    assert!(matches!(
        result,
        Err(LinkError::Cancelled) | Err(LinkError::NotConnected)
    ));
    assert_eq!(flasher.link().state(), LinkState::Disconnected);
    assert_eq!(
        flasher.last_session().map(|s| s.state),
        Some(FlashState::Aborted)
    );
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, Event::Disconnected { .. })));
}

#[test]
fn test_new_session_after_abort_starts_from_unlock() {
    let ecu = SimulatedEcu::new()
        .with_unlock_key(KEY)
        .with_block_nacks(1, 10);
    let (flasher, _rx) = setup(&ecu);

    assert!(matches!(
        flasher.flash(image(3), &CancellationToken::new()),
        Err(LinkError::FlashWriteFailed(1))
    ));
    let failed = flasher.last_session().expect("summary");

    // Four refusals were used up and six remain
    let retry = FirmwareFlasher::new(
        flasher.link().clone(),
        FlashConfig {
            max_block_retries: 6,
            ..config()
        },
    );
    let report = retry
        .flash(image(3), &CancellationToken::new())
        .expect("second session");
    assert_ne!(report.session, failed.session);

    let unlocks = ecu
        .received()
        .iter()
        .filter(|f| f.command == Command::Unlock)
        .count();
    assert_eq!(unlocks, 2);
}

#[test]
fn test_padded_image_from_file() {
    use std::io::Write;

    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(&[0x11; 100]).expect("write");
    let image = FirmwareImage::from_file(file.path())
        .expect("load")
        .padded(BLOCK);
    assert_eq!(image.len(), 2 * BLOCK);

    let ecu = SimulatedEcu::new().with_unlock_key(KEY);
    let (flasher, _rx) = setup(&ecu);
    flasher
        .flash(image, &CancellationToken::new())
        .expect("flash");

    let contents = ecu.flash_contents();
    assert_eq!(&contents[..100], &[0x11; 100][..]);
    assert!(contents[100..].iter().all(|&b| b == 0xFF));
    assert!(ecu.is_unlocked());

    // Closing the port relocks the controller
    flasher.link().disconnect();
    assert!(!ecu.is_unlocked());
}

#[test]
fn test_unaligned_image_is_rejected_before_unlock() {
    let ecu = SimulatedEcu::new().with_unlock_key(KEY);
    let (flasher, _rx) = setup(&ecu);

    assert!(matches!(
        flasher.flash(FirmwareImage::new(vec![0; BLOCK + 1]), &CancellationToken::new()),
        Err(LinkError::MalformedImage(_))
    ));
    assert!(ecu.received().is_empty());
    assert!(!ecu.is_unlocked());
    assert_eq!(flasher.link().state(), LinkState::Connected);
}
