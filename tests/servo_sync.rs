mod common;

use std::collections::BTreeMap;

use common::MockBus;
use servobus_lib::serial::packet::{instruction, BROADCAST_ID};
use servobus_lib::servo::reg;
use servobus_lib::{CommResult, ServoError};

#[tokio::test]
async fn test_empty_sync_write_sends_nothing() {
    let mock = MockBus::with_servos(&[1]);
    let bus = mock.connect().await;

    bus.sync_write_positions(&BTreeMap::new()).await.expect("noop");
    bus.sync_write_wheel_speed(&BTreeMap::new()).await.expect("noop");
    assert!(mock.sent().is_empty());
}

#[tokio::test]
async fn test_one_invalid_entry_aborts_whole_sync_write() {
    let mock = MockBus::with_servos(&[1, 2, 3]);
    let bus = mock.connect().await;

    let positions = BTreeMap::from([(1, 100.0), (2, 200.0), (3, 9000.0)]);
    let err = bus.sync_write_positions(&positions).await.unwrap_err();
    assert!(matches!(err, ServoError::InvalidPosition(_)));

    let positions = BTreeMap::from([(1, 100.0), (2, 200.0), (253, 300.0)]);
    let err = bus.sync_write_positions(&positions).await.unwrap_err();
    assert!(matches!(err, ServoError::InvalidId(253)));

    let speeds = BTreeMap::from([(0, 10), (1, 20)]);
    let err = bus.sync_write_wheel_speed(&speeds).await.unwrap_err();
    assert!(matches!(err, ServoError::InvalidId(0)));

    assert!(mock.sent().is_empty());
}

#[tokio::test]
async fn test_sync_write_positions_is_one_frame() {
    let mock = MockBus::with_servos(&[1, 2]);
    let bus = mock.connect().await;

    let positions = BTreeMap::from([(1, 1024.0), (2, 3000.4)]);
    bus.sync_write_positions(&positions).await.expect("sync write");

    let sent = mock.sent_packets();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].id, BROADCAST_ID);
    assert_eq!(sent[0].code, instruction::SYNC_WRITE);
    assert_eq!(
        sent[0].params,
        vec![reg::GOAL_POSITION, 2, 1, 0x00, 0x04, 2, 0xB8, 0x0B]
    );

    let read = bus.sync_read_positions(&[1, 2]).await.unwrap();
    assert_eq!(read, BTreeMap::from([(1, 1024), (2, 3000)]));
}

#[tokio::test]
async fn test_sync_wheel_speed_clamps_and_sets_sign_bit() {
    let mock = MockBus::with_servos(&[5]);
    let bus = mock.connect().await;

    bus.sync_write_wheel_speed(&BTreeMap::from([(5, -12_000)]))
        .await
        .expect("sync write");

    let frame = mock.sent().pop().unwrap();
    // FF FF FE len 83 addr width id lo hi chk
    assert_eq!(&frame[..5], &[0xFF, 0xFF, BROADCAST_ID, 7, instruction::SYNC_WRITE]);
    assert_eq!(&frame[5..10], &[reg::GOAL_SPEED, 2, 5, 0x10, 0xA7]);
    assert_eq!(u16::from_le_bytes([frame[8], frame[9]]), 0x8000 | 10_000);
}

#[tokio::test]
async fn test_sync_read_omits_silent_servo() {
    let mock = MockBus::with_servos(&[1, 2]);
    mock.set_register(1, reg::PRESENT_POSITION, 0x34);
    mock.set_register(1, reg::PRESENT_POSITION + 1, 0x02);
    mock.silence(2);
    let bus = mock.connect().await;

    let read = bus.sync_read_positions(&[1, 2]).await.expect("partial result");
    assert_eq!(read, BTreeMap::from([(1, 0x0234)]));
    // one transaction per id, the failure did not stop the loop
    assert_eq!(mock.destinations(), vec![1, 2]);
}

#[tokio::test]
async fn test_sync_read_continues_after_failure() {
    let mock = MockBus::with_servos(&[1, 2, 3]);
    mock.silence(1);
    let bus = mock.connect().await;

    let read = bus.sync_read_positions(&[1, 2, 3]).await.unwrap();
    assert_eq!(read.keys().copied().collect::<Vec<_>>(), vec![2, 3]);
}

#[tokio::test]
async fn test_sync_read_skips_invalid_and_repeated_ids() {
    let mock = MockBus::with_servos(&[4]);
    let bus = mock.connect().await;

    let read = bus.sync_read_positions(&[0, 4, 4, 254]).await.unwrap();
    assert_eq!(read.len(), 1);
    assert!(read.contains_key(&4));
    assert_eq!(mock.destinations(), vec![4]);
}

#[tokio::test]
async fn test_sync_write_too_large_for_one_frame() {
    let ids: Vec<u8> = (1..=81).collect();
    let mock = MockBus::with_servos(&ids);
    let bus = mock.connect().await;

    let positions: BTreeMap<u8, f64> = ids.iter().map(|&id| (id, 2048.0)).collect();
    let err = bus.sync_write_positions(&positions).await.unwrap_err();
    assert!(matches!(
        err,
        ServoError::SyncWrite {
            operation: "sync_write_positions",
            result: CommResult::TxFail,
        }
    ));
    assert!(mock.sent().is_empty());

    // 80 servos still fit
    let positions: BTreeMap<u8, f64> = ids[..80].iter().map(|&id| (id, 2048.0)).collect();
    bus.sync_write_positions(&positions).await.expect("fits");
    assert_eq!(mock.sent().len(), 1);
    assert_eq!(mock.sent()[0].len(), 248);
}
