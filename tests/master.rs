mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_test::{assert_err, assert_ok};

use common::{connected, test_config, with_crc, Bank, LineChannel, LineMaster, MockSlave};
use rtu_master::{
    ConnectionState, ErrorKind, MasterConfig, ModbusError, RegisterKind, RegisterValue, RtuMaster,
    SerialConfig, StreamChannel,
};

async fn wait_disconnected(mut state: watch::Receiver<ConnectionState>) {
    tokio::time::timeout(
        Duration::from_secs(1),
        state.wait_for(|s| *s == ConnectionState::Disconnected),
    )
    .await
    .expect("state change")
    .unwrap();
}

fn bank_with_values() -> Bank {
    let mut bank = Bank::default();
    for address in 0..4u16 {
        bank.discrete_inputs.insert(address, address % 2 == 1);
        bank.input_registers.insert(address, 100 + address);
        bank.holding_registers.insert(address, 200 + address);
    }
    bank
}

#[tokio::test]
async fn default_map_has_sixteen_entries_per_kind() {
    let master: common::TestMaster = RtuMaster::new(MasterConfig::default()).unwrap();
    let entries = master.registers();
    assert_eq!(entries.len(), 64);

    for kind in RegisterKind::ALL {
        let addresses: Vec<u16> = entries
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.address)
            .collect();
        assert_eq!(addresses, (0..16).collect::<Vec<_>>());
    }

    assert_err!(master.add_entry(RegisterKind::Coil, 15));
    assert_ok!(master.add_entry(RegisterKind::Coil, 16));
}

#[tokio::test]
async fn cycle_reads_every_entry_and_counts_once() {
    let (master, slave) = connected(test_config(4), bank_with_values()).await;

    let report = master.update().await.unwrap();
    assert_eq!(report.cycle, 1);
    assert_eq!(report.reads_ok, 16);
    assert_eq!(report.failures(), 0);
    assert_eq!(master.cycle_count(), 1);
    assert_eq!(slave.frames().len(), 16);

    for entry in master.registers() {
        assert!(!entry.updating);
        assert!(entry.last_update.is_some());
        assert!(entry.error.is_none());
    }
    assert_eq!(
        master.entry(RegisterKind::InputRegister, 3).unwrap().value,
        Some(RegisterValue::Word(103))
    );
    assert_eq!(
        master.entry(RegisterKind::OutputRegister, 2).unwrap().value,
        Some(RegisterValue::Word(202))
    );
    assert_eq!(
        master.entry(RegisterKind::DiscreteInput, 1).unwrap().value,
        Some(RegisterValue::Bit(true))
    );

    master.update().await.unwrap();
    assert_eq!(master.cycle_count(), 2);
}

#[tokio::test]
async fn coil_written_then_read_back() {
    let (master, slave) = connected(test_config(4), Bank::default()).await;

    master
        .set_pending_write(RegisterKind::Coil, 3, RegisterValue::Bit(true))
        .unwrap();
    let report = master.update().await.unwrap();
    assert_eq!(report.writes_ok, 1);

    let coil = master.entry(RegisterKind::Coil, 3).unwrap();
    assert_eq!(coil.value, Some(RegisterValue::Bit(true)));
    assert!(coil.pending_write.is_none());
    assert!(coil.write_error.is_none());

    // Write multiple coils, quantity 1, to slave 10
    let first = &slave.frames()[0];
    assert_eq!(
        first,
        &with_crc(&[0x0A, 0x0F, 0x00, 0x03, 0x00, 0x01, 0x01, 0x01])
    );
}

#[tokio::test]
async fn output_register_written_with_function_06() {
    let (master, slave) = connected(test_config(2), Bank::default()).await;

    master
        .set_pending_write(RegisterKind::OutputRegister, 1, RegisterValue::Word(0x1234))
        .unwrap();
    master.update().await.unwrap();

    assert_eq!(
        slave.frames()[0],
        with_crc(&[0x0A, 0x06, 0x00, 0x01, 0x12, 0x34])
    );
    assert_eq!(
        master.entry(RegisterKind::OutputRegister, 1).unwrap().value,
        Some(RegisterValue::Word(0x1234))
    );
}

#[tokio::test]
async fn read_only_writes_never_reach_the_wire() {
    let (master, slave) = connected(test_config(2), Bank::default()).await;

    let err = master
        .set_pending_write(RegisterKind::DiscreteInput, 0, RegisterValue::Bit(true))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    let err = master
        .set_pending_write(RegisterKind::InputRegister, 1, RegisterValue::Word(5))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    master.update().await.unwrap();
    let writes = slave
        .frames()
        .iter()
        .filter(|frame| matches!(frame[1], 0x05 | 0x06 | 0x0F | 0x10))
        .count();
    assert_eq!(writes, 0);
}

#[tokio::test]
async fn silent_slave_times_out_and_keeps_values() {
    let (master, slave) = connected(test_config(1), bank_with_values()).await;

    master.update().await.unwrap();
    assert_eq!(
        master.entry(RegisterKind::InputRegister, 0).unwrap().value,
        Some(RegisterValue::Word(100))
    );

    slave.set_silent(true);
    master
        .set_pending_write(RegisterKind::OutputRegister, 0, RegisterValue::Word(9))
        .unwrap();
    let report = master.update().await.unwrap();
    assert_eq!(report.cycle, 2);
    assert_eq!(report.writes_failed, 1);
    assert_eq!(report.reads_failed, 4);
    assert!(report.transport_error.is_none());

    let input = master.entry(RegisterKind::InputRegister, 0).unwrap();
    assert_eq!(input.error.as_ref().unwrap().kind, ErrorKind::Timeout);
    assert_eq!(input.value, Some(RegisterValue::Word(100)));
    assert!(!input.updating);

    let output = master.entry(RegisterKind::OutputRegister, 0).unwrap();
    assert!(output.pending_write.is_none(), "pending write is not restored");
    assert_eq!(output.write_error.as_ref().unwrap().kind, ErrorKind::Timeout);

    assert_eq!(master.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn exception_response_is_recorded_per_entry() {
    let mut bank = bank_with_values();
    bank.illegal_from = Some(1);
    let (master, _slave) = connected(test_config(2), bank).await;

    let report = master.update().await.unwrap();
    assert_eq!(report.reads_ok, 4);
    assert_eq!(report.reads_failed, 4);

    let entry = master.entry(RegisterKind::OutputRegister, 1).unwrap();
    let error = entry.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Protocol);
    assert_eq!(error.device_message.as_deref(), Some("Illegal Data Address"));
    assert!(entry.value.is_none());
}

#[tokio::test]
async fn changing_slave_id_readdresses_frames() {
    let (master, slave) = connected(test_config(1), bank_with_values()).await;
    master.update().await.unwrap();
    assert!(slave.frames().iter().all(|frame| frame[0] == 10));

    master.set_slave_id(5).unwrap();
    assert_eq!(master.state(), ConnectionState::Connected);
    assert_eq!(
        master.entry(RegisterKind::InputRegister, 0).unwrap().value,
        Some(RegisterValue::Word(100))
    );

    slave.clear_frames();
    master.update().await.unwrap();
    let frames = slave.frames();
    assert_eq!(frames.len(), 4);
    assert!(frames.iter().all(|frame| frame[0] == 5));
    assert_eq!(master.slave_id(), 5);
}

#[tokio::test]
async fn peer_hang_up_forces_disconnected() {
    let (master, slave) = connected(test_config(1), Bank::default()).await;
    let state = master.subscribe_state();

    slave.hang_up();
    wait_disconnected(state).await;

    assert_eq!(master.last_error().unwrap().kind(), ErrorKind::Transport);
    assert_eq!(master.update().await.unwrap_err(), ModbusError::NotConnected);
    assert_eq!(master.cycle_count(), 0);

    // A fresh connection works after the link was lost
    let (ours, theirs) = tokio::io::duplex(1024);
    let _slave = MockSlave::spawn(theirs, Bank::default());
    master
        .connect(StreamChannel::new("again", ours), &SerialConfig::default())
        .await
        .unwrap();
    assert!(master.is_connected());
    assert!(master.last_error().is_none());
    assert_ok!(master.update().await);
}

#[tokio::test]
async fn disconnect_waits_for_cycle_in_flight() {
    let config = test_config(2).with_response_timeout(Duration::from_millis(20));
    let (master, slave) = connected(config, Bank::default()).await;
    slave.set_silent(true);

    let cycle = {
        let master = master.clone();
        tokio::spawn(async move { master.update().await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    master.disconnect().await.unwrap();
    assert_eq!(master.state(), ConnectionState::Disconnected);

    let report = cycle.await.unwrap().unwrap();
    assert_eq!(report.reads_failed, 8);
    assert!(
        report.transport_error.is_none(),
        "the transport stayed open until the cycle finished"
    );
    assert_eq!(master.cycle_count(), 1);
    assert!(master.registers().iter().all(|e| !e.updating));
}

#[tokio::test]
async fn auto_update_runs_until_stopped() {
    let (master, _slave) = connected(test_config(1), bank_with_values()).await;

    master.start_auto_update(Duration::from_millis(20)).unwrap();
    assert!(master.is_auto_updating());
    tokio::time::sleep(Duration::from_millis(110)).await;
    master.stop_auto_update().await;
    assert!(!master.is_auto_updating());

    let cycles = master.cycle_count();
    assert!(cycles >= 2, "only {} cycles ran", cycles);
    assert!(master.registers().iter().all(|e| !e.updating));

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(master.cycle_count(), cycles, "no cycles after stop");
}

#[tokio::test]
async fn polling_uses_configured_period() {
    let config = test_config(1).with_poll_period(Duration::from_millis(15));
    let (master, _slave) = connected(config, Bank::default()).await;

    master.start_polling().unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    // Restarting replaces the running auto-update
    master.start_polling().unwrap();
    assert!(master.is_auto_updating());
    master.stop_auto_update().await;

    assert!(master.cycle_count() >= 2);
    assert_err!(master.start_auto_update(Duration::ZERO));
    assert!(!master.is_auto_updating());
}

#[tokio::test]
async fn auto_update_skips_ticks_while_a_cycle_runs() {
    let config = test_config(1).with_response_timeout(Duration::from_millis(30));
    let (master, slave) = connected(config, Bank::default()).await;
    slave.set_silent(true);

    // A cycle takes 4 x 30 ms; ticks every 10 ms must not queue up.
    master.start_auto_update(Duration::from_millis(10)).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    master.stop_auto_update().await;

    let cycles = master.cycle_count();
    assert!((1..=2).contains(&cycles), "{} cycles", cycles);
    assert!(master.registers().iter().all(|e| !e.updating));
}

#[tokio::test]
async fn cycle_on_lost_link_does_not_close_the_next_connection() {
    let config = test_config(5).with_response_timeout(Duration::from_millis(20));
    let (master, slave) = connected(config, Bank::default()).await;
    slave.set_silent(true);

    let cycle = {
        let master = master.clone();
        tokio::spawn(async move { master.update().await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    slave.hang_up();
    wait_disconnected(master.subscribe_state()).await;

    // Reconnect while the old cycle is still working through its entries
    let (ours, theirs) = tokio::io::duplex(1024);
    let fresh = MockSlave::spawn(theirs, bank_with_values());
    master
        .connect(StreamChannel::new("fresh", ours), &SerialConfig::default())
        .await
        .unwrap();

    let report = cycle.await.unwrap().unwrap();
    assert!(report.transport_error.is_some());
    assert_eq!(master.state(), ConnectionState::Connected);
    assert!(master.last_error().is_none());

    let report = master.update().await.unwrap();
    assert_eq!(report.failures(), 0);
    assert_eq!(fresh.frames().len(), 20);
    assert_eq!(
        master.entry(RegisterKind::InputRegister, 2).unwrap().value,
        Some(RegisterValue::Word(102))
    );
}

#[tokio::test]
async fn write_failure_ends_the_connection() {
    let master: LineMaster = RtuMaster::new(test_config(2)).unwrap();
    let (ours, _peer) = tokio::io::duplex(1024);
    let (channel, closes) = LineChannel::new(ours, true);
    master.connect(channel, &SerialConfig::default()).await.unwrap();

    let report = master.update().await.unwrap();
    assert_eq!(report.cycle, 1);
    assert_eq!(report.reads_failed, 8);
    assert_eq!(
        report.transport_error.as_ref().map(ModbusError::kind),
        Some(ErrorKind::Transport)
    );

    assert_eq!(master.state(), ConnectionState::Disconnected);
    assert_eq!(master.last_error().unwrap().kind(), ErrorKind::Transport);
    assert_eq!(master.cycle_count(), 1);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert!(master.registers().iter().all(|e| !e.updating));

    assert_eq!(master.update().await.unwrap_err(), ModbusError::NotConnected);
    assert_eq!(master.cycle_count(), 1);
}

#[tokio::test]
async fn lost_link_releases_port_on_next_update() {
    let master = Arc::new(LineMaster::new(test_config(1)).unwrap());
    let (ours, theirs) = tokio::io::duplex(1024);
    let slave = MockSlave::spawn(theirs, Bank::default());
    let (channel, closes) = LineChannel::new(ours, false);
    master.connect(channel, &SerialConfig::default()).await.unwrap();
    assert_ok!(master.update().await);

    slave.hang_up();
    wait_disconnected(master.subscribe_state()).await;
    assert_eq!(closes.load(Ordering::SeqCst), 0, "port still held");

    assert_eq!(master.update().await.unwrap_err(), ModbusError::NotConnected);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert_eq!(master.last_error().unwrap().kind(), ErrorKind::Transport);

    // Nothing left to release
    assert_err!(master.update().await);
    assert_ok!(master.disconnect().await);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn toggled_coil_alternates_across_cycles() {
    let (master, slave) = connected(test_config(2), Bank::default()).await;

    for i in 0..4u8 {
        master
            .set_pending_write(RegisterKind::Coil, 1, RegisterValue::Bit(i % 2 == 0))
            .unwrap();
        master.update().await.unwrap();
        assert_eq!(
            master.entry(RegisterKind::Coil, 1).unwrap().value,
            Some(RegisterValue::Bit(i % 2 == 0))
        );
    }

    let written: Vec<u8> = slave
        .frames()
        .iter()
        .filter(|frame| frame[1] == 0x0F)
        .map(|frame| frame[7])
        .collect();
    assert_eq!(written, vec![1, 0, 1, 0]);
}
