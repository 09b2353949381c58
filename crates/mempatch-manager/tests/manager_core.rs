//! Full manager/core conversations over loopback: handshake, ordered
//! traffic, state streaming into the in-process core, disconnect and detach.

use std::net::TcpListener;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use mempatch_common::channel::{ClientOp, CustomPacket, ServerOp};
use mempatch_common::info::Info;
use mempatch_common::patch::{Patch, PatchPack, ReplaceSearchPatch};
use mempatch_common::pattern::Search;
use mempatch_common::wire::{self, Wire};
use mempatch_core::Core;
use mempatch_manager::CoreManager;

const CORE_NAME: &str = "libmempatch_core.so";

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Bind an ephemeral loopback port and connect an in-process core to it.
fn connect_pair(manager: &CoreManager) -> (std::sync::Arc<Core>, u32) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let (core_tx, core_rx) = mpsc::channel();
    let connector = std::thread::spawn(move || {
        let core = Core::connect(port).expect("core could not connect");
        core_tx.send(core).unwrap();
    });

    let core_id = manager
        .attach(&listener, None, CORE_NAME, Duration::from_secs(5))
        .expect("handshake failed");
    let core = core_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("core thread never finished connecting");
    connector.join().unwrap();
    (core, core_id)
}

#[test]
fn handshake_traffic_and_disconnect() {
    let manager = CoreManager::new();
    let (core, core_id) = connect_pair(&manager);

    assert_eq!(manager.connected_cores(), vec![core_id]);
    assert_eq!(core.core_name(), CORE_NAME);
    assert!(core.is_connected());

    // Frames on one socket arrive and decode in send order.
    let (seen_tx, seen_rx) = mpsc::channel();
    manager
        .registry()
        .add(ClientOp::Custom as u32, move |core_id: &u32, data: &[u8]| {
            let packet = CustomPacket::from_bytes(data).unwrap();
            let _ = seen_tx.send((*core_id, packet.op));
        });
    for sequence in 0..32u32 {
        core.send_custom(sequence, &sequence.to_le_bytes()).unwrap();
    }
    for sequence in 0..32u32 {
        let (from, op) = seen_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("custom frame lost");
        assert_eq!(from, core_id);
        assert_eq!(op, sequence);
    }

    // A patch pack streamed from the manager lands in the core's loader.
    let pack = PatchPack {
        info: Info {
            name: "streamed".to_string(),
            ..Info::default()
        },
        patches: vec![Patch::ReplaceSearch(ReplaceSearchPatch {
            search: Search {
                module_name: "libnever-loaded.so".to_string(),
                search_bytes: vec![0xAA, 0xBB, 0xCC, 0xDD],
                ..Search::default()
            },
            replace_bytes: vec![0xDD, 0xCC, 0xBB, 0xAA],
            ignored_replace_rvas: Default::default(),
        })],
        ..PatchPack::default()
    };
    let mut data = Vec::new();
    wire::put_entity(&mut data, &pack);
    manager.send_to(core_id, ServerOp::PatchPack, &data).unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || core
            .loader()
            .is_pack_loaded("streamed")),
        "pack never reached the core"
    );

    // Removal is symmetric.
    let mut name = Vec::new();
    wire::put_string(&mut name, "streamed");
    manager
        .send_to(core_id, ServerOp::PatchPackRemove, &name)
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || !core
        .loader()
        .is_pack_loaded("streamed")));

    // Clean disconnect: both sides observe it.
    manager.end_core_connection(core_id).unwrap();
    assert!(wait_until(Duration::from_secs(5), || !core.is_connected()));
    assert!(wait_until(Duration::from_secs(5), || manager
        .connected_cores()
        .is_empty()));
}

#[test]
fn detach_unwinds_the_core_without_killing_the_process() {
    let manager = CoreManager::new();
    let (core, core_id) = connect_pair(&manager);

    manager.end_core(core_id).unwrap();
    assert!(wait_until(Duration::from_secs(5), || !core.is_connected()));
    assert!(wait_until(Duration::from_secs(5), || manager
        .connected_cores()
        .is_empty()));
    // This process (the "target") is alive and well.
}

#[test]
fn core_ids_are_never_recycled() {
    let manager = CoreManager::new();

    let (first_core, first_id) = connect_pair(&manager);
    manager.end_core_connection(first_id).unwrap();
    assert!(wait_until(Duration::from_secs(5), || manager
        .connected_cores()
        .is_empty()));
    drop(first_core);

    let (second_core, second_id) = connect_pair(&manager);
    assert!(second_id > first_id);
    drop(second_core);
}
