//! Two controllers replicating topology over an in-process bus.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use spfmesh::{
    ChannelHandle, Config, ControlChannel, Controller, ControllerHandle, DeviceEvent, DeviceId,
    Endpoint, GossipTransport, HostAddr, Inbound, InboundKind, MemoryBus, Node, PortNo,
    TopologySnapshot, UdpTransport,
};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::timeout;

#[derive(Default)]
struct Recorder {
    installs: Mutex<Vec<(DeviceId, HostAddr, PortNo)>>,
}

impl ControlChannel for Recorder {
    fn install_rule(&self, device: DeviceId, destination: HostAddr, port: PortNo) {
        self.installs.lock().unwrap().push((device, destination, port));
    }

    fn remove_rule(&self, _device: DeviceId, _destination: HostAddr, _port: PortNo) {}

    fn clear_rules(&self, _device: DeviceId) {}
}

fn config(id: u64) -> Config {
    Config {
        controller_id: id,
        controller_name: format!("c{}", id),
        poll_interval_ms: 50,
        ..Config::default()
    }
}

fn start(bus: &MemoryBus, id: u64) -> ControllerHandle {
    let (controller, handle) = Controller::new(&config(id), bus.endpoint(id, &format!("c{}", id)));
    tokio::spawn(controller.run());
    handle
}

async fn wait_for<F>(rx: &mut watch::Receiver<TopologySnapshot>, pred: F) -> TopologySnapshot
where
    F: Fn(&TopologySnapshot) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            {
                let snap = rx.borrow_and_update();
                if pred(&snap) {
                    return snap.clone();
                }
            }
            rx.changed().await.expect("controller stopped");
        }
    })
    .await
    .expect("timed out waiting for snapshot")
}

async fn wait_install(recorder: &Recorder, rule: (DeviceId, HostAddr, PortNo)) {
    timeout(Duration::from_secs(5), async {
        loop {
            if recorder.installs.lock().unwrap().contains(&rule) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("rule was never installed");
}

fn host(n: u8) -> HostAddr {
    HostAddr([0x02, 0, 0, 0, 0, n])
}

#[tokio::test]
async fn host_seen_replicates_to_peer() {
    let bus = MemoryBus::new();
    let c0 = start(&bus, 0);
    let c1 = start(&bus, 1);
    let mut snaps0 = c0.snapshots();
    let mut snaps1 = c1.snapshots();

    wait_for(&mut snaps0, |s| s.peers == vec![1]).await;
    wait_for(&mut snaps1, |s| s.peers == vec![0]).await;

    let recorder = Arc::new(Recorder::default());
    let channel = ChannelHandle(recorder.clone());
    c0.send(DeviceEvent::ConnectionUp {
        device: 4,
        channel: channel.clone(),
    })
    .await
    .unwrap();
    c1.send(DeviceEvent::ConnectionUp {
        device: 7,
        channel: channel.clone(),
    })
    .await
    .unwrap();
    c0.send(DeviceEvent::PacketIn {
        device: 4,
        src: host(1),
        dst: host(0xff),
        in_port: 2,
    })
    .await
    .unwrap();

    let snap = wait_for(&mut snaps1, |s| {
        s.contains_link(Node::Device(4), Node::Host(host(1))) && s.contains_node(Node::Device(7))
    })
    .await;
    assert!(snap.contains_node(Node::Host(host(1))));

    wait_install(&recorder, (4, host(1), 2)).await;
    let installs = recorder.installs.lock().unwrap().clone();
    // Controller 1 owns 7, which has no path to the host yet.
    assert!(installs.iter().all(|(d, _, _)| *d == 4));

    c0.shutdown();
    c1.shutdown();
}

#[tokio::test]
async fn link_events_converge_across_controllers() {
    let bus = MemoryBus::new();
    let c0 = start(&bus, 0);
    let c1 = start(&bus, 1);
    let mut snaps0 = c0.snapshots();
    let mut snaps1 = c1.snapshots();
    wait_for(&mut snaps0, |s| s.peers == vec![1]).await;
    wait_for(&mut snaps1, |s| s.peers == vec![0]).await;

    let recorder = Arc::new(Recorder::default());
    let channel = ChannelHandle(recorder.clone());
    for (handle, device) in [(&c0, 4), (&c1, 7)] {
        handle
            .send(DeviceEvent::ConnectionUp {
                device,
                channel: channel.clone(),
            })
            .await
            .unwrap();
    }

    let a = Endpoint { device: 4, port: 1 };
    let b = Endpoint { device: 7, port: 1 };
    c0.send(DeviceEvent::LinkEvent { added: true, a, b })
        .await
        .unwrap();
    c0.send(DeviceEvent::PacketIn {
        device: 4,
        src: host(9),
        dst: host(0xff),
        in_port: 3,
    })
    .await
    .unwrap();

    let snap = wait_for(&mut snaps1, |s| {
        s.contains_link(Node::Device(4), Node::Device(7))
            && s.contains_node(Node::Host(host(9)))
    })
    .await;
    assert_eq!(snap.controller, 1);

    // The same link reported again by the other side changes nothing.
    c1.send(DeviceEvent::LinkEvent {
        added: true,
        a: b,
        b: a,
    })
    .await
    .unwrap();

    // Device 7 now routes towards the host through its uplink to 4.
    wait_install(&recorder, (7, host(9), 1)).await;

    c1.send(DeviceEvent::LinkEvent {
        added: false,
        a: b,
        b: a,
    })
    .await
    .unwrap();
    wait_for(&mut snaps0, |s| {
        !s.contains_link(Node::Device(4), Node::Device(7))
    })
    .await;

    c0.shutdown();
    c1.shutdown();
}

#[tokio::test]
async fn unauthenticated_joins_never_reach_membership() {
    let secret = "real-secret";
    let loopback = "127.0.0.1:0".parse().unwrap();
    let transport = UdpTransport::bind(0, "c0", secret, loopback, Vec::new())
        .await
        .unwrap();
    let addr = transport.local_addr().unwrap();
    let cfg = Config {
        cluster_secret: secret.into(),
        ..config(0)
    };
    let (controller, handle) = Controller::new(&cfg, transport);
    tokio::spawn(controller.run());
    let mut snaps = handle.snapshots();

    let spoofer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for sender_id in 1..=3 {
        let join = serde_json::to_vec(&Inbound {
            kind: InboundKind::Join,
            sender_id,
            sender_name: format!("fake{}", sender_id),
            group: "SPF".into(),
            payload: Vec::new(),
        })
        .unwrap();
        spoofer.send_to(&join, addr).await.unwrap();
    }

    let mut peer = UdpTransport::bind(4, "c4", secret, loopback, vec![addr])
        .await
        .unwrap();
    peer.join("SPF").await.unwrap();

    let snap = wait_for(&mut snaps, |s| s.peers.contains(&4)).await;
    assert_eq!(snap.peers, vec![4]);

    handle.shutdown();
}
