//! End-to-end tests against a running node on the loopback interface.
//!
//! A minimal in-test client speaks real frames over TCP using the crate's
//! codec, the same way an external controller would.

use periphhome::api::frame::{self, Frame};
use periphhome::api::proto;
use periphhome::cancel;
use periphhome::config::Root;
use periphhome::{Node, NodeOptions};
use prost::Message;
use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::time::{Duration, Instant};

const SAMPLE_CONF: &str = r#"
periphhome:
  name: pi
  comment: pi device

api:
  port: 6053
  password: "Foo"

binary_sensor:
  - platform: fake
    name: "fake binary_sensor"
    device_class: motion

camera:
  - platform: fake
    name: "fake camera"

light:
  - platform: fake
    name: "fake light"

sensor:
  - platform: fake
    name: "fake sensor"
    update_interval: 60s
"#;

const BINARY_SENSOR_KEY: u32 = 2604849794;
const SENSOR_KEY: u32 = 3490831464;
const LIGHT_KEY: u32 = 2124765894;
const CAMERA_KEY: u32 = 1841563375;

/// An OS-assigned free TCP port. Racy by construction, like every
/// free-port helper, but fine on the loopback.
fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// The returned canceller is the root scope; it must outlive the node or
/// dropping it shuts everything down.
fn start_node() -> (Node, cancel::Canceller) {
    start_node_with(SAMPLE_CONF)
}

fn start_node_with(conf: &str) -> (Node, cancel::Canceller) {
    let mut cfg = Root::load_yaml(conf).unwrap();
    if let Some(api) = cfg.api.as_mut() {
        api.port = u32::from(free_port());
    }
    let (canceller, token) = cancel::root();
    let node = Node::new(
        &token,
        cfg,
        NodeOptions {
            bind_host: "127.0.0.1".into(),
        },
    )
    .unwrap();
    (node, canceller)
}

struct Client {
    stream: TcpStream,
}

impl Client {
    fn connect(node: &Node) -> Client {
        let addr = node.local_addr().expect("api should be enabled");
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        Client { stream }
    }

    fn send<M: Message>(&mut self, id: u32, msg: &M) {
        frame::write_frame(&mut self.stream, id, &msg.encode_to_vec()).unwrap();
    }

    /// Next frame within `timeout`, or None.
    fn next_frame(&mut self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        loop {
            match frame::read_frame(&mut self.stream) {
                Ok(Some(frame)) => return Some(frame),
                Ok(None) => {
                    if Instant::now() >= deadline {
                        return None;
                    }
                }
                Err(_) => return None,
            }
        }
    }

    fn expect_frame(&mut self, want_id: u32) -> Frame {
        let frame = self
            .next_frame(Duration::from_secs(5))
            .unwrap_or_else(|| panic!("timed out waiting for message id {}", want_id));
        assert_eq!(frame.id, want_id, "unexpected message id");
        frame
    }

    /// True once the server has closed the connection.
    fn eof_within(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 64];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return true,
                Ok(_) => {}
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    if Instant::now() >= deadline {
                        return false;
                    }
                }
                Err(_) => return true,
            }
        }
    }

    fn hello(&mut self) -> proto::HelloResponse {
        self.send(1, &proto::HelloRequest {
            client_info: "api_server test".into(),
        });
        proto::HelloResponse::decode(&self.expect_frame(2).payload[..]).unwrap()
    }

    fn login(&mut self, password: &str) -> proto::ConnectResponse {
        self.send(3, &proto::ConnectRequest {
            password: password.into(),
        });
        proto::ConnectResponse::decode(&self.expect_frame(4).payload[..]).unwrap()
    }

    fn authenticate(node: &Node) -> Client {
        let mut client = Client::connect(node);
        client.hello();
        let resp = client.login("Foo");
        assert!(!resp.invalid_password);
        client
    }
}

#[test]
fn handshake_reports_api_1_3() {
    let (node, _root) = start_node();
    let mut client = Client::connect(&node);
    let hello = client.hello();
    assert_eq!(hello.api_version_major, 1);
    assert_eq!(hello.api_version_minor, 3);
    assert_eq!(hello.server_info, "periphhome");
    drop(client);
    node.close().unwrap();
}

#[test]
fn correct_password_is_accepted() {
    let (node, _root) = start_node();
    let mut client = Client::connect(&node);
    client.hello();
    assert!(!client.login("Foo").invalid_password);
    drop(client);
    node.close().unwrap();
}

#[test]
fn wrong_password_is_rejected_and_closes() {
    let (node, _root) = start_node();
    let mut client = Client::connect(&node);
    client.hello();
    assert!(client.login("bar").invalid_password);
    assert!(client.eof_within(Duration::from_secs(1)));
    node.close().unwrap();
}

#[test]
fn message_before_hello_closes() {
    let (node, _root) = start_node();
    let mut client = Client::connect(&node);
    client.send(7, &proto::PingRequest {});
    assert!(client.eof_within(Duration::from_secs(1)));
    node.close().unwrap();
}

#[test]
fn unknown_message_id_closes() {
    let (node, _root) = start_node();
    let mut client = Client::authenticate(&node);
    frame::write_frame(&mut client.stream, 200, &[]).unwrap();
    assert!(client.eof_within(Duration::from_secs(1)));
    node.close().unwrap();
}

#[test]
fn ping_and_time() {
    let (node, _root) = start_node();
    let mut client = Client::authenticate(&node);

    client.send(7, &proto::PingRequest {});
    client.expect_frame(8);

    client.send(36, &proto::GetTimeRequest {});
    let time = proto::GetTimeResponse::decode(&client.expect_frame(37).payload[..]).unwrap();
    assert!(time.epoch_seconds > 1_600_000_000);
    drop(client);
    node.close().unwrap();
}

#[test]
fn device_info_carries_config() {
    let (node, _root) = start_node();
    let mut client = Client::authenticate(&node);
    client.send(9, &proto::DeviceInfoRequest {});
    let info = proto::DeviceInfoResponse::decode(&client.expect_frame(10).payload[..]).unwrap();
    assert!(info.uses_password);
    assert_eq!(info.name, "pi");
    assert_eq!(info.compilation_time, "pi device");
    assert_eq!(info.esphome_version, format!("PeriphHome {}", periphhome::VERSION));
    assert_eq!(info.model, std::env::consts::OS);
    assert!(!info.has_deep_sleep);
    drop(client);
    node.close().unwrap();
}

#[test]
fn list_entities_in_declaration_order() {
    let (node, _root) = start_node();
    let mut client = Client::authenticate(&node);
    client.send(11, &proto::ListEntitiesRequest {});

    let binary =
        proto::ListEntitiesBinarySensorResponse::decode(&client.expect_frame(12).payload[..])
            .unwrap();
    assert_eq!(binary.object_id, "fakebinary_sensor");
    assert_eq!(binary.key, BINARY_SENSOR_KEY);
    assert_eq!(binary.name, "fake binary_sensor");
    assert_eq!(binary.unique_id, "pibinary_sensorfakebinary_sensor");
    assert_eq!(binary.device_class, "motion");

    let sensor =
        proto::ListEntitiesSensorResponse::decode(&client.expect_frame(16).payload[..]).unwrap();
    assert_eq!(sensor.object_id, "fakesensor");
    assert_eq!(sensor.key, SENSOR_KEY);
    assert_eq!(sensor.unique_id, "pisensorfakesensor");
    assert_eq!(sensor.icon, "mdi:exclamation");

    let light =
        proto::ListEntitiesLightResponse::decode(&client.expect_frame(15).payload[..]).unwrap();
    assert_eq!(light.object_id, "fakelight");
    assert_eq!(light.key, LIGHT_KEY);
    assert!(!light.supports_brightness);

    let camera =
        proto::ListEntitiesCameraResponse::decode(&client.expect_frame(43).payload[..]).unwrap();
    assert_eq!(camera.object_id, "fakecamera");
    assert_eq!(camera.key, CAMERA_KEY);
    assert_eq!(camera.unique_id, "picamerafakecamera");

    client.expect_frame(19); // ListEntitiesDoneResponse
    drop(client);
    node.close().unwrap();
}

#[test]
fn subscribe_states_sends_snapshots() {
    let (node, _root) = start_node();
    let mut client = Client::authenticate(&node);
    client.send(20, &proto::SubscribeStatesRequest {});

    // One snapshot per non-camera entity, in whatever order the
    // subscription threads win the writer lock.
    let mut got_binary = false;
    let mut got_sensor = false;
    let mut got_light = false;
    for _ in 0..3 {
        let frame = client.next_frame(Duration::from_secs(5)).expect("snapshot");
        match frame.id {
            21 => {
                let m =
                    proto::BinarySensorStateResponse::decode(&frame.payload[..]).unwrap();
                assert_eq!(m.key, BINARY_SENSOR_KEY);
                assert!(!m.state);
                got_binary = true;
            }
            25 => {
                let m = proto::SensorStateResponse::decode(&frame.payload[..]).unwrap();
                assert_eq!(m.key, SENSOR_KEY);
                assert_eq!(m.state, 1.0);
                got_sensor = true;
            }
            24 => {
                let m = proto::LightStateResponse::decode(&frame.payload[..]).unwrap();
                assert_eq!(m.key, LIGHT_KEY);
                assert!(!m.state);
                got_light = true;
            }
            other => panic!("unexpected snapshot message id {}", other),
        }
    }
    assert!(got_binary && got_sensor && got_light);
    // Cameras never join the state subscription.
    assert!(client.next_frame(Duration::from_millis(300)).is_none());
    drop(client);
    node.close().unwrap();
}

#[test]
fn state_update_reaches_subscriber() {
    let (node, _root) = start_node();
    let mut client = Client::authenticate(&node);
    client.send(20, &proto::SubscribeStatesRequest {});
    for _ in 0..3 {
        client.next_frame(Duration::from_secs(5)).expect("snapshot");
    }

    // Drive a state change through the public surface: a light command
    // echoes back as a fresh LightStateResponse to every subscriber.
    client.send(32, &proto::LightCommandRequest {
        key: LIGHT_KEY,
        has_state: true,
        state: true,
        ..Default::default()
    });
    let frame = client
        .next_frame(Duration::from_secs(5))
        .expect("state update");
    assert_eq!(frame.id, 24);
    let m = proto::LightStateResponse::decode(&frame.payload[..]).unwrap();
    assert_eq!(m.key, LIGHT_KEY);
    assert!(m.state);
    drop(client);
    node.close().unwrap();
}

#[test]
fn commands_with_unknown_key_do_not_kill_connection() {
    let (node, _root) = start_node();
    let mut client = Client::authenticate(&node);

    client.send(32, &proto::LightCommandRequest {
        key: 0xdeadbeef,
        has_state: true,
        state: true,
        ..Default::default()
    });
    // Still alive and serving.
    client.send(7, &proto::PingRequest {});
    client.expect_frame(8);
    drop(client);
    node.close().unwrap();
}

#[test]
fn wrong_kind_command_is_rejected_but_survives() {
    let (node, _root) = start_node();
    let mut client = Client::authenticate(&node);

    // A switch command aimed at the light: refused as "<name> is no
    // switch", logged server-side, connection stays up and no state change
    // is broadcast.
    client.send(20, &proto::SubscribeStatesRequest {});
    for _ in 0..3 {
        client.next_frame(Duration::from_secs(5)).expect("snapshot");
    }
    client.send(33, &proto::SwitchCommandRequest {
        key: LIGHT_KEY,
        state: true,
    });
    assert!(client.next_frame(Duration::from_millis(300)).is_none());

    client.send(7, &proto::PingRequest {});
    client.expect_frame(8);
    drop(client);
    node.close().unwrap();
}

#[test]
fn execute_service_is_unimplemented_but_survives() {
    let (node, _root) = start_node();
    let mut client = Client::authenticate(&node);
    client.send(42, &proto::ExecuteServiceRequest { key: 1 });
    client.send(7, &proto::PingRequest {});
    client.expect_frame(8);
    drop(client);
    node.close().unwrap();
}

#[test]
fn subscriptions_acknowledged_silently() {
    let (node, _root) = start_node();
    let mut client = Client::authenticate(&node);
    client.send(28, &proto::SubscribeLogsRequest::default());
    client.send(34, &proto::SubscribeHomeassistantServicesRequest {});
    client.send(38, &proto::SubscribeHomeAssistantStatesRequest {});
    client.send(40, &proto::HomeAssistantStateResponse {
        entity_id: "sun.sun".into(),
        state: "below_horizon".into(),
    });
    // No replies to any of those; the connection is still healthy.
    client.send(7, &proto::PingRequest {});
    client.expect_frame(8);
    drop(client);
    node.close().unwrap();
}

#[test]
fn camera_single_shot() {
    let (node, _root) = start_node();
    let mut client = Client::authenticate(&node);
    client.send(45, &proto::CameraImageRequest {
        single: true,
        stream: false,
    });
    let image = proto::CameraImageResponse::decode(&client.expect_frame(44).payload[..]).unwrap();
    assert_eq!(image.key, CAMERA_KEY);
    assert!(image.done);
    assert_eq!(&image.data[..2], &[0xff, 0xd8], "expected a JPEG");
    // Exactly one frame for a single-shot request.
    assert!(client.next_frame(Duration::from_millis(500)).is_none());
    drop(client);
    node.close().unwrap();
}

#[test]
fn camera_stream_delivers_frames() {
    let (node, _root) = start_node();
    let mut client = Client::authenticate(&node);
    client.send(45, &proto::CameraImageRequest {
        single: false,
        stream: true,
    });
    let first = proto::CameraImageResponse::decode(&client.expect_frame(44).payload[..]).unwrap();
    assert!(!first.done);
    // The fake camera produces one frame per second; at least one more
    // must arrive inside the five-second stream window.
    let frame = client
        .next_frame(Duration::from_secs(3))
        .expect("streamed frame");
    assert_eq!(frame.id, 44);
    drop(client);
    node.close().unwrap();
}

#[test]
fn disconnect_request_is_answered_then_closed() {
    let (node, _root) = start_node();
    let mut client = Client::authenticate(&node);
    client.send(5, &proto::DisconnectRequest {});
    client.expect_frame(6);
    assert!(client.eof_within(Duration::from_secs(1)));
    node.close().unwrap();
}

#[test]
fn node_close_announces_disconnect() {
    let (node, _root) = start_node();
    let mut client = Client::authenticate(&node);
    client.send(20, &proto::SubscribeStatesRequest {});
    for _ in 0..3 {
        client.next_frame(Duration::from_secs(5)).expect("snapshot");
    }

    let closer = std::thread::spawn(move || {
        let start = Instant::now();
        node.close().unwrap();
        start.elapsed()
    });

    // The draining connection announces the shutdown; acknowledge it.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let frame = client
            .next_frame(Duration::from_secs(5))
            .expect("disconnect request");
        if frame.id == 5 {
            break;
        }
        assert!(Instant::now() < deadline, "no DisconnectRequest before deadline");
    }
    client.send(6, &proto::DisconnectResponse {});

    let elapsed = closer.join().unwrap();
    assert!(elapsed < Duration::from_secs(5), "shutdown took {:?}", elapsed);
}

#[test]
fn shutdown_with_unresponsive_client_is_bounded() {
    let (node, _root) = start_node();
    let client = Client::authenticate(&node);
    // The client never answers the disconnect announcement; dropping the
    // socket lets the drain finish early. Keep it open but silent.
    let start = Instant::now();
    node.close().unwrap();
    let elapsed = start.elapsed();
    // Bounded by the 5s drain window plus scheduling slack.
    assert!(elapsed < Duration::from_secs(8), "shutdown took {:?}", elapsed);
    drop(client);
}

#[test]
fn node_without_camera_ignores_camera_request() {
    let conf = r#"
periphhome:
  name: pi

api:
  password: "Foo"

light:
  - platform: fake
    name: "fake light"
"#;
    let (node, _root) = start_node_with(conf);
    let mut client = Client::authenticate(&node);
    client.send(45, &proto::CameraImageRequest {
        single: true,
        stream: false,
    });
    assert!(client.next_frame(Duration::from_millis(300)).is_none());
    client.send(7, &proto::PingRequest {});
    client.expect_frame(8);
    drop(client);
    node.close().unwrap();
}

#[test]
fn empty_password_accepts_empty_connect() {
    let conf = "periphhome:\n  name: pi\napi:\n";
    let (node, _root) = start_node_with(conf);
    let mut client = Client::connect(&node);
    client.hello();
    assert!(!client.login("").invalid_password);
    drop(client);
    node.close().unwrap();
}
