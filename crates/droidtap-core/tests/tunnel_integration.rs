//! End-to-end tests for the tunnel: a real client, a real tunnel server and a
//! mock device service connected over loopback.

mod common;

use std::time::Duration;

use futures_util::SinkExt;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use common::*;
use droidtap_core::config::DroidtapConfig;
use droidtap_core::element::{Point, Size};
use droidtap_core::enrichment::{ElementDataRequest, TunnelMessage};

fn element_request(x: i32, y: i32) -> Message {
    Message::Text(
        TunnelMessage::GetElementData(ElementDataRequest {
            udid: "emulator-5554".into(),
            point: Point::new(x, y),
            screen_size: Size::new(720, 1280),
        })
        .to_text(),
    )
}

#[tokio::test]
async fn element_request_is_answered_and_never_relayed() {
    let mut device = MockDevice::start().await;
    let snapshots = CannedSnapshots::with(sample_hierarchy());
    let (addr, _shutdown) = start_tunnel(
        ScriptedForwarder::to_port(device.addr.port()),
        snapshots.clone(),
        DroidtapConfig::default(),
    )
    .await;
    let mut client = connect_client(&route_url(addr, "emulator-5554")).await;

    client.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
    client.send(element_request(50, 60)).await.unwrap();
    client.send(Message::Binary(vec![4, 5, 6])).await.unwrap();

    // Exactly one result comes back, echoing the request.
    let Some(Message::Text(text)) = next_data(&mut client).await else {
        panic!("expected an elementDataResult text frame");
    };
    let Some(TunnelMessage::ElementDataResult(result)) = TunnelMessage::parse(&text) else {
        panic!("unexpected frame: {text}");
    };
    assert_eq!(result.original_point, Some(Point::new(50, 60)));
    assert_eq!(result.original_screen_size, Some(Size::new(720, 1280)));
    let data = result.element_data.expect("button under the point");
    assert_eq!(
        data.xpath,
        "//android.widget.Button[@resource-id='com.example:id/ok' and @text='OK' and @index='0']"
    );
    assert_eq!(snapshots.requests.lock().unwrap().as_slice(), ["emulator-5554"]);

    // The device sees only the binary frames, in order.
    assert_eq!(device.next_frame().await, Some(Message::Binary(vec![1, 2, 3])));
    assert_eq!(device.next_frame().await, Some(Message::Binary(vec![4, 5, 6])));
    client.send(Message::Binary(vec![9])).await.unwrap();
    assert_eq!(device.next_frame().await, Some(Message::Binary(vec![9])));

    // And no second result arrives.
    let extra = tokio::time::timeout(Duration::from_millis(200), next_data(&mut client)).await;
    assert!(extra.is_err() || extra.unwrap().is_none());
}

#[tokio::test]
async fn other_text_frames_are_relayed_unchanged() {
    let mut device = MockDevice::start().await;
    let (addr, _shutdown) = start_tunnel(
        ScriptedForwarder::to_port(device.addr.port()),
        CannedSnapshots::with(sample_hierarchy()),
        DroidtapConfig::default(),
    )
    .await;
    let mut client = connect_client(&route_url(addr, "d")).await;

    client.send(Message::Text("not json".into())).await.unwrap();
    client
        .send(Message::Text(r#"{"type":"getElementData"}"#.into()))
        .await
        .unwrap();

    assert_eq!(device.next_frame().await, Some(Message::Text("not json".into())));
    assert_eq!(
        device.next_frame().await,
        Some(Message::Text(r#"{"type":"getElementData"}"#.into()))
    );
}

#[tokio::test]
async fn snapshot_failure_answers_null_element() {
    let device = MockDevice::start().await;
    let (addr, _shutdown) = start_tunnel(
        ScriptedForwarder::to_port(device.addr.port()),
        CannedSnapshots::unavailable(),
        DroidtapConfig::default(),
    )
    .await;
    let mut client = connect_client(&route_url(addr, "d")).await;

    client.send(element_request(10, 10)).await.unwrap();
    let Some(Message::Text(text)) = next_data(&mut client).await else {
        panic!("expected a result frame");
    };
    let json: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(json["type"], "elementDataResult");
    assert!(json["data"]["elementData"].is_null());
    assert_eq!(json["data"]["originalPoint"]["x"], 10);
}

#[tokio::test]
async fn device_frames_reach_client() {
    let mut device = MockDevice::start().await;
    let (addr, _shutdown) = start_tunnel(
        ScriptedForwarder::to_port(device.addr.port()),
        CannedSnapshots::unavailable(),
        DroidtapConfig::default(),
    )
    .await;
    let mut client = connect_client(&route_url(addr, "d")).await;
    // The device endpoint is up once a relayed frame arrives.
    client.send(Message::Binary(vec![0])).await.unwrap();
    device.next_frame().await.unwrap();

    device.send(Message::Binary(vec![7, 7]));
    device.send(Message::Text("device-info".into()));
    assert_eq!(next_data(&mut client).await, Some(Message::Binary(vec![7, 7])));
    assert_eq!(next_data(&mut client).await, Some(Message::Text("device-info".into())));
}

#[tokio::test]
async fn device_close_code_is_relayed() {
    let mut device = MockDevice::start().await;
    let (addr, _shutdown) = start_tunnel(
        ScriptedForwarder::to_port(device.addr.port()),
        CannedSnapshots::unavailable(),
        DroidtapConfig::default(),
    )
    .await;
    let mut client = connect_client(&route_url(addr, "d")).await;
    client.send(Message::Binary(vec![0])).await.unwrap();
    device.next_frame().await.unwrap();

    device.close_with(4001, "stream ended");
    assert_eq!(next_close(&mut client).await, Some((4001, "stream ended".into())));
}

#[tokio::test]
async fn client_close_is_relayed_to_device() {
    let mut device = MockDevice::start().await;
    let (addr, _shutdown) = start_tunnel(
        ScriptedForwarder::to_port(device.addr.port()),
        CannedSnapshots::unavailable(),
        DroidtapConfig::default(),
    )
    .await;
    let mut client = connect_client(&route_url(addr, "d")).await;
    client.send(Message::Binary(vec![0])).await.unwrap();
    device.next_frame().await.unwrap();

    client
        .close(Some(CloseFrame {
            code: CloseCode::from(4002),
            reason: "operator left".into(),
        }))
        .await
        .unwrap();

    match device.next_frame().await {
        Some(Message::Close(Some(frame))) => {
            assert_eq!(u16::from(frame.code), 4002);
            assert_eq!(frame.reason, "operator left");
        }
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn forward_failure_closes_with_4005() {
    let forwarder = ScriptedForwarder::failing("device offline");
    let (addr, _shutdown) = start_tunnel(
        forwarder.clone(),
        CannedSnapshots::unavailable(),
        DroidtapConfig::default(),
    )
    .await;
    let mut client = connect_client(&route_url(addr, "emulator-5554")).await;

    let (code, reason) = next_close(&mut client).await.expect("close frame");
    assert_eq!(code, 4005);
    assert_eq!(reason, "Failed to start service: port forward failed: device offline");
    assert_eq!(
        forwarder.calls.lock().unwrap().as_slice(),
        [("emulator-5554".to_string(), "tcp:8886".to_string())]
    );
}

#[tokio::test]
async fn invalid_route_closes_with_4003() {
    let (addr, _shutdown) = start_tunnel(
        ScriptedForwarder::to_port(1),
        CannedSnapshots::unavailable(),
        DroidtapConfig::default(),
    )
    .await;

    let mut client = connect_client(&format!("ws://{addr}/?action=proxy-adb&udid=d")).await;
    let (code, reason) = next_close(&mut client).await.expect("close frame");
    assert_eq!(code, 4003);
    assert!(reason.contains("\"remote\""), "reason was {reason}");

    let mut client = connect_client(&format!("ws://{addr}/?action=stream")).await;
    assert_eq!(
        next_close(&mut client).await,
        Some((4003, "Unsupported action".to_string()))
    );
}

#[tokio::test]
async fn frames_sent_before_device_is_ready_arrive_in_order() {
    let mut device = MockDevice::start().await;
    let (addr, _shutdown) = start_tunnel(
        ScriptedForwarder::delayed(device.addr.port(), Duration::from_millis(300)),
        CannedSnapshots::with(sample_hierarchy()),
        DroidtapConfig::default(),
    )
    .await;
    let mut client = connect_client(&route_url(addr, "d")).await;

    for i in 0..5u8 {
        client.send(Message::Binary(vec![i])).await.unwrap();
    }
    // Answered even though the device is not connected yet.
    client.send(element_request(50, 50)).await.unwrap();
    assert!(matches!(next_data(&mut client).await, Some(Message::Text(_))));

    for i in 0..5u8 {
        assert_eq!(device.next_frame().await, Some(Message::Binary(vec![i])));
    }
}

#[tokio::test]
async fn pending_overflow_closes_with_4008() {
    let device = MockDevice::start().await;
    let config = DroidtapConfig {
        max_pending_frames: 2,
        ..DroidtapConfig::default()
    };
    let (addr, _shutdown) = start_tunnel(
        ScriptedForwarder::delayed(device.addr.port(), Duration::from_secs(3)),
        CannedSnapshots::unavailable(),
        config,
    )
    .await;
    let mut client = connect_client(&route_url(addr, "d")).await;

    for i in 0..3u8 {
        client.send(Message::Binary(vec![i])).await.unwrap();
    }
    let (code, _) = next_close(&mut client).await.expect("close frame");
    assert_eq!(code, 4008);
}

#[tokio::test]
async fn shutdown_closes_open_sessions() {
    let mut device = MockDevice::start().await;
    let (addr, shutdown) = start_tunnel(
        ScriptedForwarder::to_port(device.addr.port()),
        CannedSnapshots::unavailable(),
        DroidtapConfig::default(),
    )
    .await;
    let mut client = connect_client(&route_url(addr, "d")).await;
    client.send(Message::Binary(vec![0])).await.unwrap();
    device.next_frame().await.unwrap();

    shutdown.cancel();
    let (code, _) = next_close(&mut client).await.expect("close frame");
    assert_eq!(code, 1001);
}
