use super::protocol::*;
use super::tunnel::{backoff, ws_url};
use crate::config::FederationConfig;
use crate::error::BusError;
use crate::payload::Payload;
use crate::channel::ChannelEvent;
use crate::queue::{AttachOptions, ConsumeOptions, QueueEvent};
use serde_json::{json, Value};
use std::time::Duration;

#[test]
fn test_ws_url_maps_http_schemes() {
    assert_eq!(ws_url("http://host:9000/federate"), "ws://host:9000/federate");
    assert_eq!(ws_url("https://host/federate"), "wss://host/federate");
    assert_eq!(ws_url("ws://host/federate"), "ws://host/federate");
}

#[test]
fn test_backoff_grows_and_is_capped() {
    let config = FederationConfig {
        reconnect_delay_ms: 100,
        max_reconnect_delay_ms: 1000,
        ..FederationConfig::default()
    };

    let first = backoff(&config, 1);
    assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(125));

    let third = backoff(&config, 3);
    assert!(third >= Duration::from_millis(400) && third < Duration::from_millis(500));

    let late = backoff(&config, 30);
    assert!(late >= Duration::from_millis(1000) && late < Duration::from_millis(1250));
}

#[test]
fn test_call_wire_shape() {
    let (method, args) = encode_call(&QueueCall::Push(Payload::from("hello"))).unwrap();
    assert_eq!(method, "push");
    assert!(!args.is_null());

    let (method, args) = encode_call(&QueueCall::Count).unwrap();
    assert_eq!(method, "count");
    assert_eq!(args, Value::Null);

    let (method, _) = encode_call(&QueueCall::MetadataSet {
        key: "k".into(),
        value: "v".into(),
    })
    .unwrap();
    assert_eq!(method, "metadata_set");
}

#[test]
fn test_decode_call_rebuilds_variants() {
    let call: QueueCall = decode_call("count", Value::Null).unwrap();
    assert_eq!(call, QueueCall::Count);

    let options = ConsumeOptions::default().reliable().max(3);
    let (method, args) = encode_call(&QueueCall::Consume(options.clone())).unwrap();
    let call: QueueCall = decode_call(&method, args).unwrap();
    assert_eq!(call, QueueCall::Consume(options));

    let call: ChannelCall = decode_call("ack", json!(7)).unwrap();
    assert_eq!(call, ChannelCall::Ack(7));
}

#[test]
fn test_decode_unknown_method_is_protocol_error() {
    let err = decode_call::<PubSubCall>("explode", Value::Null).unwrap_err();
    assert!(matches!(err, BusError::Protocol(_)));
}

#[test]
fn test_replay_classification() {
    assert_eq!(QueueCall::Attach(AttachOptions::default()).replay(), Replay::Record);
    assert_eq!(QueueCall::Consume(ConsumeOptions::default()).replay(), Replay::Record);
    assert_eq!(QueueCall::Push(Payload::from("x")).replay(), Replay::None);
    assert_eq!(QueueCall::Detach.replay(), Replay::Forget(&["attach", "consume"]));
    assert_eq!(QueueCall::Stop.replay(), Replay::Forget(&["consume"]));

    assert_eq!(ChannelCall::Listen(Default::default()).replay(), Replay::Record);
    assert_eq!(
        ChannelCall::Disconnect.replay(),
        Replay::Forget(&["connect", "listen"])
    );

    assert_eq!(PubSubCall::Subscribe.replay(), Replay::Record);
    assert_eq!(PubSubCall::Publish(Payload::from("x")).replay(), Replay::None);
    assert_eq!(PersistedCall::Load.replay(), Replay::None);
}

#[test]
fn test_request_uses_camel_case_fields() {
    let request = RpcRequest {
        correlation_id: 4,
        link_id: 2,
        entity_type: EntityKind::Queue,
        entity_name: "jobs".into(),
        method: METHOD_OPEN.into(),
        args: Value::Null,
    };
    let json = serde_json::to_value(&request).unwrap();
    assert_eq!(json["correlationId"], 4);
    assert_eq!(json["linkId"], 2);
    assert_eq!(json["entityType"], "queue");
    assert_eq!(json["entityName"], "jobs");
}

#[test]
fn test_error_frame_carries_bus_error() {
    let frame = RpcResponse::error(9, &BusError::Unauthorized);
    assert_eq!(frame.kind, ResponseKind::Error);
    assert_eq!(frame.correlation_id, 9);
    assert_eq!(frame.into_error(), BusError::Unauthorized);

    let garbage = RpcResponse {
        correlation_id: 1,
        kind: ResponseKind::Error,
        payload: json!("nonsense"),
    };
    assert!(matches!(garbage.into_error(), BusError::Protocol(_)));
}

#[test]
fn test_event_frame_correlates_by_link() {
    let frame = RpcResponse::event(12, json!({"event": "connect"}));
    assert_eq!(frame.correlation_id, 12);
    assert_eq!(frame.kind, ResponseKind::Event);
}

#[test]
fn test_ended_sessions_retire_recorded_calls() {
    let stopped = serde_json::to_value(QueueEvent::Consuming(false)).unwrap();
    assert_eq!(retired_by(EntityKind::Queue, &stopped).to_vec(), vec!["consume"]);

    let started = serde_json::to_value(QueueEvent::Consuming(true)).unwrap();
    assert!(retired_by(EntityKind::Queue, &started).is_empty());

    let ended = serde_json::to_value(ChannelEvent::End).unwrap();
    assert_eq!(
        retired_by(EntityKind::Channel, &ended).to_vec(),
        vec!["connect", "listen"]
    );
    assert!(retired_by(EntityKind::Queue, &ended).is_empty());

    let message = serde_json::to_value(QueueEvent::Message {
        payload: Payload::from("x"),
        id: None,
    })
    .unwrap();
    assert!(retired_by(EntityKind::Queue, &message).is_empty());
}
