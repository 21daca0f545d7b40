//! Integration tests for the relay-core protocol layer.
//!
//! These tests drive the public API the way the link reader does: bytes
//! arrive in arbitrary chunks, the streaming decoder reassembles frames and
//! each frame is classified as a response or a push.

use relay_core::{
    encode_frame, protocol::messages::METHOD_OBJECTS_QUERY, ControlState, FrameDecoder,
    PushMessage, SequenceCounter, UpstreamMessage, UpstreamRequest,
};
use serde_json::{json, Value};

/// Feeds `bytes` in `chunk`-sized pieces and collects every classified frame.
fn feed(bytes: &[u8], chunk: usize) -> Vec<UpstreamMessage> {
    let mut decoder = FrameDecoder::new();
    let mut out = Vec::new();
    for piece in bytes.chunks(chunk) {
        decoder.extend(piece);
        while let Some(frame) = decoder.next_frame().expect("frames are well formed") {
            out.push(UpstreamMessage::classify(frame).expect("frames classify"));
        }
    }
    assert_eq!(decoder.buffered(), 0, "no bytes may remain buffered");
    out
}

fn wire(values: &[Value]) -> Vec<u8> {
    values
        .iter()
        .flat_map(|v| encode_frame(v).expect("encode must succeed"))
        .collect()
}

#[test]
fn test_request_encodes_with_fresh_ids() {
    let counter = SequenceCounter::starting_at(1);
    let first = UpstreamRequest {
        id: counter.next(),
        method: METHOD_OBJECTS_QUERY.into(),
        params: json!({"objects": {"print_stats": null}}),
    };
    let second = UpstreamRequest {
        id: counter.next(),
        ..first.clone()
    };

    let bytes = wire(&[first.to_value(), second.to_value()]);
    let mut decoder = FrameDecoder::new();
    decoder.extend(&bytes);

    let a = decoder.next_frame().unwrap().unwrap();
    let b = decoder.next_frame().unwrap().unwrap();
    assert_eq!(a["id"], 1);
    assert_eq!(b["id"], 2);
    assert_eq!(b["method"], "objects/query");
}

#[test]
fn test_byte_at_a_time_reassembly_preserves_wire_order() {
    // Arrange: a push, two out-of-order responses and a state change
    let bytes = wire(&[
        json!({"method": "process_status_update", "params": {"status": {"fan": {"speed": 0.5}}, "eventtime": 1.0}}),
        json!({"id": 9, "result": {"b": true}}),
        json!({"id": 8, "result": {"a": true}}),
        json!({"method": "state_changed", "params": {"state": "ready", "message": ""}}),
    ]);

    // Act
    let messages = feed(&bytes, 1);

    // Assert
    assert_eq!(messages.len(), 4);
    assert!(matches!(messages[0], UpstreamMessage::Push(PushMessage::StatusUpdate { .. })));
    assert!(matches!(messages[1], UpstreamMessage::Response { id: 9, .. }));
    assert!(matches!(messages[2], UpstreamMessage::Response { id: 8, .. }));
    match &messages[3] {
        UpstreamMessage::Push(PushMessage::StateChanged(status)) => {
            assert_eq!(status.state, ControlState::Ready)
        }
        other => panic!("unexpected message {other:?}"),
    }
}

#[test]
fn test_newline_delimited_input_is_accepted() {
    let bytes = b"{\"id\":1,\"result\":{}}\n{\"method\":\"process_gcode_response\",\"params\":{\"response\":\"ok\"}}\n";
    let messages = feed(bytes, 7);
    assert_eq!(messages.len(), 2);
    assert_eq!(
        messages[1],
        UpstreamMessage::Push(PushMessage::GcodeResponse("ok".into()))
    );
}

#[test]
fn test_malformed_frame_between_good_frames_is_skipped() {
    let mut bytes = wire(&[json!({"id": 1, "result": 1})]);
    bytes.extend_from_slice(b"not json\x03");
    bytes.extend(wire(&[json!({"id": 2, "result": 2})]));

    let mut decoder = FrameDecoder::new();
    decoder.extend(&bytes);

    assert!(decoder.next_frame().unwrap().is_some());
    assert!(decoder.next_frame().is_err());
    let last = decoder.next_frame().unwrap().unwrap();
    assert_eq!(last["id"], 2);
}
