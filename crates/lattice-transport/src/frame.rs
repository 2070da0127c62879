//! Shape-based classification of inbound frames.
//!
//! After the handshake every frame is JSON. Frames carry no envelope; the
//! dispatcher tells them apart by shape, in a fixed priority order. Object
//! frames matching no shape are dropped by the caller.

use serde_json::Value;

use lattice_core::InstancePayload;

/// A classified inbound frame.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerFrame {
    /// Ordered batch of instance payloads (array root).
    Instances(Vec<InstancePayload>),
    /// Response to an outbound RPC call.
    ActionResponse {
        call_id: u64,
        result: Option<Value>,
        error: Option<Value>,
    },
    /// Server-pushed runtime variable update.
    RuntimeVar { name: String, value: Value },
    /// Multi-anchor initialization; an empty list signals an empty anchor
    /// set.
    InitialAnchors(Vec<i64>),
    /// Insert an anchor at the head of the sequence.
    PrependAnchor(i64),
    /// System broadcast for the user.
    System(Value),
    /// Server-initiated graceful rollover; the transport reconnects.
    Maintenance(Value),
    /// Connection status; 200 means connected.
    Status {
        status_code: u16,
        error: Option<String>,
    },
}

/// Classify one parsed frame by shape, in priority order.
///
/// Returns `None` for object frames matching no known shape and for array
/// frames whose payloads do not parse; per the error policy both are logged
/// and dropped by the caller.
#[must_use]
pub fn classify(value: Value) -> Option<ServerFrame> {
    if value.is_array() {
        let payloads: Vec<InstancePayload> = serde_json::from_value(value).ok()?;
        return Some(ServerFrame::Instances(payloads));
    }

    let obj = value.as_object()?;

    if let Some(call_id) = obj.get("callId").and_then(Value::as_u64) {
        return Some(ServerFrame::ActionResponse {
            call_id,
            result: obj.get("result").cloned(),
            error: obj.get("error").cloned(),
        });
    }

    if let Some(name) = obj.get("runtimeVar").and_then(Value::as_str) {
        return Some(ServerFrame::RuntimeVar {
            name: name.to_owned(),
            value: obj.get("value").cloned().unwrap_or(Value::Null),
        });
    }

    if let Some(ids) = obj.get("initialAnchors").and_then(Value::as_array) {
        let ids = ids.iter().filter_map(Value::as_i64).collect();
        return Some(ServerFrame::InitialAnchors(ids));
    }

    if let Some(id) = obj.get("prependAnchor").and_then(Value::as_i64) {
        return Some(ServerFrame::PrependAnchor(id));
    }

    match obj.get("source").and_then(Value::as_str) {
        Some("system") => return Some(ServerFrame::System(value.clone())),
        Some("maintenance") => return Some(ServerFrame::Maintenance(value.clone())),
        _ => {}
    }

    if let Some(status_code) = obj.get("status_code").and_then(Value::as_u64) {
        return Some(ServerFrame::Status {
            status_code: u16::try_from(status_code).ok()?,
            error: obj
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_owned),
        });
    }

    None
}
