//! Broadcast predicates for observers and completion trackers.

use ezlo_protocol::constants::status;
use ezlo_protocol::{Message, subclass};
use serde_json::Value;

/// Matches messages tagged `id: "ui_broadcast"`.
pub fn is_broadcast() -> impl Fn(&Message) -> bool + Send + Sync + 'static {
    |msg: &Message| msg.is_broadcast()
}

/// Matches broadcasts of one `msg_subclass`.
pub fn broadcast_subclass(name: &str) -> impl Fn(&Message) -> bool + Send + Sync + 'static {
    let name = name.to_string();
    move |msg: &Message| msg.msg_subclass() == Some(name.as_str())
}

/// Matches the progress broadcast reporting that `scene_id` finished.
pub fn scene_finished(scene_id: &str) -> impl Fn(&Message) -> bool + Send + Sync + 'static {
    let scene_id = scene_id.to_string();
    move |msg: &Message| {
        msg.msg_subclass() == Some(subclass::SCENE_RUN_PROGRESS)
            && id_matches(msg.pointer("/result/scene_id"), &scene_id)
            && msg.pointer("/result/status").and_then(Value::as_str) == Some(status::SCENE_FINISHED)
    }
}

/// Matches the broadcast reporting a completed switch into `mode_id`.
///
/// Only the destination mode is checked, so a switch into the same mode
/// started elsewhere completes the wait too.
pub fn house_mode_switched(mode_id: &str) -> impl Fn(&Message) -> bool + Send + Sync + 'static {
    let mode_id = mode_id.to_string();
    move |msg: &Message| {
        msg.msg_subclass() == Some(subclass::MODES_SWITCHED)
            && id_matches(msg.pointer("/result/to"), &mode_id)
            && msg.pointer("/result/status").and_then(Value::as_str)
                == Some(status::MODE_SWITCH_DONE)
    }
}

/// Hub firmwares send ids as strings or bare numbers.
fn id_matches(value: Option<&Value>, expected: &str) -> bool {
    match value {
        Some(Value::String(s)) => s == expected,
        Some(Value::Number(n)) => n.to_string() == expected,
        _ => false,
    }
}
