//! Structural diff between two state snapshots.
//!
//! Used by the broadcast discipline: after every mutation pass the room
//! diffs the new full snapshot against the previous one and only
//! non-empty diffs are logged and pushed to agents.

use serde_json::Value;

/// Presentation-layer noise excluded from diffs so a UI countdown
/// cannot spam the log and the agent state feed.
const NOISY_KEYS: &[&str] = &["turn_timer"];

/// Returns the keys of `curr` whose values differ from `prev`,
/// recursing into nested objects. Keys absent from `curr` are not
/// reported (state fields are never removed, only changed).
pub fn find_differences(prev: &Value, curr: &Value) -> Value {
    let mut out = serde_json::Map::new();
    if let (Some(prev_map), Some(curr_map)) = (prev.as_object(), curr.as_object()) {
        for (key, curr_val) in curr_map {
            match prev_map.get(key) {
                Some(prev_val) if prev_val == curr_val => {}
                Some(prev_val) if prev_val.is_object() && curr_val.is_object() => {
                    out.insert(key.clone(), find_differences(prev_val, curr_val));
                }
                _ => {
                    out.insert(key.clone(), curr_val.clone());
                }
            }
        }
    } else if prev != curr {
        return curr.clone();
    }
    Value::Object(out)
}

/// [`find_differences`] with the noisy presentation keys stripped.
/// Returns `None` when nothing of substance changed.
pub fn state_changes(prev: &Value, curr: &Value) -> Option<Value> {
    let mut changes = find_differences(prev, curr);
    if let Some(map) = changes.as_object_mut() {
        for key in NOISY_KEYS {
            map.remove(*key);
        }
        if map.is_empty() {
            return None;
        }
    }
    Some(changes)
}
