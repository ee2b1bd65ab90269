//! Path traversal shared by secret and group lookups.

use serde_json::Value;

/// Steps into a value by one segment.
///
/// Mappings are indexed by key. Sequences are indexed by position when the
/// segment is numeric, otherwise by the element whose `name` field equals
/// the segment.
pub(crate) fn step<'a>(value: &'a Value, segment: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().map_or_else(
            |_| {
                items
                    .iter()
                    .find(|item| item.get("name").and_then(Value::as_str) == Some(segment))
            },
            |index| items.get(index),
        ),
        _ => None,
    }
}

/// Follows every segment in turn.
pub(crate) fn lookup_path<'a, 'p>(
    root: &'a Value,
    segments: impl IntoIterator<Item = &'p str>,
) -> Option<&'a Value> {
    segments.into_iter().try_fold(root, step)
}
