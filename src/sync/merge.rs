use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Fields that change on every write and never count as conflicts.
pub const DEFAULT_IGNORED_FIELDS: [&str; 6] = [
	"updated_at",
	"modified_at",
	"updatedAt",
	"modifiedAt",
	"version",
	"_version",
];

/// Merge a client value into a server value.
///
/// `Null` counts as absent on either side. Arrays are merged by `id` when
/// their entries carry one and as a union otherwise, objects key by key,
/// and scalars prefer the client unless it is blank (empty string, zero).
/// `merge_values(v, v) == v` for every `v`.
pub fn merge_values(client: &Value, server: &Value) -> Value {
	match (client, server) {
		(Value::Null, other) | (other, Value::Null) => other.clone(),
		(Value::Array(a), Value::Array(b)) => Value::Array(merge_arrays(a, b)),
		(Value::Object(a), Value::Object(b)) => Value::Object(merge_objects(a, b)),
		(Value::String(a), Value::String(b)) => {
			if a.trim().is_empty() {
				Value::String(b.clone())
			} else {
				Value::String(a.clone())
			}
		}
		(Value::Number(a), Value::Number(_)) => {
			if a.as_f64() == Some(0.0) {
				server.clone()
			} else {
				client.clone()
			}
		}
		// Booleans and mismatched types: the client expressed intent.
		_ => client.clone(),
	}
}

fn entry_id(v: &Value) -> Option<&Value> {
	v.as_object().and_then(|o| o.get("id")).filter(|id| !id.is_null())
}

/// Start from the server array. Each tagged client entry claims the first
/// unclaimed server entry with the same id and is merged into it; untagged
/// client entries are added only when the value is not already present.
/// Repeats inside the server array are left alone so that merging a value
/// with itself returns it unchanged.
fn merge_arrays(client: &[Value], server: &[Value]) -> Vec<Value> {
	let mut merged: Vec<Value> = server.to_vec();
	let mut claimed = vec![false; server.len()];

	for item in client {
		let Some(id) = entry_id(item) else {
			if !merged.contains(item) {
				merged.push(item.clone());
			}
			continue;
		};
		match (0..server.len()).find(|&j| !claimed[j] && entry_id(&server[j]) == Some(id)) {
			Some(j) => {
				claimed[j] = true;
				merged[j] = merge_values(item, &server[j]);
			}
			None => merged.push(item.clone()),
		}
	}

	merged
}

fn merge_objects(client: &Map<String, Value>, server: &Map<String, Value>) -> Map<String, Value> {
	let mut merged = server.clone();
	for (key, cv) in client {
		let value = match server.get(key) {
			Some(sv) => merge_values(cv, sv),
			None => cv.clone(),
		};
		merged.insert(key.clone(), value);
	}
	merged
}

/// Top-level fields present on both sides whose values differ, excluding
/// `ignore`. Fields present on one side only are additions, not conflicts.
/// Returned in key order.
pub fn detect_conflicts(client: &Value, server: &Value, ignore: &[&str]) -> Vec<String> {
	let (Some(c), Some(s)) = (client.as_object(), server.as_object()) else {
		return Vec::new();
	};

	let keys: BTreeSet<&String> = c.keys().chain(s.keys()).collect();
	keys.into_iter()
		.filter(|k| !ignore.contains(&k.as_str()))
		.filter(|k| match (c.get(*k), s.get(*k)) {
			(Some(cv), Some(sv)) => cv != sv,
			_ => false,
		})
		.cloned()
		.collect()
}

/// Look up a dot-separated path such as `details.budget.total`.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
	path.split('.')
		.try_fold(value, |current, segment| current.as_object()?.get(segment))
}

/// Set (or with `None`, remove) the value at a dot-separated path,
/// creating intermediate objects as needed.
pub fn set_path(value: &mut Value, path: &str, new_value: Option<Value>) {
	let mut segments: Vec<&str> = path.split('.').collect();
	let Some(last) = segments.pop() else {
		return;
	};

	let Some(new_value) = new_value else {
		let parent = segments
			.into_iter()
			.try_fold(value, |current, segment| current.as_object_mut()?.get_mut(segment));
		if let Some(map) = parent.and_then(Value::as_object_mut) {
			map.remove(last);
		}
		return;
	};

	let mut current = value;
	for segment in segments {
		if !current.is_object() {
			*current = Value::Object(Map::new());
		}
		let Some(map) = current.as_object_mut() else {
			return;
		};
		current = map
			.entry(segment.to_string())
			.or_insert_with(|| Value::Object(Map::new()));
	}

	if !current.is_object() {
		*current = Value::Object(Map::new());
	}
	if let Some(map) = current.as_object_mut() {
		map.insert(last.to_string(), new_value);
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn test_array_merge_by_id() {
		let client = json!([{"id": 1, "name": "A"}]);
		let server = json!([{"id": 1, "name": "B"}, {"id": 2, "name": "C"}]);
		assert_eq!(
			merge_values(&client, &server),
			json!([{"id": 1, "name": "A"}, {"id": 2, "name": "C"}])
		);
	}

	#[test]
	fn test_array_merge_appends_client_only_entries() {
		let client = json!([{"id": 3, "name": "D"}, {"id": 1, "role": "owner"}]);
		let server = json!([{"id": 1, "name": "B"}]);
		assert_eq!(
			merge_values(&client, &server),
			json!([{"id": 1, "name": "B", "role": "owner"}, {"id": 3, "name": "D"}])
		);
	}

	#[test]
	fn test_scalar_array_union() {
		let client = json!(["beach", "museum"]);
		let server = json!(["museum", "hike"]);
		assert_eq!(merge_values(&client, &server), json!(["museum", "hike", "beach"]));

		let client = json!(["beach", "beach", "museum", "beach"]);
		assert_eq!(merge_values(&client, &server), json!(["museum", "hike", "beach"]));
	}

	#[test]
	fn test_object_merge_is_recursive() {
		let client = json!({"title": "Rome", "budget": {"total": 0, "currency": "EUR"}});
		let server = json!({"title": "Roma", "budget": {"total": 900}, "owner": "bob"});
		assert_eq!(
			merge_values(&client, &server),
			json!({"title": "Rome", "budget": {"total": 900, "currency": "EUR"}, "owner": "bob"})
		);
	}

	#[test]
	fn test_primitive_preferences() {
		assert_eq!(merge_values(&json!(""), &json!("server")), json!("server"));
		assert_eq!(merge_values(&json!("  "), &json!("server")), json!("server"));
		assert_eq!(merge_values(&json!("client"), &json!("server")), json!("client"));
		assert_eq!(merge_values(&json!(0), &json!(7)), json!(7));
		assert_eq!(merge_values(&json!(3), &json!(7)), json!(3));
		assert_eq!(merge_values(&json!(false), &json!(true)), json!(false));
		assert_eq!(merge_values(&json!("5"), &json!(5)), json!("5"));
	}

	#[test]
	fn test_null_is_absent() {
		assert_eq!(merge_values(&Value::Null, &json!({"a": 1})), json!({"a": 1}));
		assert_eq!(merge_values(&json!([1]), &Value::Null), json!([1]));
		assert_eq!(merge_values(&Value::Null, &Value::Null), Value::Null);
	}

	#[test]
	fn test_merge_is_idempotent() {
		let samples = vec![
			Value::Null,
			json!(true),
			json!(0),
			json!(-2.5),
			json!(""),
			json!("text"),
			json!([1, 1, 2]),
			json!([{"id": 1, "tags": ["a", "a"]}, {"id": 1, "x": 0}, {"name": "no id"}]),
			json!({"nested": {"list": [{"id": "p1", "n": null}], "empty": {}}, "z": [[], [1]]}),
		];
		for v in samples {
			assert_eq!(merge_values(&v, &v), v, "merge(v, v) != v for {}", v);
		}
	}

	#[test]
	fn test_detect_conflicts_ignores_metadata_and_additions() {
		let client = json!({"title": "A", "notes": "x", "updated_at": 1, "version": 2, "extra": true});
		let server = json!({"title": "B", "notes": "x", "updated_at": 9, "version": 3, "owner": "bob"});
		assert_eq!(
			detect_conflicts(&client, &server, &DEFAULT_IGNORED_FIELDS),
			vec!["title".to_string()]
		);
	}

	#[test]
	fn test_detect_conflicts_deep_equality() {
		let client = json!({"budget": {"total": 10}, "tags": ["a"]});
		let server = json!({"budget": {"total": 10}, "tags": ["b"]});
		assert_eq!(detect_conflicts(&client, &server, &[]), vec!["tags".to_string()]);
		assert!(detect_conflicts(&json!(1), &server, &[]).is_empty());
	}

	#[test]
	fn test_paths() {
		let mut doc = json!({"details": {"budget": {"total": 10}}});
		assert_eq!(get_path(&doc, "details.budget.total"), Some(&json!(10)));
		assert_eq!(get_path(&doc, "details.missing"), None);

		set_path(&mut doc, "details.budget.currency", Some(json!("EUR")));
		set_path(&mut doc, "meta.source", Some(json!("offline")));
		set_path(&mut doc, "details.budget.total", None);
		assert_eq!(
			doc,
			json!({"details": {"budget": {"currency": "EUR"}}, "meta": {"source": "offline"}})
		);
	}
}
