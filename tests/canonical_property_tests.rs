//! Property-based tests for payload canonicalization
//!
//! Signatures are only as good as the byte representation they hash, so these
//! tests check that canonical bytes ignore how an object was built but change
//! with any change in content.

use batch_record::canonical::{canonical_string, canonicalize, payload_hash};
use proptest::prelude::*;
use serde_json::{Map, Number, Value, json};

/// Strategy for arbitrary json values, a few levels deep
fn json_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| json!(n)),
        any::<f64>().prop_filter_map("finite", |f| Number::from_f64(f).map(Value::Number)),
        "[a-zA-Z0-9 _\"\\\\]{0,12}".prop_map(Value::String),
    ];
    leaf.prop_recursive(3, 32, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
            prop::collection::vec(("[a-z]{1,6}", inner), 0..6).prop_map(|entries| {
                Value::Object(entries.into_iter().collect::<Map<String, Value>>())
            }),
        ]
    })
}

/// Rebuilds every object with its entries inserted in reverse order.
fn reinsert_reversed(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut rebuilt = Map::new();
            for (key, item) in map.iter().rev() {
                rebuilt.insert(key.clone(), reinsert_reversed(item));
            }
            Value::Object(rebuilt)
        }
        Value::Array(items) => Value::Array(items.iter().map(reinsert_reversed).collect()),
        scalar => scalar.clone(),
    }
}

proptest! {
    /// Insertion order of object keys never changes the canonical bytes
    #[test]
    fn key_order_is_irrelevant(value in json_strategy()) {
        let reordered = reinsert_reversed(&value);
        prop_assert_eq!(canonicalize(&value).unwrap(), canonicalize(&reordered).unwrap());
    }

    /// Canonical text is valid json describing the same value
    #[test]
    fn canonical_text_parses_back(value in json_strategy()) {
        let text = canonical_string(&value);
        let parsed: Value = serde_json::from_str(&text).unwrap();
        prop_assert_eq!(parsed, value);
    }

    /// Swapping two distinct array elements changes the hash
    #[test]
    fn array_order_is_significant(a in any::<i64>(), b in any::<i64>()) {
        prop_assume!(a != b);
        prop_assert_ne!(
            payload_hash(&json!({"items": [a, b]})).unwrap(),
            payload_hash(&json!({"items": [b, a]})).unwrap()
        );
    }

    /// Any change to a signed field changes the hash
    #[test]
    fn value_changes_are_detected(section in "[A-Z][0-9]{1,3}", other in "[A-Z][0-9]{1,3}") {
        prop_assume!(section != other);
        let signed = json!({"action": "COMPLETE_SECTION", "batchRecordId": "B1", "sectionId": section});
        let tampered = json!({"action": "COMPLETE_SECTION", "batchRecordId": "B1", "sectionId": other});
        prop_assert_ne!(payload_hash(&signed).unwrap(), payload_hash(&tampered).unwrap());
    }
}
