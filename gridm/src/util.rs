use serde_json::Value;

/*
 * Whether `actual` holds everything `desired` asks for. Objects may carry
 * extra keys (fields defaulted by the API server or added by a mutating
 * admission webhook), arrays must have the same length and contain each
 * other element-wise, anything else must be equal. A null in `desired`
 * matches a missing key.
 */
pub fn deep_contains(actual: &Value, desired: &Value) -> bool {
    match (actual, desired) {
	(Value::Object(actual), Value::Object(desired)) => {
	    desired.iter().all(|(key, want)| match actual.get(key) {
		Some(have) => deep_contains(have, want),
		None => want.is_null(),
	    })
	},
	(Value::Array(actual), Value::Array(desired)) => {
	    actual.len() == desired.len() &&
		actual.iter().zip(desired.iter()).all(|(have, want)| deep_contains(have, want))
	},
	(actual, desired) => actual == desired,
    }
}
