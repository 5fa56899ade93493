use serde_json::Value;

/// Returns true if any field set in `desired` is missing from, or different in, `observed`.
///
/// An explicit null in `desired` asks for the field to be unset, so a non-null observed value
/// is drift. Fields only present in `observed` are ignored: the API server (or Konnect) fills in defaults
/// and allocated values such as cluster IPs, and those are not drift. Arrays are compared
/// element-wise, except arrays of strings which are compared as sets (tag lists come back
/// reordered).
pub fn differs(desired: &Value, observed: &Value) -> bool {
    match (desired, observed) {
        (Value::Null, observed) => !observed.is_null(),
        (Value::Object(desired), Value::Object(observed)) => desired.iter().any(|(k, v)| {
            match observed.get(k) {
                Some(o) => differs(v, o),
                None => !is_empty(v),
            }
        }),
        (Value::Array(desired), Value::Array(observed)) => {
            if desired.len() != observed.len() {
                return true;
            }
            if desired.iter().all(Value::is_string) && observed.iter().all(Value::is_string) {
                let mut d: Vec<&str> = desired.iter().filter_map(Value::as_str).collect();
                let mut o: Vec<&str> = observed.iter().filter_map(Value::as_str).collect();
                d.sort_unstable();
                o.sort_unstable();
                return d != o;
            }
            desired.iter().zip(observed).any(|(d, o)| differs(d, o))
        }
        (Value::Number(d), Value::Number(o)) => d.as_f64() != o.as_f64(),
        (d, o) => d != o,
    }
}

fn is_empty(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}
