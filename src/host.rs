// File: src/host.rs
//
// The host bridge (§4.7 / C7): environment validation at `run` entry, and
// value conversion between the internal `value::Value` and the boundary
// type a caller embeds this crate with. Kept separate from `vm.rs` the way
// the teacher splits `module.rs`/`interpreter.rs` concerns apart — this file
// owns *translation*, the VM owns *execution*.

use std::collections::HashMap;
use std::rc::Rc;

use crate::value::{OrderedMap, Value};

/// The boundary type a host program hands in (env bindings, callback args)
/// and receives back (the final result, args to a native callback). A
/// concrete stand-in for "whatever the host's own value type is" (§6's
/// conversion table), since a Rust library has no single universal dynamic
/// value the way the table's "host nil"/"host bool" prose implies.
#[derive(Debug, Clone)]
pub enum HostValue {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<HostValue>),
    Map(Vec<(String, HostValue)>),
    /// A raw internal value, used only in "raw result" mode (§6
    /// `with_raw_result`) or when a registered callable wants to hand back
    /// something the default table can't express (a closure, say).
    Raw(Value),
}

impl HostValue {
    pub fn string(s: impl Into<String>) -> Self {
        HostValue::String(s.into())
    }
}

/// Host-extensible conversion for opaque host types (§4.7 "A host-extensible
/// registry may add conversions for opaque host types"). Unregistered types
/// fall back to wrapping as `value::HostObject` / `Inspect()`-string egress.
pub trait TypeRegistry {
    fn to_internal(&self, host: &HostValue) -> Option<Value> {
        let _ = host;
        None
    }

    fn to_host(&self, value: &Value) -> Option<HostValue> {
        let _ = value;
        None
    }
}

/// The default registry: no extra conversions, relying entirely on the
/// built-in table.
pub struct DefaultTypeRegistry;

impl TypeRegistry for DefaultTypeRegistry {}

/// Converts a host-supplied value into an internal one (ingress): env
/// bindings and values a native builtin receives back from a host callback.
pub fn to_internal(host: &HostValue, registry: &dyn TypeRegistry) -> Value {
    if let Some(v) = registry.to_internal(host) {
        return v;
    }
    match host {
        HostValue::Nil => Value::Nil,
        HostValue::Bool(b) => Value::Bool(*b),
        HostValue::Int(i) => Value::Int(*i),
        HostValue::Float(f) => Value::Float(*f),
        HostValue::String(s) => Value::string(s.clone()),
        HostValue::Bytes(b) => Value::Bytes(Rc::new(b.clone())),
        HostValue::List(items) => {
            Value::list(items.iter().map(|v| to_internal(v, registry)).collect())
        }
        HostValue::Map(entries) => {
            let mut map = OrderedMap::new();
            for (k, v) in entries {
                map.insert(k.clone(), to_internal(v, registry));
            }
            Value::map(map)
        }
        HostValue::Raw(v) => v.clone(),
    }
}

/// Converts an internal value into a host-facing one (egress): the top-level
/// result and arguments handed to a native callback. Closures/modules/other
/// non-plain-data variants degrade to their `inspect()` string per §6's
/// table, unless `raw` mode is requested.
pub fn to_host(value: &Value, registry: &dyn TypeRegistry, raw: bool) -> HostValue {
    if raw {
        return HostValue::Raw(value.clone());
    }
    if let Some(h) = registry.to_host(value) {
        return h;
    }
    match value {
        Value::Nil => HostValue::Nil,
        Value::Bool(b) => HostValue::Bool(*b),
        Value::Int(i) => HostValue::Int(*i),
        Value::Float(f) => HostValue::Float(*f),
        Value::String(s) => HostValue::String(s.to_string()),
        Value::Bytes(b) => HostValue::Bytes(b.as_ref().clone()),
        Value::List(items) => {
            HostValue::List(items.borrow().iter().map(|v| to_host(v, registry, false)).collect())
        }
        Value::Map(map) => HostValue::Map(
            map.borrow().iter().map(|(k, v)| (k.clone(), to_host(v, registry, false))).collect(),
        ),
        other => HostValue::String(other.inspect()),
    }
}

/// Compares the host-supplied environment's key set against the compiled
/// `Code`'s recorded `env_keys()` (§4.7 point 1 / testable property #8).
/// Extra keys are fine (silently ignored, never referenced since globals
/// resolve by index); any missing key is a hard failure before a single
/// instruction executes.
pub fn missing_globals(env: &HashMap<String, HostValue>, env_keys: &[String]) -> Vec<String> {
    env_keys.iter().filter(|k| !env.contains_key(k.as_str())).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_plain_data() {
        let registry = DefaultTypeRegistry;
        let host = HostValue::List(vec![HostValue::Int(1), HostValue::string("x")]);
        let internal = to_internal(&host, &registry);
        let back = to_host(&internal, &registry, false);
        match back {
            HostValue::List(items) => assert_eq!(items.len(), 2),
            _ => panic!("expected list"),
        }
    }

    #[test]
    fn missing_globals_reports_only_absent_keys() {
        let mut env = HashMap::new();
        env.insert("a".to_string(), HostValue::Int(1));
        let missing = missing_globals(&env, &["a".to_string(), "b".to_string()]);
        assert_eq!(missing, vec!["b".to_string()]);
    }

    #[test]
    fn closures_degrade_to_inspect_string_by_default() {
        let registry = DefaultTypeRegistry;
        let host = to_host(&Value::Error(Rc::new(crate::value::ErrorValue {
            message: "boom".to_string(),
            cause: None,
        })), &registry, false);
        assert!(matches!(host, HostValue::String(_)));
    }
}
