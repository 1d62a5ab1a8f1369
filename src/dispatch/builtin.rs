//! The built-in `sys.*` command surface (spec §6): the only part of the
//! command surface this crate ships itself, since application handlers
//! are out of scope (spec §1). Grounded on `transit/builtin_tools.rs`'s
//! pattern of a small, fixed, always-registered set of commands.

use super::{Error, Handler, StaticHandler};
use crate::codec::Value;
use crate::request::RequestLayer;
use std::sync::{Arc, Mutex};

/// The literal byte sequence `sys.test` must round-trip, proving frame
/// transparency end to end (spec §6, §8).
pub const TEST_BYTES: [u8; 11] = [
    b'r', 0x0d, b'n', 0x0a, b'-', 0x00, b'x', 0x0c, b'e', 0x1b, b'!',
];

/// The incremental configuration store `sys.cfg_r`/`sys.cfg` operate on
/// (spec §6). Paths are vectors of string keys into a `Value::Map` tree;
/// `Value::NotGiven` as the write payload deletes the addressed key, and
/// a trailing path element of `"-1"` appends to the array found there.
pub struct ConfigStore {
    root: Mutex<Value>,
}

impl ConfigStore {
    pub fn new(initial: Value) -> Arc<Self> {
        Arc::new(ConfigStore { root: Mutex::new(initial) })
    }

    pub fn read(&self, path: &[String]) -> Value {
        let root = self.root.lock().unwrap();
        get_path(&root, path).cloned().unwrap_or(Value::Nil)
    }

    pub fn write(&self, path: &[String], data: Value) {
        let mut root = self.root.lock().unwrap();
        set_path(&mut root, path, data);
    }
}

fn get_path<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    match path.split_first() {
        None => Some(value),
        Some((head, rest)) => get_path(value.map_get(head)?, rest),
    }
}

fn set_path(value: &mut Value, path: &[String], data: Value) {
    match path.split_first() {
        None => *value = data,
        // A trailing `"-1"` path element appends to the array found at
        // the current position (spec §6), rather than naming a map key.
        Some((head, rest)) if rest.is_empty() && head == "-1" => {
            if let Value::Array(items) = value {
                items.push(data);
            }
        }
        Some((head, rest)) => {
            let Value::Map(entries) = value else { return };
            if rest.is_empty() && matches!(data, Value::NotGiven) {
                entries.retain(|(k, _)| k.as_str() != Some(head.as_str()));
                return;
            }
            set_path(entry_mut(entries, head), rest, data);
        }
    }
}

fn entry_mut<'a>(entries: &'a mut Vec<(Value, Value)>, key: &str) -> &'a mut Value {
    if let Some(idx) = entries.iter().position(|(k, _)| k.as_str() == Some(key)) {
        &mut entries[idx].1
    } else {
        entries.push((Value::str(key), Value::Map(Vec::new())));
        let last = entries.len() - 1;
        &mut entries[last].1
    }
}

fn value_to_path(v: &Value) -> Vec<String> {
    v.as_array()
        .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

/// Builds the `sys` subtree: `test`, `ping`, `cfg_r`, `cfg`, `unproxy`
/// (spec §6), wired to `config` and `channel`. `on_commit` fires when a
/// commit request (`{a:["sys","cfg"]}`, empty path, null data) arrives,
/// so the supervisor can reconcile the dispatch tree (spec §4.5 "live
/// reconfiguration").
pub fn sys_handler(
    config: Arc<ConfigStore>,
    channel: std::sync::Weak<RequestLayer>,
    on_commit: impl Fn() + Send + Sync + 'static,
) -> Arc<dyn Handler> {
    let cfg_for_read = config.clone();
    let cfg_for_write = config.clone();

    StaticHandler::builder()
        .simple_command("test", |_data| Ok(Value::Bytes(TEST_BYTES.to_vec())))
        .simple_command("ping", |data| match data {
            Value::Str(m) => Ok(Value::str(format!("R:{m}"))),
            other => Ok(Value::str(format!("R:{other:?}"))),
        })
        .simple_command("cfg_r", move |data| {
            let path = value_to_path(&data);
            Ok(cfg_for_read.read(&path))
        })
        .simple_command("cfg", move |data| {
            let path = data.map_get("p").map(value_to_path).unwrap_or_default();
            let payload = data.map_get("d").cloned().unwrap_or(Value::NotGiven);
            if path.is_empty() && matches!(payload, Value::Nil) {
                on_commit();
                return Ok(Value::Nil);
            }
            cfg_for_write.write(&path, payload);
            Ok(Value::Nil)
        })
        .simple_command("unproxy", move |data| {
            let name = data.as_str().ok_or_else(|| Error::Handler("unproxy needs a name".into()))?;
            if let Some(channel) = channel.upgrade() {
                channel
                    .unproxy(name)
                    .map_err(|_| Error::Handler("channel closed".into()))?;
            }
            Ok(Value::Nil)
        })
        .build_arc()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_round_trip_set_read_delete() {
        let store = ConfigStore::new(Value::Map(vec![(
            Value::str("tt"),
            Value::Map(vec![(Value::str("x"), Value::str("y"))]),
        )]));

        store.write(
            &["tt".to_string(), "a".to_string()],
            Value::str("d"),
        );
        store.write(
            &["tt".to_string(), "e".to_string(), "f".to_string()],
            Value::Int(42),
        );

        let tt = store.read(&["tt".to_string()]);
        assert_eq!(tt.map_get("a"), Some(&Value::str("d")));
        assert_eq!(tt.map_get("x"), Some(&Value::str("y")));
        assert_eq!(tt.map_get("e").unwrap().map_get("f"), Some(&Value::Int(42)));

        store.write(&["tt".to_string(), "z".to_string()], Value::NotGiven);
        assert_eq!(store.read(&["tt".to_string(), "z".to_string()]), Value::Nil);
    }

    #[test]
    fn test_bytes_match_spec_literal() {
        assert_eq!(TEST_BYTES.len(), 11);
        assert_eq!(TEST_BYTES[0], b'r');
        assert_eq!(TEST_BYTES[TEST_BYTES.len() - 1], b'!');
    }
}
