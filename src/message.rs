//! Wire message shapes, parsed into concrete variants at the edge of each
//! layer instead of being matched ad hoc on which keys are present
//! (spec §3, §9 redesign note: "prefer a tagged sum at the edge").

use crate::codec::Value;

/// An action path: the addressing component of a message (spec §3, GLOSSARY).
///
/// `Name` is a bare string action, eligible for the whole-name fast path
/// in routing rule 2 (spec §4.5) for as long as it is at least two
/// characters; `Path` is an explicit ordered sequence, which always
/// routes element-by-element (rule 2 never applies to it, see the
/// dispatch routing testable property in spec §8).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Name(String),
    Path(Vec<String>),
}

impl Action {
    pub fn is_empty(&self) -> bool {
        match self {
            Action::Name(s) => s.is_empty(),
            Action::Path(p) => p.is_empty(),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Action::Name(s) => Value::Str(s.clone()),
            Action::Path(p) => Value::Array(p.iter().map(|s| Value::Str(s.clone())).collect()),
        }
    }

    fn from_value(v: &Value) -> Option<Action> {
        match v {
            Value::Str(s) => Some(Action::Name(s.clone())),
            Value::Array(items) => {
                let mut path = Vec::with_capacity(items.len());
                for item in items {
                    path.push(item.as_str()?.to_string());
                }
                Some(Action::Path(path))
            }
            _ => None,
        }
    }
}

impl From<&str> for Action {
    fn from(s: &str) -> Self {
        Action::Name(s.to_string())
    }
}

impl From<Vec<&str>> for Action {
    fn from(v: Vec<&str>) -> Self {
        Action::Path(v.into_iter().map(|s| s.to_string()).collect())
    }
}

/// Errors raised while parsing a raw decoded value into a concrete
/// message variant.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("message is not a map")]
    NotAMap,
    #[error("missing or malformed field '{0}'")]
    BadField(&'static str),
}

/// A request-layer message, as it sits directly on the codec (loss-free
/// transport) or as the payload carried inside a reliable-layer `Data`
/// frame (spec §4.4).
#[derive(Debug, Clone)]
pub enum RequestFrame {
    /// `{a,i,d}`, expects a reply.
    Request { action: Action, id: i64, data: Value },
    /// `{a,d}`, no id, fire and forget.
    Notification { action: Action, data: Value },
    /// `{i,d}`, a successful reply to a previously sent request.
    Reply { id: i64, data: Value },
    /// `{i,e}`, a failed reply.
    ReplyError { id: i64, error: Value },
}

impl RequestFrame {
    pub fn parse(v: &Value) -> Result<RequestFrame, Error> {
        let map = v.as_map().ok_or(Error::NotAMap)?;
        let action = find(map, "a");
        let id = find(map, "i");
        let data = find(map, "d");
        let err = find(map, "e");

        if let Some(action) = action {
            let action = Action::from_value(action).ok_or(Error::BadField("a"))?;
            let data = data.cloned().unwrap_or(Value::Nil);
            return Ok(match id {
                Some(id) => RequestFrame::Request {
                    action,
                    id: id.as_i64().ok_or(Error::BadField("i"))?,
                    data,
                },
                None => RequestFrame::Notification { action, data },
            });
        }

        let id = id.and_then(Value::as_i64).ok_or(Error::BadField("i"))?;
        if let Some(err) = err {
            Ok(RequestFrame::ReplyError { id, error: err.clone() })
        } else {
            Ok(RequestFrame::Reply { id, data: data.cloned().unwrap_or(Value::Nil) })
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            RequestFrame::Request { action, id, data } => Value::Map(vec![
                (Value::str("a"), action.to_value()),
                (Value::str("i"), Value::Int(*id)),
                (Value::str("d"), data.clone()),
            ]),
            RequestFrame::Notification { action, data } => Value::Map(vec![
                (Value::str("a"), action.to_value()),
                (Value::str("d"), data.clone()),
            ]),
            RequestFrame::Reply { id, data } => Value::Map(vec![
                (Value::str("i"), Value::Int(*id)),
                (Value::str("d"), data.clone()),
            ]),
            RequestFrame::ReplyError { id, error } => Value::Map(vec![
                (Value::str("i"), Value::Int(*id)),
                (Value::str("e"), error.clone()),
            ]),
        }
    }
}

/// Reliable-layer configuration exchanged during the reset handshake
/// (spec §4.3: `c={t,m}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetConfig {
    pub timeout_ms: u64,
    pub window: u8,
}

/// A reliable-layer message: either a control message driving the reset
/// handshake, or a data/ack message carrying (optionally) a nested
/// `RequestFrame` payload plus ARQ bookkeeping (spec §4.3).
#[derive(Debug, Clone)]
pub enum ReliableFrame {
    /// `a="r", n, c?, e?`
    Control { n: u8, config: Option<ResetConfig>, error: Option<String> },
    /// Data/ack: `s?, r, x?, d?`
    DataAck { seq: Option<u8>, recv_tail: u8, sacks: Vec<u8>, payload: Option<Value> },
}

impl ReliableFrame {
    pub fn parse(v: &Value) -> Result<ReliableFrame, Error> {
        let map = v.as_map().ok_or(Error::NotAMap)?;
        if find(map, "a").and_then(Value::as_str) == Some("r") {
            let n = find(map, "n").and_then(Value::as_i64).ok_or(Error::BadField("n"))? as u8;
            let config = find(map, "c").and_then(|c| {
                let cm = c.as_map()?;
                let timeout_ms = find(cm, "t")?.as_i64()? as u64;
                let window = find(cm, "m")?.as_i64()? as u8;
                Some(ResetConfig { timeout_ms, window })
            });
            let error = find(map, "e").and_then(Value::as_str).map(|s| s.to_string());
            return Ok(ReliableFrame::Control { n, config, error });
        }
        let seq = find(map, "s").and_then(Value::as_i64).map(|i| i as u8);
        let recv_tail = find(map, "r").and_then(Value::as_i64).ok_or(Error::BadField("r"))? as u8;
        let sacks = find(map, "x")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_i64).map(|i| i as u8).collect())
            .unwrap_or_default();
        let payload = find(map, "d").cloned();
        Ok(ReliableFrame::DataAck { seq, recv_tail, sacks, payload })
    }

    pub fn to_value(&self) -> Value {
        match self {
            ReliableFrame::Control { n, config, error } => {
                let mut fields = vec![
                    (Value::str("a"), Value::str("r")),
                    (Value::str("n"), Value::Int(*n as i64)),
                ];
                if let Some(cfg) = config {
                    fields.push((
                        Value::str("c"),
                        Value::Map(vec![
                            (Value::str("t"), Value::Int(cfg.timeout_ms as i64)),
                            (Value::str("m"), Value::Int(cfg.window as i64)),
                        ]),
                    ));
                }
                if let Some(err) = error {
                    fields.push((Value::str("e"), Value::str(err.clone())));
                }
                Value::Map(fields)
            }
            ReliableFrame::DataAck { seq, recv_tail, sacks, payload } => {
                let mut fields = Vec::new();
                if let Some(seq) = seq {
                    fields.push((Value::str("s"), Value::Int(*seq as i64)));
                }
                fields.push((Value::str("r"), Value::Int(*recv_tail as i64)));
                if !sacks.is_empty() {
                    fields.push((
                        Value::str("x"),
                        Value::Array(sacks.iter().map(|s| Value::Int(*s as i64)).collect()),
                    ));
                }
                if let Some(payload) = payload {
                    fields.push((Value::str("d"), payload.clone()));
                }
                Value::Map(fields)
            }
        }
    }
}

fn find<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    map.iter().find_map(|(k, v)| if k.as_str() == Some(key) { Some(v) } else { None })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frame_round_trips() {
        let f = RequestFrame::Request { action: Action::Name("ping".into()), id: 7, data: Value::Int(1) };
        let back = RequestFrame::parse(&f.to_value()).unwrap();
        match back {
            RequestFrame::Request { action, id, data } => {
                assert_eq!(action, Action::Name("ping".into()));
                assert_eq!(id, 7);
                assert_eq!(data, Value::Int(1));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn reliable_control_round_trips() {
        let f = ReliableFrame::Control {
            n: 1,
            config: Some(ResetConfig { timeout_ms: 1000, window: 8 }),
            error: None,
        };
        let back = ReliableFrame::parse(&f.to_value()).unwrap();
        match back {
            ReliableFrame::Control { n, config, .. } => {
                assert_eq!(n, 1);
                assert_eq!(config, Some(ResetConfig { timeout_ms: 1000, window: 8 }));
            }
            _ => panic!("wrong variant"),
        }
    }
}
