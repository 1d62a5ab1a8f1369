//! The proxy table: a per-session, first-class registry mapping stable
//! short names to process-local objects (spec §4.2, §9 redesign note).
//!
//! Two views are maintained, as the data model in spec §3 requires:
//! name -> object and object -> name. Lookups by object use pointer
//! identity on the `Arc`, not structural equality, since two distinct
//! objects of the same shape are still distinct proxies.

use super::Value;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

/// An object that can cross the wire as a named proxy or a tag-5
/// constructed value.
///
/// Implement this for any type you want to hand to the peer by reference
/// (tag 4) or reconstruct on the other side from a class name plus
/// constructor arguments and state (tag 5, via `ProxyClass`).
pub trait Proxied: std::any::Any + Send + Sync + Debug {
    /// The registered class name used for tag-5 encoding, if this value's
    /// class has one. Objects whose class has no registered name are
    /// always sent by reference (tag 4, possibly auto-named).
    fn class_name(&self) -> &str;

    /// Positional constructor arguments to reconstruct this object on the
    /// peer, used only when `class_name()` resolves to a registered
    /// `ProxyClass`.
    fn positional_args(&self) -> Vec<Value> {
        Vec::new()
    }

    /// Extra state applied as attribute updates after construction.
    fn state(&self) -> Value {
        Value::Map(Vec::new())
    }

    fn as_any(&self) -> &dyn std::any::Any;
}

/// A placeholder materialised on decode when a referenced proxy name is
/// not (yet) known locally. Its only identity is the name (spec §3).
#[derive(Debug)]
pub struct Placeholder {
    pub name: String,
}

impl Proxied for Placeholder {
    fn class_name(&self) -> &str {
        "placeholder"
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// The `NotGiven` marker object backing the reserved `"-"` proxy name.
#[derive(Debug)]
pub struct NotGivenMarker;

impl Proxied for NotGivenMarker {
    fn class_name(&self) -> &str {
        "NotGiven"
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// A registered class: how to construct and update an object of a given
/// name when it arrives as a tag-5 payload (spec §4.2 decode policy).
pub trait ProxyClass: Send + Sync {
    fn name(&self) -> &str;

    /// Constructs an instance from positional arguments alone.
    fn construct(&self, args: &[Value]) -> Result<Arc<dyn Proxied>, String>;

    /// Constructs an instance honoring `state` as constructor keyword
    /// arguments in one shot. The default always falls through to
    /// `construct` + `apply_state`, which is the common case for plain
    /// Rust types.
    fn construct_with_kwargs(
        &self,
        _args: &[Value],
        _state: &[(Value, Value)],
    ) -> Result<Arc<dyn Proxied>, String> {
        Err("construct_with_kwargs not supported".to_string())
    }

    /// Applies `state` to an already-constructed object as attribute
    /// updates. The default is a no-op, appropriate for immutable
    /// proxied values.
    fn apply_state(&self, _obj: &Arc<dyn Proxied>, _state: &[(Value, Value)]) -> Result<(), String> {
        Ok(())
    }

    /// Implements the two-step decode policy from spec §4.2: try the
    /// single-shot constructor first, then fall back to
    /// construct-then-apply-state.
    fn construct_with_state(
        &self,
        args: &[Value],
        state: &[(Value, Value)],
    ) -> Result<Arc<dyn Proxied>, String> {
        match self.construct_with_kwargs(args, state) {
            Ok(obj) => Ok(obj),
            Err(_) => {
                let obj = self.construct(args)?;
                self.apply_state(&obj, state)?;
                Ok(obj)
            }
        }
    }
}

fn identity_key(obj: &Arc<dyn Proxied>) -> usize {
    (Arc::as_ptr(obj) as *const ()) as usize
}

pub(crate) fn same_identity(a: &Arc<dyn Proxied>, b: &Arc<dyn Proxied>) -> bool {
    identity_key(a) == identity_key(b)
}

/// Default bound on auto-allocated proxy entries (spec §9 open question:
/// "a bound and eviction policy are unspecified and should be designed").
/// Explicitly-`register`ed names are never evicted; only auto-named
/// entries age out, oldest first, once the bound is exceeded. See
/// DESIGN.md for the rationale.
pub const DEFAULT_MAX_AUTO_PROXIES: usize = 4096;

/// The per-session proxy + class registry (spec §3, §4.2, §9).
pub struct ProxyTable {
    by_name: HashMap<String, Arc<dyn Proxied>>,
    by_identity: HashMap<usize, String>,
    classes: HashMap<String, Arc<dyn ProxyClass>>,
    auto_counter: u64,
    auto_order: std::collections::VecDeque<String>,
    max_auto: usize,
}

impl ProxyTable {
    pub fn new() -> Self {
        let mut table = ProxyTable {
            by_name: HashMap::new(),
            by_identity: HashMap::new(),
            classes: HashMap::new(),
            auto_counter: 0,
            auto_order: std::collections::VecDeque::new(),
            max_auto: DEFAULT_MAX_AUTO_PROXIES,
        };
        table.register(super::NOT_GIVEN_NAME, Arc::new(NotGivenMarker));
        table
    }

    pub fn with_max_auto_proxies(mut self, max: usize) -> Self {
        self.max_auto = max;
        self
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Explicitly binds `name` to `obj`. Append-only for explicit names
    /// during a session (spec §3 invariant); re-registering the same
    /// name replaces the binding, matching a client re-sending an
    /// already-named object.
    pub fn register(&mut self, name: &str, obj: Arc<dyn Proxied>) {
        let key = identity_key(&obj);
        self.by_identity.insert(key, name.to_string());
        self.by_name.insert(name.to_string(), obj);
    }

    /// Registers a reconstructable class for tag-5 decoding.
    pub fn register_class(&mut self, class: Arc<dyn ProxyClass>) {
        self.classes.insert(class.name().to_string(), class);
    }

    pub fn class_of(&self, name: &str) -> Option<Arc<dyn ProxyClass>> {
        self.classes.get(name).cloned()
    }

    /// Looks up the name already bound to `obj`, if any.
    pub fn name_of(&self, obj: &Arc<dyn Proxied>) -> Option<String> {
        self.by_identity.get(&identity_key(obj)).cloned()
    }

    /// Resolves a name to its object, materialising a `Placeholder` if
    /// the name is unknown (spec §3: "unknown names materialise a
    /// placeholder whose only identity is the name").
    pub fn resolve(&mut self, name: &str) -> Arc<dyn Proxied> {
        if let Some(obj) = self.by_name.get(name) {
            return obj.clone();
        }
        let placeholder: Arc<dyn Proxied> = Arc::new(Placeholder { name: name.to_string() });
        self.register(name, placeholder.clone());
        placeholder
    }

    /// Explicit removal, the only way a proxy table entry disappears
    /// (spec §3 invariant; driven by `sys.unproxy`, spec §6).
    pub fn unproxy(&mut self, name: &str) {
        if let Some(obj) = self.by_name.remove(name) {
            self.by_identity.remove(&identity_key(&obj));
        }
        self.auto_order.retain(|n| n != name);
    }

    /// Allocates a fresh auto-name for an object with neither a
    /// registered name nor a registered class, per the tag-4 fallback in
    /// the encoding policy (spec §4.2). Evicts the oldest auto-named
    /// entry once `max_auto` is exceeded.
    pub fn register_auto(&mut self, obj: Arc<dyn Proxied>) -> String {
        if self.auto_order.len() >= self.max_auto {
            if let Some(oldest) = self.auto_order.pop_front() {
                self.unproxy(&oldest);
            }
        }
        self.auto_counter += 1;
        let name = format!("@{}", self.auto_counter);
        self.register(&name, obj);
        self.auto_order.push_back(name.clone());
        name
    }
}

impl Default for ProxyTable {
    fn default() -> Self {
        Self::new()
    }
}
