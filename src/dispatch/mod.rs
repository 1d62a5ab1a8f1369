//! The dispatch tree: path-addressed handlers, subtrees, and live
//! reconfiguration (spec §4.5).
//!
//! The source encodes three concepts (commands, subtrees, and
//! local-only commands) as attribute-prefix scanning (`cmd_*`,
//! `dis_*`). Per the §9 redesign note this is replaced with explicit
//! registration: a handler declares a map of name→callable and a map of
//! name→sub-handler at construction, and introspection (`_dir`) reads
//! those maps directly instead of reflecting over method names.

pub mod builtin;

use crate::codec::Value;
use crate::task_group::{CancellationToken, TaskGroup};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no such command: {0}")]
    NoSuchCommand(String),
    #[error("action path is empty and no default handler is registered")]
    NoDefault,
    #[error("{0}")]
    Handler(String),
    /// A distinguished error class: returned to the caller but never
    /// logged server-side (spec §4.4 logging discipline).
    #[error("{0}")]
    Silent(String),
}

pub type CommandFn = dyn Fn(Value, &[String]) -> Result<Value, Error> + Send + Sync;

/// Signals that a handler has finished starting and is ready to accept
/// requests (spec §4.5 lifecycle: "a 'ready' event is set when the
/// handler accepts requests").
#[derive(Clone, Default)]
pub struct ReadyToken(Arc<AtomicBool>);

impl ReadyToken {
    pub fn new() -> Self {
        ReadyToken(Arc::new(AtomicBool::new(false)))
    }
    pub fn mark_ready(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A node in the dispatch tree.
///
/// Application handlers (the BMS controller, ADC/pin readers, fake
/// sensors, out of scope per spec §1) implement this trait; the
/// transport core only ships `StaticHandler` (a plain command/subtree
/// map, for the built-in `sys.*` surface and tests) and `RetryWrapper`
/// (spec §4.5/§9, "a first-class wrapping component").
pub trait Handler: Send + Sync {
    fn has_command(&self, name: &str) -> bool;
    fn command_names(&self) -> Vec<String>;
    fn call_command(&self, name: &str, rest: &[String], data: Value) -> Result<Value, Error>;

    fn child(&self, name: &str) -> Option<Arc<dyn Handler>>;
    fn child_names(&self) -> Vec<String>;

    /// Names of commands reported by `_dir` only to the local (server)
    /// side, never to a remote introspecting peer (spec §4.5 `_dir`:
    /// "`e:[local-only commands]`").
    fn local_only_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Invoked when the action path is exhausted (spec §4.5 rule 1).
    /// `None` means no default handler is registered, which is an error.
    fn default(&self, _data: Value) -> Option<Result<Value, Error>> {
        None
    }

    /// Runs this handler's background task, if it has one, until
    /// `token` is cancelled. Most command-only handlers never override
    /// this. `ready` should be marked once the handler is prepared to
    /// accept requests.
    fn run(&self, ready: ReadyToken, token: CancellationToken) -> Result<(), Error> {
        ready.mark_ready();
        while !token.is_cancelled() {
            token.wait_timeout(std::time::Duration::from_millis(200));
        }
        Ok(())
    }

    /// Delivered to a surviving handler across a live-reconfiguration
    /// commit, carrying its new subtree (spec §4.5, "surviving handlers
    /// receive a `config_updated` notification").
    fn config_updated(&self, _subtree: Value) {}
}

/// A plain command/subtree map, built at construction time, the
/// concrete shape the §9 redesign note asks for.
pub struct StaticHandler {
    commands: HashMap<String, Box<CommandFn>>,
    children: HashMap<String, Arc<dyn Handler>>,
    default: Option<Box<CommandFn>>,
    local_only: Vec<String>,
}

impl StaticHandler {
    pub fn builder() -> StaticHandlerBuilder {
        StaticHandlerBuilder::default()
    }
}

#[derive(Default)]
pub struct StaticHandlerBuilder {
    commands: HashMap<String, Box<CommandFn>>,
    children: HashMap<String, Arc<dyn Handler>>,
    default: Option<Box<CommandFn>>,
    local_only: Vec<String>,
}

impl StaticHandlerBuilder {
    pub fn command(
        mut self,
        name: impl Into<String>,
        f: impl Fn(Value, &[String]) -> Result<Value, Error> + Send + Sync + 'static,
    ) -> Self {
        self.commands.insert(name.into(), Box::new(f));
        self
    }

    /// Registers a command that ignores the path tail, the common case
    /// for a leaf command reached by its whole name.
    pub fn simple_command(
        self,
        name: impl Into<String>,
        f: impl Fn(Value) -> Result<Value, Error> + Send + Sync + 'static,
    ) -> Self {
        self.command(name, move |data, _rest| f(data))
    }

    pub fn local_only_command(
        mut self,
        name: impl Into<String>,
        f: impl Fn(Value, &[String]) -> Result<Value, Error> + Send + Sync + 'static,
    ) -> Self {
        let name = name.into();
        self.local_only.push(name.clone());
        self.commands.insert(name, Box::new(f));
        self
    }

    pub fn child(mut self, name: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        self.children.insert(name.into(), handler);
        self
    }

    pub fn default(
        mut self,
        f: impl Fn(Value, &[String]) -> Result<Value, Error> + Send + Sync + 'static,
    ) -> Self {
        self.default = Some(Box::new(f));
        self
    }

    pub fn build(self) -> StaticHandler {
        StaticHandler {
            commands: self.commands,
            children: self.children,
            default: self.default,
            local_only: self.local_only,
        }
    }

    pub fn build_arc(self) -> Arc<dyn Handler> {
        Arc::new(self.build())
    }
}

impl Handler for StaticHandler {
    fn has_command(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    fn command_names(&self) -> Vec<String> {
        self.commands.keys().cloned().collect()
    }

    fn call_command(&self, name: &str, rest: &[String], data: Value) -> Result<Value, Error> {
        match self.commands.get(name) {
            Some(f) => f(data, rest),
            None => Err(Error::NoSuchCommand(name.to_string())),
        }
    }

    fn child(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.children.get(name).cloned()
    }

    fn child_names(&self) -> Vec<String> {
        self.children.keys().cloned().collect()
    }

    fn local_only_names(&self) -> Vec<String> {
        self.local_only.clone()
    }

    fn default(&self, data: Value) -> Option<Result<Value, Error>> {
        self.default.as_ref().map(|f| f(data, &[]))
    }
}

/// A wrapper that catches exceptions from its child's background task
/// and restarts it up to `max_attempts` times with `delay` between
/// attempts before giving up (spec §4.5, §9: "treat retry as a
/// first-class wrapping component").
///
/// Call routing (`call_command`/`child`/introspection) always delegates
/// to whatever child is currently installed; only `run` applies the
/// retry policy, since that is the background task the source's
/// inconsistent per-handler retry behavior was about.
pub struct RetryWrapper {
    factory: Box<dyn Fn() -> Arc<dyn Handler> + Send + Sync>,
    current: std::sync::RwLock<Arc<dyn Handler>>,
    max_attempts: u32,
    delay: std::time::Duration,
    /// Whether `run` blocks (holds the caller) until the first attempt
    /// reports ready, vs. marking itself ready immediately and retrying
    /// in the background (spec §9 `RetryWrapper` config: `wait_before_ready`).
    wait_before_ready: bool,
}

impl RetryWrapper {
    pub fn new(
        factory: impl Fn() -> Arc<dyn Handler> + Send + Sync + 'static,
        max_attempts: u32,
        delay: std::time::Duration,
        wait_before_ready: bool,
    ) -> Arc<Self> {
        let initial = factory();
        Arc::new(RetryWrapper {
            factory: Box::new(factory),
            current: std::sync::RwLock::new(initial),
            max_attempts,
            delay,
            wait_before_ready,
        })
    }

    fn current(&self) -> Arc<dyn Handler> {
        self.current.read().unwrap().clone()
    }
}

impl Handler for RetryWrapper {
    fn has_command(&self, name: &str) -> bool {
        self.current().has_command(name)
    }
    fn command_names(&self) -> Vec<String> {
        self.current().command_names()
    }
    fn call_command(&self, name: &str, rest: &[String], data: Value) -> Result<Value, Error> {
        self.current().call_command(name, rest, data)
    }
    fn child(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.current().child(name)
    }
    fn child_names(&self) -> Vec<String> {
        self.current().child_names()
    }
    fn local_only_names(&self) -> Vec<String> {
        self.current().local_only_names()
    }
    fn default(&self, data: Value) -> Option<Result<Value, Error>> {
        self.current().default(data)
    }
    fn config_updated(&self, subtree: Value) {
        self.current().config_updated(subtree)
    }

    fn run(&self, ready: ReadyToken, token: CancellationToken) -> Result<(), Error> {
        let mut attempt = 0;
        loop {
            let child = self.factory();
            *self.current.write().unwrap() = child.clone();

            let child_ready = ReadyToken::new();
            if !self.wait_before_ready {
                ready.mark_ready();
            }
            let result = child.run(child_ready.clone(), token.clone());
            if self.wait_before_ready && child_ready.is_ready() {
                ready.mark_ready();
            }

            if token.is_cancelled() {
                return result;
            }
            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempt += 1;
                    crate::logging::log(&format!(
                        "satlink::dispatch: handler restart {attempt}/{} after error: {e}",
                        self.max_attempts
                    ));
                    if attempt >= self.max_attempts {
                        return Err(e);
                    }
                    token.wait_timeout(self.delay);
                }
            }
        }
    }
}

/// Result of `_dir` introspection (spec §4.5).
#[derive(Debug, Clone)]
pub struct Dir {
    pub commands: Vec<String>,
    pub subtrees: Vec<String>,
    pub has_default: bool,
    /// Local-only commands, included only when introspection runs on the
    /// server side (spec §4.5: "`e:[local-only commands]`").
    pub local_only: Vec<String>,
}

impl Dir {
    pub fn to_value(&self, include_local_only: bool) -> Value {
        let mut fields = vec![
            (
                Value::str("c"),
                Value::Array(self.commands.iter().map(|s| Value::str(s.clone())).collect()),
            ),
            (
                Value::str("d"),
                Value::Array(self.subtrees.iter().map(|s| Value::str(s.clone())).collect()),
            ),
            (Value::str("j"), Value::Bool(self.has_default)),
        ];
        if include_local_only {
            fields.push((
                Value::str("e"),
                Value::Array(self.local_only.iter().map(|s| Value::str(s.clone())).collect()),
            ));
        }
        Value::Map(fields)
    }
}

/// The routing entry point for one tree of handlers (spec §4.5 routing
/// rule). Call `Tree::route` with a parsed `Action` (see `message.rs`)
/// and its payload.
pub struct Tree {
    root: Arc<dyn Handler>,
}

impl Tree {
    pub fn new(root: Arc<dyn Handler>) -> Self {
        Tree { root }
    }

    pub fn root(&self) -> Arc<dyn Handler> {
        self.root.clone()
    }

    pub fn route(&self, action: &crate::message::Action, data: Value) -> Result<Value, Error> {
        route_on(&self.root, action, data)
    }

    pub fn dir(&self, path: &[String]) -> Result<Dir, Error> {
        let handler = walk_to(&self.root, path)?;
        Ok(Dir {
            commands: handler.command_names(),
            subtrees: handler.child_names(),
            has_default: handler.default(Value::Nil).is_some(),
            local_only: handler.local_only_names(),
        })
    }

    /// Subdispatch optimisation (spec §4.5): walks as far into the
    /// static tree as possible for a fixed address, binding the
    /// remaining suffix so later calls skip per-hop lookup.
    pub fn bind(&self, path: &[String]) -> BoundHandler {
        let mut handler = self.root.clone();
        let mut i = 0;
        while i < path.len() {
            match handler.child(&path[i]) {
                Some(child) => {
                    handler = child;
                    i += 1;
                }
                None => break,
            }
        }
        BoundHandler { handler, suffix: path[i..].to_vec() }
    }
}

fn walk_to(root: &Arc<dyn Handler>, path: &[String]) -> Result<Arc<dyn Handler>, Error> {
    let mut handler = root.clone();
    for segment in path {
        handler = handler
            .child(segment)
            .ok_or_else(|| Error::NoSuchCommand(segment.clone()))?;
    }
    Ok(handler)
}

fn route_on(
    root: &Arc<dyn Handler>,
    action: &crate::message::Action,
    data: Value,
) -> Result<Value, Error> {
    use crate::message::Action;

    if action.is_empty() {
        return root.default(data).unwrap_or(Err(Error::NoDefault));
    }

    match action {
        Action::Name(s) if s.chars().count() >= 2 => {
            if root.has_command(s) {
                return root.call_command(s, &[], data);
            }
            let mut chars = s.chars();
            let first = chars.next().unwrap().to_string();
            let rest: String = chars.collect();
            step(root, &first, Action::Name(rest), data)
        }
        Action::Name(s) => step(root, s, Action::Name(String::new()), data),
        Action::Path(p) => {
            let first = p[0].clone();
            let rest = Action::Path(p[1..].to_vec());
            step(root, &first, rest, data)
        }
    }
}

fn step(
    root: &Arc<dyn Handler>,
    key: &str,
    rest_action: crate::message::Action,
    data: Value,
) -> Result<Value, Error> {
    if let Some(child) = root.child(key) {
        return route_on(&child, &rest_action, data);
    }
    if root.has_command(key) {
        let tail = match rest_action {
            crate::message::Action::Path(p) => p,
            crate::message::Action::Name(s) if s.is_empty() => Vec::new(),
            crate::message::Action::Name(s) => vec![s],
        };
        return root.call_command(key, &tail, data);
    }
    Err(Error::NoSuchCommand(key.to_string()))
}

/// A path pre-walked at construction time down to its deepest static
/// handler, with the remaining suffix bound for direct calls (spec
/// §4.5 "subdispatch optimisation").
pub struct BoundHandler {
    handler: Arc<dyn Handler>,
    suffix: Vec<String>,
}

impl BoundHandler {
    pub fn call(&self, data: Value) -> Result<Value, Error> {
        if self.suffix.is_empty() {
            return self.handler.default(data).unwrap_or(Err(Error::NoDefault));
        }
        route_on(
            &self.handler,
            &crate::message::Action::Path(self.suffix.clone()),
            data,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Action;

    fn tree_abc() -> Tree {
        let leaf_b = StaticHandler::builder()
            .simple_command("c", |data| Ok(data))
            .build_arc();
        let child_a = StaticHandler::builder().child("b", leaf_b).build_arc();
        let root = StaticHandler::builder()
            .simple_command("abc", |_data| Ok(Value::str("whole-name-hit")))
            .child("a", child_a)
            .build_arc();
        Tree::new(root)
    }

    #[test]
    fn whole_string_action_prefers_full_command_name() {
        let tree = tree_abc();
        let result = tree.route(&Action::Name("abc".into()), Value::Nil).unwrap();
        assert_eq!(result, Value::str("whole-name-hit"));
    }

    #[test]
    fn path_action_always_walks_element_by_element() {
        let tree = tree_abc();
        let result = tree
            .route(&Action::Path(vec!["a".into(), "b".into(), "c".into()]), Value::Int(9))
            .unwrap();
        assert_eq!(result, Value::Int(9));
    }

    #[test]
    fn string_action_falls_back_to_walking_when_whole_name_absent() {
        // Same tree, but ask for "ac" which has no whole-name command,
        // so it must fall back to "a" -> "c" -> no handler named "c" at
        // child_a... instead exercise "ab" falling to a -> b -> default.
        let leaf_b = StaticHandler::builder()
            .default(|data, _rest| Ok(data))
            .build_arc();
        let child_a = StaticHandler::builder().child("b", leaf_b).build_arc();
        let root = StaticHandler::builder().child("a", child_a).build_arc();
        let tree = Tree::new(root);
        let result = tree.route(&Action::Name("ab".into()), Value::str("hi")).unwrap();
        assert_eq!(result, Value::str("hi"));
    }

    #[test]
    fn empty_action_calls_default_or_errors() {
        let root = StaticHandler::builder().build_arc();
        let tree = Tree::new(root);
        let err = tree.route(&Action::Name(String::new()), Value::Nil).unwrap_err();
        assert!(matches!(err, Error::NoDefault));
    }

    #[test]
    fn no_such_command_is_an_error() {
        let root = StaticHandler::builder().build_arc();
        let tree = Tree::new(root);
        let err = tree.route(&Action::Name("zz".into()), Value::Nil).unwrap_err();
        assert!(matches!(err, Error::NoSuchCommand(_)));
    }

    #[test]
    fn bind_walks_static_prefix_and_calls_remaining_suffix() {
        let leaf_b = StaticHandler::builder()
            .simple_command("c", |data| Ok(data))
            .build_arc();
        let child_a = StaticHandler::builder().child("b", leaf_b).build_arc();
        let root = StaticHandler::builder().child("a", child_a).build_arc();
        let tree = Tree::new(root);
        let bound = tree.bind(&["a".to_string(), "b".to_string(), "c".to_string()]);
        assert_eq!(bound.call(Value::Int(5)).unwrap(), Value::Int(5));
    }

    #[test]
    fn retry_wrapper_restarts_failing_child_and_gives_up() {
        let attempts = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let attempts2 = attempts.clone();
        struct Flaky;
        impl Handler for Flaky {
            fn has_command(&self, _name: &str) -> bool {
                false
            }
            fn command_names(&self) -> Vec<String> {
                Vec::new()
            }
            fn call_command(&self, name: &str, _rest: &[String], _data: Value) -> Result<Value, Error> {
                Err(Error::NoSuchCommand(name.to_string()))
            }
            fn child(&self, _name: &str) -> Option<Arc<dyn Handler>> {
                None
            }
            fn child_names(&self) -> Vec<String> {
                Vec::new()
            }
            fn run(&self, ready: ReadyToken, _token: CancellationToken) -> Result<(), Error> {
                ready.mark_ready();
                Err(Error::Handler("boom".into()))
            }
        }
        let wrapper = RetryWrapper::new(
            move || {
                attempts2.fetch_add(1, Ordering::SeqCst);
                Arc::new(Flaky) as Arc<dyn Handler>
            },
            3,
            std::time::Duration::from_millis(1),
            false,
        );
        let ready = ReadyToken::new();
        let token = CancellationToken::new();
        let result = wrapper.run(ready, token);
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
