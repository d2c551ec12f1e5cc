//! # Background
//!
//! Per-execution state handed to every script, command, provider and
//! consumer. A background owns a private `local` map and JSON frame stack,
//! and shares the `global` env, the process DB, the reporter, the imported
//! functions and the flow-control gate with every background duplicated
//! from it.

use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::engine::flow::FlowControl;
use crate::reporter::Reporter;
use crate::script::Group;

pub const KEY_ERROR: &str = "ERROR";
pub const KEY_FAILURE: &str = "FAILURE";
pub const KEY_INPUT: &str = "INPUT";
pub const KEY_OUTPUT: &str = "OUTPUT";
pub const KEY_TEST: &str = "TEST";
pub const KEY_ROUTINE: &str = "ROUTINE";
pub const KEY_SEQUENCE: &str = "SEQUENCE";
pub const KEY_URL: &str = "URL";
pub const KEY_REQUEST: &str = "REQUEST";
pub const KEY_STATUS: &str = "STATUS";
pub const KEY_RESPONSE: &str = "RESPONSE";

pub const GLOBAL_DEBUG: &str = "DEBUG";
pub const GLOBAL_CONFIG: &str = "CONFIG";
pub const GLOBAL_SCHEDULE: &str = "SCHEDULE";
pub const GLOBAL_TPATH: &str = "TPATH";
pub const GLOBAL_CWD: &str = "CWD";

/// Routine id used by plans that run without spawning workers.
pub const SEQUENTIAL_ROUTINE: i64 = -1;

/// A lock-protected string map that falls back to a parent on lookup miss.
#[derive(Debug, Default)]
pub struct Env {
    vars: RwLock<HashMap<String, String>>,
    parent: Option<Arc<Env>>,
}

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parent(parent: Arc<Env>) -> Self {
        Self {
            vars: RwLock::new(HashMap::new()),
            parent: Some(parent),
        }
    }

    pub fn from_map(vars: HashMap<String, String>) -> Self {
        Self {
            vars: RwLock::new(vars),
            parent: None,
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let found = self
            .vars
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned();
        match found {
            Some(value) => Some(value),
            None => self.parent.as_ref().and_then(|parent| parent.get(key)),
        }
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.vars
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into());
    }

    pub fn extend(&self, entries: impl IntoIterator<Item = (String, String)>) {
        self.vars
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(entries);
    }
}

/// One entry of the JSON scope stack.
#[derive(Debug, Clone)]
pub struct JsonFrame {
    pub key: String,
    pub value: JsonValue,
    overlay: HashMap<String, String>,
}

impl JsonFrame {
    pub fn new(key: impl Into<String>, value: JsonValue) -> Self {
        Self {
            key: key.into(),
            value,
            overlay: HashMap::new(),
        }
    }

    /// Resolve `$<name>` against this frame.
    pub fn get(&self, name: &str) -> Option<String> {
        if let Some(value) = self.overlay.get(name) {
            return Some(value.clone());
        }
        match name {
            "key" => Some(self.key.clone()),
            "value" => Some(json_text(&self.value)),
            "length" => json_length(&self.value).map(|len| len.to_string()),
            _ => None,
        }
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.overlay.insert(name.into(), value.into());
    }
}

/// Text form of a JSON value as seen by scripts: strings lose their quotes,
/// everything else keeps its JSON spelling.
pub fn json_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn json_length(value: &JsonValue) -> Option<usize> {
    match value {
        JsonValue::Array(items) => Some(items.len()),
        JsonValue::Object(members) => Some(members.len()),
        JsonValue::String(text) => Some(text.chars().count()),
        JsonValue::Null => Some(0),
        _ => None,
    }
}

/// Named groups of compiled fragments importable by scripts.
pub type Functions = HashMap<String, Arc<Group>>;

#[derive(Debug)]
pub struct Background {
    name: String,
    local: HashMap<String, String>,
    global: Arc<Env>,
    db: Arc<Env>,
    json_stack: Vec<JsonFrame>,
    error: Option<String>,
    predefined: Arc<HashMap<String, String>>,
    reporter: Option<Arc<Reporter>>,
    functions: Arc<Functions>,
    flow_control: Option<Arc<FlowControl>>,
}

impl Background {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            local: HashMap::new(),
            global: Arc::new(Env::new()),
            db: Arc::new(Env::new()),
            json_stack: Vec::new(),
            error: None,
            predefined: Arc::new(HashMap::new()),
            reporter: None,
            functions: Arc::new(HashMap::new()),
            flow_control: None,
        }
    }

    pub fn with_global(mut self, global: Arc<Env>) -> Self {
        self.global = global;
        self
    }

    pub fn with_db(mut self, db: Arc<Env>) -> Self {
        self.db = db;
        self
    }

    pub fn with_predefined(mut self, predefined: HashMap<String, String>) -> Self {
        self.local.extend(predefined.clone());
        self.predefined = Arc::new(predefined);
        self
    }

    pub fn with_reporter(mut self, reporter: Option<Arc<Reporter>>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn set_reporter(&mut self, reporter: Option<Arc<Reporter>>) {
        self.reporter = reporter;
    }

    pub fn with_functions(mut self, functions: Arc<Functions>) -> Self {
        self.functions = functions;
        self
    }

    pub fn with_flow_control(mut self, flow_control: Option<Arc<FlowControl>>) -> Self {
        self.flow_control = flow_control;
        self
    }

    /// A worker-private copy: `local` and the JSON stack are copied, every
    /// shared handle is shared.
    pub fn dup(&self) -> Self {
        Self {
            name: self.name.clone(),
            local: self.local.clone(),
            global: self.global.clone(),
            db: self.db.clone(),
            json_stack: self.json_stack.clone(),
            error: None,
            predefined: self.predefined.clone(),
            reporter: self.reporter.clone(),
            functions: self.functions.clone(),
            flow_control: self.flow_control.clone(),
        }
    }

    /// Reset per-iteration state: `local` holds only the predefined entries
    /// and the error slot is empty.
    pub fn cleanup(&mut self) {
        self.local.clear();
        self.local
            .extend(self.predefined.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.json_stack.clear();
        self.error = None;
    }

    /// Start a new iteration numbered `sequence` on worker `routine`.
    pub fn next(&mut self, sequence: u64, routine: i64) {
        self.cleanup();
        self.set_local(KEY_SEQUENCE, sequence.to_string());
        self.set_local(KEY_ROUTINE, routine.to_string());
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_local(&self, key: &str) -> String {
        if key == KEY_ERROR {
            return self.error.clone().unwrap_or_default();
        }
        self.local.get(key).cloned().unwrap_or_default()
    }

    pub fn set_local(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.local.insert(key.into(), value.into());
    }

    pub fn get_global(&self, key: &str) -> String {
        self.global.get(key).unwrap_or_default()
    }

    pub fn set_global(&self, key: impl Into<String>, value: impl Into<String>) {
        self.global.set(key, value);
    }

    pub fn global(&self) -> &Arc<Env> {
        &self.global
    }

    pub fn get_db(&self, key: &str) -> String {
        self.db.get(key).unwrap_or_default()
    }

    pub fn set_db(&self, key: impl Into<String>, value: impl Into<String>) {
        self.db.set(key, value);
    }

    pub fn db(&self) -> &Arc<Env> {
        &self.db
    }

    pub fn push_json_env(&mut self, key: impl Into<String>, value: JsonValue) {
        self.json_stack.push(JsonFrame::new(key, value));
    }

    pub fn pop_json_env(&mut self) -> Option<JsonFrame> {
        self.json_stack.pop()
    }

    pub fn json_depth(&self) -> usize {
        self.json_stack.len()
    }

    /// Read `$<name>` from the top JSON frame.
    pub fn get_json(&self, name: &str) -> Option<String> {
        self.json_stack.last().and_then(|frame| frame.get(name))
    }

    /// Write a custom key into the top JSON frame. Returns false when the
    /// stack is empty.
    pub fn set_json(&mut self, name: impl Into<String>, value: impl Into<String>) -> bool {
        match self.json_stack.last_mut() {
            Some(frame) => {
                frame.set(name, value);
                true
            }
            None => false,
        }
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn set_error(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    /// Store a command result so it is readable as `$(OUTPUT)` / `$$`.
    pub fn set_output(&mut self, value: impl Into<String>) {
        self.local.insert(KEY_OUTPUT.to_string(), value.into());
    }

    pub fn set_input(&mut self, value: impl Into<String>) {
        self.local.insert(KEY_INPUT.to_string(), value.into());
    }

    pub fn reporter(&self) -> Option<&Arc<Reporter>> {
        self.reporter.as_ref()
    }

    pub fn function(&self, name: &str) -> Option<&Arc<Group>> {
        self.functions.get(name)
    }

    pub fn flow_control(&self) -> Option<&Arc<FlowControl>> {
        self.flow_control.as_ref()
    }
}
