//! Serde types of the configuration document.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

use crate::engine::consumer::FailurePolicy;
use crate::engine::RunMode;

// ─── Document ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Config {
    pub name: String,
    pub mode: RunMode,
    pub hosts: BTreeMap<String, HostDef>,
    pub messages: BTreeMap<String, MessageDef>,
    pub tests: BTreeMap<String, TestDef>,
    pub schedules: Vec<ScheduleDef>,
    pub env: BTreeMap<String, String>,
    pub options: Options,
    pub functions: BTreeMap<String, Scripts>,
}

/// One script or a list of scripts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scripts {
    One(String),
    Many(Vec<String>),
}

impl Default for Scripts {
    fn default() -> Self {
        Scripts::Many(Vec::new())
    }
}

impl Scripts {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Scripts::One(script) => vec![script.clone()],
            Scripts::Many(scripts) => scripts.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Options {
    pub abort_if_fail: Option<bool>,
    /// Set by the loader to the canonical path of the loaded file.
    pub cfg_path: Option<String>,
}

// ─── Catalog ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HostDef {
    pub host: String,
    pub proxy: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MessageDef {
    pub method: Option<String>,
    pub path: String,
    pub headers: BTreeMap<String, String>,
    /// Raw JSON. A JSON string is used verbatim as the body script.
    pub body: Option<JsonValue>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ResponseDef {
    pub check: Scripts,
    pub success: Scripts,
    pub failure: Scripts,
    pub template: Option<JsonValue>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TestDef {
    pub host: Option<String>,
    pub request: Option<MessageDef>,
    pub request_message: Option<String>,
    pub pre_process: Scripts,
    /// Milliseconds.
    pub timeout: Option<u64>,
    pub response: ResponseDef,
    /// Upper bound on requests fed by this test; zero or unset is unbounded.
    pub count: Option<u64>,
    pub on_failure: Option<FailurePolicy>,
}

// ─── Schedules ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ReporterDef {
    pub path: Option<String>,
    pub format: Option<String>,
    pub templates: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ScheduleDef {
    pub name: String,
    /// `|`-separated test names; `*` stands for every test not listed.
    pub tests: String,
    /// Partial test object laid over every test of this schedule.
    pub test_base: Option<JsonValue>,
    pub count: u64,
    pub concurrency: usize,
    pub parallel: usize,
    #[serde(rename = "QPS")]
    pub qps: u32,
    pub pre_process: Scripts,
    pub post_process: Scripts,
    pub env: BTreeMap<String, String>,
    pub reporter: Option<ReporterDef>,
    pub latency: bool,
}
