//! Programmable HTTP load generator and response validator.
//!
//! A JSON configuration describes hosts, requests, tests and schedules;
//! [`config::load_config`] reads it, [`config::compile`] turns it into an
//! [`engine::Engine`] and [`engine::Engine::run`] drives every schedule.

pub mod background;
pub mod commands;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod reporter;
pub mod script;
pub mod template;

pub use background::Background;
pub use config::{compile, load_config, CompileOptions};
pub use engine::{Engine, Next, Outcome, RunMode};
pub use error::{ConfigError, EngineError, ScriptError};
