//! # Command library
//!
//! Built-in commands invoked inside back-tick pipelines. Every command is
//! built once at compile time and lives as long as the segment owning it,
//! so iterable state (open files, counters) survives across iterations.
//! Shared state sits behind a mutex: a segment may be composed by many
//! workers of the same plan, which are then served first come first served.

mod control;
mod env;
mod io;
mod text;

use std::collections::HashMap;
use std::fmt;

use crate::background::Background;
use crate::error::ScriptError;
use crate::script::{Composable, Segment};

pub trait Command: fmt::Debug + Send + Sync {
    /// Run once. `input` is the previous stage's output, if any.
    fn execute(&self, bg: &mut Background, input: Option<&str>) -> Result<String, ScriptError>;

    fn is_iterable(&self) -> bool {
        false
    }

    fn close(&self) {}
}

/// One argument word: its raw spelling and its compiled form.
#[derive(Debug)]
pub struct Word {
    pub raw: String,
    pub segment: Segment,
}

impl Word {
    pub fn compose(&self, bg: &mut Background) -> Result<String, ScriptError> {
        self.segment.compose(bg)
    }

    /// `-x` style switch: a dash followed by letters.
    fn is_flag(&self) -> bool {
        let mut chars = self.raw.chars();
        chars.next() == Some('-') && chars.clone().next().is_some() && chars.all(|c| c.is_ascii_alphabetic())
    }
}

/// A parsed pipeline stage handed to a command constructor.
#[derive(Debug)]
pub struct CommandSpec {
    pub name: String,
    /// Argument text after the command name, verbatim.
    pub args_src: String,
    pub words: Vec<Word>,
}

/// Leading switches of a command line.
#[derive(Debug, Default)]
struct Flags {
    switches: Vec<char>,
    values: HashMap<char, Word>,
}

impl Flags {
    /// Consume leading flags. `valued` flags take the following word.
    fn parse(
        spec: &mut CommandSpec,
        switches: &[char],
        valued: &[char],
    ) -> Result<Self, ScriptError> {
        let mut flags = Flags::default();
        let mut words = std::mem::take(&mut spec.words).into_iter().peekable();

        while let Some(word) = words.next_if(Word::is_flag) {
            for flag in word.raw.chars().skip(1) {
                if switches.contains(&flag) {
                    flags.switches.push(flag);
                } else if valued.contains(&flag) {
                    let value = words.next().ok_or_else(|| {
                        ScriptError::compile(&spec.args_src, format!("`-{flag}` needs a value"))
                    })?;
                    flags.values.insert(flag, value);
                } else {
                    return Err(ScriptError::compile(
                        &spec.args_src,
                        format!("`{}` does not accept `-{flag}`", spec.name),
                    ));
                }
            }
        }

        spec.words = words.collect();
        Ok(flags)
    }

    fn has(&self, flag: char) -> bool {
        self.switches.contains(&flag)
    }

    fn take(&mut self, flag: char) -> Option<Word> {
        self.values.remove(&flag)
    }
}

/// Compose every word and join with single spaces.
fn compose_words(words: &[Word], bg: &mut Background) -> Result<String, ScriptError> {
    let mut parts = Vec::with_capacity(words.len());
    for word in words {
        parts.push(word.compose(bg)?);
    }
    Ok(parts.join(" "))
}

/// Joined arguments when present, otherwise the piped input.
fn words_or_input(
    words: &[Word],
    bg: &mut Background,
    input: Option<&str>,
) -> Result<String, ScriptError> {
    if words.is_empty() {
        Ok(input.unwrap_or_default().to_string())
    } else {
        compose_words(words, bg)
    }
}

fn expect_words(spec: &CommandSpec, min: usize, max: usize) -> Result<(), ScriptError> {
    let count = spec.words.len();
    if count < min || count > max {
        let reason = if min == max {
            format!("`{}` takes {min} argument(s), got {count}", spec.name)
        } else {
            format!("`{}` takes {min} to {max} arguments, got {count}", spec.name)
        };
        return Err(ScriptError::compile(&spec.args_src, reason));
    }
    Ok(())
}

pub fn build(spec: CommandSpec) -> Result<Box<dyn Command>, ScriptError> {
    let command: Box<dyn Command> = match spec.name.as_str() {
        "cat" => Box::new(io::Cat::new(spec)?),
        "write" => Box::new(io::Write::new(spec)?),
        "list" => Box::new(io::List::new(spec)?),
        "b64" => Box::new(io::Base64::new(spec)?),
        "env" => Box::new(env::EnvCommand::new(spec, false)?),
        "envw" => Box::new(env::EnvCommand::new(spec, true)?),
        "db" => Box::new(env::DbCommand::new(spec)?),
        "echo" => Box::new(text::Echo::new(spec)),
        "strlen" => Box::new(text::Strlen::new(spec)),
        "cvt" => Box::new(text::Convert::new(spec)?),
        "md5" => Box::new(text::Md5::new(spec)),
        "json" => Box::new(text::Json::new(spec)?),
        "assert" => Box::new(control::Assert::new(spec)?),
        "expr" => Box::new(control::Expr::new(spec)?),
        "nop" => Box::new(control::Nop),
        "print" => Box::new(control::Print::new(spec)),
        "report" => Box::new(control::Report::new(spec)?),
        "sleep" => Box::new(control::Sleep::new(spec)?),
        "call" => Box::new(control::Call::new(spec)?),
        "seq" => Box::new(control::Seq::new(spec)?),
        other => {
            return Err(ScriptError::compile(
                spec.args_src.as_str(),
                format!("unknown command `{other}`"),
            ))
        }
    };
    Ok(command)
}
