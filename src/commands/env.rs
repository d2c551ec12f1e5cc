use crate::background::Background;
use crate::error::ScriptError;

use super::{expect_words, Command, CommandSpec, Flags, Word};

/// Where a read or write lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Local,
    Global,
    Db,
    /// Custom keys of the innermost JSON frame, read back as `$<name>`.
    Json,
}

impl Scope {
    fn read(self, bg: &Background, name: &str) -> String {
        match self {
            Scope::Local => bg.get_local(name),
            Scope::Global => bg.get_global(name),
            Scope::Db => bg.get_db(name),
            Scope::Json => bg.get_json(name).unwrap_or_default(),
        }
    }

    fn write(self, bg: &mut Background, name: &str, value: &str) -> Result<(), ScriptError> {
        match self {
            Scope::Local => bg.set_local(name, value),
            Scope::Global => bg.set_global(name, value),
            Scope::Db => bg.set_db(name, value),
            Scope::Json => {
                if !bg.set_json(name, value) {
                    return Err(ScriptError::runtime(format!("env -j {name}: no JSON value in scope")));
                }
            }
        }
        Ok(())
    }
}

/// Shared shape of `env` and `db`: read a name, or with `-w` write the
/// `-c` literal (else the piped input) to it. Output is the value.
#[derive(Debug)]
struct Access {
    scope: Scope,
    write: bool,
    literal: Option<Word>,
    name: Word,
}

impl Access {
    fn execute(&self, bg: &mut Background, input: Option<&str>) -> Result<String, ScriptError> {
        let name = self.name.compose(bg)?;
        if name.is_empty() {
            return Err(ScriptError::runtime("empty variable name"));
        }
        if !self.write {
            return Ok(self.scope.read(bg, &name));
        }
        let value = match &self.literal {
            Some(word) => word.compose(bg)?,
            None => input.unwrap_or_default().to_string(),
        };
        self.scope.write(bg, &name, &value)?;
        Ok(value)
    }
}

/// `env [-w] [-g|-j] [-c literal] NAME`; `envw NAME` is `env -w NAME`.
/// `-j` targets the JSON value being matched by a response template.
#[derive(Debug)]
pub struct EnvCommand {
    access: Access,
}

impl EnvCommand {
    pub fn new(mut spec: CommandSpec, always_write: bool) -> Result<Self, ScriptError> {
        let mut flags = Flags::parse(&mut spec, &['w', 'g', 'j'], &['c'])?;
        expect_words(&spec, 1, 1)?;
        let scope = match (flags.has('g'), flags.has('j')) {
            (true, true) => {
                return Err(ScriptError::compile(&spec.args_src, "`-g` and `-j` are exclusive"));
            }
            (true, false) => Scope::Global,
            (false, true) => Scope::Json,
            (false, false) => Scope::Local,
        };
        let literal = flags.take('c');
        let write = always_write || flags.has('w') || literal.is_some();
        Ok(Self {
            access: Access {
                scope,
                write,
                literal,
                name: spec.words.remove(0),
            },
        })
    }
}

impl Command for EnvCommand {
    fn execute(&self, bg: &mut Background, input: Option<&str>) -> Result<String, ScriptError> {
        self.access.execute(bg, input)
    }
}

/// `db [-w] [-c literal] NAME` against the process-wide store.
#[derive(Debug)]
pub struct DbCommand {
    access: Access,
}

impl DbCommand {
    pub fn new(mut spec: CommandSpec) -> Result<Self, ScriptError> {
        let mut flags = Flags::parse(&mut spec, &['w'], &['c'])?;
        expect_words(&spec, 1, 1)?;
        let literal = flags.take('c');
        Ok(Self {
            access: Access {
                scope: Scope::Db,
                write: flags.has('w') || literal.is_some(),
                literal,
                name: spec.words.remove(0),
            },
        })
    }
}

impl Command for DbCommand {
    fn execute(&self, bg: &mut Background, input: Option<&str>) -> Result<String, ScriptError> {
        self.access.execute(bg, input)
    }
}
