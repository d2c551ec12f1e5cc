use serde_json::Value as JsonValue;

use crate::background::{json_text, Background};
use crate::error::ScriptError;
use crate::script::value::{bool_text, format_number, parse_bool, parse_number, Value};

use super::{compose_words, words_or_input, Command, CommandSpec, Flags, Word};

/// `echo [args...]`
#[derive(Debug)]
pub struct Echo {
    words: Vec<Word>,
}

impl Echo {
    pub fn new(spec: CommandSpec) -> Self {
        Self { words: spec.words }
    }
}

impl Command for Echo {
    fn execute(&self, bg: &mut Background, input: Option<&str>) -> Result<String, ScriptError> {
        words_or_input(&self.words, bg, input)
    }
}

/// `strlen [text]`: length in code points.
#[derive(Debug)]
pub struct Strlen {
    words: Vec<Word>,
}

impl Strlen {
    pub fn new(spec: CommandSpec) -> Self {
        Self { words: spec.words }
    }
}

impl Command for Strlen {
    fn execute(&self, bg: &mut Background, input: Option<&str>) -> Result<String, ScriptError> {
        let text = words_or_input(&self.words, bg, input)?;
        Ok(text.chars().count().to_string())
    }
}

/// `md5 [data]`: lowercase hex digest.
#[derive(Debug)]
pub struct Md5 {
    words: Vec<Word>,
}

impl Md5 {
    pub fn new(spec: CommandSpec) -> Self {
        Self { words: spec.words }
    }
}

impl Command for Md5 {
    fn execute(&self, bg: &mut Background, input: Option<&str>) -> Result<String, ScriptError> {
        let data = words_or_input(&self.words, bg, input)?;
        Ok(format!("{:x}", md5::compute(data.as_bytes())))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Int,
    Float,
    JsonString,
    Bool,
}

/// `cvt -i|-f|-s|-b [value]`
#[derive(Debug)]
pub struct Convert {
    target: Target,
    words: Vec<Word>,
}

impl Convert {
    pub fn new(mut spec: CommandSpec) -> Result<Self, ScriptError> {
        let flags = Flags::parse(&mut spec, &['i', 'f', 's', 'b'], &[])?;
        let target = match flags.switches.as_slice() {
            ['i'] => Target::Int,
            ['f'] => Target::Float,
            ['s'] => Target::JsonString,
            ['b'] => Target::Bool,
            _ => {
                return Err(ScriptError::compile(
                    &spec.args_src,
                    "`cvt` needs exactly one of -i, -f, -s, -b",
                ))
            }
        };
        Ok(Self {
            target,
            words: spec.words,
        })
    }
}

impl Command for Convert {
    fn execute(&self, bg: &mut Background, input: Option<&str>) -> Result<String, ScriptError> {
        let value = words_or_input(&self.words, bg, input)?;
        let not_a = |kind: &str| ScriptError::runtime(format!("cvt: `{value}` is not {kind}"));
        match self.target {
            Target::Int => match Value::classify(&value) {
                Value::Int(int) => Ok(int.to_string()),
                Value::Number(number) => Ok((number.trunc() as i64).to_string()),
                _ => Err(not_a("a number")),
            },
            Target::Float => {
                let number = parse_number(&value).ok_or_else(|| not_a("a number"))?;
                Ok(format_number(number))
            }
            Target::JsonString => Ok(JsonValue::String(value.clone()).to_string()),
            Target::Bool => {
                let flag = parse_bool(&value).ok_or_else(|| not_a("a boolean"))?;
                Ok(bool_text(flag).to_string())
            }
        }
    }
}

/// One step of a JSON path.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PathStep {
    Key(String),
    Index(usize),
}

/// Parse `.a.b[0].c`, `a.b.0` or `.` (the root).
fn parse_path(path: &str) -> Result<Vec<PathStep>, ScriptError> {
    let mut steps = Vec::new();
    for part in path.split('.').filter(|part| !part.is_empty()) {
        let (key, mut rest) = match part.find('[') {
            Some(open) => (&part[..open], &part[open..]),
            None => (part, ""),
        };
        if !key.is_empty() {
            steps.push(match key.parse::<usize>() {
                Ok(index) => PathStep::Index(index),
                Err(_) => PathStep::Key(key.to_string()),
            });
        }
        while let Some(inner) = rest.strip_prefix('[') {
            let close = inner
                .find(']')
                .ok_or_else(|| ScriptError::compile(path, "unterminated `[` in json path"))?;
            let index = inner[..close]
                .trim()
                .parse::<usize>()
                .map_err(|_| ScriptError::compile(path, "json path index is not a number"))?;
            steps.push(PathStep::Index(index));
            rest = &inner[close + 1..];
        }
        if !rest.is_empty() {
            return Err(ScriptError::compile(path, "unexpected text after `]`"));
        }
    }
    Ok(steps)
}

fn navigate<'a>(root: &'a JsonValue, steps: &[PathStep]) -> Option<&'a JsonValue> {
    steps.iter().try_fold(root, |node, step| match (node, step) {
        (JsonValue::Object(members), PathStep::Key(key)) => members.get(key),
        (JsonValue::Object(members), PathStep::Index(index)) => members.get(&index.to_string()),
        (JsonValue::Array(items), PathStep::Index(index)) => items.get(*index),
        _ => None,
    })
}

/// `json [-n] <path> [json]`: select by path from the literal or the piped
/// input. The selection prints as JSON; with `-n` arrays print their
/// length and scalars their raw text.
#[derive(Debug)]
pub struct Json {
    numeric: bool,
    path: Word,
    document: Vec<Word>,
}

impl Json {
    pub fn new(mut spec: CommandSpec) -> Result<Self, ScriptError> {
        let flags = Flags::parse(&mut spec, &['n'], &[])?;
        if spec.words.is_empty() {
            return Err(ScriptError::compile(&spec.args_src, "`json` needs a path"));
        }
        let document = spec.words.split_off(1);
        Ok(Self {
            numeric: flags.has('n'),
            path: spec.words.remove(0),
            document,
        })
    }
}

impl Command for Json {
    fn execute(&self, bg: &mut Background, input: Option<&str>) -> Result<String, ScriptError> {
        let path = self.path.compose(bg)?;
        let steps = parse_path(&path)?;
        let text = if self.document.is_empty() {
            input.unwrap_or_default().to_string()
        } else {
            compose_words(&self.document, bg)?
        };
        let root: JsonValue = serde_json::from_str(&text)
            .map_err(|err| ScriptError::runtime(format!("json: invalid document: {err}")))?;
        let node = navigate(&root, &steps)
            .ok_or_else(|| ScriptError::runtime(format!("json: path `{path}` not found")))?;

        if !self.numeric {
            return Ok(node.to_string());
        }
        Ok(match node {
            JsonValue::Array(items) => items.len().to_string(),
            JsonValue::Null => String::new(),
            other => json_text(other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::run;
    use super::*;

    #[test]
    fn parses_json_paths() {
        assert_eq!(
            parse_path(".a.b[1].c").unwrap(),
            vec![
                PathStep::Key("a".into()),
                PathStep::Key("b".into()),
                PathStep::Index(1),
                PathStep::Key("c".into())
            ]
        );
        assert_eq!(
            parse_path("list.0").unwrap(),
            vec![PathStep::Key("list".into()), PathStep::Index(0)]
        );
        assert!(parse_path(".").unwrap().is_empty());
        assert!(parse_path(".a[x]").is_err());
    }

    #[test]
    fn json_selects_from_piped_input() {
        let mut bg = Background::new("t");
        bg.set_local("DOC", r#"{"user":{"name":"ann","tags":["a","b"]}}"#);
        assert_eq!(run("echo $(DOC) | json .user.name", &mut bg).unwrap(), "\"ann\"");
        assert_eq!(run("echo $(DOC) | json -n .user.name", &mut bg).unwrap(), "ann");
        assert_eq!(run("echo $(DOC) | json -n .user.tags", &mut bg).unwrap(), "2");
        assert_eq!(run("echo $(DOC) | json .user.tags[1]", &mut bg).unwrap(), "\"b\"");
        assert!(run("echo $(DOC) | json .user.age", &mut bg).is_err());
    }

    #[test]
    fn json_reads_current_frame() {
        let mut bg = Background::new("t");
        bg.push_json_env("item", serde_json::json!({"a": 12, "b": -1}));
        assert_eq!(run("json .b $ | assert $$ < 0", &mut bg).unwrap(), "-1");
    }

    #[test]
    fn cvt_conversions() {
        let mut bg = Background::new("t");
        assert_eq!(run("cvt -i 42.9", &mut bg).unwrap(), "42");
        assert_eq!(run("echo 3.50 | cvt -f", &mut bg).unwrap(), "3.5");
        assert_eq!(run("cvt -s hello", &mut bg).unwrap(), r#""hello""#);
        assert_eq!(run("cvt -b true", &mut bg).unwrap(), "TRUE");
        assert!(run("cvt -i abc", &mut bg).is_err());
        assert!(crate::script::Pipeline::compile("cvt 1").is_err());
    }

    #[test]
    fn cvt_int_survives_json_round_trip() {
        let mut bg = Background::new("t");
        let text = run("cvt -i 17", &mut bg).unwrap();
        let parsed: JsonValue = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, serde_json::json!(17));
    }

    #[test]
    fn cvt_int_keeps_integers_beyond_f64_precision() {
        let mut bg = Background::new("t");
        assert_eq!(run("cvt -i 9007199254740993", &mut bg).unwrap(), "9007199254740993");
        assert_eq!(run("echo -9007199254740993 | cvt -i", &mut bg).unwrap(), "-9007199254740993");
    }

    #[test]
    fn text_helpers() {
        let mut bg = Background::new("t");
        assert_eq!(run("echo héllo | strlen", &mut bg).unwrap(), "5");
        assert_eq!(run("md5 abc", &mut bg).unwrap(), "900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(run("echo a b  c", &mut bg).unwrap(), "a b c");
    }
}
