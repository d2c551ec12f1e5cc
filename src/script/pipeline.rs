use crate::background::Background;
use crate::commands::{self, Command, CommandSpec, Word};
use crate::error::ScriptError;

use super::segment::Segment;
use super::Composable;

/// Commands joined by `|`. Each stage receives the previous stage's output
/// as its piped input and as `$(INPUT)`.
#[derive(Debug)]
pub struct Pipeline {
    stages: Vec<Box<dyn Command>>,
    iterable: bool,
}

impl Pipeline {
    pub fn compile(source: &str) -> Result<Self, ScriptError> {
        let mut stages = Vec::new();
        for stage in split_stages(source) {
            let stage = stage.trim();
            if stage.is_empty() {
                return Err(ScriptError::compile(source, "empty pipeline stage"));
            }
            stages.push(commands::build(parse_stage(stage)?)?);
        }
        let iterable = stages.iter().any(|command| command.is_iterable());
        Ok(Self {
            stages,
            iterable,
        })
    }

    pub fn is_iterable(&self) -> bool {
        self.iterable
    }

    pub fn close(&self) {
        for command in &self.stages {
            command.close();
        }
    }
}

impl Composable for Pipeline {
    fn compose(&self, bg: &mut Background) -> Result<String, ScriptError> {
        let mut input: Option<String> = None;
        for command in &self.stages {
            if let Some(piped) = &input {
                bg.set_input(piped.clone());
            }
            match command.execute(bg, input.as_deref()) {
                Ok(output) => {
                    bg.set_output(output.clone());
                    input = Some(output);
                }
                Err(ScriptError::Eof) => return Err(ScriptError::Eof),
                Err(err) => {
                    bg.set_error(err.to_string());
                    return Err(err);
                }
            }
        }
        Ok(input.unwrap_or_default())
    }

    fn is_iterable(&self) -> bool {
        self.iterable
    }

    fn close(&self) {
        Pipeline::close(self)
    }
}

/// Split on top-level `|`, leaving `||` and anything quoted or bracketed alone.
fn split_stages(source: &str) -> Vec<&str> {
    let bytes = source.as_bytes();
    let mut stages = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            if b == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match b {
            b'\'' | b'"' => quote = Some(b),
            b'(' | b'{' | b'[' => depth += 1,
            b')' | b'}' | b']' => depth = depth.saturating_sub(1),
            b'|' if bytes.get(i + 1) == Some(&b'|') => {
                i += 2;
                continue;
            }
            b'|' if depth == 0 => {
                stages.push(&source[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    stages.push(&source[start..]);
    stages
}

/// Split a stage into whitespace-separated words. Quotes and brackets group.
fn split_words(stage: &str) -> Vec<&str> {
    let mut words = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start: Option<usize> = None;

    for (i, c) in stage.char_indices() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        if c.is_whitespace() && depth == 0 {
            if let Some(s) = start.take() {
                words.push(&stage[s..i]);
            }
            continue;
        }
        if start.is_none() {
            start = Some(i);
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '{' | '[' => depth += 1,
            ')' | '}' | ']' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    if let Some(s) = start {
        words.push(&stage[s..]);
    }
    words
}

fn parse_stage(stage: &str) -> Result<CommandSpec, ScriptError> {
    let raw_words = split_words(stage);
    let Some((name, rest)) = raw_words.split_first() else {
        return Err(ScriptError::compile(stage, "missing command name"));
    };
    let args_src = stage[name.len()..].trim().to_string();
    let words = rest
        .iter()
        .map(|raw| compile_word(raw))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(CommandSpec {
        name: name.to_string(),
        args_src,
        words,
    })
}

/// Single quotes keep text verbatim; double quotes and bare words expand.
fn compile_word(raw: &str) -> Result<Word, ScriptError> {
    let segment = if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
        Segment::literal(&raw[1..raw.len() - 1])
    } else if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        Segment::compile(&raw[1..raw.len() - 1])?
    } else {
        Segment::compile(raw)?
    };
    Ok(Word {
        raw: raw.to_string(),
        segment,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_single_pipe_only() {
        assert_eq!(
            split_stages("assert $ > 1 || $ < 0 | echo ok"),
            vec!["assert $ > 1 || $ < 0 ", " echo ok"]
        );
        assert_eq!(split_stages("echo 'a|b' | strlen"), vec!["echo 'a|b' ", " strlen"]);
        assert_eq!(split_stages("echo $(@echo a | strlen)"), vec!["echo $(@echo a | strlen)"]);
    }

    #[test]
    fn words_keep_groups_together() {
        assert_eq!(
            split_words(r#"json .a {"a": 1, "b": 2}"#),
            vec!["json", ".a", r#"{"a": 1, "b": 2}"#]
        );
        assert_eq!(split_words("echo 'hello world' x"), vec!["echo", "'hello world'", "x"]);
    }

    #[test]
    fn pipes_output_into_input() {
        let pipeline = Pipeline::compile("echo hello | strlen").unwrap();
        let mut bg = Background::new("t");
        assert_eq!(pipeline.compose(&mut bg).unwrap(), "5");
        assert_eq!(bg.get_local("INPUT"), "hello");
        assert_eq!(bg.get_local("OUTPUT"), "5");
    }

    #[test]
    fn error_short_circuits_and_lands_in_background() {
        let pipeline = Pipeline::compile("echo 3 | assert $$ > 5 | env -w NEVER").unwrap();
        let mut bg = Background::new("t");
        assert!(pipeline.compose(&mut bg).is_err());
        assert!(bg.error().is_some());
        assert_eq!(bg.get_local("NEVER"), "");
    }

    #[test]
    fn single_quotes_suppress_expansion() {
        let pipeline = Pipeline::compile("echo '$(X)' \"$(X)\"").unwrap();
        let mut bg = Background::new("t");
        bg.set_local("X", "1");
        assert_eq!(pipeline.compose(&mut bg).unwrap(), "$(X) 1");
    }

    #[test]
    fn unknown_command_fails_to_compile() {
        assert!(Pipeline::compile("frobnicate x").is_err());
        assert!(Pipeline::compile("echo a | ").is_err());
    }
}
