use std::sync::Arc;

use crate::background::Background;
use crate::error::ScriptError;

use super::pipeline::Pipeline;
use super::var::{self, VarRef};
use super::Composable;

#[derive(Debug)]
enum Part {
    Text(String),
    Var(VarRef),
    Pipeline(Arc<Pipeline>),
}

/// A compiled string mixing literal text, `$` references and back-tick
/// pipelines. `\`` and `\$` escape the two special characters.
#[derive(Debug)]
pub struct Segment {
    source: String,
    parts: Vec<Part>,
    iterable: bool,
}

impl Segment {
    pub fn compile(source: &str) -> Result<Self, ScriptError> {
        let mut parts = Vec::new();
        let mut text = String::new();
        let mut pos = 0;

        while pos < source.len() {
            let rest = &source[pos..];
            let c = rest.chars().next().unwrap_or_default();
            match c {
                '\\' if rest[1..].starts_with(['`', '$']) => {
                    text.push_str(&rest[1..2]);
                    pos += 2;
                }
                '`' => {
                    let close = find_backtick(source, pos + 1).ok_or_else(|| {
                        ScriptError::compile(&source[pos..], "unterminated back-tick")
                    })?;
                    flush(&mut parts, &mut text);
                    let pipeline = Pipeline::compile(&source[pos + 1..close])?;
                    parts.push(Part::Pipeline(Arc::new(pipeline)));
                    pos = close + 1;
                }
                '$' => {
                    let (reference, end) = var::scan(source, pos)?;
                    flush(&mut parts, &mut text);
                    parts.push(Part::Var(reference));
                    pos = end;
                }
                _ => {
                    text.push(c);
                    pos += c.len_utf8();
                }
            }
        }
        flush(&mut parts, &mut text);

        let iterable = parts.iter().any(|part| match part {
            Part::Pipeline(pipeline) => pipeline.is_iterable(),
            Part::Var(reference) => reference.is_iterable(),
            Part::Text(_) => false,
        });

        Ok(Self {
            source: source.to_string(),
            parts,
            iterable,
        })
    }

    /// A segment holding `text` verbatim.
    pub fn literal(text: &str) -> Self {
        let parts = if text.is_empty() {
            Vec::new()
        } else {
            vec![Part::Text(text.to_string())]
        };
        Self {
            source: text.to_string(),
            parts,
            iterable: false,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

fn flush(parts: &mut Vec<Part>, text: &mut String) {
    if !text.is_empty() {
        parts.push(Part::Text(std::mem::take(text)));
    }
}

fn find_backtick(source: &str, start: usize) -> Option<usize> {
    let mut escaped = false;
    for (offset, c) in source[start..].char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '`' => return Some(start + offset),
            _ => {}
        }
    }
    None
}

impl Composable for Segment {
    fn compose(&self, bg: &mut Background) -> Result<String, ScriptError> {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Text(text) => out.push_str(text),
                Part::Var(reference) => out.push_str(&reference.read(bg)?),
                Part::Pipeline(pipeline) => out.push_str(&pipeline.compose(bg)?),
            }
        }
        Ok(out)
    }

    fn is_static(&self) -> bool {
        self.parts.iter().all(|part| matches!(part, Part::Text(_)))
    }

    fn is_iterable(&self) -> bool {
        self.iterable
    }

    fn close(&self) {
        for part in &self.parts {
            match part {
                Part::Var(reference) => reference.close(),
                Part::Pipeline(pipeline) => pipeline.close(),
                Part::Text(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn static_segment() {
        let segment = Segment::compile("http://example.com/a").unwrap();
        assert!(segment.is_static());
        let mut bg = Background::new("t");
        assert_eq!(segment.compose(&mut bg).unwrap(), "http://example.com/a");
    }

    #[test]
    fn composes_variables_and_pipelines() {
        let mut bg = Background::new("t");
        bg.set_local("ID", "42");
        bg.set_global("HOST", "api.test");
        let segment = Segment::compile("http://${HOST}/users/$(ID)?q=`echo hi | strlen`").unwrap();
        assert!(!segment.is_static());
        assert!(!segment.is_iterable());
        assert_eq!(
            segment.compose(&mut bg).unwrap(),
            "http://api.test/users/42?q=2"
        );
    }

    #[test]
    fn escapes_special_characters() {
        let segment = Segment::compile("cost \\$5 and \\`tick\\`").unwrap();
        assert!(segment.is_static());
        let mut bg = Background::new("t");
        assert_eq!(segment.compose(&mut bg).unwrap(), "cost $5 and `tick`");
    }

    #[test]
    fn unterminated_backtick_fails() {
        assert!(Segment::compile("a `echo b").is_err());
    }

    #[test]
    fn iterable_segment_yields_each_line_then_eof() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "alpha\n\nbeta\ngamma").unwrap();
        let source = format!("id=`list {}`", file.path().display());
        let segment = Segment::compile(&source).unwrap();
        assert!(segment.is_iterable());

        let mut bg = Background::new("t");
        let produced: Vec<String> = (0..3).map(|_| segment.compose(&mut bg).unwrap()).collect();
        assert_eq!(produced, vec!["id=alpha", "id=beta", "id=gamma"]);
        assert_eq!(segment.compose(&mut bg), Err(ScriptError::Eof));
        assert_eq!(segment.compose(&mut bg), Err(ScriptError::Eof));
    }
}
