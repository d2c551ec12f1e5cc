use std::sync::Arc;

use crate::background::{Background, KEY_OUTPUT};
use crate::error::ScriptError;

use super::pipeline::Pipeline;
use super::Composable;

/// A `$` reference inside a script or segment.
#[derive(Debug, Clone)]
pub enum VarRef {
    /// `$(NAME)`
    Local(String),
    /// `${NAME}`
    Global(String),
    /// `$<NAME>`, bare `$` reads `$<value>`
    Json(String),
    /// `$(@CMD ARGS...)`
    Command(Arc<Pipeline>),
}

impl VarRef {
    pub fn read(&self, bg: &mut Background) -> Result<String, ScriptError> {
        match self {
            VarRef::Local(name) => Ok(bg.get_local(name)),
            VarRef::Global(name) => Ok(bg.get_global(name)),
            VarRef::Json(name) => bg.get_json(name).ok_or_else(|| {
                if bg.json_depth() == 0 {
                    ScriptError::runtime(format!("`$<{name}>` read outside a JSON context"))
                } else {
                    ScriptError::runtime(format!("`$<{name}>` is not defined"))
                }
            }),
            VarRef::Command(pipeline) => pipeline.compose(bg),
        }
    }

    pub fn local_name(&self) -> Option<&str> {
        match self {
            VarRef::Local(name) => Some(name),
            _ => None,
        }
    }

    pub fn is_iterable(&self) -> bool {
        matches!(self, VarRef::Command(pipeline) if pipeline.is_iterable())
    }

    pub fn close(&self) {
        if let VarRef::Command(pipeline) = self {
            pipeline.close();
        }
    }
}

impl Composable for VarRef {
    fn compose(&self, bg: &mut Background) -> Result<String, ScriptError> {
        self.read(bg)
    }

    fn is_iterable(&self) -> bool {
        VarRef::is_iterable(self)
    }

    fn close(&self) {
        VarRef::close(self)
    }
}

/// Scan the reference starting at `src[pos]`, which must be `$`. Returns the
/// reference and the byte offset just past it.
pub fn scan(src: &str, pos: usize) -> Result<(VarRef, usize), ScriptError> {
    let rest = &src[pos + 1..];
    match rest.chars().next() {
        Some('(') => {
            let body_start = pos + 2;
            let close = find_paren_close(src, body_start)
                .ok_or_else(|| ScriptError::compile(&src[pos..], "unterminated `$(`"))?;
            let body = &src[body_start..close];
            let reference = if let Some(command) = body.strip_prefix('@') {
                VarRef::Command(Arc::new(Pipeline::compile(command)?))
            } else {
                VarRef::Local(checked_name(body, &src[pos..=close])?)
            };
            Ok((reference, close + 1))
        }
        Some('{') => {
            let close = src[pos + 2..]
                .find('}')
                .map(|offset| pos + 2 + offset)
                .ok_or_else(|| ScriptError::compile(&src[pos..], "unterminated `${`"))?;
            let name = checked_name(&src[pos + 2..close], &src[pos..=close])?;
            Ok((VarRef::Global(name), close + 1))
        }
        Some('<') => {
            let candidate = src[pos + 2..].find('>').and_then(|offset| {
                let name = &src[pos + 2..pos + 2 + offset];
                is_json_name(name).then(|| (name.to_string(), pos + 2 + offset + 1))
            });
            match candidate {
                Some((name, end)) => Ok((VarRef::Json(name), end)),
                // `$ <` with no valid name: a bare `$` followed by text
                None => Ok((VarRef::Json("value".to_string()), pos + 1)),
            }
        }
        Some('$') => Ok((VarRef::Local(KEY_OUTPUT.to_string()), pos + 2)),
        _ => Ok((VarRef::Json("value".to_string()), pos + 1)),
    }
}

fn checked_name(raw: &str, fragment: &str) -> Result<String, ScriptError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(ScriptError::compile(fragment, "empty variable name"));
    }
    Ok(name.to_string())
}

fn is_json_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// Index of the `)` closing a group whose body starts at `start`.
fn find_paren_close(src: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for (offset, c) in src[start..].char_indices() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' => depth += 1,
            ')' if depth == 0 => return Some(start + offset),
            ')' => depth -= 1,
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_all(src: &str) -> (VarRef, usize) {
        scan(src, 0).expect("scan")
    }

    #[test]
    fn scans_each_form() {
        assert!(matches!(scan_all("$(NAME)").0, VarRef::Local(ref n) if n == "NAME"));
        assert!(matches!(scan_all("${HOST}").0, VarRef::Global(ref n) if n == "HOST"));
        assert!(matches!(scan_all("$<key>").0, VarRef::Json(ref n) if n == "key"));
        assert!(matches!(scan_all("$$").0, VarRef::Local(ref n) if n == "OUTPUT"));
        assert!(matches!(scan_all("$ > 1").0, VarRef::Json(ref n) if n == "value"));
        assert!(matches!(scan_all("$(@echo hi)").0, VarRef::Command(_)));
    }

    #[test]
    fn bare_dollar_before_less_than() {
        let (reference, end) = scan_all("$< 9");
        assert!(matches!(reference, VarRef::Json(ref n) if n == "value"));
        assert_eq!(end, 1);
    }

    #[test]
    fn nested_command_reference() {
        let (_, end) = scan_all("$(@echo $(A)) tail");
        assert_eq!(end, "$(@echo $(A))".len());
    }

    #[test]
    fn unterminated_reference_fails() {
        assert!(scan("$(NAME", 0).is_err());
        assert!(scan("${NAME", 0).is_err());
        assert!(scan("$()", 0).is_err());
    }

    #[test]
    fn json_read_without_context_fails() {
        let mut bg = Background::new("t");
        assert!(VarRef::Json("value".into()).read(&mut bg).is_err());
        assert_eq!(VarRef::Local("missing".into()).read(&mut bg).unwrap(), "");
    }
}
