//! # Script language
//!
//! Configuration strings are compiled into [`Composable`] fragments:
//! segments (literal text with `$` references and back-tick pipelines),
//! pipelines of commands, and infix expressions used by `assert` and `expr`.

pub mod expr;
pub mod lexer;
pub mod pipeline;
pub mod segment;
pub mod value;
pub mod var;

use std::fmt;
use std::sync::Arc;

use crate::background::Background;
use crate::error::ScriptError;

pub use expr::Expression;
pub use pipeline::Pipeline;
pub use segment::Segment;
pub use var::VarRef;

/// A compiled fragment that renders to a string against a [`Background`].
///
/// Iterable fragments advance on every `compose` and return
/// [`ScriptError::Eof`] once exhausted.
pub trait Composable: fmt::Debug + Send + Sync {
    fn compose(&self, bg: &mut Background) -> Result<String, ScriptError>;

    fn is_static(&self) -> bool {
        false
    }

    fn is_iterable(&self) -> bool {
        false
    }

    fn close(&self) {}
}

/// Fragments executed in order for their side effects. The group's value
/// is the last fragment's output.
#[derive(Debug, Default)]
pub struct Group {
    members: Vec<Arc<dyn Composable>>,
}

impl Group {
    pub fn new(members: Vec<Arc<dyn Composable>>) -> Self {
        Self { members }
    }
}

impl Composable for Group {
    fn compose(&self, bg: &mut Background) -> Result<String, ScriptError> {
        let mut last = String::new();
        for member in &self.members {
            last = member.compose(bg)?;
        }
        Ok(last)
    }

    fn is_iterable(&self) -> bool {
        self.members.iter().any(|member| member.is_iterable())
    }

    fn close(&self) {
        for member in &self.members {
            member.close();
        }
    }
}

pub fn compile_segment(source: &str) -> Result<Arc<dyn Composable>, ScriptError> {
    Ok(Arc::new(Segment::compile(source)?))
}

pub fn compile_segments(sources: &[String]) -> Result<Vec<Arc<dyn Composable>>, ScriptError> {
    sources.iter().map(|source| compile_segment(source)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_runs_members_in_order() {
        let group = Group::new(compile_segments(&[
            "`env -w -c 1 A`".to_string(),
            "`echo $(A) | env -w B`".to_string(),
            "$(B)-done".to_string(),
        ])
        .unwrap());
        let mut bg = Background::new("t");
        assert_eq!(group.compose(&mut bg).unwrap(), "1-done");
    }

    #[test]
    fn env_write_then_compare() {
        let mut bg = Background::new("t");
        compile_segment("`echo value | env -w X`")
            .unwrap()
            .compose(&mut bg)
            .unwrap();
        let check = Expression::compile("$(X) == value").unwrap();
        assert_eq!(check.eval(&mut bg).unwrap(), "TRUE");
    }
}
