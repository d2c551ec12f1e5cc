use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use crate::background::Background;
use crate::engine::blocking;
use crate::error::ScriptError;
use crate::script::value::{parse_bool, parse_int, TRUE};
use crate::script::{Composable, Expression};

use super::{expect_words, words_or_input, Command, CommandSpec, Flags, Word};

fn expression(spec: &CommandSpec) -> Result<Expression, ScriptError> {
    if spec.args_src.trim().is_empty() {
        return Err(ScriptError::compile(
            &spec.name,
            format!("`{}` needs an expression", spec.name),
        ));
    }
    Expression::compile(&spec.args_src)
}

/// `assert <expr>`: fails unless the expression is true. The piped input
/// passes through so asserts can be chained.
#[derive(Debug)]
pub struct Assert {
    expression: Expression,
}

impl Assert {
    pub fn new(spec: CommandSpec) -> Result<Self, ScriptError> {
        Ok(Self {
            expression: expression(&spec)?,
        })
    }
}

impl Command for Assert {
    fn execute(&self, bg: &mut Background, input: Option<&str>) -> Result<String, ScriptError> {
        let result = self.expression.eval(bg)?;
        match parse_bool(&result) {
            Some(true) => Ok(input.unwrap_or(TRUE).to_string()),
            Some(false) => Err(ScriptError::runtime(format!(
                "assert failed: {}",
                self.expression.source()
            ))),
            None => Err(ScriptError::runtime(format!(
                "assert: `{}` yields `{result}`, not a boolean",
                self.expression.source()
            ))),
        }
    }
}

/// `expr <expr>`: the expression's value.
#[derive(Debug)]
pub struct Expr {
    expression: Expression,
}

impl Expr {
    pub fn new(spec: CommandSpec) -> Result<Self, ScriptError> {
        Ok(Self {
            expression: expression(&spec)?,
        })
    }
}

impl Command for Expr {
    fn execute(&self, bg: &mut Background, _input: Option<&str>) -> Result<String, ScriptError> {
        self.expression.eval(bg)
    }
}

#[derive(Debug)]
pub struct Nop;

impl Command for Nop {
    fn execute(&self, _bg: &mut Background, input: Option<&str>) -> Result<String, ScriptError> {
        Ok(input.unwrap_or_default().to_string())
    }
}

/// `print [text...]`: log a line at info level.
#[derive(Debug)]
pub struct Print {
    words: Vec<Word>,
}

impl Print {
    pub fn new(spec: CommandSpec) -> Self {
        Self { words: spec.words }
    }
}

impl Command for Print {
    fn execute(&self, bg: &mut Background, input: Option<&str>) -> Result<String, ScriptError> {
        let text = words_or_input(&self.words, bg, input)?;
        tracing::info!(target: "barrage::script", schedule = bg.name(), "{text}");
        Ok(input.map(str::to_string).unwrap_or(text))
    }
}

/// `report [-n] [-t NAME] [line...]`
///
/// Sends a line to the schedule's reporter: the literal words when given,
/// else the named template (`-t`), else the default format. A newline is
/// appended unless `-n`. Without a reporter the input passes through.
#[derive(Debug)]
pub struct Report {
    newline: bool,
    template: Option<Word>,
    line: Vec<Word>,
}

impl Report {
    pub fn new(mut spec: CommandSpec) -> Result<Self, ScriptError> {
        let mut flags = Flags::parse(&mut spec, &['n'], &['t'])?;
        Ok(Self {
            newline: !flags.has('n'),
            template: flags.take('t'),
            line: spec.words,
        })
    }
}

impl Command for Report {
    fn execute(&self, bg: &mut Background, input: Option<&str>) -> Result<String, ScriptError> {
        let passthrough = input.unwrap_or_default().to_string();
        let Some(reporter) = bg.reporter().cloned() else {
            return Ok(passthrough);
        };

        if !self.line.is_empty() {
            let mut line = super::compose_words(&self.line, bg)?;
            if self.newline {
                line.push('\n');
            }
            reporter.report_line(line);
            return Ok(passthrough);
        }
        match &self.template {
            Some(word) => {
                let name = word.compose(bg)?;
                reporter.report_template(bg, &name, self.newline)?;
            }
            None => reporter.report_default(bg, self.newline)?,
        }
        Ok(passthrough)
    }
}

/// `sleep <ms>`
#[derive(Debug)]
pub struct Sleep {
    millis: Word,
}

impl Sleep {
    pub fn new(mut spec: CommandSpec) -> Result<Self, ScriptError> {
        expect_words(&spec, 1, 1)?;
        Ok(Self {
            millis: spec.words.remove(0),
        })
    }
}

impl Command for Sleep {
    fn execute(&self, bg: &mut Background, input: Option<&str>) -> Result<String, ScriptError> {
        let text = self.millis.compose(bg)?;
        let millis = parse_int(&text)
            .filter(|ms| *ms >= 0)
            .ok_or_else(|| ScriptError::runtime(format!("sleep: `{text}` is not a duration in ms")))?;
        blocking(|| thread::sleep(Duration::from_millis(millis as u64)));
        Ok(input.unwrap_or_default().to_string())
    }
}

/// `call NAME`: run an imported function's fragments in order.
#[derive(Debug)]
pub struct Call {
    name: Word,
}

impl Call {
    pub fn new(mut spec: CommandSpec) -> Result<Self, ScriptError> {
        expect_words(&spec, 1, 1)?;
        Ok(Self {
            name: spec.words.remove(0),
        })
    }
}

impl Command for Call {
    fn execute(&self, bg: &mut Background, _input: Option<&str>) -> Result<String, ScriptError> {
        let name = self.name.compose(bg)?;
        let function = bg
            .function(&name)
            .cloned()
            .ok_or_else(|| ScriptError::runtime(format!("call: unknown function `{name}`")))?;
        function.compose(bg)
    }
}

#[derive(Debug, Default)]
struct SeqState {
    next: Option<i64>,
    done: bool,
}

/// `seq <from> <to>`: iterable inclusive counter.
#[derive(Debug)]
pub struct Seq {
    from: Word,
    to: Word,
    state: Mutex<SeqState>,
}

impl Seq {
    pub fn new(mut spec: CommandSpec) -> Result<Self, ScriptError> {
        expect_words(&spec, 2, 2)?;
        let to = spec.words.remove(1);
        Ok(Self {
            from: spec.words.remove(0),
            to,
            state: Mutex::new(SeqState::default()),
        })
    }

    fn bound(word: &Word, bg: &mut Background) -> Result<i64, ScriptError> {
        let text = word.compose(bg)?;
        parse_int(&text).ok_or_else(|| ScriptError::runtime(format!("seq: `{text}` is not an integer")))
    }
}

impl Command for Seq {
    fn execute(&self, bg: &mut Background, _input: Option<&str>) -> Result<String, ScriptError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.done {
            return Err(ScriptError::Eof);
        }
        let current = match state.next {
            Some(value) => value,
            None => Self::bound(&self.from, bg)?,
        };
        let last = Self::bound(&self.to, bg)?;
        if current > last {
            state.done = true;
            return Err(ScriptError::Eof);
        }
        state.next = Some(current + 1);
        Ok(current.to_string())
    }

    fn is_iterable(&self) -> bool {
        true
    }

    fn close(&self) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).done = true;
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::run;
    use crate::background::{Background, Functions};
    use crate::error::ScriptError;
    use crate::script::{compile_segments, Composable, Group, Pipeline};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn assert_passes_input_through() {
        let mut bg = Background::new("t");
        assert_eq!(run("echo 5 | assert $$ > 1 | assert $$ < 9", &mut bg).unwrap(), "5");
        assert_eq!(run("assert 1 == 1", &mut bg).unwrap(), "TRUE");
    }

    #[test]
    fn assert_failure_is_runtime_error() {
        let mut bg = Background::new("t");
        let err = run("assert 2 < 1", &mut bg).unwrap_err();
        assert!(matches!(err, ScriptError::Runtime(_)));
        assert!(bg.error().unwrap().contains("assert failed"));
        assert!(run("assert 1 + 1", &mut bg).is_err());
        assert!(Pipeline::compile("assert").is_err());
    }

    #[test]
    fn expr_evaluates_with_side_effects() {
        let mut bg = Background::new("t");
        assert_eq!(run("expr n = 4; $(n) * 2", &mut bg).unwrap(), "8");
        assert_eq!(bg.get_local("n"), "4");
    }

    #[test]
    fn seq_counts_inclusively_then_eof() {
        let pipeline = Pipeline::compile("seq 1 3").unwrap();
        assert!(pipeline.is_iterable());
        let mut bg = Background::new("t");
        let values: Vec<String> = (0..3).map(|_| pipeline.compose(&mut bg).unwrap()).collect();
        assert_eq!(values, ["1", "2", "3"]);
        assert_eq!(pipeline.compose(&mut bg), Err(ScriptError::Eof));
        assert_eq!(pipeline.compose(&mut bg), Err(ScriptError::Eof));
    }

    #[test]
    fn call_runs_imported_function() {
        let mut functions: Functions = HashMap::new();
        functions.insert(
            "login".to_string(),
            Arc::new(Group::new(
                compile_segments(&["`env -w -c tok TOKEN`".to_string(), "Bearer $(TOKEN)".to_string()])
                    .unwrap(),
            )),
        );
        let mut bg = Background::new("t").with_functions(Arc::new(functions));
        assert_eq!(run("call login", &mut bg).unwrap(), "Bearer tok");
        assert!(run("call missing", &mut bg).is_err());
    }

    #[test]
    fn sleep_validates_duration() {
        let mut bg = Background::new("t");
        assert_eq!(run("echo x | sleep 1", &mut bg).unwrap(), "x");
        assert!(run("sleep soon", &mut bg).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn sleep_hands_worker_to_other_tasks() {
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let sleeper = tokio::spawn(async move {
            let _ = started_tx.send(());
            let mut bg = Background::new("t");
            run("sleep 400", &mut bg).map(|_| ())
        });
        started_rx.await.unwrap();

        let start = Instant::now();
        let other = tokio::spawn(async move { start.elapsed() }).await.unwrap();
        assert!(other < Duration::from_millis(300), "other task waited {other:?}");
        sleeper.await.unwrap().unwrap();
    }

    #[test]
    fn report_without_reporter_passes_through() {
        let mut bg = Background::new("t");
        assert_eq!(run("echo x | report", &mut bg).unwrap(), "x");
        assert_eq!(run("print hello", &mut bg).unwrap(), "hello");
    }
}
