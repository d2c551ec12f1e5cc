use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Lines, Write as _};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use crate::background::Background;
use crate::error::ScriptError;

use super::{compose_words, expect_words, words_or_input, Command, CommandSpec, Flags, Word};

fn io_error(action: &str, path: &str, err: std::io::Error) -> ScriptError {
    ScriptError::runtime(format!("{action} `{path}`: {err}"))
}

/// `cat [path]`: file contents, read once and cached. Without a path the
/// piped input passes through.
#[derive(Debug)]
pub struct Cat {
    path: Option<Word>,
    cache: Mutex<Option<(String, String)>>,
}

impl Cat {
    pub fn new(mut spec: CommandSpec) -> Result<Self, ScriptError> {
        expect_words(&spec, 0, 1)?;
        Ok(Self {
            path: spec.words.pop(),
            cache: Mutex::new(None),
        })
    }
}

impl Command for Cat {
    fn execute(&self, bg: &mut Background, input: Option<&str>) -> Result<String, ScriptError> {
        let Some(word) = &self.path else {
            return Ok(input.unwrap_or_default().to_string());
        };
        let path = word.compose(bg)?;
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((cached_path, content)) = cache.as_ref() {
            if *cached_path == path {
                return Ok(content.clone());
            }
        }
        let content = fs::read_to_string(&path).map_err(|err| io_error("cat: cannot read", &path, err))?;
        *cache = Some((path, content.clone()));
        Ok(content)
    }

    fn close(&self) {
        *self.cache.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// `write [-a] <path> [content...]`: write (or append) content, falling
/// back to the piped input. Outputs what was written.
#[derive(Debug)]
pub struct Write {
    append: bool,
    path: Word,
    content: Vec<Word>,
}

impl Write {
    pub fn new(mut spec: CommandSpec) -> Result<Self, ScriptError> {
        let flags = Flags::parse(&mut spec, &['a'], &[])?;
        if spec.words.is_empty() {
            return Err(ScriptError::compile(&spec.args_src, "`write` needs a path"));
        }
        let content = spec.words.split_off(1);
        let path = spec.words.remove(0);
        Ok(Self {
            append: flags.has('a'),
            path,
            content,
        })
    }
}

impl Command for Write {
    fn execute(&self, bg: &mut Background, input: Option<&str>) -> Result<String, ScriptError> {
        let path = self.path.compose(bg)?;
        if path.trim().is_empty() {
            return Err(ScriptError::runtime("write: empty path"));
        }
        let content = words_or_input(&self.content, bg, input)?;

        if let Some(parent) = Path::new(&path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|err| io_error("write: cannot create directory for", &path, err))?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(self.append)
            .truncate(!self.append)
            .open(&path)
            .map_err(|err| io_error("write: cannot open", &path, err))?;
        file.write_all(content.as_bytes())
            .map_err(|err| io_error("write: cannot write", &path, err))?;
        Ok(content)
    }
}

#[derive(Debug, Default)]
struct ListState {
    lines: Option<Lines<BufReader<File>>>,
    done: bool,
}

/// `list <path>`: iterable line reader. Each call yields the next non-empty
/// line; after the last one every call returns EOF.
#[derive(Debug)]
pub struct List {
    path: Word,
    state: Mutex<ListState>,
}

impl List {
    pub fn new(mut spec: CommandSpec) -> Result<Self, ScriptError> {
        expect_words(&spec, 1, 1)?;
        Ok(Self {
            path: spec.words.remove(0),
            state: Mutex::new(ListState::default()),
        })
    }
}

impl Command for List {
    fn execute(&self, bg: &mut Background, _input: Option<&str>) -> Result<String, ScriptError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.done {
            return Err(ScriptError::Eof);
        }
        if state.lines.is_none() {
            let path = self.path.compose(bg)?;
            let file = File::open(&path).map_err(|err| io_error("list: cannot open", &path, err))?;
            state.lines = Some(BufReader::new(file).lines());
        }

        let lines = state.lines.as_mut().ok_or(ScriptError::Eof)?;
        for line in lines.by_ref() {
            let line = line.map_err(|err| ScriptError::runtime(format!("list: {err}")))?;
            let line = line.trim_end_matches('\r');
            if !line.trim().is_empty() {
                return Ok(line.to_string());
            }
        }

        state.lines = None;
        state.done = true;
        Err(ScriptError::Eof)
    }

    fn is_iterable(&self) -> bool {
        true
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.lines = None;
        state.done = true;
    }
}

/// `b64 [-f] [-d] [data...]`: base64 of the literal, the file named by it
/// (`-f`), or the piped input. `-d` decodes instead.
#[derive(Debug)]
pub struct Base64 {
    from_file: bool,
    decode: bool,
    data: Vec<Word>,
}

impl Base64 {
    pub fn new(mut spec: CommandSpec) -> Result<Self, ScriptError> {
        let flags = Flags::parse(&mut spec, &['f', 'd'], &[])?;
        Ok(Self {
            from_file: flags.has('f'),
            decode: flags.has('d'),
            data: spec.words,
        })
    }
}

impl Command for Base64 {
    fn execute(&self, bg: &mut Background, input: Option<&str>) -> Result<String, ScriptError> {
        let data = if self.data.is_empty() {
            input.unwrap_or_default().to_string()
        } else {
            compose_words(&self.data, bg)?
        };
        let bytes = if self.from_file {
            fs::read(&data).map_err(|err| io_error("b64: cannot read", &data, err))?
        } else {
            data.into_bytes()
        };

        if self.decode {
            let text = String::from_utf8_lossy(&bytes);
            let decoded = STANDARD
                .decode(text.trim())
                .map_err(|err| ScriptError::runtime(format!("b64: invalid input: {err}")))?;
            return Ok(String::from_utf8_lossy(&decoded).into_owned());
        }
        Ok(STANDARD.encode(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::run;
    use crate::background::Background;
    use crate::error::ScriptError;
    use crate::script::{Composable, Pipeline};
    use std::io::Write as _;

    #[test]
    fn cat_reads_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("body.json");
        std::fs::write(&path, "{\"a\":1}").unwrap();

        let pipeline = Pipeline::compile(&format!("cat {}", path.display())).unwrap();
        let mut bg = Background::new("t");
        assert_eq!(pipeline.compose(&mut bg).unwrap(), "{\"a\":1}");

        std::fs::write(&path, "changed").unwrap();
        assert_eq!(pipeline.compose(&mut bg).unwrap(), "{\"a\":1}");
    }

    #[test]
    fn write_creates_parents_and_uses_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.txt");
        let mut bg = Background::new("t");
        run(&format!("echo hello | write {}", path.display()), &mut bg).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");

        run(&format!("write -a {} more", path.display()), &mut bg).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hellomore");
    }

    #[test]
    fn write_rejects_empty_path() {
        let mut bg = Background::new("t");
        let err = run("write $(NOPE) data", &mut bg).unwrap_err();
        assert_eq!(err, ScriptError::runtime("write: empty path"));
    }

    #[test]
    fn list_iterates_non_empty_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "one\r\n\n  \ntwo\nthree").unwrap();
        let pipeline = Pipeline::compile(&format!("list {}", file.path().display())).unwrap();
        assert!(pipeline.is_iterable());

        let mut bg = Background::new("t");
        assert_eq!(pipeline.compose(&mut bg).unwrap(), "one");
        assert_eq!(pipeline.compose(&mut bg).unwrap(), "two");
        assert_eq!(pipeline.compose(&mut bg).unwrap(), "three");
        assert_eq!(pipeline.compose(&mut bg), Err(ScriptError::Eof));
    }

    #[test]
    fn list_on_missing_file_is_an_error_not_eof() {
        let mut bg = Background::new("t");
        let err = run("list /definitely/not/here.txt", &mut bg).unwrap_err();
        assert!(!err.is_eof());
    }

    #[test]
    fn b64_encodes_and_decodes() {
        let mut bg = Background::new("t");
        assert_eq!(run("b64 hello", &mut bg).unwrap(), "aGVsbG8=");
        assert_eq!(run("echo hello | b64 | b64 -d", &mut bg).unwrap(), "hello");

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "abc").unwrap();
        let encoded = run(&format!("b64 -f {}", file.path().display()), &mut bg).unwrap();
        assert_eq!(encoded, "YWJj");
    }
}
