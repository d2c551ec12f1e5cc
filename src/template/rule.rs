use serde_json::{Map, Value as JsonValue};

use crate::background::{json_text, Background};
use crate::error::ScriptError;
use crate::script::value::numbers_equal;
use crate::script::{Composable, Segment};

/// Properties suffixed to a member key: `"name: optional,index"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyProps {
    pub optional: bool,
    pub absent: bool,
    pub index: bool,
}

#[derive(Debug)]
pub struct Member {
    pub key: String,
    pub props: KeyProps,
    pub rule: Rule,
}

#[derive(Debug, Default)]
pub struct ObjectRule {
    pub members: Vec<Member>,
    pub default: Option<Box<Rule>>,
}

impl ObjectRule {
    pub fn index_members(&self) -> impl Iterator<Item = &Member> {
        self.members.iter().filter(|member| member.props.index)
    }

    pub fn is_searcher(&self) -> bool {
        self.index_members().next().is_some()
    }

    /// A searcher may find nothing only if every index member is optional.
    fn is_optional_searcher(&self) -> bool {
        self.index_members().all(|member| member.props.optional)
    }
}

#[derive(Debug, Default)]
pub struct ListRule {
    pub members: Vec<Rule>,
    pub searchers: Vec<ObjectRule>,
    pub item: Option<Box<Rule>>,
    pub list: Option<Box<Rule>>,
    pub default: Option<Box<Rule>>,
    pub template: Option<Box<Rule>>,
}

/// A compiled template node.
#[derive(Debug)]
pub enum Rule {
    Static(JsonValue),
    Dynamic(Vec<Segment>),
    Object(ObjectRule),
    List(ListRule),
}

fn child_path(path: &str, key: &str) -> String {
    format!("{path}.{key}")
}

fn element_path(path: &str, index: usize) -> String {
    format!("{path}[{index}]")
}

fn shown(path: &str) -> &str {
    if path.is_empty() {
        "."
    } else {
        path
    }
}

fn type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "list",
        JsonValue::Object(_) => "object",
    }
}

fn static_equal(expected: &JsonValue, actual: &JsonValue) -> bool {
    match (expected, actual) {
        (JsonValue::Number(e), JsonValue::Number(a)) => {
            let close = match (e.as_f64(), a.as_f64()) {
                (Some(e), Some(a)) => numbers_equal(e, a),
                _ => false,
            };
            close || matches!((e.as_i64(), a.as_i64()), (Some(e), Some(a)) if e == a)
        }
        (JsonValue::Bool(e), JsonValue::Bool(a)) => e == a,
        (JsonValue::String(e), JsonValue::String(a)) => e == a,
        (JsonValue::Null, JsonValue::Null) => true,
        _ => false,
    }
}

impl Rule {
    /// Match `value` found under `key`. The value is pushed as a JSON frame
    /// for the duration of the match.
    pub fn compare(
        &self,
        bg: &mut Background,
        path: &str,
        key: &str,
        value: &JsonValue,
    ) -> Result<(), ScriptError> {
        bg.push_json_env(key, value.clone());
        let result = self.compare_in_frame(bg, path, value);
        bg.pop_json_env();
        result
    }

    fn compare_in_frame(
        &self,
        bg: &mut Background,
        path: &str,
        value: &JsonValue,
    ) -> Result<(), ScriptError> {
        match self {
            Rule::Static(expected) => {
                if static_equal(expected, value) {
                    Ok(())
                } else {
                    Err(ScriptError::mismatch(
                        shown(path),
                        expected.to_string(),
                        value.to_string(),
                    ))
                }
            }
            Rule::Dynamic(segments) => {
                for segment in segments {
                    if let Err(err) = segment.compose(bg) {
                        return Err(ScriptError::mismatch(
                            shown(path),
                            segment.source(),
                            format!("{} ({err})", json_text(value)),
                        ));
                    }
                }
                Ok(())
            }
            Rule::Object(object) => object.compare(bg, path, value),
            Rule::List(list) => list.compare(bg, path, value),
        }
    }
}

impl ObjectRule {
    fn compare(&self, bg: &mut Background, path: &str, value: &JsonValue) -> Result<(), ScriptError> {
        let empty = Map::new();
        let observed = match value {
            JsonValue::Object(members) => members,
            JsonValue::Null => &empty,
            other => {
                return Err(ScriptError::mismatch(shown(path), "object", type_name(other)));
            }
        };

        for member in &self.members {
            let member_path = child_path(path, &member.key);
            match observed.get(&member.key) {
                Some(_) if member.props.absent => {
                    return Err(ScriptError::mismatch(member_path, "absent", "present"));
                }
                Some(found) => member.rule.compare(bg, &member_path, &member.key, found)?,
                None if member.props.optional || member.props.absent => {}
                None => return Err(ScriptError::mismatch(member_path, "present", "missing")),
            }
        }

        if let Some(default) = &self.default {
            for (key, found) in observed {
                if self.members.iter().any(|member| member.key == *key) {
                    continue;
                }
                default.compare(bg, &child_path(path, key), key, found)?;
            }
        }
        Ok(())
    }

    /// Whether `value` satisfies every index member. Errors raised while
    /// probing are swallowed and the error slot is restored.
    fn matches_index(&self, bg: &mut Background, path: &str, key: &str, value: &JsonValue) -> bool {
        let JsonValue::Object(observed) = value else {
            return false;
        };
        let saved = bg.error().map(str::to_string);
        bg.push_json_env(key, value.clone());
        let matched = self.index_members().all(|member| match observed.get(&member.key) {
            Some(found) => member
                .rule
                .compare(bg, &child_path(path, &member.key), &member.key, found)
                .is_ok(),
            None => false,
        });
        bg.pop_json_env();
        match saved {
            Some(error) => bg.set_error(error),
            None => bg.clear_error(),
        }
        matched
    }
}

impl ListRule {
    fn compare(&self, bg: &mut Background, path: &str, value: &JsonValue) -> Result<(), ScriptError> {
        let JsonValue::Array(items) = value else {
            return Err(ScriptError::mismatch(shown(path), "list", type_name(value)));
        };

        if let Some(list) = &self.list {
            list.compare_in_frame(bg, path, value)?;
        }
        for broadcast in [&self.item, &self.template].into_iter().flatten() {
            for (index, item) in items.iter().enumerate() {
                broadcast.compare(bg, &element_path(path, index), &index.to_string(), item)?;
            }
        }

        if items.len() < self.members.len() {
            return Err(ScriptError::mismatch(
                shown(path),
                format!("at least {} elements", self.members.len()),
                items.len().to_string(),
            ));
        }
        for (index, (rule, item)) in self.members.iter().zip(items).enumerate() {
            rule.compare(bg, &element_path(path, index), &index.to_string(), item)?;
        }

        let mut remaining: Vec<(usize, &JsonValue)> =
            items.iter().enumerate().skip(self.members.len()).collect();
        for searcher in &self.searchers {
            let found = remaining.iter().position(|(index, item)| {
                searcher.matches_index(bg, &element_path(path, *index), &index.to_string(), item)
            });
            match found {
                Some(position) => {
                    let (index, item) = remaining.remove(position);
                    let item_path = element_path(path, index);
                    bg.push_json_env(index.to_string(), item.clone());
                    let result = searcher.compare(bg, &item_path, item);
                    bg.pop_json_env();
                    result?;
                }
                None if searcher.is_optional_searcher() => {}
                None => {
                    let wanted: Vec<&str> =
                        searcher.index_members().map(|member| member.key.as_str()).collect();
                    return Err(ScriptError::mismatch(
                        shown(path),
                        format!("an element matching index {}", wanted.join(",")),
                        "none",
                    ));
                }
            }
        }

        match &self.default {
            Some(default) => {
                for (index, item) in remaining {
                    default.compare(bg, &element_path(path, index), &index.to_string(), item)?;
                }
            }
            None => {
                let covered = self.item.is_some() || self.template.is_some();
                if !self.members.is_empty() && !covered {
                    if let Some((index, item)) = remaining.first() {
                        return Err(ScriptError::mismatch(
                            element_path(path, *index),
                            "no element",
                            item.to_string(),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}
