//! # JSON template comparator
//!
//! A template is itself JSON. Scalars compare by value, strings wrapped in
//! back-ticks run as scripts against the matched value (`$`), objects match
//! member by member and lists match positionally or by searching.
//!
//! ```text
//! {"id": "`assert $ > 0`", "name: optional": "bob", "`default`": "`nop`"}
//! [{"`item`": {"id": "`assert $ > 0`"}}, {"id: index": 7, "tag": "x"}]
//! ```

mod rule;

use serde_json::{Map, Value as JsonValue};

use crate::background::Background;
use crate::error::ScriptError;
use crate::script::Segment;

pub use rule::{KeyProps, ListRule, Member, ObjectRule, Rule};

const META_DEFAULT: &str = "default";
const META_LIST: &str = "list";
const META_ITEM: &str = "item";
const META_TEMPLATE: &str = "template";

/// A compiled template, immutable and shareable between workers.
#[derive(Debug)]
pub struct Template {
    root: Rule,
}

impl Template {
    pub fn compile(template: &JsonValue) -> Result<Self, ScriptError> {
        Ok(Self {
            root: compile_rule(template)?,
        })
    }

    /// Match an observed document. The first mismatch is returned.
    pub fn compare(&self, bg: &mut Background, observed: &JsonValue) -> Result<(), ScriptError> {
        self.root.compare(bg, "", "", observed)
    }
}

/// `` `name` `` → `name`.
fn unquote_script(text: &str) -> Option<&str> {
    text.strip_prefix('`')?.strip_suffix('`')
}

fn is_script(text: &str) -> bool {
    text.len() >= 2 && unquote_script(text).is_some()
}

/// Split `"name: optional,absent"` into its name and properties. Keys whose
/// suffix is not a property list are taken literally.
pub fn parse_key(raw: &str) -> Result<(String, KeyProps), ScriptError> {
    let Some((name, suffix)) = raw.rsplit_once(':') else {
        return Ok((raw.to_string(), KeyProps::default()));
    };
    let mut props = KeyProps::default();
    for prop in suffix.split(',').map(str::trim) {
        match prop {
            "optional" => props.optional = true,
            "absent" => props.absent = true,
            "index" => props.index = true,
            _ => return Ok((raw.to_string(), KeyProps::default())),
        }
    }
    if props.optional && props.absent {
        return Err(ScriptError::compile(raw, "a key cannot be both optional and absent"));
    }
    Ok((name.trim().to_string(), props))
}

fn compile_rule(template: &JsonValue) -> Result<Rule, ScriptError> {
    match template {
        JsonValue::String(text) if is_script(text) => Ok(Rule::Dynamic(vec![Segment::compile(text)?])),
        JsonValue::Array(items) if is_script_list(items) => {
            let segments = items
                .iter()
                .filter_map(JsonValue::as_str)
                .map(Segment::compile)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Rule::Dynamic(segments))
        }
        JsonValue::Array(items) => compile_list(items).map(Rule::List),
        JsonValue::Object(members) => compile_object(members).map(Rule::Object),
        scalar => Ok(Rule::Static(scalar.clone())),
    }
}

fn is_script_list(items: &[JsonValue]) -> bool {
    !items.is_empty()
        && items
            .iter()
            .all(|item| item.as_str().is_some_and(is_script))
}

fn compile_object(members: &Map<String, JsonValue>) -> Result<ObjectRule, ScriptError> {
    let mut object = ObjectRule::default();
    for (raw, value) in members {
        if let Some(meta) = unquote_script(raw).filter(|_| is_script(raw)) {
            if meta != META_DEFAULT {
                return Err(ScriptError::compile(raw, "only `default` is allowed as an object meta-key"));
            }
            object.default = Some(Box::new(compile_rule(value)?));
            continue;
        }
        let (key, props) = parse_key(raw)?;
        if object.members.iter().any(|member| member.key == key) {
            return Err(ScriptError::compile(raw, "duplicate member key"));
        }
        object.members.push(Member {
            key,
            props,
            rule: compile_rule(value)?,
        });
    }
    Ok(object)
}

/// The leading meta-object of a list: every key is a back-ticked name.
fn is_meta_object(value: &JsonValue) -> bool {
    match value {
        JsonValue::Object(members) => {
            !members.is_empty() && members.keys().all(|key| is_script(key))
        }
        _ => false,
    }
}

fn compile_list(items: &[JsonValue]) -> Result<ListRule, ScriptError> {
    let mut list = ListRule::default();
    let mut positional = items;

    if let Some(JsonValue::Object(meta)) = items.first().filter(|first| is_meta_object(first)) {
        for (raw, value) in meta {
            let slot = match unquote_script(raw).unwrap_or_default() {
                META_LIST => &mut list.list,
                META_ITEM => &mut list.item,
                META_DEFAULT => &mut list.default,
                META_TEMPLATE => &mut list.template,
                _ => return Err(ScriptError::compile(raw, "unknown list meta-key")),
            };
            *slot = Some(Box::new(compile_rule(value)?));
        }
        positional = &items[1..];
    }

    let rules = positional
        .iter()
        .map(compile_rule)
        .collect::<Result<Vec<_>, _>>()?;
    let searchers = rules
        .iter()
        .filter(|rule| matches!(rule, Rule::Object(object) if object.is_searcher()))
        .count();

    if searchers == 0 {
        list.members = rules;
    } else if searchers == rules.len() {
        list.searchers = rules
            .into_iter()
            .filter_map(|rule| match rule {
                Rule::Object(object) => Some(object),
                _ => None,
            })
            .collect();
    } else {
        return Err(ScriptError::compile(
            JsonValue::Array(items.to_vec()).to_string(),
            "positional rules and index searchers cannot be mixed in one list",
        ));
    }
    Ok(list)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn check(template: JsonValue, observed: JsonValue) -> Result<(), ScriptError> {
        let template = Template::compile(&template).unwrap();
        let mut bg = Background::new("template");
        template.compare(&mut bg, &observed)
    }

    #[test]
    fn parses_key_properties() {
        assert_eq!(parse_key("a").unwrap(), ("a".to_string(), KeyProps::default()));
        let (key, props) = parse_key("extra: optional").unwrap();
        assert_eq!(key, "extra");
        assert!(props.optional && !props.absent && !props.index);
        let (key, props) = parse_key("a: index, optional").unwrap();
        assert_eq!(key, "a");
        assert!(props.index && props.optional);
        assert_eq!(parse_key("time: 12:00").unwrap().0, "time: 12:00");
        assert!(parse_key("a: optional,absent").is_err());
    }

    #[test]
    fn static_members() {
        let template = json!({"int": 11, "neg-int": -11, "extra: optional": 110});
        assert!(check(template.clone(), json!({"int": 11, "neg-int": -11, "gib": 0})).is_ok());
        assert!(check(template.clone(), json!({"int": 12, "neg-int": -11, "extra": 110})).is_err());
        assert!(check(template, json!({"int": "11", "neg-int": -12, "extra": 110})).is_err());
    }

    #[test]
    fn numeric_tolerance() {
        assert!(check(json!(1.0), json!(1.00000001)).is_ok());
        assert!(check(json!(1.0), json!(1.0001)).is_err());
        assert!(check(json!(9007199254740993u64), json!(9007199254740993u64)).is_ok());
    }

    #[test]
    fn dynamic_members() {
        let template = json!({
            "int1": "`assert $ > 1 | assert $ < 9`",
            "int2": ["`assert $ > 1`", "`assert $ < 9`"]
        });
        assert!(check(template.clone(), json!({"int1": 2, "int2": 2})).is_ok());
        let err = check(template, json!({"int1": 1, "int2": 2})).unwrap_err();
        assert!(matches!(err, ScriptError::Mismatch { ref path, .. } if path == ".int1"));
    }

    #[test]
    fn list_search() {
        let template = json!([
            {"`default`": "`json .b $ | assert $$ < 0`"},
            {"a: index": "`assert $ == 1`", "b": "`assert $ > 1`"},
            {"a: index": "`assert $ == 2`", "b: index": "`assert $ == 1`", "c": "`assert $ > 3`"}
        ]);
        let matching = json!([{"a": 1, "b": 20}, {"a": 2, "b": 1, "c": 30}, {"a": 12, "b": -1}]);
        assert!(check(template.clone(), matching).is_ok());

        let broken = json!([{"a": 1, "b": 20}, {"a": 2, "b": 2, "c": 30}, {"a": 12, "b": -1}]);
        assert!(check(template, broken).is_err());
    }

    #[test]
    fn short_list_fails_positional_template() {
        assert!(check(json!([1, 2]), json!([])).is_err());
        assert!(check(json!([1, 2]), json!([1, 2])).is_ok());
        assert!(check(json!([1, 2]), json!([1, 2, 3])).is_err());
    }

    #[test]
    fn absent_key_must_not_appear() {
        let template = json!({"secret: absent": 1});
        assert!(check(template.clone(), json!({})).is_ok());
        assert!(check(template, json!({"secret": 1})).is_err());
    }

    #[test]
    fn optional_searcher_without_candidate_succeeds() {
        let template = json!([
            {"id: index": 1, "name": "one"},
            {"id: index,optional": 5, "name": "five"}
        ]);
        assert!(check(template.clone(), json!([{"id": 1, "name": "one"}])).is_ok());
        assert!(check(template, json!([{"id": 2, "name": "two"}])).is_err());
    }

    #[test]
    fn mixing_searchers_and_positional_rules_is_rejected() {
        let template = json!([{"a: index": 1}, 2]);
        assert!(matches!(Template::compile(&template), Err(ScriptError::Compile { .. })));
    }

    #[test]
    fn list_meta_rules() {
        let template = json!([{"`list`": "`assert $<length> == 3`", "`item`": "`assert $ > 0`"}]);
        assert!(check(template.clone(), json!([1, 2, 3])).is_ok());
        assert!(check(template.clone(), json!([1, 2])).is_err());
        assert!(check(template, json!([1, -2, 3])).is_err());
    }

    #[test]
    fn object_default_and_null_target() {
        let template = json!({"`default`": "`assert $ > 0`"});
        assert!(check(template.clone(), json!({"x": 1, "y": 2})).is_ok());
        assert!(check(template.clone(), json!({"x": 1, "y": -2})).is_err());
        assert!(check(template, JsonValue::Null).is_ok());
        assert!(check(json!({"id": 1}), JsonValue::Null).is_err());
    }

    #[test]
    fn serialised_static_template_matches_itself() {
        let template = json!({"a": [1, 2.5, "x", true, null], "b": {"c": false}});
        assert!(check(template.clone(), template).is_ok());
    }

    #[test]
    fn failed_searcher_candidate_leaves_error_slot_clean() {
        let template = Template::compile(&json!([{"a: index": "`assert $ == 2`"}])).unwrap();
        let mut bg = Background::new("template");
        template.compare(&mut bg, &json!([{"a": 1}, {"a": 2}])).unwrap();
        assert!(bg.error().is_none());
        assert_eq!(bg.json_depth(), 0);
    }
}
