use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::background::{
    Background, Env, Functions, GLOBAL_CONFIG, GLOBAL_CWD, GLOBAL_DEBUG, GLOBAL_SCHEDULE, GLOBAL_TPATH,
};
use crate::domain::{Config, HostDef, MessageDef, ReporterDef, ScheduleDef, Scripts, TestDef};
use crate::engine::assembler::Assembler;
use crate::engine::consumer::{DynamicConsumer, FailurePolicy};
use crate::engine::flow::FlowControl;
use crate::engine::http::{ClientKey, ClientPool, HostUrl, DEFAULT_TIMEOUT};
use crate::engine::latency::LatencyMarker;
use crate::engine::plan::{Plan, ReporterSetup};
use crate::engine::provider::{DynamicFeeder, ProviderSource, CATEGORY_BODY, CATEGORY_METHOD, CATEGORY_URL};
use crate::engine::runner::{Credentials, Runner};
use crate::engine::Engine;
use crate::error::{ConfigError, ScriptError};
use crate::reporter::resolve_path;
use crate::script::{compile_segment, compile_segments, Composable, Group, Segment};
use crate::template::Template;

const WILDCARD: &str = "*";

#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Sets the `DEBUG` global to `1`.
    pub debug: bool,
    /// Only compile these schedules; empty compiles all of them.
    pub schedules: Vec<String>,
}

/// Shared by every plan of one compilation.
struct Shared {
    global: Arc<Env>,
    db: Arc<Env>,
    functions: Arc<Functions>,
    clients: ClientPool,
    base_dir: PathBuf,
    policy: FailurePolicy,
}

/// Turn a loaded configuration into an [`Engine`].
pub fn compile(config: &Config, options: &CompileOptions) -> Result<Engine, ConfigError> {
    let base_dir = config
        .options
        .cfg_path
        .as_deref()
        .and_then(|path| Path::new(path).parent())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let shared = Shared {
        global: Arc::new(process_env(config, &base_dir, options.debug)),
        db: Arc::new(Env::new()),
        functions: Arc::new(compile_functions(&config.functions)?),
        clients: ClientPool::new(),
        base_dir,
        policy: FailurePolicy::from_abort_if_fail(config.options.abort_if_fail),
    };

    for wanted in &options.schedules {
        if !config.schedules.iter().any(|schedule| &schedule.name == wanted) {
            return Err(ConfigError::invalid("Schedules", format!("no schedule named `{wanted}`")));
        }
    }

    let mut seen = BTreeSet::new();
    let mut plans = Vec::new();
    for schedule in &config.schedules {
        let name = schedule.name.trim();
        if name.is_empty() {
            return Err(ConfigError::invalid("Schedules.Name", "schedule name is empty"));
        }
        if !seen.insert(name.to_string()) {
            return Err(ConfigError::invalid("Schedules.Name", format!("duplicate schedule `{name}`")));
        }
        if !options.schedules.is_empty() && !options.schedules.iter().any(|wanted| wanted == name) {
            continue;
        }
        plans.push(compile_schedule(config, schedule, &shared)?);
    }

    tracing::debug!(
        config = %config.name,
        plans = plans.len(),
        clients = shared.clients.len(),
        "configuration compiled"
    );
    Ok(Engine::new(config.mode, plans))
}

fn process_env(config: &Config, base_dir: &Path, debug: bool) -> Env {
    let mut vars: HashMap<String, String> = config
        .env
        .iter()
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    vars.insert(GLOBAL_CONFIG.to_string(), config.name.clone());
    vars.insert(GLOBAL_TPATH.to_string(), base_dir.display().to_string());
    let cwd = std::env::current_dir()
        .map(|dir| dir.display().to_string())
        .unwrap_or_default();
    vars.insert(GLOBAL_CWD.to_string(), cwd);
    vars.insert(GLOBAL_DEBUG.to_string(), if debug { "1" } else { "0" }.to_string());
    Env::from_map(vars)
}

fn compile_functions(functions: &BTreeMap<String, Scripts>) -> Result<Functions, ConfigError> {
    let mut compiled = Functions::new();
    for (name, scripts) in functions {
        let fragments = scripts_field(&format!("Functions.{name}"), scripts)?;
        compiled.insert(name.clone(), Arc::new(Group::new(fragments)));
    }
    Ok(compiled)
}

fn scripts_field(field: &str, scripts: &Scripts) -> Result<Vec<Arc<dyn Composable>>, ConfigError> {
    compile_segments(&scripts.to_vec()).map_err(|err| script_error(field, err))
}

fn segment_field(field: &str, source: &str) -> Result<Arc<dyn Composable>, ConfigError> {
    compile_segment(source).map_err(|err| script_error(field, err))
}

fn script_error(field: &str, err: ScriptError) -> ConfigError {
    ConfigError::invalid(field, err.to_string())
}

/// Split a schedule's `Tests` string. `*` stands for every catalog test not
/// named explicitly, in name order; blank tokens are skipped.
pub fn select_tests<'a>(
    series: &str,
    catalog: impl IntoIterator<Item = &'a String>,
) -> Result<Vec<String>, ConfigError> {
    let catalog: BTreeSet<&str> = catalog.into_iter().map(String::as_str).collect();
    let tokens: Vec<&str> = series
        .split('|')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .collect();

    let mut named = BTreeSet::new();
    for token in tokens.iter().filter(|token| **token != WILDCARD) {
        if !catalog.contains(token) {
            return Err(ConfigError::invalid("Schedules.Tests", format!("unknown test `{token}`")));
        }
        named.insert(*token);
    }

    let mut selected = Vec::new();
    for token in tokens {
        if token == WILDCARD {
            selected.extend(
                catalog
                    .iter()
                    .filter(|name| !named.contains(*name))
                    .map(|name| name.to_string()),
            );
        } else {
            selected.push(token.to_string());
        }
    }
    Ok(selected)
}

/// Lay a schedule's `TestBase` over a test. `Response` is merged one level
/// deep; every other key is replaced.
fn apply_test_base(test: &TestDef, base: Option<&JsonValue>, field: &str) -> Result<TestDef, ConfigError> {
    let Some(base) = base.filter(|base| !base.is_null()) else {
        return Ok(test.clone());
    };
    let JsonValue::Object(base) = base else {
        return Err(ConfigError::invalid(field, "TestBase must be an object"));
    };
    let invalid = |err: serde_json::Error| ConfigError::invalid(field, err.to_string());

    let JsonValue::Object(mut merged) = serde_json::to_value(test).map_err(invalid)? else {
        return Err(ConfigError::invalid(field, "test is not an object"));
    };
    for (key, value) in base {
        match (merged.entry(key.as_str()).or_insert(JsonValue::Null), value) {
            (JsonValue::Object(own), JsonValue::Object(overlay)) if key == "Response" => {
                own.extend(overlay.clone());
            }
            (slot, value) => *slot = value.clone(),
        }
    }
    serde_json::from_value(JsonValue::Object(merged)).map_err(invalid)
}

fn compile_schedule(config: &Config, schedule: &ScheduleDef, shared: &Shared) -> Result<Plan, ConfigError> {
    let name = schedule.name.trim();
    let field = format!("Schedules.{name}");

    let mut runners = Vec::new();
    for test_name in select_tests(&schedule.tests, config.tests.keys())? {
        let test = apply_test_base(
            &config.tests[&test_name],
            schedule.test_base.as_ref(),
            &format!("{field}.TestBase"),
        )?;
        let runner = compile_test(config, &test_name, &test, shared)?;
        let marker = if schedule.latency {
            let marker = LatencyMarker::new()
                .map_err(|err| ConfigError::invalid(format!("{field}.Latency"), err.to_string()))?;
            Some(Arc::new(marker))
        } else {
            None
        };
        runners.push(runner.with_marker(marker));
    }

    let plan_env = Env::with_parent(shared.global.clone());
    plan_env.extend(schedule.env.iter().map(|(key, value)| (key.clone(), value.clone())));
    plan_env.set(GLOBAL_SCHEDULE, name);
    let predefined = HashMap::from([(GLOBAL_SCHEDULE.to_string(), name.to_string())]);
    let background = Background::new(name)
        .with_global(Arc::new(plan_env))
        .with_db(shared.db.clone())
        .with_functions(shared.functions.clone())
        .with_predefined(predefined);

    let concurrency = schedule.concurrency.max(1);
    let parallel = normalise_parallel(schedule.parallel, concurrency);
    let flow_control = (parallel > 0 || schedule.qps > 0).then(|| FlowControl::new(parallel, schedule.qps));

    let reporter = schedule
        .reporter
        .as_ref()
        .map(|reporter| compile_reporter(reporter, &shared.base_dir, &format!("{field}.Reporter")))
        .transpose()?;

    tracing::debug!(
        schedule = name,
        runners = runners.len(),
        concurrency,
        parallel,
        qps = schedule.qps,
        "schedule compiled"
    );

    Ok(Plan::new(name, background, Assembler::new(runners))
        .with_concurrency(concurrency)
        .with_count(schedule.count)
        .with_flow_control(flow_control)
        .with_pre_process(scripts_field(&format!("{field}.PreProcess"), &schedule.pre_process)?)
        .with_post_process(scripts_field(&format!("{field}.PostProcess"), &schedule.post_process)?)
        .with_reporter(reporter))
}

/// A gate wider than the worker count is capped to it; a gate of one or
/// less is no gate at all.
fn normalise_parallel(parallel: usize, concurrency: usize) -> usize {
    let parallel = parallel.min(concurrency);
    if parallel < 2 {
        0
    } else {
        parallel
    }
}

fn compile_reporter(def: &ReporterDef, base_dir: &Path, field: &str) -> Result<ReporterSetup, ConfigError> {
    let format = def
        .format
        .as_deref()
        .map(Segment::compile)
        .transpose()
        .map_err(|err| script_error(&format!("{field}.Format"), err))?;
    let templates = def
        .templates
        .iter()
        .map(|(name, source)| {
            Segment::compile(source)
                .map(|segment| (name.clone(), segment))
                .map_err(|err| script_error(&format!("{field}.Templates.{name}"), err))
        })
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(ReporterSetup {
        path: def
            .path
            .as_deref()
            .filter(|path| !path.trim().is_empty())
            .map(|path| resolve_path(base_dir, path)),
        format,
        templates,
    })
}

fn resolve_request<'a>(
    config: &'a Config,
    name: &str,
    test: &'a TestDef,
) -> Result<&'a MessageDef, ConfigError> {
    if let Some(request) = &test.request {
        return Ok(request);
    }
    let field = format!("Tests.{name}.RequestMessage");
    let Some(message) = test.request_message.as_deref() else {
        return Err(ConfigError::invalid(field, "test has neither Request nor RequestMessage"));
    };
    config
        .messages
        .get(message)
        .ok_or_else(|| ConfigError::invalid(field, format!("unknown message `{message}`")))
}

fn resolve_host<'a>(
    config: &'a Config,
    name: &str,
    test: &TestDef,
) -> Result<Option<&'a HostDef>, ConfigError> {
    match test.host.as_deref().map(str::trim).filter(|host| !host.is_empty()) {
        None => Ok(None),
        Some(host) => config
            .hosts
            .get(host)
            .map(Some)
            .ok_or_else(|| {
                ConfigError::invalid(format!("Tests.{name}.Host"), format!("unknown host `{host}`"))
            }),
    }
}

fn body_source(body: Option<&JsonValue>) -> Option<String> {
    match body? {
        JsonValue::Null => None,
        JsonValue::String(source) => Some(source.clone()),
        other => Some(other.to_string()),
    }
}

fn compile_test(config: &Config, name: &str, test: &TestDef, shared: &Shared) -> Result<Runner, ConfigError> {
    let field = format!("Tests.{name}");
    let request = resolve_request(config, name, test)?;
    let host = resolve_host(config, name, test)?;

    // Without a host the request path is taken as the full URL.
    let (url, authority, credentials) = match host {
        Some(host) => {
            let parsed = HostUrl::parse(&host.host);
            let credentials = parsed.user.clone().map(|user| Credentials {
                user,
                password: parsed.password.clone(),
            });
            (parsed.join(&request.path), parsed.authority, credentials)
        }
        None => (request.path.trim().to_string(), String::new(), None),
    };

    let mut feeder = DynamicFeeder::new()
        .with_category(CATEGORY_URL, segment_field(&format!("{field}.Path"), &url)?)
        .with_pre_process(scripts_field(&format!("{field}.PreProcess"), &test.pre_process)?)
        .with_limit(test.count.unwrap_or(0));
    if let Some(method) = request.method.as_deref().filter(|method| !method.trim().is_empty()) {
        feeder = feeder.with_category(CATEGORY_METHOD, segment_field(&format!("{field}.Method"), method)?);
    }
    if let Some(body) = body_source(request.body.as_ref()) {
        feeder = feeder.with_category(CATEGORY_BODY, segment_field(&format!("{field}.Body"), &body)?);
    }
    for (header, value) in &request.headers {
        let segment = segment_field(&format!("{field}.Headers.{header}"), value)?;
        feeder = feeder.with_category(header.as_str(), segment);
    }

    let response = &test.response;
    let template = response
        .template
        .as_ref()
        .filter(|template| !template.is_null())
        .map(Template::compile)
        .transpose()
        .map_err(|err| script_error(&format!("{field}.Response.Template"), err))?;
    let consumer = DynamicConsumer::new(test.on_failure.unwrap_or(shared.policy))
        .with_template(template)
        .with_check(scripts_field(&format!("{field}.Response.Check"), &response.check)?)
        .with_success(scripts_field(&format!("{field}.Response.Success"), &response.success)?)
        .with_failure(scripts_field(&format!("{field}.Response.Failure"), &response.failure)?);

    let timeout = test
        .timeout
        .filter(|millis| *millis > 0)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_TIMEOUT);
    let key = ClientKey {
        proxy: host
            .and_then(|host| host.proxy.clone())
            .filter(|proxy| !proxy.trim().is_empty()),
        host: authority,
        timeout,
    };
    let client = shared
        .clients
        .get(&key)
        .map_err(|err| ConfigError::invalid(format!("{field}.Host"), err.to_string()))?;

    Ok(
        Runner::new(name, ProviderSource::new(feeder), consumer, client, timeout)
            .with_credentials(credentials),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(doc: JsonValue) -> Config {
        serde_json::from_value(doc).unwrap()
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn wildcard_expands_to_remaining_tests() {
        let catalog = names(&["a", "b", "c", "d"]);
        assert_eq!(select_tests("c| * |a", &catalog).unwrap(), names(&["c", "b", "d", "a"]));
        assert_eq!(select_tests(" b || ", &catalog).unwrap(), names(&["b"]));
        assert!(select_tests("b|nope", &catalog).is_err());
    }

    #[test]
    fn parallel_is_capped_and_small_gates_dropped() {
        assert_eq!(normalise_parallel(8, 4), 4);
        assert_eq!(normalise_parallel(3, 4), 3);
        assert_eq!(normalise_parallel(1, 4), 0);
        assert_eq!(normalise_parallel(5, 1), 0);
    }

    #[test]
    fn test_base_overrides_keys_and_merges_response() {
        let test: TestDef = serde_json::from_value(json!({
            "Host": "a",
            "Timeout": 100,
            "Response": {"Check": "`assert $(STATUS) == 200`", "Success": "`nop`"}
        }))
        .unwrap();
        let base = json!({"Timeout": 5, "Response": {"Success": "`print ok`"}});
        let merged = apply_test_base(&test, Some(&base), "TestBase").unwrap();
        assert_eq!(merged.host.as_deref(), Some("a"));
        assert_eq!(merged.timeout, Some(5));
        assert_eq!(merged.response.check.to_vec(), vec!["`assert $(STATUS) == 200`"]);
        assert_eq!(merged.response.success.to_vec(), vec!["`print ok`"]);
        assert!(apply_test_base(&test, Some(&json!([1])), "TestBase").is_err());
    }

    #[test]
    fn compiles_schedules_into_plans() {
        let config = config(json!({
            "Name": "demo",
            "Hosts": {"api": {"Host": "http://u:p@localhost:9/v1"}},
            "Messages": {"get": {"Path": "/items/$(SEQUENCE)"}},
            "Tests": {
                "one": {"Host": "api", "RequestMessage": "get"},
                "two": {"Host": "api", "Request": {"Method": "POST", "Path": "items", "Body": {"a": 1}}}
            },
            "Schedules": [
                {"Name": "first", "Tests": "*", "Concurrency": 4, "Parallel": 2, "Count": 8, "Latency": true},
                {"Name": "second", "Tests": "two"}
            ]
        }));
        let engine = compile(&config, &CompileOptions::default()).unwrap();
        let plans = engine.plans();
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].concurrency(), 4);
        assert_eq!(plans[0].assembler().runners().len(), 2);
        assert!(plans[0].assembler().runners()[0].marker().is_some());
        assert!(plans[0].background().flow_control().is_some());
        assert_eq!(plans[1].concurrency(), 1);
        assert!(plans[1].background().flow_control().is_none());
        assert_eq!(plans[1].background().get_global(GLOBAL_SCHEDULE), "second");
        assert_eq!(plans[1].background().get_global(GLOBAL_CONFIG), "demo");
        assert_eq!(plans[1].background().get_global(GLOBAL_DEBUG), "0");
    }

    #[test]
    fn schedule_filter_selects_plans() {
        let config = config(json!({
            "Schedules": [{"Name": "a"}, {"Name": "b"}]
        }));
        let options = CompileOptions {
            debug: true,
            schedules: names(&["b"]),
        };
        let engine = compile(&config, &options).unwrap();
        assert_eq!(engine.plans().len(), 1);
        assert_eq!(engine.plans()[0].name(), "b");
        assert_eq!(engine.plans()[0].background().get_global(GLOBAL_DEBUG), "1");

        let missing = CompileOptions {
            debug: false,
            schedules: names(&["c"]),
        };
        assert!(compile(&config, &missing).is_err());
    }

    #[test]
    fn rejects_invalid_catalogs() {
        let cases = [
            json!({"Schedules": [{"Name": ""}]}),
            json!({"Schedules": [{"Name": "x"}, {"Name": "x"}]}),
            json!({"Tests": {"t": {"Host": "missing", "Request": {"Path": "/"}}}, "Schedules": [{"Name": "s", "Tests": "t"}]}),
            json!({"Tests": {"t": {"RequestMessage": "missing"}}, "Schedules": [{"Name": "s", "Tests": "t"}]}),
            json!({"Tests": {"t": {"Request": {"Path": "`nope`"}}}, "Schedules": [{"Name": "s", "Tests": "t"}]}),
            json!({"Tests": {"t": {"Request": {"Path": "http://x"}, "Response": {"Template": {"a:optional,absent": 1}}}}, "Schedules": [{"Name": "s", "Tests": "t"}]}),
        ];
        for case in cases {
            let config = config(case.clone());
            let err = compile(&config, &CompileOptions::default()).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid { .. }), "{case}: {err}");
        }
    }

    #[test]
    fn string_bodies_are_used_verbatim() {
        assert_eq!(body_source(Some(&json!("{\"n\": $(SEQUENCE)}"))).unwrap(), "{\"n\": $(SEQUENCE)}");
        assert_eq!(body_source(Some(&json!({"a": [1, 2]}))).unwrap(), r#"{"a":[1,2]}"#);
        assert_eq!(body_source(Some(&JsonValue::Null)), None);
        assert_eq!(body_source(None), None);
    }
}
