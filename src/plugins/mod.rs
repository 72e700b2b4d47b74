//! Pre/post query plugin chain: compiled-in handlers, dynamically loaded
//! dylib handlers, and scripted handlers backed by [script_pool::ScriptPool].

pub mod script_pool;

use crate::config::PluginConfig;
use crate::enums::RecordType;
use crate::error::HerdNsError;
use crate::resourcerecord::{parse_ipv4, parse_ipv6, DomainName, InternalResourceRecord};
use crate::Question;
use libloading::{Library, Symbol};
use rhai::{Dynamic, AST};
use script_pool::ScriptPool;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Which half of a query's processing a handler is being invoked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pre,
    Post,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Noop,
    Question,
    Reply,
    Rewrite,
    Deny,
}

/// A handler's verdict on a single query.
#[derive(Debug, Clone, Default)]
pub struct Update {
    pub action: Option<Action>,
    /// Stop processing this question entirely — skip resolution.
    pub done: bool,
    /// Stop running the rest of this chain.
    pub stop: bool,
    pub question: Option<Question>,
    pub rr: Vec<InternalResourceRecord>,
}

/// A pre- or post-resolution handler. Implementors must be safe to call
/// concurrently from any query task — the dispatcher holds no lock while
/// invoking a handler.
pub trait Plugin: Send + Sync {
    fn process_query(
        &self,
        phase: Phase,
        remote_ip: &str,
        question: &Question,
        answers_so_far: &[InternalResourceRecord],
    ) -> Result<Option<Update>, HerdNsError>;
}

/// Declares the C-ABI constructor a dylib plugin must export for
/// [PluginChain::load] to find it. The constructed value is boxed and its
/// ownership handed to the loader, which keeps the owning [Library] alive
/// for as long as the trait object lives.
#[macro_export]
macro_rules! declare_plugin {
    ($plugin_type:ty, $constructor:path) => {
        #[no_mangle]
        pub extern "C" fn _plugin_create(arguments: &[String]) -> *mut dyn $crate::plugins::Plugin {
            let constructor: fn(&[String]) -> $plugin_type = $constructor;
            let object = constructor(arguments);
            let boxed: Box<dyn $crate::plugins::Plugin> = Box::new(object);
            Box::into_raw(boxed)
        }
    };
}

type PluginConstructor = unsafe extern "C" fn(arguments: &[String]) -> *mut dyn Plugin;

/// A dylib-backed plugin together with the [Library] it was loaded from.
/// The library must outlive the boxed trait object since the object's
/// vtable lives in the library's mapped memory.
struct DylibPlugin {
    plugin: Box<dyn Plugin>,
    #[allow(dead_code)]
    library: Library,
}

impl Plugin for DylibPlugin {
    fn process_query(
        &self,
        phase: Phase,
        remote_ip: &str,
        question: &Question,
        answers_so_far: &[InternalResourceRecord],
    ) -> Result<Option<Update>, HerdNsError> {
        self.plugin
            .process_query(phase, remote_ip, question, answers_so_far)
    }
}

fn load_dylib(path: &str, symbol: &str, arguments: &[String]) -> Result<DylibPlugin, HerdNsError> {
    unsafe {
        let library = Library::new(path)
            .map_err(|e| HerdNsError::PluginError(format!("failed to open plugin {path}: {e}")))?;
        let constructor: Symbol<PluginConstructor> = library.get(symbol.as_bytes()).map_err(|e| {
            HerdNsError::PluginError(format!("plugin {path} lacks handler {symbol}: {e}"))
        })?;
        let raw = constructor(arguments);
        if raw.is_null() {
            return Err(HerdNsError::PluginError(format!(
                "plugin {path} handler {symbol} returned null"
            )));
        }
        let plugin = Box::from_raw(raw);
        Ok(DylibPlugin { plugin, library })
    }
}

/// A compiled-in demonstration handler: replies with a fixed TXT record for
/// one magic name in the pre phase, and rewrites a second name's A answer
/// TTL in the post phase depending on whether the pre phase rewrote the
/// question for this query.
pub struct ExamplePlugin;

impl ExamplePlugin {
    pub fn new(_arguments: &[String]) -> Self {
        ExamplePlugin
    }
}

impl Plugin for ExamplePlugin {
    fn process_query(
        &self,
        phase: Phase,
        _remote_ip: &str,
        question: &Question,
        answers_so_far: &[InternalResourceRecord],
    ) -> Result<Option<Update>, HerdNsError> {
        let qname = String::from_utf8_lossy(&question.qname).to_ascii_lowercase();
        match phase {
            Phase::Pre => {
                if question.qtype == RecordType::TXT && qname == "magic.example.com" {
                    return Ok(Some(Update {
                        action: Some(Action::Reply),
                        done: true,
                        rr: vec![InternalResourceRecord::TXT {
                            txtdata: "this is a magic record".into(),
                            ttl: 60,
                        }],
                        ..Default::default()
                    }));
                }
                if question.qtype == RecordType::A && qname == "plugintest.example.com" {
                    let mut rewritten = question.clone();
                    rewritten.qname = b"test.example.com".to_vec();
                    return Ok(Some(Update {
                        action: Some(Action::Question),
                        stop: true,
                        question: Some(rewritten),
                        ..Default::default()
                    }));
                }
                Ok(None)
            }
            Phase::Post => {
                if question.qtype == RecordType::A && qname == "test.example.com" {
                    let rewritten: Vec<InternalResourceRecord> = answers_so_far
                        .iter()
                        .cloned()
                        .map(|record| match record {
                            InternalResourceRecord::A { address, .. } => {
                                InternalResourceRecord::A { address, ttl: 3600 }
                            }
                            other => other,
                        })
                        .collect();
                    return Ok(Some(Update {
                        action: Some(Action::Rewrite),
                        rr: rewritten,
                        ..Default::default()
                    }));
                }
                Ok(None)
            }
        }
    }
}

/// A plugin backed by a `rhai` script. The script is compiled once into an
/// [AST] at load and then evaluated once per query using an engine leased
/// from the shared [ScriptPool]. The script must define a `main` function:
/// `main(phase, ip, existing_answers, qtype, qname)` returning a map with
/// `action`/`done`/`stop`/`question`/`type`/`TTL`/`RR` keys.
pub struct ScriptPlugin {
    pool: ScriptPool,
    ast: AST,
}

impl ScriptPlugin {
    pub fn load(pool: ScriptPool, script_path: &str) -> Result<Self, HerdNsError> {
        let source = std::fs::read_to_string(script_path).map_err(|e| {
            HerdNsError::PluginError(format!("failed to read script {script_path}: {e}"))
        })?;
        let engine = rhai::Engine::new();
        let ast = engine
            .compile(&source)
            .map_err(|e| HerdNsError::PluginError(format!("script {script_path} failed to compile: {e}")))?;
        Ok(ScriptPlugin { pool, ast })
    }

    fn run(
        &self,
        phase: Phase,
        remote_ip: &str,
        question: &Question,
        answers_so_far: &[InternalResourceRecord],
    ) -> Result<Option<Update>, HerdNsError> {
        // A blocking lease/release cycle: `process_query` itself is called
        // synchronously from the dispatcher, so we drive the async broker
        // with a short-lived current-thread runtime rather than threading
        // `async` through the whole `Plugin` trait.
        let handle = tokio::runtime::Handle::try_current();
        let index = match handle {
            Ok(handle) => tokio::task::block_in_place(|| handle.block_on(self.pool.book())),
            Err(_) => {
                let rt = tokio::runtime::Runtime::new()
                    .map_err(|e| HerdNsError::Generic(e.to_string()))?;
                rt.block_on(self.pool.book())
            }
        }?;

        let result = self.invoke(index, phase, remote_ip, question, answers_so_far);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => tokio::task::block_in_place(|| handle.block_on(self.pool.release(index))),
            Err(_) => {
                if let Ok(rt) = tokio::runtime::Runtime::new() {
                    rt.block_on(self.pool.release(index));
                }
            }
        }

        result
    }

    fn invoke(
        &self,
        index: usize,
        phase: Phase,
        remote_ip: &str,
        question: &Question,
        answers_so_far: &[InternalResourceRecord],
    ) -> Result<Option<Update>, HerdNsError> {
        let engine = self.pool.engine(index);
        let phase_num = match phase {
            Phase::Pre => 0i64,
            Phase::Post => 1i64,
        };
        let qname = String::from_utf8_lossy(&question.qname).to_string();
        let qtype = question.qtype as i64;
        let existing_answers: rhai::Array = answers_so_far.iter().map(record_to_script_map).collect();

        let mut scope = rhai::Scope::new();
        let raw: Dynamic = engine
            .call_fn(
                &mut scope,
                &self.ast,
                "main",
                (
                    phase_num,
                    remote_ip.to_string(),
                    existing_answers,
                    qtype,
                    qname.clone(),
                ),
            )
            .map_err(|e| HerdNsError::PluginError(format!("script execution failed: {e}")))?;

        let map = match raw.try_cast::<rhai::Map>() {
            Some(map) => map,
            None => return Ok(None),
        };

        let action = match map.get("action").and_then(|v| v.as_int().ok()) {
            Some(0) | None => Action::Noop,
            Some(1) => Action::Question,
            Some(2) => Action::Reply,
            Some(3) => Action::Rewrite,
            Some(4) => Action::Deny,
            Some(_) => Action::Noop,
        };
        let done = map
            .get("done")
            .and_then(|v| v.as_bool().ok())
            .unwrap_or(false);
        let stop = map
            .get("stop")
            .and_then(|v| v.as_bool().ok())
            .unwrap_or(false);

        let rr = match (action, map.get("RR").and_then(|v| v.clone().try_cast::<rhai::Array>())) {
            (Action::Reply | Action::Rewrite, Some(items)) => {
                let record_type = map
                    .get("type")
                    .and_then(|v| v.as_int().ok())
                    .map(|t| RecordType::from(&(t as u16)))
                    .unwrap_or(RecordType::InvalidType);
                let ttl = map.get("TTL").and_then(|v| v.as_int().ok()).unwrap_or(3600) as u32;
                items
                    .into_iter()
                    .filter_map(|item| build_script_record(record_type, ttl, &qname, item))
                    .collect()
            }
            _ => vec![],
        };

        Ok(Some(Update {
            action: Some(action),
            done,
            stop,
            question: None,
            rr,
        }))
    }
}

/// Renders one already-resolved answer record as the `{type, ttl, rdata}`
/// map a script's `main()` sees in its `existingAnswers` argument, so a
/// post-phase handler can inspect or rewrite answers earlier plugins added.
fn record_to_script_map(record: &InternalResourceRecord) -> rhai::Map {
    let mut map = rhai::Map::new();
    let record_type: RecordType = RecordType::from(record);
    map.insert("type".into(), Dynamic::from(record_type as u16 as i64));
    map.insert("ttl".into(), Dynamic::from(record.ttl() as i64));
    let rdata = match record {
        InternalResourceRecord::A { address, .. } => std::net::Ipv4Addr::from(*address).to_string(),
        InternalResourceRecord::AAAA { address, .. } => std::net::Ipv6Addr::from(*address).to_string(),
        InternalResourceRecord::NS { nsdname, .. } => nsdname.name.clone(),
        InternalResourceRecord::CNAME { cname, .. } => cname.name.clone(),
        InternalResourceRecord::SOA { mname, .. } => mname.name.clone(),
        InternalResourceRecord::MX { exchange, .. } => exchange.as_ref().map(|e| e.name.clone()).unwrap_or_default(),
        InternalResourceRecord::TXT { txtdata, .. } => String::from_utf8_lossy(&txtdata.data).to_string(),
        InternalResourceRecord::SRV { target, .. } => target.name.clone(),
    };
    map.insert("rdata".into(), Dynamic::from(rdata));
    map
}

fn build_script_record(
    record_type: RecordType,
    ttl: u32,
    qname: &str,
    item: Dynamic,
) -> Option<InternalResourceRecord> {
    let map = item.try_cast::<rhai::Map>()?;
    let get_str = |key: &str| map.get(key).and_then(|v| v.clone().into_string().ok());
    match record_type {
        RecordType::A => parse_ipv4(&get_str("ip")?).ok().map(|address| InternalResourceRecord::A { address, ttl }),
        RecordType::AAAA => parse_ipv6(&get_str("ip")?).ok().map(|address| InternalResourceRecord::AAAA { address, ttl }),
        RecordType::TXT => Some(InternalResourceRecord::TXT {
            txtdata: get_str("target")?.as_str().into(),
            ttl,
        }),
        RecordType::CNAME => Some(InternalResourceRecord::CNAME {
            cname: DomainName::from(get_str("aliased")?.as_str()),
            ttl,
        }),
        RecordType::MX => Some(InternalResourceRecord::MX {
            preference: map.get("priority").and_then(|v| v.as_int().ok()).unwrap_or(0) as u16,
            exchange: Some(DomainName::from(get_str("host")?.as_str())),
            ttl,
        }),
        RecordType::SRV => Some(InternalResourceRecord::SRV {
            priority: map.get("priority").and_then(|v| v.as_int().ok()).unwrap_or(0) as u16,
            weight: map.get("weight").and_then(|v| v.as_int().ok()).unwrap_or(0) as u16,
            port: map.get("port").and_then(|v| v.as_int().ok()).unwrap_or(0) as u16,
            target: DomainName::from(get_str("target")?.as_str()),
            ttl,
        }),
        _ => {
            warn!(%qname, "script plugin produced an unsupported record type");
            None
        }
    }
}

impl Plugin for ScriptPlugin {
    fn process_query(
        &self,
        phase: Phase,
        remote_ip: &str,
        question: &Question,
        answers_so_far: &[InternalResourceRecord],
    ) -> Result<Option<Update>, HerdNsError> {
        self.run(phase, remote_ip, question, answers_so_far)
    }
}

/// The loaded pre/post handler chains for one server instance.
#[derive(Default, Clone)]
pub struct PluginChain {
    pre: Vec<Arc<dyn Plugin>>,
    post: Vec<Arc<dyn Plugin>>,
}

impl PluginChain {
    pub fn load(configs: &[PluginConfig], script_pool: &ScriptPool) -> Result<Self, HerdNsError> {
        let mut chain = PluginChain::default();
        for plugin_config in configs {
            if !plugin_config.enabled {
                continue;
            }
            if !plugin_config.pre_handler.is_empty() {
                let handler = instantiate(plugin_config, &plugin_config.pre_handler, script_pool)?;
                info!(path = %plugin_config.path, handler = %plugin_config.pre_handler, "loaded pre handler");
                chain.pre.push(handler);
            }
            if !plugin_config.post_handler.is_empty() {
                let handler = instantiate(plugin_config, &plugin_config.post_handler, script_pool)?;
                info!(path = %plugin_config.path, handler = %plugin_config.post_handler, "loaded post handler");
                chain.post.push(handler);
            }
        }
        Ok(chain)
    }

    /// Runs the pre-resolution chain. Returns whether the query should skip
    /// resolution (`done`) and whether it should be denied outright.
    pub fn run_pre(
        &self,
        remote_ip: &str,
        question: &mut Question,
        answers: &mut Vec<InternalResourceRecord>,
    ) -> Result<ChainOutcome, HerdNsError> {
        run_chain(&self.pre, Phase::Pre, remote_ip, question, answers)
    }

    pub fn run_post(
        &self,
        remote_ip: &str,
        question: &mut Question,
        answers: &mut Vec<InternalResourceRecord>,
    ) -> Result<ChainOutcome, HerdNsError> {
        run_chain(&self.post, Phase::Post, remote_ip, question, answers)
    }
}

fn instantiate(
    plugin_config: &PluginConfig,
    symbol: &str,
    script_pool: &ScriptPool,
) -> Result<Arc<dyn Plugin>, HerdNsError> {
    if plugin_config.path == "builtin:example" {
        return Ok(Arc::new(ExamplePlugin::new(&plugin_config.arguments)));
    }
    if plugin_config.path == "builtin:script" {
        let script_path = plugin_config.arguments.first().ok_or_else(|| {
            HerdNsError::PluginError("builtin:script plugin requires a script path argument".into())
        })?;
        return Ok(Arc::new(ScriptPlugin::load(script_pool.clone(), script_path)?));
    }
    Ok(Arc::new(load_dylib(
        &plugin_config.path,
        symbol,
        &plugin_config.arguments,
    )?))
}

/// The outcome of running one handler chain against a single question.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChainOutcome {
    /// The whole question is complete — skip resolution for it.
    pub done: bool,
    /// A handler asked for the query to be denied.
    pub deny: bool,
}

fn run_chain(
    handlers: &[Arc<dyn Plugin>],
    phase: Phase,
    remote_ip: &str,
    question: &mut Question,
    answers: &mut Vec<InternalResourceRecord>,
) -> Result<ChainOutcome, HerdNsError> {
    let mut outcome = ChainOutcome::default();
    for handler in handlers {
        let update = match handler.process_query(phase, remote_ip, question, answers) {
            Ok(Some(update)) => update,
            Ok(None) => continue,
            Err(err) => {
                error!(%err, "plugin handler failed, aborting plugin processing for this message");
                return Err(err);
            }
        };

        match update.action {
            Some(Action::Reply) => answers.extend(update.rr),
            Some(Action::Rewrite) => *answers = update.rr,
            Some(Action::Question) => {
                if let Some(new_question) = update.question {
                    *question = new_question;
                }
            }
            Some(Action::Deny) => {
                outcome.deny = true;
                outcome.done = true;
            }
            Some(Action::Noop) | None => {}
        }

        if update.done {
            outcome.done = true;
        }
        if update.stop {
            break;
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::RecordClass;

    fn question(qtype: RecordType, qname: &str) -> Question {
        Question {
            qname: qname.as_bytes().to_vec(),
            qtype,
            qclass: RecordClass::Internet,
        }
    }

    #[test]
    fn example_plugin_replies_to_magic_name_in_pre_phase() {
        let plugin = ExamplePlugin::new(&[]);
        let q = question(RecordType::TXT, "magic.example.com");
        let update = plugin
            .process_query(Phase::Pre, "127.0.0.1", &q, &[])
            .unwrap()
            .unwrap();
        assert_eq!(update.action, Some(Action::Reply));
        assert!(update.done);
        assert_eq!(update.rr.len(), 1);
    }

    #[test]
    fn example_plugin_rewrites_question_for_plugintest() {
        let plugin = ExamplePlugin::new(&[]);
        let q = question(RecordType::A, "plugintest.example.com");
        let update = plugin
            .process_query(Phase::Pre, "127.0.0.1", &q, &[])
            .unwrap()
            .unwrap();
        assert_eq!(update.action, Some(Action::Question));
        assert!(update.stop);
        assert_eq!(update.question.unwrap().qname, b"test.example.com");
    }

    #[test]
    fn chain_stop_halts_remaining_handlers() {
        let plugin = Arc::new(ExamplePlugin::new(&[]));
        let handlers = vec![plugin.clone() as Arc<dyn Plugin>, plugin as Arc<dyn Plugin>];
        let mut q = question(RecordType::A, "plugintest.example.com");
        let mut answers = vec![];
        let outcome = run_chain(&handlers, Phase::Pre, "127.0.0.1", &mut q, &mut answers).unwrap();
        assert!(!outcome.done);
        assert_eq!(q.qname, b"test.example.com");
    }

    #[test]
    fn chain_deny_marks_done() {
        struct DenyPlugin;
        impl Plugin for DenyPlugin {
            fn process_query(
                &self,
                _phase: Phase,
                _remote_ip: &str,
                _question: &Question,
                _answers_so_far: &[InternalResourceRecord],
            ) -> Result<Option<Update>, HerdNsError> {
                Ok(Some(Update {
                    action: Some(Action::Deny),
                    ..Default::default()
                }))
            }
        }
        let handlers: Vec<Arc<dyn Plugin>> = vec![Arc::new(DenyPlugin)];
        let mut q = question(RecordType::A, "example.com");
        let mut answers = vec![];
        let outcome = run_chain(&handlers, Phase::Pre, "127.0.0.1", &mut q, &mut answers).unwrap();
        assert!(outcome.done);
        assert!(outcome.deny);
    }
}
