//! Boolean rule evaluation over the query context, grounded on `evalexpr`.

use crate::resourcerecord::{parse_ipv4, InternalResourceRecord};
use evalexpr::{context_map, eval_boolean_with_context};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuleConfig {
    /// A boolean `evalexpr` expression evaluated against `{host, remoteip}`.
    pub condition: String,
    /// `""`, `"drop"`, `"inspect"`, or `"rewrite '<ip>'"`.
    #[serde(default)]
    pub action: String,
}

/// The decoded form of a rule's `action` string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleAction {
    /// No rule matched, or the matched rule's action is the empty string:
    /// produce the answer unchanged.
    Pass,
    /// Suppress the answer entirely.
    Drop,
    /// Log the record for diagnostics, do not emit it.
    Inspect,
    /// Replace the answer with a synthesized A record at the given address.
    Rewrite(String),
}

impl FromStr for RuleAction {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let input = input.trim();
        if input.is_empty() {
            return Ok(RuleAction::Pass);
        }
        if input.eq_ignore_ascii_case("drop") {
            return Ok(RuleAction::Drop);
        }
        if input.eq_ignore_ascii_case("inspect") {
            return Ok(RuleAction::Inspect);
        }
        if let Some(rest) = input.strip_prefix("rewrite ") {
            let ip = rest.trim().trim_matches('\'').trim_matches('"');
            return Ok(RuleAction::Rewrite(ip.to_string()));
        }
        Err(format!("unrecognized rule action: {input:?}"))
    }
}

/// Evaluates `rules` in order against `(host, remoteip)` and returns the
/// first match's decoded action, or [RuleAction::Pass] if none matched or
/// the rule engine is disabled. Evaluation errors are logged and treated as
/// non-matching, per the rule engine's error contract.
pub fn evaluate(rules: &[RuleConfig], host: &str, remoteip: &str, enabled: bool) -> RuleAction {
    if !enabled {
        return RuleAction::Pass;
    }
    for rule in rules {
        let context = match context_map! {
            "host" => host,
            "remoteip" => remoteip,
        } {
            Ok(context) => context,
            Err(err) => {
                warn!(condition = %rule.condition, %err, "failed to build rule evaluation context");
                continue;
            }
        };
        match eval_boolean_with_context(&rule.condition, &context) {
            Ok(true) => match RuleAction::from_str(&rule.action) {
                Ok(action) => return action,
                Err(err) => {
                    warn!(condition = %rule.condition, action = %rule.action, %err, "bad rule action, skipping");
                    continue;
                }
            },
            Ok(false) => continue,
            Err(err) => {
                warn!(condition = %rule.condition, %err, "rule condition failed to evaluate, treating as non-match");
                continue;
            }
        }
    }
    RuleAction::Pass
}

/// Applies a resolved [RuleAction] to a single candidate answer, returning
/// the (possibly empty, possibly replaced) set of records to emit for it.
/// `qname` is the original question name, used as the owner of any
/// synthesized rewrite record. `rewrite_ttl` is the placeholder TTL used for
/// synthesized records (see the rule engine's §9 design note).
pub fn apply(action: &RuleAction, record: InternalResourceRecord, qname: &str, rewrite_ttl: u32) -> Vec<InternalResourceRecord> {
    match action {
        RuleAction::Pass => vec![record],
        RuleAction::Drop => vec![],
        RuleAction::Inspect => {
            tracing::info!(?record, qname, "rule inspect: would have served this record");
            vec![]
        }
        RuleAction::Rewrite(ip) => match parse_ipv4(ip) {
            Ok(address) => vec![InternalResourceRecord::A {
                address,
                ttl: rewrite_ttl,
            }],
            Err(err) => {
                warn!(%ip, %err, "rule rewrite target is not a valid IPv4 address, dropping answer");
                vec![]
            }
        },
    }
}
