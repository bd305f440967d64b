//! Admission policy: decides whether a source IP may open a flow.
//!
//! Mirrors the `evaluator.go` precedence from the proxy this crate replaces:
//! blocked CIDRs short-circuit before a country lookup is even attempted, then
//! blocked countries, then allowed CIDRs, then allowed countries, then the
//! configured default.

use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;
use thiserror::Error;

use crate::config::RuleConfig;
use crate::geo::{GeoError, GeoLookup};

/// A single allow/block rule, already parsed out of its config-file string form.
#[derive(Clone, Debug)]
pub enum Rule {
    Country(String),
    Cidr(IpNet),
}

#[derive(Debug, Error)]
pub enum EvaluatorError {
    #[error("invalid rule type {0:?} (expected \"country\" or \"cidr\")")]
    UnknownRuleType(String),
    #[error("invalid CIDR {0:?}: {1}")]
    InvalidCidr(String, ipnet::AddrParseError),
    #[error("invalid country code {0:?}: must be a 2-letter code")]
    InvalidCountry(String),
}

/// Whether a default-action fallback is to allow or block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DefaultAction {
    Allow,
    Block,
}

/// The two disjoint indexes built from one rule list: exact country codes and an
/// ordered sequence of CIDR networks.
struct RuleSet {
    countries: std::collections::HashSet<String>,
    cidrs: Vec<IpNet>,
}

impl RuleSet {
    fn build(rules: &[RuleConfig]) -> Result<RuleSet, EvaluatorError> {
        let mut countries = std::collections::HashSet::new();
        let mut cidrs = Vec::new();

        for rule in rules {
            match parse_rule(rule)? {
                Rule::Country(code) => {
                    countries.insert(code);
                }
                Rule::Cidr(net) => cidrs.push(net),
            }
        }

        Ok(RuleSet { countries, cidrs })
    }

    fn contains_country(&self, country: &str) -> bool {
        !country.is_empty() && self.countries.contains(country)
    }

    fn matching_cidr(&self, ip: IpAddr) -> bool {
        self.cidrs.iter().any(|net| net.contains(&ip))
    }
}

fn parse_rule(rule: &RuleConfig) -> Result<Rule, EvaluatorError> {
    match rule.kind.as_str() {
        "country" => {
            let code = rule.value.to_lowercase();
            if code.len() != 2 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(EvaluatorError::InvalidCountry(rule.value.clone()));
            }
            Ok(Rule::Country(code))
        }
        "cidr" => {
            let net = IpNet::from_str(&rule.value)
                .map_err(|e| EvaluatorError::InvalidCidr(rule.value.clone(), e))?;
            Ok(Rule::Cidr(net))
        }
        other => Err(EvaluatorError::UnknownRuleType(other.to_string())),
    }
}

/// The outcome of evaluating a source IP: whether it is allowed, and the country
/// code the decision was made against (empty if none was resolved or needed).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verdict {
    pub allowed: bool,
    pub country: String,
}

#[derive(Debug, Error)]
pub enum EvaluateError {
    #[error("invalid IP address: {0:?}")]
    InvalidAddress(String),
    #[error("country lookup failed: {0}")]
    Lookup(#[from] GeoError),
}

/// Applies the allow/block rule sets (and a configured default) to classify a
/// source IP, consulting `GeoLookup` only when a country-based rule could fire.
pub struct Evaluator {
    default_action: DefaultAction,
    allow: RuleSet,
    block: RuleSet,
    geo: GeoLookup,
}

impl Evaluator {
    pub fn new(
        default_action: DefaultAction,
        allowlist: &[RuleConfig],
        blocklist: &[RuleConfig],
        geo: GeoLookup,
    ) -> Result<Evaluator, EvaluatorError> {
        Ok(Evaluator {
            default_action,
            allow: RuleSet::build(allowlist)?,
            block: RuleSet::build(blocklist)?,
            geo,
        })
    }

    /// Evaluates a textual source address, returning the admission verdict.
    pub fn evaluate(&self, addr: &str) -> Result<Verdict, EvaluateError> {
        let ip: IpAddr = addr
            .parse()
            .map_err(|_| EvaluateError::InvalidAddress(addr.to_string()))?;
        self.evaluate_ip(ip)
    }

    /// Evaluates an already-parsed source IP. Order matters: see module docs.
    pub fn evaluate_ip(&self, ip: IpAddr) -> Result<Verdict, EvaluateError> {
        if self.block.matching_cidr(ip) {
            return Ok(Verdict { allowed: false, country: String::new() });
        }

        let country = self.geo.country(ip)?.to_lowercase();

        if self.block.contains_country(&country) {
            return Ok(Verdict { allowed: false, country });
        }

        if self.allow.matching_cidr(ip) {
            return Ok(Verdict { allowed: true, country });
        }

        if self.allow.contains_country(&country) {
            return Ok(Verdict { allowed: true, country });
        }

        Ok(Verdict { allowed: self.default_action == DefaultAction::Allow, country })
    }
}
