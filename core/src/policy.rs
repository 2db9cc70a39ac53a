// Copyright 2025 ribd Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Import and export policy.
//!
//! A policy is a named, ordered list of statements. The first statement whose
//! conditions all match applies its actions and decides the outcome; when none
//! match, the policy's default decides. Several policies are chained: a path
//! must be accepted by each in turn, and modifications carry forward.

use crate::bgp::attr::{as_path_to_string, parse_community, AsPathSegment, AsPathSegmentType};
use crate::config::{ActionsConfig, ConditionsConfig, PolicyDefinitionConfig, StatementConfig};
use crate::net::IpNetwork;
use crate::rib::{Path, PathAttrs, SourceKind};
use crate::rpki::RpkiVerdict;
use regex::Regex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyDirection {
    Import,
    Export,
}

impl std::fmt::Display for PolicyDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyDirection::Import => f.write_str("import"),
            PolicyDirection::Export => f.write_str("export"),
        }
    }
}

/// Policy evaluation as seen by the server.
pub trait PolicyEngine: Send + Sync {
    /// Run `path` through the named policies in order. `None` means rejected;
    /// otherwise the (possibly rewritten) path.
    fn apply(
        &self,
        direction: PolicyDirection,
        names: &[String],
        path: &Arc<Path>,
    ) -> Option<Arc<Path>>;

    fn define(&mut self, def: &PolicyDefinitionConfig) -> Result<(), String>;

    fn remove(&mut self, name: &str) -> bool;

    fn contains(&self, name: &str) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteType {
    Ebgp,
    Ibgp,
    Local,
}

#[derive(Debug, Clone)]
pub enum Condition {
    /// Matches the prefix itself, or more specifics up to `le` when set.
    Prefix { prefix: IpNetwork, le: Option<u8> },
    Neighbor(IpAddr),
    AsPathRegex(Regex),
    Community(u32),
    Rpki(RpkiVerdict),
    RouteType(RouteType),
}

impl Condition {
    fn matches(&self, path: &Path) -> bool {
        match self {
            Condition::Prefix { prefix, le } => match path.nlri.prefix() {
                Some(p) => match le {
                    Some(le) => prefix.contains(&p) && p.prefix_len() <= *le,
                    None => p == *prefix,
                },
                None => false,
            },
            Condition::Neighbor(addr) => {
                !path.source.is_local() && path.source.address == *addr
            }
            Condition::AsPathRegex(re) => re.is_match(&as_path_to_string(&path.attrs.as_path)),
            Condition::Community(c) => path.attrs.has_community(*c),
            Condition::Rpki(verdict) => path.validation == *verdict,
            Condition::RouteType(route_type) => matches!(
                (route_type, path.source.kind),
                (RouteType::Ebgp, SourceKind::Ebgp)
                    | (RouteType::Ibgp, SourceKind::Ibgp)
                    | (RouteType::Local, SourceKind::Local)
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Reject,
    SetLocalPref(u32),
    SetMed(u32),
    AddCommunities(Vec<u32>),
    Prepend { asn: u32, count: u8 },
}

impl Action {
    /// Returns false when the action rejects the path.
    fn apply(&self, attrs: &mut PathAttrs) -> bool {
        match self {
            Action::Reject => return false,
            Action::SetLocalPref(value) => attrs.local_pref = Some(*value),
            Action::SetMed(value) => attrs.med = Some(*value),
            Action::AddCommunities(to_add) => {
                for c in to_add {
                    if !attrs.communities.contains(c) {
                        attrs.communities.push(*c);
                    }
                }
            }
            Action::Prepend { asn, count } => prepend_as(&mut attrs.as_path, *asn, *count),
        }
        true
    }
}

/// Put `asn` `count` times at the front of the path.
pub fn prepend_as(as_path: &mut Vec<AsPathSegment>, asn: u32, count: u8) {
    let extra = std::iter::repeat(asn).take(count as usize);
    match as_path.first_mut() {
        Some(first)
            if first.segment_type == AsPathSegmentType::AsSequence
                && first.asn_list.len() + (count as usize) <= 255 =>
        {
            first.asn_list.splice(0..0, extra);
        }
        _ => as_path.insert(0, AsPathSegment::sequence(extra.collect())),
    }
}

#[derive(Debug, Clone)]
pub struct Statement {
    name: Option<String>,
    conditions: Vec<Condition>,
    actions: Vec<Action>,
}

impl Statement {
    pub fn new() -> Self {
        Statement {
            name: None,
            conditions: Vec::new(),
            actions: Vec::new(),
        }
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn then(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    fn matches(&self, path: &Path) -> bool {
        self.conditions.iter().all(|c| c.matches(path))
    }
}

impl Default for Statement {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<&StatementConfig> for Statement {
    type Error = String;

    fn try_from(config: &StatementConfig) -> Result<Self, Self::Error> {
        let mut stmt = add_conditions(Statement::new(), &config.conditions)?;
        stmt = add_actions(stmt, &config.actions)?;
        stmt.name = config.name.clone();
        Ok(stmt)
    }
}

fn add_conditions(mut stmt: Statement, cond: &ConditionsConfig) -> Result<Statement, String> {
    if let Some(ref prefix_str) = cond.prefix {
        let prefix = IpNetwork::from_str(prefix_str)
            .map_err(|e| format!("invalid prefix '{}': {}", prefix_str, e))?;
        if let Some(le) = cond.prefix_le {
            if le < prefix.prefix_len() {
                return Err(format!("prefix-le {} shorter than {}", le, prefix_str));
            }
        }
        stmt = stmt.when(Condition::Prefix {
            prefix,
            le: cond.prefix_le,
        });
    } else if cond.prefix_le.is_some() {
        return Err("prefix-le without prefix".to_string());
    }

    if let Some(neighbor) = cond.neighbor {
        stmt = stmt.when(Condition::Neighbor(neighbor));
    }

    if let Some(ref pattern) = cond.as_path_regex {
        let re = Regex::new(pattern)
            .map_err(|e| format!("invalid as-path-regex '{}': {}", pattern, e))?;
        stmt = stmt.when(Condition::AsPathRegex(re));
    }

    if let Some(ref community_str) = cond.community {
        stmt = stmt.when(Condition::Community(parse_community(community_str)?));
    }

    if let Some(ref rpki) = cond.rpki {
        stmt = stmt.when(Condition::Rpki(rpki.parse()?));
    }

    if let Some(ref route_type_str) = cond.route_type {
        let route_type = match route_type_str.as_str() {
            "ebgp" => RouteType::Ebgp,
            "ibgp" => RouteType::Ibgp,
            "local" => RouteType::Local,
            _ => {
                return Err(format!(
                    "invalid route-type '{}' (must be 'ebgp', 'ibgp', or 'local')",
                    route_type_str
                ))
            }
        };
        stmt = stmt.when(Condition::RouteType(route_type));
    }

    Ok(stmt)
}

fn add_actions(mut stmt: Statement, actions: &ActionsConfig) -> Result<Statement, String> {
    if actions.reject {
        return Ok(stmt.then(Action::Reject));
    }
    if let Some(value) = actions.local_pref {
        stmt = stmt.then(Action::SetLocalPref(value));
    }
    if let Some(value) = actions.med {
        stmt = stmt.then(Action::SetMed(value));
    }
    if !actions.add_communities.is_empty() {
        let communities = actions
            .add_communities
            .iter()
            .map(|c| parse_community(c))
            .collect::<Result<Vec<_>, _>>()?;
        stmt = stmt.then(Action::AddCommunities(communities));
    }
    if let Some(prepend) = actions.prepend {
        if prepend.count == 0 {
            return Err("prepend count must be at least 1".to_string());
        }
        stmt = stmt.then(Action::Prepend {
            asn: prepend.asn,
            count: prepend.count,
        });
    }
    Ok(stmt)
}

#[derive(Debug, Clone)]
pub struct Policy {
    pub name: String,
    statements: Vec<Statement>,
    default_accept: bool,
}

enum Verdict {
    Accept,
    Reject,
}

impl Policy {
    pub fn new(name: impl Into<String>, statements: Vec<Statement>, default_accept: bool) -> Self {
        Policy {
            name: name.into(),
            statements,
            default_accept,
        }
    }

    fn evaluate(&self, path: &Path, attrs: &mut PathAttrs) -> Verdict {
        let Some(stmt) = self.statements.iter().find(|s| s.matches(path)) else {
            return if self.default_accept {
                Verdict::Accept
            } else {
                Verdict::Reject
            };
        };
        for action in &stmt.actions {
            if !action.apply(attrs) {
                return Verdict::Reject;
            }
        }
        Verdict::Accept
    }
}

impl TryFrom<&PolicyDefinitionConfig> for Policy {
    type Error = String;

    fn try_from(def: &PolicyDefinitionConfig) -> Result<Self, Self::Error> {
        let statements = def
            .statements
            .iter()
            .enumerate()
            .map(|(i, s)| {
                Statement::try_from(s).map_err(|e| {
                    let label = s.name.clone().unwrap_or_else(|| format!("#{}", i));
                    format!("policy '{}' statement {}: {}", def.name, label, e)
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Policy::new(def.name.clone(), statements, def.default_accept))
    }
}

/// Named policies, compiled from configuration.
#[derive(Debug, Clone, Default)]
pub struct PolicyStore {
    policies: HashMap<String, Policy>,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(defs: &[PolicyDefinitionConfig]) -> Result<Self, String> {
        let mut store = PolicyStore::new();
        for def in defs {
            store.define(def)?;
        }
        Ok(store)
    }

    pub fn insert(&mut self, policy: Policy) {
        self.policies.insert(policy.name.clone(), policy);
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.policies.keys().cloned().collect();
        names.sort();
        names
    }
}

impl PolicyEngine for PolicyStore {
    fn apply(
        &self,
        _direction: PolicyDirection,
        names: &[String],
        path: &Arc<Path>,
    ) -> Option<Arc<Path>> {
        if names.is_empty() || path.withdraw {
            return Some(Arc::clone(path));
        }
        let mut attrs = (*path.attrs).clone();
        for name in names {
            // references are checked when a neighbor is configured
            let Some(policy) = self.policies.get(name) else {
                continue;
            };
            if let Verdict::Reject = policy.evaluate(path, &mut attrs) {
                return None;
            }
        }
        if attrs == *path.attrs {
            return Some(Arc::clone(path));
        }
        Some(path.clone_with(|p| p.attrs = Arc::new(attrs)))
    }

    fn define(&mut self, def: &PolicyDefinitionConfig) -> Result<(), String> {
        let policy = Policy::try_from(def)?;
        self.insert(policy);
        Ok(())
    }

    fn remove(&mut self, name: &str) -> bool {
        self.policies.remove(name).is_some()
    }

    fn contains(&self, name: &str) -> bool {
        self.policies.contains_key(name)
    }
}
