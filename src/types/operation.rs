//! Operation definitions.
//!
//! An [`Operation`] is parsed once from its GraphQL document. The kind and the
//! root field set are computed at that point and never re-derived at dispatch.

use crate::{Error, ErrorContext, Result};
use async_graphql::parser::types::{
    Directive, DocumentOperations, FragmentDefinition, OperationDefinition, OperationType,
    Selection, SelectionSet,
};
use async_graphql::parser::{parse_query, Positioned};
use async_graphql::{Name, Value as ConstValue};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Mutation => "mutation",
            Self::Subscription => "subscription",
        }
    }

    /// Cache key of the root entry that results of this kind are written under.
    pub fn root_key(&self) -> &'static str {
        match self {
            Self::Query => "ROOT_QUERY",
            Self::Mutation => "ROOT_MUTATION",
            Self::Subscription => "ROOT_SUBSCRIPTION",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared retry intent of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryIntent {
    /// Follow the client's retry policy.
    #[default]
    Default,
    /// Never re-issue this operation automatically.
    Never,
}

/// A parsed GraphQL operation.
#[derive(Debug, Clone)]
pub struct Operation {
    document: Arc<str>,
    name: Option<String>,
    kind: OperationKind,
    root_fields: Vec<String>,
    conditional_fields: Vec<String>,
    retry: RetryIntent,
}

impl Operation {
    /// Parse a document containing exactly one operation definition
    /// (fragment definitions may accompany it).
    pub fn parse(document: impl Into<String>) -> Result<Self> {
        Self::build(document.into(), None)
    }

    /// Parse a document and select the operation called `name`.
    pub fn named(document: impl Into<String>, name: &str) -> Result<Self> {
        Self::build(document.into(), Some(name))
    }

    fn build(document: String, wanted: Option<&str>) -> Result<Self> {
        let parsed = parse_query(&document)
            .map_err(|e| parse_error("invalid GraphQL document", Some(e.to_string())))?;

        let operations: Vec<(Option<&str>, &Positioned<OperationDefinition>)> =
            match &parsed.operations {
                DocumentOperations::Single(op) => vec![(None, op)],
                DocumentOperations::Multiple(ops) => ops
                    .iter()
                    .map(|(name, op)| (Some(name.as_str()), op))
                    .collect(),
            };
        let mut candidates = operations
            .into_iter()
            .filter(|(name, _)| wanted.map_or(true, |w| *name == Some(w)));
        let (name, op) = candidates.next().ok_or_else(|| {
            parse_error(
                match wanted {
                    Some(w) => format!("no operation named '{}' in document", w),
                    None => "document contains no operation definition".to_string(),
                },
                None,
            )
        })?;
        if candidates.next().is_some() {
            return Err(parse_error(
                "document contains several operations; select one by name",
                None,
            ));
        }

        let mut root = RootFields::default();
        collect_root_fields(
            &op.node.selection_set.node,
            &parsed.fragments,
            Presence::Always,
            &mut Vec::new(),
            &mut root,
        )?;

        Ok(Self {
            name: name.map(str::to_string),
            kind: kind_of(op.node.ty),
            root_fields: root.keys,
            conditional_fields: root.conditional,
            document: Arc::from(document),
            retry: RetryIntent::Default,
        })
    }

    pub fn with_retry(mut self, intent: RetryIntent) -> Self {
        self.retry = intent;
        self
    }

    /// Opt this operation out of automatic retry.
    pub fn without_retry(self) -> Self {
        self.with_retry(RetryIntent::Never)
    }

    pub fn document(&self) -> &str {
        &self.document
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Response keys (alias or field name) selected at the root, in document
    /// order. Fields excluded by a literal `@skip`/`@include` are left out.
    pub fn root_fields(&self) -> &[String] {
        &self.root_fields
    }

    /// Root fields whose presence depends on a variable in `@skip`/`@include`.
    pub fn conditional_fields(&self) -> &[String] {
        &self.conditional_fields
    }

    /// Root fields every response to this operation carries.
    pub fn required_fields(&self) -> impl Iterator<Item = &String> {
        self.root_fields
            .iter()
            .filter(|k| !self.conditional_fields.contains(k))
    }

    pub fn retry_intent(&self) -> RetryIntent {
        self.retry
    }

    /// Name for logs and diagnostics.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<anonymous>")
    }
}

fn parse_error(msg: impl Into<String>, details: Option<String>) -> Error {
    let mut ctx = ErrorContext::new()
        .with_field_path("operation.document")
        .with_source("operation_parser");
    if let Some(d) = details {
        ctx = ctx.with_details(d);
    }
    Error::configuration_with_context(msg, ctx)
}

/// Whether a selection reaches the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Presence {
    Always,
    /// Guarded by `@skip`/`@include` on a variable.
    Conditional,
    Never,
}

impl Presence {
    fn and(self, other: Presence) -> Presence {
        match (self, other) {
            (Presence::Never, _) | (_, Presence::Never) => Presence::Never,
            (Presence::Conditional, _) | (_, Presence::Conditional) => Presence::Conditional,
            _ => Presence::Always,
        }
    }
}

/// Evaluate `@skip(if:)` and `@include(if:)`. A literal condition is
/// resolved here; a variable makes the selection conditional.
fn presence(directives: &[Positioned<Directive>]) -> Presence {
    directives.iter().fold(Presence::Always, |acc, directive| {
        let skip = match directive.node.name.node.as_str() {
            "skip" => true,
            "include" => false,
            _ => return acc,
        };
        let condition = directive
            .node
            .arguments
            .iter()
            .find(|(name, _)| name.node.as_str() == "if")
            .map(|(_, value)| value.node.clone().into_const());
        let own = match condition {
            Some(Some(ConstValue::Boolean(flag))) if flag == skip => Presence::Never,
            Some(Some(ConstValue::Boolean(_))) => Presence::Always,
            _ => Presence::Conditional,
        };
        acc.and(own)
    })
}

#[derive(Default)]
struct RootFields {
    keys: Vec<String>,
    conditional: Vec<String>,
}

impl RootFields {
    fn add(&mut self, key: &str, presence: Presence) {
        match presence {
            Presence::Never => {}
            Presence::Always => {
                self.conditional.retain(|k| k != key);
                if !self.keys.iter().any(|k| k == key) {
                    self.keys.push(key.to_string());
                }
            }
            Presence::Conditional => {
                if !self.keys.iter().any(|k| k == key) {
                    self.keys.push(key.to_string());
                    self.conditional.push(key.to_string());
                }
            }
        }
    }
}

/// Collect root response keys, expanding fragment spreads and inline
/// fragments.
fn collect_root_fields(
    selection_set: &SelectionSet,
    fragments: &HashMap<Name, Positioned<FragmentDefinition>>,
    inherited: Presence,
    visiting: &mut Vec<String>,
    out: &mut RootFields,
) -> Result<()> {
    for selection in &selection_set.items {
        match &selection.node {
            Selection::Field(field) => {
                let presence = inherited.and(presence(&field.node.directives));
                out.add(field.node.response_key().node.as_str(), presence);
            }
            Selection::InlineFragment(fragment) => {
                let presence = inherited.and(presence(&fragment.node.directives));
                collect_root_fields(
                    &fragment.node.selection_set.node,
                    fragments,
                    presence,
                    visiting,
                    out,
                )?;
            }
            Selection::FragmentSpread(spread) => {
                let name = spread.node.fragment_name.node.as_str();
                if visiting.iter().any(|v| v == name) {
                    return Err(parse_error(format!("fragment cycle through '{}'", name), None));
                }
                let definition = fragments
                    .get(&spread.node.fragment_name.node)
                    .ok_or_else(|| parse_error(format!("unknown fragment '{}'", name), None))?;
                let presence = inherited
                    .and(presence(&spread.node.directives))
                    .and(presence(&definition.node.directives));
                visiting.push(name.to_string());
                collect_root_fields(
                    &definition.node.selection_set.node,
                    fragments,
                    presence,
                    visiting,
                    out,
                )?;
                visiting.pop();
            }
        }
    }
    Ok(())
}

fn kind_of(ty: OperationType) -> OperationKind {
    match ty {
        OperationType::Query => OperationKind::Query,
        OperationType::Mutation => OperationKind::Mutation,
        OperationType::Subscription => OperationKind::Subscription,
    }
}
