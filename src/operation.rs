//! Operation documents, resolved for routing.
//!
//! Documents are parsed with `async-graphql-parser`; this module keeps only
//! what the runtime needs to route an operation: the operation type, the
//! root fields with their arguments (variables substituted), and the
//! selection sets used to shape event entities. Full validation stays with
//! the [`crate::executor::Executor`].

use crate::error::{Error, Result};
use async_graphql_parser::types::{
    DocumentOperations, ExecutableDocument, FragmentDefinition, OperationDefinition,
    OperationType, Selection, SelectionSet,
};
use async_graphql_parser::Positioned;
use async_graphql_value::{ConstValue, Name, Value as GqlValue};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// GraphQL operation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
            OperationKind::Subscription => "subscription",
        }
    }
}

/// A field selection with resolved arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub alias: Option<String>,
    pub name: String,
    pub arguments: Map<String, Value>,
    pub selection: Vec<Field>,
}

impl Field {
    /// Key this field occupies in the response object.
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    pub fn argument(&self, name: &str) -> Option<&Value> {
        self.arguments.get(name)
    }

    /// Shape `value` by this field's selection set.
    ///
    /// Objects keep only selected keys (missing ones become `null`), lists
    /// are projected element-wise, leaves are returned unchanged.
    pub fn project(&self, value: &Value) -> Value {
        if self.selection.is_empty() {
            return value.clone();
        }
        match value {
            Value::Object(object) => {
                let mut projected = Map::with_capacity(self.selection.len());
                for child in &self.selection {
                    let child_value = object
                        .get(&child.name)
                        .map(|v| child.project(v))
                        .unwrap_or(Value::Null);
                    projected.insert(child.response_key().to_string(), child_value);
                }
                Value::Object(projected)
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| self.project(v)).collect()),
            other => other.clone(),
        }
    }
}

/// The operation selected from a document.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub kind: OperationKind,
    pub name: Option<String>,
    pub fields: Vec<Field>,
}

impl Operation {
    /// Parse `document` and select the operation to run.
    pub fn parse(
        document: &str,
        operation_name: Option<&str>,
        variables: Option<&Value>,
    ) -> Result<Self> {
        check_nesting(document)?;
        let parsed = async_graphql_parser::parse_query(document)
            .map_err(|err| Error::InvalidOperation(err.to_string()))?;

        let (name, definition) = select(&parsed, operation_name.filter(|n| !n.is_empty()))?;

        let empty = Map::new();
        let provided = match variables {
            Some(Value::Object(map)) => map,
            _ => &empty,
        };
        let resolver = Resolver {
            variables: provided,
            defaults: definition
                .variable_definitions
                .iter()
                .filter_map(|var| {
                    let default = var.node.default_value.as_ref()?;
                    Some((var.node.name.node.as_str(), &default.node))
                })
                .collect(),
            fragments: &parsed.fragments,
        };

        let fields = resolver.fields(&definition.selection_set.node, 0)?;
        if fields.is_empty() {
            return Err(Error::InvalidOperation("operation selects no fields".into()));
        }
        let kind = match definition.ty {
            OperationType::Query => OperationKind::Query,
            OperationType::Mutation => OperationKind::Mutation,
            OperationType::Subscription => OperationKind::Subscription,
        };
        if kind == OperationKind::Subscription && fields.len() > 1 {
            return Err(Error::InvalidOperation(
                "subscription must select only one top level field".into(),
            ));
        }

        Ok(Operation {
            kind,
            name: name.map(|n| n.to_string()),
            fields,
        })
    }

    /// First root field; subscriptions have exactly one.
    pub fn root_field(&self) -> Result<&Field> {
        self.fields
            .first()
            .ok_or_else(|| Error::InvalidOperation("operation selects no fields".into()))
    }

    pub fn is_subscription(&self) -> bool {
        self.kind == OperationKind::Subscription
    }
}

fn select<'a>(
    document: &'a ExecutableDocument,
    operation_name: Option<&str>,
) -> Result<(Option<&'a Name>, &'a OperationDefinition)> {
    let unknown =
        |name: &str| Error::InvalidOperation(format!("Unknown operation named \"{}\".", name));
    match (&document.operations, operation_name) {
        (DocumentOperations::Single(op), None) => Ok((None, &op.node)),
        (DocumentOperations::Single(_), Some(name)) => Err(unknown(name)),
        (DocumentOperations::Multiple(ops), Some(name)) => ops
            .get_key_value(name)
            .map(|(name, op)| (Some(name), &op.node))
            .ok_or_else(|| unknown(name)),
        (DocumentOperations::Multiple(ops), None) => {
            let mut iter = ops.iter();
            match (iter.next(), iter.next()) {
                (Some((name, op)), None) => Ok((Some(name), &op.node)),
                _ => Err(Error::InvalidOperation(
                    "operation name is required when the document contains multiple operations"
                        .into(),
                )),
            }
        }
    }
}

/// Deepest `{`/`[`/`(` nesting accepted in a document.
pub const MAX_NESTING_DEPTH: usize = 64;

/// Reject documents nested deeper than [`MAX_NESTING_DEPTH`] before they
/// reach the recursive parser. Strings and comments are skipped.
fn check_nesting(document: &str) -> Result<()> {
    let bytes = document.as_bytes();
    let mut depth = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'#' => {
                while i < bytes.len() && bytes[i] != b'\n' && bytes[i] != b'\r' {
                    i += 1;
                }
                continue;
            }
            b'"' if bytes[i..].starts_with(b"\"\"\"") => {
                i += 3;
                while i < bytes.len() {
                    if bytes[i..].starts_with(b"\\\"\"\"") {
                        i += 4;
                    } else if bytes[i..].starts_with(b"\"\"\"") {
                        i += 3;
                        break;
                    } else {
                        i += 1;
                    }
                }
                continue;
            }
            b'"' => {
                i += 1;
                while i < bytes.len() && bytes[i] != b'"' && bytes[i] != b'\n' {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            b'{' | b'[' | b'(' => {
                depth += 1;
                if depth > MAX_NESTING_DEPTH {
                    return Err(Error::InvalidOperation(format!(
                        "document nests deeper than {} levels",
                        MAX_NESTING_DEPTH
                    )));
                }
            }
            b'}' | b']' | b')' => depth = depth.saturating_sub(1),
            _ => {}
        }
        i += 1;
    }
    Ok(())
}

const MAX_FRAGMENT_DEPTH: usize = 32;

struct Resolver<'a> {
    variables: &'a Map<String, Value>,
    defaults: HashMap<&'a str, &'a ConstValue>,
    fragments: &'a HashMap<Name, Positioned<FragmentDefinition>>,
}

impl Resolver<'_> {
    fn fields(&self, set: &SelectionSet, depth: usize) -> Result<Vec<Field>> {
        if depth > MAX_FRAGMENT_DEPTH {
            return Err(Error::InvalidOperation("fragment spreads nest too deeply".into()));
        }
        let mut fields = Vec::new();
        for item in &set.items {
            match &item.node {
                Selection::Field(field) => {
                    let field = &field.node;
                    let mut arguments = Map::new();
                    for (name, value) in &field.arguments {
                        arguments.insert(name.node.to_string(), self.value(&value.node)?);
                    }
                    fields.push(Field {
                        alias: field.alias.as_ref().map(|alias| alias.node.to_string()),
                        name: field.name.node.to_string(),
                        arguments,
                        selection: self.fields(&field.selection_set.node, depth)?,
                    });
                }
                Selection::FragmentSpread(spread) => {
                    let name = &spread.node.fragment_name.node;
                    let fragment = self.fragments.get(name).ok_or_else(|| {
                        Error::InvalidOperation(format!("Unknown fragment \"{}\".", name))
                    })?;
                    fields.extend(self.fields(&fragment.node.selection_set.node, depth + 1)?);
                }
                Selection::InlineFragment(inline) => {
                    fields.extend(self.fields(&inline.node.selection_set.node, depth + 1)?)
                }
            }
        }
        Ok(fields)
    }

    /// Substitute variables and convert to JSON. Enum values become strings;
    /// unset variables without a default become `null`.
    fn value(&self, value: &GqlValue) -> Result<Value> {
        value
            .clone()
            .into_const_with(|name| match self.variables.get(name.as_str()) {
                Some(provided) => ConstValue::from_json(provided.clone()),
                None => Ok(self
                    .defaults
                    .get(name.as_str())
                    .map(|default| (*default).clone())
                    .unwrap_or(ConstValue::Null)),
            })
            .and_then(ConstValue::into_json)
            .map_err(|err| Error::InvalidOperation(format!("invalid argument value: {}", err)))
    }
}
