//! Subscription event filters.
//!
//! A binding may carry a [`FilterCondition`] tree. At subscribe time the
//! tree is compiled against the field arguments into a [`FilterPredicate`]
//! which is then evaluated once per decoded event. Events that do not match
//! are skipped silently.

use super::template::{canonical_scalar, lookup_argument, ArgumentTemplate};
use crate::error::Result;
use ahash::AHashSet;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Declarative filter as written in a config snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FilterCondition {
    And(Vec<FilterCondition>),
    Or(Vec<FilterCondition>),
    Not(Box<FilterCondition>),
    In(InCondition),
}

/// Membership test of one event field against a set of values.
///
/// String values may contain `{{ args.x }}` placeholders. A value that is
/// exactly one placeholder referencing a list argument expands to every
/// element of that list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InCondition {
    #[serde(rename = "fieldPath")]
    pub field_path: Vec<String>,
    pub values: Vec<Value>,
}

/// A filter with its argument references resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterPredicate {
    And(Vec<FilterPredicate>),
    Or(Vec<FilterPredicate>),
    Not(Box<FilterPredicate>),
    In {
        field_path: Vec<String>,
        values: AHashSet<String>,
    },
}

impl FilterCondition {
    /// Check the placeholders of every value so broken filters fail the
    /// generation build instead of the first subscription.
    pub fn validate(&self) -> Result<()> {
        match self {
            FilterCondition::And(children) | FilterCondition::Or(children) => {
                children.iter().try_for_each(FilterCondition::validate)
            }
            FilterCondition::Not(child) => child.validate(),
            FilterCondition::In(condition) => {
                for value in &condition.values {
                    if let Value::String(s) = value {
                        ArgumentTemplate::parse(s)?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Resolve argument placeholders for one subscription.
    pub fn compile(&self, arguments: &Map<String, Value>) -> Result<FilterPredicate> {
        Ok(match self {
            FilterCondition::And(children) => FilterPredicate::And(
                children
                    .iter()
                    .map(|c| c.compile(arguments))
                    .collect::<Result<_>>()?,
            ),
            FilterCondition::Or(children) => FilterPredicate::Or(
                children
                    .iter()
                    .map(|c| c.compile(arguments))
                    .collect::<Result<_>>()?,
            ),
            FilterCondition::Not(child) => FilterPredicate::Not(Box::new(child.compile(arguments)?)),
            FilterCondition::In(condition) => {
                let mut values = AHashSet::new();
                for value in &condition.values {
                    expand_value(value, arguments, &mut values)?;
                }
                FilterPredicate::In {
                    field_path: condition.field_path.clone(),
                    values,
                }
            }
        })
    }
}

fn expand_value(value: &Value, arguments: &Map<String, Value>, out: &mut AHashSet<String>) -> Result<()> {
    let Value::String(raw) = value else {
        out.insert(canonical_scalar(value));
        return Ok(());
    };

    let template = ArgumentTemplate::parse(raw)?;
    if let Some(path) = template.whole_argument() {
        match lookup_argument(arguments, path) {
            Some(Value::Array(items)) => {
                out.extend(items.iter().map(canonical_scalar));
            }
            Some(other) => {
                out.insert(canonical_scalar(other));
            }
            // An absent optional argument contributes nothing.
            None => {}
        }
        return Ok(());
    }

    if template.has_placeholders() {
        out.insert(template.render(arguments)?);
    } else {
        out.insert(raw.clone());
    }
    Ok(())
}

impl FilterPredicate {
    /// Evaluate against a decoded event entity.
    pub fn matches(&self, event: &Value) -> bool {
        match self {
            FilterPredicate::And(children) => children.iter().all(|c| c.matches(event)),
            FilterPredicate::Or(children) => children.iter().any(|c| c.matches(event)),
            FilterPredicate::Not(child) => !child.matches(event),
            FilterPredicate::In { field_path, values } => {
                match lookup_path(event, field_path) {
                    Some(Value::Array(items)) => {
                        items.iter().any(|item| values.contains(&canonical_scalar(item)))
                    }
                    Some(value) => values.contains(&canonical_scalar(value)),
                    None => false,
                }
            }
        }
    }
}

fn lookup_path<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter()
        .try_fold(value, |current, key| current.as_object()?.get(key))
}
