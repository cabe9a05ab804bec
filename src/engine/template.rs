//! `{{ args.<name> }}` placeholders in topics and filter values.

use crate::error::{Error, Result};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Argument(Vec<String>),
}

/// A string with argument placeholders, e.g. `employeeUpdated.{{ args.employeeID }}`.
#[derive(Debug, Clone, PartialEq)]
pub struct ArgumentTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl ArgumentTemplate {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut rest = raw;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after
                .find("}}")
                .ok_or_else(|| Error::GenerationBuild(format!("unterminated placeholder in '{}'", raw)))?;
            let expr = after[..end].trim();
            let path = expr
                .strip_prefix("args.")
                .filter(|p| !p.is_empty())
                .ok_or_else(|| {
                    Error::GenerationBuild(format!(
                        "placeholder '{}' in '{}' must reference args.<name>",
                        expr, raw
                    ))
                })?;
            segments.push(Segment::Argument(path.split('.').map(str::to_string).collect()));
            rest = &after[end + 2..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn has_placeholders(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Argument(_)))
    }

    /// Argument path when the template is a single placeholder and nothing else.
    pub fn whole_argument(&self) -> Option<&[String]> {
        match self.segments.as_slice() {
            [Segment::Argument(path)] => Some(path),
            _ => None,
        }
    }

    /// Substitute argument values. Missing arguments are an error.
    pub fn render(&self, arguments: &Map<String, Value>) -> Result<String> {
        let mut out = String::with_capacity(self.raw.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Argument(path) => {
                    let value = lookup_argument(arguments, path)
                        .filter(|v| !v.is_null())
                        .ok_or_else(|| {
                            Error::InvalidRequest(format!(
                                "argument '{}' is required by '{}'",
                                path.join("."),
                                self.raw
                            ))
                        })?;
                    out.push_str(&canonical_scalar(value));
                }
            }
        }
        Ok(out)
    }
}

/// Follow a dotted argument path through nested input objects.
pub fn lookup_argument<'a>(arguments: &'a Map<String, Value>, path: &[String]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let mut current = arguments.get(first)?;
    for key in rest {
        current = current.as_object()?.get(key)?;
    }
    Some(current)
}

/// String form used for topic rendering and filter comparison, so `3` and
/// `"3"` compare equal.
pub fn canonical_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}
