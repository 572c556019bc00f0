//! # Expression evaluator module
//!
//! This module wraps the `jaq` family of crates (a jq clone) behind the
//! narrow contract the rest of the engine is written against. Nothing
//! outside this module imports `jaq_*` directly, so a different
//! jq-compatible engine can be swapped in by reimplementing [`Evaluator`].

use std::collections::BTreeMap;

use jaq_interpret::{Ctx, Error as JaqError, FilterT, ParseCtx, RcIter, Val};
use serde_json::Value;
use thiserror::Error;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to parse expression '{0}', {1}")]
    Parse(String, String),
    #[error("failed to evaluate expression '{0}', {1}")]
    Evaluate(String, String),
    #[error("expression '{0}' produced no output")]
    Empty(String),
    #[error("expression '{0}' did not produce a boolean")]
    NotBoolean(String),
    #[error("expression '{0}' did not produce a string")]
    NotString(String),
    #[error("expression '{0}' did not produce an object")]
    NotObject(String),
}

// -----------------------------------------------------------------------------
// Evaluator trait

/// the jq-compatible expression evaluator contract. Deterministic and
/// side-effect-free: given the same `expr` and `ctx`, always returns the
/// same result.
pub trait Evaluator: Send + Sync {
    fn parse_bool(&self, expr: &str, ctx: &Value) -> Result<bool, Error>;
    fn parse_string(&self, expr: &str, ctx: &Value) -> Result<String, Error>;
    fn parse_map(&self, expr: &str, ctx: &Value) -> Result<Value, Error>;
    /// evaluates `expr` once per value of `map`, returning a map of the same
    /// keys to the evaluated strings
    fn parse_strings(
        &self,
        map: &BTreeMap<String, String>,
        ctx: &Value,
    ) -> Result<BTreeMap<String, String>, Error> {
        map.iter()
            .map(|(key, expr)| Ok((key.to_owned(), self.parse_string(expr, ctx)?)))
            .collect()
    }
}

// -----------------------------------------------------------------------------
// JaqEvaluator structure

/// a jq-compatible [`Evaluator`] backed by `jaq-core`/`jaq-std`
#[derive(Clone, Debug, Default)]
pub struct JaqEvaluator {}

impl JaqEvaluator {
    fn run(&self, expr: &str, ctx: &Value) -> Result<Vec<Value>, Error> {
        let mut defs = ParseCtx::new(Vec::new());
        defs.insert_natives(jaq_core::core());
        defs.insert_defs(jaq_std::std());

        let (parsed, errs) = jaq_parse::parse(expr, jaq_parse::main());
        if !errs.is_empty() {
            return Err(Error::Parse(
                expr.to_string(),
                errs.into_iter()
                    .map(|err| err.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            ));
        }

        let filter = defs.compile(parsed.ok_or_else(|| {
            Error::Parse(expr.to_string(), "empty expression".to_string())
        })?);

        if !defs.errs.is_empty() {
            return Err(Error::Parse(
                expr.to_string(),
                defs.errs
                    .into_iter()
                    .map(|(err, _)| err.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            ));
        }

        let inputs = RcIter::new(core::iter::empty());
        let input = Val::from(ctx.to_owned());

        filter
            .run((Ctx::new(Vec::new(), &inputs), input))
            .map(|result| result.map(Value::from).map_err(|err: JaqError| err))
            .collect::<Result<Vec<Value>, JaqError>>()
            .map_err(|err| Error::Evaluate(expr.to_string(), err.to_string()))
    }

    fn run_one(&self, expr: &str, ctx: &Value) -> Result<Value, Error> {
        self.run(expr, ctx)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Empty(expr.to_string()))
    }
}

impl Evaluator for JaqEvaluator {
    fn parse_bool(&self, expr: &str, ctx: &Value) -> Result<bool, Error> {
        match self.run_one(expr, ctx)? {
            Value::Bool(b) => Ok(b),
            _ => Err(Error::NotBoolean(expr.to_string())),
        }
    }

    fn parse_string(&self, expr: &str, ctx: &Value) -> Result<String, Error> {
        match self.run_one(expr, ctx)? {
            Value::String(s) => Ok(s),
            Value::Null => Err(Error::NotString(expr.to_string())),
            other => Ok(other.to_string()),
        }
    }

    fn parse_map(&self, expr: &str, ctx: &Value) -> Result<Value, Error> {
        match self.run_one(expr, ctx)? {
            value @ Value::Object(_) => Ok(value),
            _ => Err(Error::NotObject(expr.to_string())),
        }
    }
}

// -----------------------------------------------------------------------------
// Context helpers

/// merges the spec sub-tree with a synthetic `{"response": observed}`
/// sub-tree, then resolves any string value that itself parses as a JSON
/// object or array into its parsed structure. One pass, top-down: a nested
/// JSON-encoded string becomes a nested map, it is never re-serialized.
pub fn merge_context(spec: Value, response: Value) -> Value {
    let mut root = match spec {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };

    root.insert("response".to_string(), response);
    resolve_nested_json(Value::Object(root))
}

fn resolve_nested_json(value: Value) -> Value {
    match value {
        Value::String(s) => match serde_json::from_str::<Value>(&s) {
            Ok(parsed @ (Value::Object(_) | Value::Array(_))) => resolve_nested_json(parsed),
            _ => Value::String(s),
        },
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, resolve_nested_json(v)))
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.into_iter().map(resolve_nested_json).collect())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_bool_evaluates_equality() {
        let evaluator = JaqEvaluator::default();
        let ctx = json!({"response": {"body": {"password": "x"}}, "payload": {"body": {"password": "x"}}});

        let result = evaluator
            .parse_bool(".response.body.password == .payload.body.password", &ctx)
            .unwrap();

        assert!(result);
    }

    #[test]
    fn parse_string_concatenates() {
        let evaluator = JaqEvaluator::default();
        let ctx = json!({});

        let result = evaluator
            .parse_string("(\"http://x/\" + \"1423\")", &ctx)
            .unwrap();

        assert_eq!(result, "http://x/1423");
    }

    #[test]
    fn merge_context_resolves_nested_json_strings() {
        let spec = json!({"payload": {"body": "{\"a\":1}"}});
        let merged = merge_context(spec, json!({"statusCode": 200}));

        assert_eq!(merged["payload"]["body"]["a"], json!(1));
        assert_eq!(merged["response"]["statusCode"], json!(200));
    }

    #[test]
    fn parse_bool_rejects_non_boolean() {
        let evaluator = JaqEvaluator::default();
        let ctx = json!({});

        assert!(evaluator.parse_bool(".", &ctx).is_err());
    }
}
