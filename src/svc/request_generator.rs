//! # Request generator module
//!
//! This module resolves one [`Mapping`] against a resource's current state
//! into a fully materialized method/url/body/headers tuple, ready to be
//! patched for secrets and sent. The resolution context merges the
//! resource's payload with the synthetic `{"response": ...}` sub-tree built
//! from the last observed (or cached) response, then evaluates every
//! templated field as a jq expression over that merged context.

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

use crate::svc::{
    capabilities::{Action, Cache, HttpResponse, Mapping, Method, Payload},
    expr::{self, merge_context, Evaluator},
};

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(Error, Debug)]
pub enum Error {
    #[error("no mapping found for action '{0:?}'")]
    MappingNotFound(Action),
    #[error("failed to materialize url, {0}")]
    Url(expr::Error),
    #[error("failed to materialize url into a valid uri '{0}', {1}")]
    InvalidUrl(String, url::ParseError),
    #[error("failed to materialize body, {0}")]
    Body(expr::Error),
    #[error("failed to materialize headers, {0}")]
    Headers(expr::Error),
}

// -----------------------------------------------------------------------------
// MaterializedRequest structure

#[derive(PartialEq, Eq, Clone, Debug)]
pub struct MaterializedRequest {
    pub method: Method,
    pub url: String,
    pub body: String,
    pub headers: BTreeMap<String, Vec<String>>,
}

// -----------------------------------------------------------------------------
// Helper functions

/// finds the mapping that applies to `action`: an exact match on `action`
/// wins, otherwise the first mapping that declares no action at all (a
/// catch-all mapping) is used.
pub fn find_mapping(mappings: &[Mapping], action: Action) -> Option<&Mapping> {
    mappings
        .iter()
        .find(|mapping| mapping.action == Some(action))
        .or_else(|| mappings.iter().find(|mapping| mapping.action.is_none()))
}

/// builds the template context used to materialize a mapping: the payload
/// merged with a `{"response": ...}` sub-tree built from `response`
pub fn build_context(payload: &Payload, response: &HttpResponse) -> Value {
    let spec = serde_json::json!({
        "baseUrl": payload.base_url,
        "body": payload.body,
    });

    merge_context(spec, serde_json::to_value(response).unwrap_or(Value::Null))
}

/// collapses runs of whitespace to a single space, so a multi-line,
/// YAML-indented jq body expression evaluates the same as its single-line
/// equivalent
fn normalize_whitespace(expr: &str) -> String {
    expr.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// resolves one mapping's method, url, body and headers against the given
/// context, evaluating every templated string field as a jq expression.
/// mapping-declared headers override the resource's default headers by key.
pub fn materialize<E>(
    evaluator: &E,
    mapping: &Mapping,
    default_headers: &BTreeMap<String, Vec<String>>,
    ctx: &Value,
) -> Result<MaterializedRequest, Error>
where
    E: Evaluator,
{
    let method = mapping
        .method
        .or_else(|| mapping.action.map(|action| action.default_method()))
        .unwrap_or(Method::Get);

    let url = evaluator.parse_string(&mapping.url, ctx).map_err(Error::Url)?;
    url::Url::parse(&url).map_err(|err| Error::InvalidUrl(url.to_owned(), err))?;

    let body = match &mapping.body {
        Some(expr) => evaluator
            .parse_string(&normalize_whitespace(expr), ctx)
            .map_err(Error::Body)?,
        None => String::new(),
    };

    let mut headers = default_headers.to_owned();
    if let Some(mapping_headers) = &mapping.headers {
        for (key, values) in mapping_headers {
            let mut resolved = Vec::with_capacity(values.len());
            for value in values {
                resolved.push(evaluator.parse_string(value, ctx).map_err(Error::Headers)?);
            }
            headers.insert(key.to_owned(), resolved);
        }
    }

    Ok(MaterializedRequest {
        method,
        url,
        body,
        headers,
    })
}

/// materializes `mapping` against `response`; if that attempt does not fully
/// materialize (a `null` in a critical position, or an invalid/empty url),
/// retries once against `cache.response`. Returns the second attempt's error
/// if it also fails. Open question (b): this fallback applies to any
/// generation that exposes `.response.*` in its context, not only OBSERVE.
pub fn materialize_with_cache_fallback<E>(
    evaluator: &E,
    mapping: &Mapping,
    default_headers: &BTreeMap<String, Vec<String>>,
    payload: &Payload,
    response: &HttpResponse,
    cache: &Cache,
) -> Result<MaterializedRequest, Error>
where
    E: Evaluator,
{
    let ctx = build_context(payload, response);
    match materialize(evaluator, mapping, default_headers, &ctx) {
        Ok(materialized) => Ok(materialized),
        Err(_) => {
            let cache_ctx = build_context(payload, &cache.response);
            materialize(evaluator, mapping, default_headers, &cache_ctx)
        }
    }
}

/// finds the mapping for `action` and materializes it, with the cache
/// fallback described in [`materialize_with_cache_fallback`]
pub fn resolve<E>(
    evaluator: &E,
    mappings: &[Mapping],
    action: Action,
    default_headers: &BTreeMap<String, Vec<String>>,
    payload: &Payload,
    response: &HttpResponse,
    cache: &Cache,
) -> Result<MaterializedRequest, Error>
where
    E: Evaluator,
{
    let mapping = find_mapping(mappings, action).ok_or(Error::MappingNotFound(action))?;
    materialize_with_cache_fallback(evaluator, mapping, default_headers, payload, response, cache)
}

/// invariant 3: `cache.response` may only be refreshed when every mapping
/// can be fully materialized against `ctx` without producing a `null`
/// anywhere
pub fn all_mappings_materialize<E>(
    evaluator: &E,
    mappings: &[Mapping],
    default_headers: &BTreeMap<String, Vec<String>>,
    ctx: &Value,
) -> bool
where
    E: Evaluator,
{
    mappings
        .iter()
        .all(|mapping| materialize(evaluator, mapping, default_headers, ctx).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svc::expr::JaqEvaluator;

    fn mapping(action: Option<Action>, url: &str, body: Option<&str>) -> Mapping {
        Mapping {
            method: None,
            action,
            url: url.to_string(),
            body: body.map(str::to_string),
            headers: None,
        }
    }

    #[test]
    fn find_mapping_prefers_exact_action_match() {
        let mappings = vec![
            mapping(None, "(.baseUrl)", None),
            mapping(Some(Action::Create), "(.baseUrl + \"/create\")", None),
        ];

        let found = find_mapping(&mappings, Action::Create).unwrap();
        assert_eq!(found.url, "(.baseUrl + \"/create\")");
    }

    #[test]
    fn find_mapping_falls_back_to_catch_all() {
        let mappings = vec![mapping(None, "(.baseUrl)", None)];

        let found = find_mapping(&mappings, Action::Observe).unwrap();
        assert_eq!(found.url, "(.baseUrl)");
    }

    #[test]
    fn build_context_merges_payload_and_response() {
        let payload = Payload {
            base_url: "http://x".to_string(),
            body: String::new(),
        };
        let mut response = HttpResponse::default();
        response.status_code = 200;

        let ctx = build_context(&payload, &response);
        assert_eq!(ctx["response"]["statusCode"], serde_json::json!(200));
    }

    #[test]
    fn materialize_with_cache_fallback_retries_against_cache_on_null() {
        let evaluator = JaqEvaluator::default();
        let mapping = mapping(
            Some(Action::Observe),
            "\"http://example.test\"",
            Some("(.response.body.id)"),
        );
        let payload = Payload {
            base_url: "http://x".to_string(),
            body: String::new(),
        };
        let response = HttpResponse::default();
        let mut cache = Cache::default();
        cache.response.body = "{\"id\": 42}".to_string();

        let materialized = materialize_with_cache_fallback(
            &evaluator,
            &mapping,
            &BTreeMap::new(),
            &payload,
            &response,
            &cache,
        )
        .unwrap();

        assert_eq!(materialized.body, "42");
    }

    #[test]
    fn all_mappings_materialize_false_when_one_produces_null() {
        let evaluator = JaqEvaluator::default();
        let mappings = vec![
            mapping(Some(Action::Observe), "(.baseUrl + \"/1234\")", None),
            mapping(Some(Action::Update), "(.response.missingField)", None),
        ];
        let ctx = serde_json::json!({"baseUrl": "http://example.test", "response": {}});

        assert!(!all_mappings_materialize(
            &evaluator,
            &mappings,
            &BTreeMap::new(),
            &ctx
        ));
    }

    #[test]
    fn all_mappings_materialize_true_when_all_succeed() {
        let evaluator = JaqEvaluator::default();
        let mappings = vec![mapping(Some(Action::Observe), "(.baseUrl + \"/1234\")", None)];
        let ctx = serde_json::json!({"baseUrl": "http://example.test"});

        assert!(all_mappings_materialize(
            &evaluator,
            &mappings,
            &BTreeMap::new(),
            &ctx
        ));
    }

    #[test]
    fn materialize_evaluates_url_and_validates_it() {
        let evaluator = JaqEvaluator::default();
        let mapping = mapping(Some(Action::Observe), "(.baseUrl + \"/1234\")", None);
        let ctx = serde_json::json!({"baseUrl": "http://example.test"});

        let materialized =
            materialize(&evaluator, &mapping, &BTreeMap::new(), &ctx).unwrap();

        assert_eq!(materialized.url, "http://example.test/1234");
        assert_eq!(materialized.method, Method::Get);
    }

    #[test]
    fn materialize_rejects_invalid_url() {
        let evaluator = JaqEvaluator::default();
        let mapping = mapping(Some(Action::Observe), "\"not a url\"", None);
        let ctx = serde_json::json!({});

        assert!(materialize(&evaluator, &mapping, &BTreeMap::new(), &ctx).is_err());
    }
}
