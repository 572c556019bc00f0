//! # Response check module
//!
//! This module evaluates whether an observed http response means a
//! `Request`/`DisposableRequest` is up to date, or that the remote resource
//! has been removed entirely. Both checks default to a structural
//! comparison but can be overridden by a custom jq boolean expression.
//!
//! The is-removed check is evaluated independently of the up-to-date check:
//! a resource can be "removed" (404/410, or a custom predicate) without the
//! up-to-date check ever running.

use serde_json::Value;
use thiserror::Error;

use crate::svc::{
    capabilities::{HttpResponse, ResponseCheck, ResponseCheckType},
    expr::{self, Evaluator},
};

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to evaluate custom response check, {0}")]
    Expression(expr::Error),
    #[error("shape mismatch, {0} is not valid json")]
    NotValidJson(String),
}

// -----------------------------------------------------------------------------
// Structural comparison

/// returns whether `expected` is a subset of `actual`: every key/value pair
/// present in `expected` must also be present, and equal recursively, in
/// `actual`. arrays compare elementwise, in order.
pub fn is_subset(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Object(expected_map), Value::Object(actual_map)) => {
            expected_map.iter().all(|(key, value)| {
                actual_map
                    .get(key)
                    .map(|actual_value| is_subset(value, actual_value))
                    .unwrap_or(false)
            })
        }
        (Value::Array(expected_items), Value::Array(actual_items)) => {
            expected_items.len() <= actual_items.len()
                && expected_items
                    .iter()
                    .zip(actual_items.iter())
                    .all(|(expected, actual)| is_subset(expected, actual))
        }
        (expected, actual) => expected == actual,
    }
}

// -----------------------------------------------------------------------------
// DEFAULT checks

/// the response's status code is in the 2xx range and, when `expected_body`
/// parses as json, it is a structural subset of the response's own body;
/// when neither side parses as json, the response body must merely contain
/// `expected_body` as a substring. A mismatch where only one side is json
/// is a shape mismatch, not a substring candidate: it surfaces as an error.
pub fn default_check(response: &HttpResponse, expected_body: &str) -> Result<bool, Error> {
    if !(200..300).contains(&response.status_code) {
        return Ok(false);
    }

    if expected_body.is_empty() {
        return Ok(true);
    }

    let actual = serde_json::from_str::<Value>(&response.body);
    let desired = serde_json::from_str::<Value>(expected_body);

    match (actual, desired) {
        (Ok(actual), Ok(desired)) => Ok(is_subset(&desired, &actual)),
        (Err(_), Ok(_)) => Err(Error::NotValidJson("response body".to_string())),
        (Ok(_), Err(_)) => Err(Error::NotValidJson("update mapping".to_string())),
        (Err(_), Err(_)) => Ok(response.body.contains(expected_body)),
    }
}

/// a 404 or 410 status code means the remote resource no longer exists
pub fn default_is_removed(response: &HttpResponse) -> bool {
    matches!(response.status_code, 404 | 410)
}

// -----------------------------------------------------------------------------
// Evaluation entry points

/// evaluates the up-to-date [`ResponseCheck`] (DEFAULT or CUSTOM) over the
/// given response and template context
pub fn evaluate<E>(
    evaluator: &E,
    check: &ResponseCheck,
    response: &HttpResponse,
    expected_body: &str,
    ctx: &Value,
) -> Result<bool, Error>
where
    E: Evaluator,
{
    match check.kind.resolved() {
        ResponseCheckType::Custom => evaluator
            .parse_bool(&check.logic, ctx)
            .map_err(Error::Expression),
        _ => default_check(response, expected_body),
    }
}

/// evaluates the is-removed [`ResponseCheck`] (DEFAULT or CUSTOM), without
/// regard to whether the up-to-date check has run or would pass
pub fn evaluate_is_removed<E>(
    evaluator: &E,
    check: &ResponseCheck,
    response: &HttpResponse,
    ctx: &Value,
) -> Result<bool, Error>
where
    E: Evaluator,
{
    match check.kind.resolved() {
        ResponseCheckType::Custom => evaluator
            .parse_bool(&check.logic, ctx)
            .map_err(Error::Expression),
        _ => Ok(default_is_removed(response)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svc::expr::JaqEvaluator;
    use serde_json::json;

    fn response(status_code: u16, body: &str) -> HttpResponse {
        HttpResponse {
            status_code,
            body: body.to_string(),
            headers: Default::default(),
        }
    }

    #[test]
    fn is_subset_matches_nested_structural_subset() {
        let expected = json!({"a": {"b": 1}});
        let actual = json!({"a": {"b": 1, "c": 2}, "d": 3});

        assert!(is_subset(&expected, &actual));
    }

    #[test]
    fn is_subset_rejects_mismatched_value() {
        let expected = json!({"a": 1});
        let actual = json!({"a": 2});

        assert!(!is_subset(&expected, &actual));
    }

    #[test]
    fn default_check_accepts_2xx_with_matching_subset_body() {
        let res = response(200, r#"{"password": "x", "id": 1}"#);
        assert!(default_check(&res, r#"{"password": "x"}"#).unwrap());
    }

    #[test]
    fn default_check_rejects_non_2xx() {
        let res = response(500, r#"{"password": "x"}"#);
        assert!(!default_check(&res, r#"{"password": "x"}"#).unwrap());
    }

    #[test]
    fn default_check_falls_back_to_substring_for_non_json() {
        let res = response(200, "status: ready");
        assert!(default_check(&res, "ready").unwrap());
    }

    #[test]
    fn default_check_errors_when_response_is_not_json_but_desired_is() {
        let res = response(200, "not json at all");
        let err = default_check(&res, r#"{"password": "x"}"#).unwrap_err();
        assert!(matches!(err, Error::NotValidJson(ref what) if what == "response body"));
    }

    #[test]
    fn default_check_errors_when_desired_is_not_json_but_response_is() {
        let res = response(200, r#"{"password": "x"}"#);
        let err = default_check(&res, "not json at all").unwrap_err();
        assert!(matches!(err, Error::NotValidJson(ref what) if what == "update mapping"));
    }

    #[test]
    fn default_is_removed_matches_404_and_410() {
        assert!(default_is_removed(&response(404, "")));
        assert!(default_is_removed(&response(410, "")));
        assert!(!default_is_removed(&response(200, "")));
    }

    #[test]
    fn evaluate_custom_check_runs_jq_expression() {
        let evaluator = JaqEvaluator::default();
        let check = ResponseCheck {
            kind: ResponseCheckType::Custom,
            logic: ".response.statusCode == 200".to_string(),
        };
        let res = response(200, "");
        let ctx = json!({"response": {"statusCode": 200}});

        assert!(evaluate(&evaluator, &check, &res, "", &ctx).unwrap());
    }

    #[test]
    fn evaluate_is_removed_independent_of_up_to_date() {
        let evaluator = JaqEvaluator::default();
        let check = ResponseCheck::default();
        let res = response(404, "gone");

        assert!(evaluate_is_removed(&evaluator, &check, &res, &json!({})).unwrap());
    }
}
