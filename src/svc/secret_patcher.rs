//! # Secret patcher module
//!
//! This module scans materialized strings for secret placeholders and
//! substitutes them with values read from the secret store, while leaving an
//! unsubstituted (encrypted) view intact for persistence.
//!
//! Placeholder grammar: `{{ namespace:name:key }}`. Whitespace around the
//! three segments is ignored. This is parsed once per string by
//! [`find_placeholders`] rather than patched with ad-hoc string replaces.

use std::collections::BTreeMap;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use thiserror::Error;

use crate::svc::{
    capabilities::SecretInjectionConfig,
    expr::{self, Evaluator},
    k8s::resource::OwnerInfo,
};

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to read secret '{1}/{0}', {2}")]
    SecretNotFound(String, String, String),
    #[error("secret '{1}/{0}' has no key '{2}'")]
    SecretKeyNotFound(String, String, String),
    #[error("failed to write secret '{1}/{0}', {2}")]
    SecretWriteDenied(String, String, String),
    #[error("failed to evaluate response path, {0}")]
    Expression(expr::Error),
}

impl From<expr::Error> for Error {
    fn from(err: expr::Error) -> Self {
        Self::Expression(err)
    }
}

// -----------------------------------------------------------------------------
// SecretStore trait

/// the external secret store collaborator: key-value retrieval/write for
/// credential extraction and response-value injection
#[async_trait]
pub trait SecretStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn get(&self, name: &str, namespace: &str) -> Result<BTreeMap<String, String>, Self::Error>;

    async fn put(
        &self,
        name: &str,
        namespace: &str,
        key: &str,
        value: &str,
        owner: Option<&OwnerInfo>,
    ) -> Result<(), Self::Error>;
}

// -----------------------------------------------------------------------------
// Placeholder structure

#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Placeholder {
    pub raw: String,
    pub namespace: String,
    pub name: String,
    pub key: String,
}

/// scans `s` for `{{ namespace:name:key }}` placeholders
pub fn find_placeholders(s: &str) -> Vec<Placeholder> {
    let mut placeholders = Vec::new();
    let mut rest = s;

    while let Some(start) = rest.find("{{") {
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            break;
        };

        let inner = after_open[..end].trim();
        let raw = format!("{{{{{}}}}}", &after_open[..end]);
        let segments: Vec<&str> = inner.splitn(3, ':').map(str::trim).collect();

        if let [namespace, name, key] = segments[..] {
            if !namespace.is_empty() && !name.is_empty() && !key.is_empty() {
                placeholders.push(Placeholder {
                    raw,
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    key: key.to_string(),
                });
            }
        }

        rest = &after_open[end + 2..];
    }

    placeholders
}

// -----------------------------------------------------------------------------
// Patcher structure

pub struct Patcher<'a, S> {
    store: &'a S,
}

impl<'a, S> Patcher<'a, S>
where
    S: SecretStore,
{
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// substitutes every placeholder in `s` with the secret value it
    /// references, producing the decrypted view. `s` itself (unmodified) is
    /// the encrypted view.
    pub async fn patch_into_string(&self, s: &str) -> Result<SecretString, Error> {
        let mut patched = s.to_string();

        for placeholder in find_placeholders(s) {
            let values = self
                .store
                .get(&placeholder.name, &placeholder.namespace)
                .await
                .map_err(|err| {
                    Error::SecretNotFound(
                        placeholder.name.to_owned(),
                        placeholder.namespace.to_owned(),
                        err.to_string(),
                    )
                })?;

            let value = values.get(&placeholder.key).ok_or_else(|| {
                Error::SecretKeyNotFound(
                    placeholder.name.to_owned(),
                    placeholder.namespace.to_owned(),
                    placeholder.key.to_owned(),
                )
            })?;

            patched = patched.replace(&placeholder.raw, value);
        }

        Ok(SecretString::new(patched))
    }

    /// applies [`Patcher::patch_into_string`] to every value of an ordered
    /// header map, leaving keys untouched
    pub async fn patch_into_headers(
        &self,
        headers: &BTreeMap<String, Vec<String>>,
    ) -> Result<BTreeMap<String, Vec<String>>, Error> {
        let mut patched = BTreeMap::new();

        for (key, values) in headers {
            let mut patched_values = Vec::with_capacity(values.len());
            for value in values {
                patched_values.push(self.patch_into_string(value).await?.expose_secret().to_owned());
            }
            patched.insert(key.to_owned(), patched_values);
        }

        Ok(patched)
    }

    /// recurses into a merged template context, patching string leaves only
    pub async fn patch_into_map(&self, value: &Value) -> Result<Value, Error> {
        match value {
            Value::String(s) => Ok(Value::String(
                self.patch_into_string(s).await?.expose_secret().to_owned(),
            )),
            Value::Object(map) => {
                let mut patched = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    patched.insert(k.to_owned(), Box::pin(self.patch_into_map(v)).await?);
                }
                Ok(Value::Object(patched))
            }
            Value::Array(items) => {
                let mut patched = Vec::with_capacity(items.len());
                for item in items {
                    patched.push(Box::pin(self.patch_into_map(item)).await?);
                }
                Ok(Value::Array(patched))
            }
            other => Ok(other.to_owned()),
        }
    }

    /// evaluates each `responsePath` jq expression over `response` and
    /// writes the resulting scalar into the configured secret
    pub async fn apply_response_to_secrets<E>(
        &self,
        evaluator: &E,
        response: &Value,
        configs: &[SecretInjectionConfig],
        owner: Option<&OwnerInfo>,
        deleting: bool,
    ) -> Result<(), Error>
    where
        E: Evaluator,
    {
        if deleting {
            // skip entirely to avoid dangling owner references across namespaces
            return Ok(());
        }

        for config in configs {
            let value = evaluator.parse_string(&config.response_path, response)?;

            let reference_owner = if config.set_owner_reference {
                owner.filter(|owner| owner.namespace == config.secret_ref.namespace)
            } else {
                None
            };

            self.store
                .put(
                    &config.secret_ref.name,
                    &config.secret_ref.namespace,
                    &config.secret_key,
                    &value,
                    reference_owner,
                )
                .await
                .map_err(|err| {
                    Error::SecretWriteDenied(
                        config.secret_ref.name.to_owned(),
                        config.secret_ref.namespace.to_owned(),
                        err.to_string(),
                    )
                })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_placeholders_parses_well_formed_references() {
        let placeholders = find_placeholders("Bearer {{ ns : name : token }} and {{ a:b:c }}");

        assert_eq!(placeholders.len(), 2);
        assert_eq!(placeholders[0].namespace, "ns");
        assert_eq!(placeholders[0].name, "name");
        assert_eq!(placeholders[0].key, "token");
        assert_eq!(placeholders[1].raw, "{{ a:b:c }}");
    }

    #[test]
    fn find_placeholders_ignores_malformed_braces() {
        let placeholders = find_placeholders("no closing brace {{ a:b:c");

        assert!(placeholders.is_empty());
    }

    #[test]
    fn find_placeholders_returns_empty_for_plain_strings() {
        assert!(find_placeholders("nothing to patch here").is_empty());
    }
}
