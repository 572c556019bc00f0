//! # Capabilities module
//!
//! This module provides the small trait set the reconciliation engine is
//! written against instead of against the concrete `Request` /
//! `DisposableRequest` custom resources directly. Two parallel families of
//! kinds are expected to exist eventually (namespaced and cluster-scoped);
//! routing the engine through these capabilities means a future cluster
//! scoped pair only needs trait impls, not a second engine.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------------
// Method / Action enumerations

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug)]
pub enum Method {
    #[serde(rename = "GET")]
    Get,
    #[serde(rename = "POST")]
    Post,
    #[serde(rename = "PUT")]
    Put,
    #[serde(rename = "DELETE")]
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug)]
pub enum Action {
    #[serde(rename = "CREATE")]
    Create,
    #[serde(rename = "OBSERVE")]
    Observe,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "REMOVE")]
    Remove,
}

impl Action {
    /// returns the http method this action defaults to when a mapping
    /// matches on `action` but leaves `method` unset
    pub fn default_method(&self) -> Method {
        match self {
            Self::Create => Method::Post,
            Self::Observe => Method::Get,
            Self::Update => Method::Put,
            Self::Remove => Method::Delete,
        }
    }
}

// -----------------------------------------------------------------------------
// Mapping structure

/// a template that specifies how to issue one http call for one action
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct Mapping {
    #[serde(rename = "method", skip_serializing_if = "Option::is_none")]
    pub method: Option<Method>,
    #[serde(rename = "action", skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    #[serde(rename = "url")]
    pub url: String,
    #[serde(rename = "body", default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(rename = "headers", default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, Vec<String>>>,
}

// -----------------------------------------------------------------------------
// Payload structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Payload {
    #[serde(rename = "baseUrl", default)]
    pub base_url: String,
    #[serde(rename = "body", default)]
    pub body: String,
}

// -----------------------------------------------------------------------------
// SecretReference / SecretInjectionConfig structures

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct SecretReference {
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "namespace")]
    pub namespace: String,
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct SecretInjectionConfig {
    #[serde(rename = "secretRef")]
    pub secret_ref: SecretReference,
    #[serde(rename = "secretKey")]
    pub secret_key: String,
    #[serde(rename = "responsePath")]
    pub response_path: String,
    #[serde(rename = "setOwnerReference", default)]
    pub set_owner_reference: bool,
}

// -----------------------------------------------------------------------------
// ResponseCheck structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug, Default)]
pub enum ResponseCheckType {
    #[default]
    #[serde(rename = "")]
    Unset,
    #[serde(rename = "DEFAULT")]
    Default,
    #[serde(rename = "CUSTOM")]
    Custom,
}

impl ResponseCheckType {
    /// an empty type is treated as `DEFAULT`
    pub fn resolved(&self) -> Self {
        match self {
            Self::Unset => Self::Default,
            other => *other,
        }
    }
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct ResponseCheck {
    #[serde(rename = "type", default)]
    pub kind: ResponseCheckType,
    #[serde(rename = "logic", default)]
    pub logic: String,
}

// -----------------------------------------------------------------------------
// ProviderConfigReference structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub enum ProviderConfigKind {
    ProviderConfig,
    ClusterProviderConfig,
}

impl Default for ProviderConfigKind {
    fn default() -> Self {
        Self::ClusterProviderConfig
    }
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct ProviderConfigReference {
    #[serde(rename = "name", default = "default_provider_config_name")]
    pub name: String,
    #[serde(rename = "kind", default)]
    pub kind: ProviderConfigKind,
}

fn default_provider_config_name() -> String {
    "default".to_string()
}

impl Default for ProviderConfigReference {
    fn default() -> Self {
        Self {
            name: default_provider_config_name(),
            kind: ProviderConfigKind::default(),
        }
    }
}

// -----------------------------------------------------------------------------
// HttpResponse / HttpRequestDetails structures

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct HttpResponse {
    #[serde(rename = "statusCode", default)]
    pub status_code: u16,
    #[serde(rename = "body", default)]
    pub body: String,
    #[serde(rename = "headers", default)]
    pub headers: BTreeMap<String, Vec<String>>,
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct HttpRequestDetails {
    #[serde(rename = "method", default)]
    pub method: String,
    #[serde(rename = "url", default)]
    pub url: String,
    #[serde(rename = "body", default)]
    pub body: String,
    #[serde(rename = "headers", default)]
    pub headers: BTreeMap<String, Vec<String>>,
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Cache {
    #[serde(rename = "response", default)]
    pub response: HttpResponse,
    #[serde(rename = "lastUpdated", skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

// -----------------------------------------------------------------------------
// Capability traits

/// a resource whose desired state is a sequence of per-action http mappings,
/// a shared payload and shared default headers (`Request`)
pub trait MappedHttpRequestSpec {
    fn mappings(&self) -> &[Mapping];
    fn payload(&self) -> &Payload;
    fn default_headers(&self) -> &BTreeMap<String, Vec<String>>;
    fn wait_timeout(&self) -> Option<std::time::Duration>;
    fn insecure_skip_tls_verify(&self) -> bool;
}

/// a resource whose desired state is a single http call (`DisposableRequest`)
pub trait SimpleHttpRequestSpec {
    fn method(&self) -> Method;
    fn url(&self) -> &str;
    fn body(&self) -> &str;
    fn headers(&self) -> &BTreeMap<String, Vec<String>>;
    fn wait_timeout(&self) -> Option<std::time::Duration>;
    fn insecure_skip_tls_verify(&self) -> bool;
}

/// a resource that may configure a pluggable up-to-date / is-removed check
pub trait ResponseCheckAware {
    fn expected_response_check(&self) -> &ResponseCheck;
    fn is_removed_check(&self) -> &ResponseCheck;
}

/// a resource that carries secret injection configuration and a provider
/// config reference
pub trait ReconciliationPolicyAware {
    fn secret_injection_configs(&self) -> &[SecretInjectionConfig];
    fn provider_config_ref(&self) -> &ProviderConfigReference;
}

/// a `DisposableRequest`-style resource governed by rollback/infinite-loop
/// policy
pub trait RollbackAware {
    fn should_loop_infinitely(&self) -> bool;
    fn rollback_retries_limit(&self) -> Option<u32>;
    fn next_reconcile(&self) -> Option<chrono::Duration>;
}

/// a resource whose status caches the last response that fully materialized
pub trait CachedResponse {
    fn cache(&self) -> &Cache;
    fn set_cache(&mut self, cache: Cache);
}

/// status mutators shared by `Request`
pub trait RequestStatusWriter {
    fn response(&self) -> &HttpResponse;
    fn set_response(&mut self, response: HttpResponse);
    fn request_details(&self) -> &HttpRequestDetails;
    fn set_request_details(&mut self, details: HttpRequestDetails);
    fn failed(&self) -> u32;
    fn set_failed(&mut self, failed: u32);
    fn set_error(&mut self, error: Option<String>);
}

/// status mutators shared by `DisposableRequest`
pub trait DisposableRequestStatusWriter: RequestStatusWriter {
    fn synced(&self) -> bool;
    fn set_synced(&mut self, synced: bool);
    fn last_reconcile_time(&self) -> Option<DateTime<Utc>>;
    fn set_last_reconcile_time(&mut self, at: DateTime<Utc>);
}
