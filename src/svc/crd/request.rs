//! # Request custom resource
//!
//! This module provides the `Request` custom resource: a declarative
//! description of a set of per-action HTTP mappings reconciled against an
//! external HTTP api, together with its reconciliation loop.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use kube::{
    api::{Api, ListParams},
    runtime::{watcher, Controller},
    CustomResource, ResourceExt,
};
use schemars::JsonSchema;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::svc::{
    capabilities::{
        Action, Cache, HttpRequestDetails, HttpResponse, Mapping, Payload,
        ProviderConfigReference, ReconciliationPolicyAware, RequestStatusWriter, ResponseCheck,
        ResponseCheckAware, SecretInjectionConfig,
    },
    crd::provider_config,
    http::client::RequestData,
    k8s::{recorder, resource, ControllerBuilder, Context},
    request_generator, response_check,
    secret_patcher::Patcher,
    status_handler,
};

// -----------------------------------------------------------------------------
// constants

pub const FINALIZER: &str = "httprequest.clever-cloud.com/request";

// -----------------------------------------------------------------------------
// static empty views, returned by reference when status is unset

const EMPTY_RESPONSE: HttpResponse = HttpResponse {
    status_code: 0,
    body: String::new(),
    headers: BTreeMap::new(),
};

const EMPTY_REQUEST_DETAILS: HttpRequestDetails = HttpRequestDetails {
    method: String::new(),
    url: String::new(),
    body: String::new(),
    headers: BTreeMap::new(),
};

const EMPTY_CACHE: Cache = Cache {
    response: HttpResponse {
        status_code: 0,
        body: String::new(),
        headers: BTreeMap::new(),
    },
    last_updated: None,
};

// -----------------------------------------------------------------------------
// Spec structure

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug)]
#[kube(group = "httprequest.clever-cloud.com")]
#[kube(version = "v1")]
#[kube(kind = "Request")]
#[kube(singular = "request")]
#[kube(plural = "requests")]
#[kube(shortname = "req")]
#[kube(status = "Status")]
#[kube(namespaced)]
#[kube(apiextensions = "v1")]
#[kube(derive = "PartialEq")]
pub struct Spec {
    #[serde(rename = "payload")]
    pub payload: Payload,
    #[serde(rename = "mappings")]
    pub mappings: Vec<Mapping>,
    #[serde(rename = "headers", default)]
    pub headers: BTreeMap<String, Vec<String>>,
    #[serde(rename = "waitTimeoutSeconds", default, skip_serializing_if = "Option::is_none")]
    pub wait_timeout_seconds: Option<u64>,
    #[serde(rename = "insecureSkipTLSVerify", default)]
    pub insecure_skip_tls_verify: bool,
    #[serde(rename = "secretInjectionConfigs", default)]
    pub secret_injection_configs: Vec<SecretInjectionConfig>,
    #[serde(rename = "expectedResponseCheck", default)]
    pub expected_response_check: ResponseCheck,
    #[serde(rename = "isRemovedCheck", default)]
    pub is_removed_check: ResponseCheck,
    #[serde(rename = "providerConfigRef", default)]
    pub provider_config_ref: ProviderConfigReference,
}

// -----------------------------------------------------------------------------
// Status structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct Status {
    #[serde(rename = "response", default)]
    pub response: HttpResponse,
    #[serde(rename = "requestDetails", default)]
    pub request_details: HttpRequestDetails,
    #[serde(rename = "failed", default)]
    pub failed: u32,
    #[serde(rename = "error", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "cache", default)]
    pub cache: Cache,
}

// -----------------------------------------------------------------------------
// capability implementations

impl crate::svc::capabilities::MappedHttpRequestSpec for Request {
    fn mappings(&self) -> &[Mapping] {
        &self.spec.mappings
    }

    fn payload(&self) -> &Payload {
        &self.spec.payload
    }

    fn default_headers(&self) -> &BTreeMap<String, Vec<String>> {
        &self.spec.headers
    }

    fn wait_timeout(&self) -> Option<Duration> {
        self.spec.wait_timeout_seconds.map(Duration::from_secs)
    }

    fn insecure_skip_tls_verify(&self) -> bool {
        self.spec.insecure_skip_tls_verify
    }
}

impl ResponseCheckAware for Request {
    fn expected_response_check(&self) -> &ResponseCheck {
        &self.spec.expected_response_check
    }

    fn is_removed_check(&self) -> &ResponseCheck {
        &self.spec.is_removed_check
    }
}

impl ReconciliationPolicyAware for Request {
    fn secret_injection_configs(&self) -> &[SecretInjectionConfig] {
        &self.spec.secret_injection_configs
    }

    fn provider_config_ref(&self) -> &ProviderConfigReference {
        &self.spec.provider_config_ref
    }
}

impl crate::svc::capabilities::CachedResponse for Request {
    fn cache(&self) -> &Cache {
        self.status.as_ref().map(|s| &s.cache).unwrap_or(&EMPTY_CACHE)
    }

    fn set_cache(&mut self, cache: Cache) {
        self.status.get_or_insert_with(Status::default).cache = cache;
    }
}

impl RequestStatusWriter for Request {
    fn response(&self) -> &HttpResponse {
        self.status.as_ref().map(|s| &s.response).unwrap_or(&EMPTY_RESPONSE)
    }

    fn set_response(&mut self, response: HttpResponse) {
        self.status.get_or_insert_with(Status::default).response = response;
    }

    fn request_details(&self) -> &HttpRequestDetails {
        self.status
            .as_ref()
            .map(|s| &s.request_details)
            .unwrap_or(&EMPTY_REQUEST_DETAILS)
    }

    fn set_request_details(&mut self, details: HttpRequestDetails) {
        self.status.get_or_insert_with(Status::default).request_details = details;
    }

    fn failed(&self) -> u32 {
        self.status.as_ref().map(|s| s.failed).unwrap_or(0)
    }

    fn set_failed(&mut self, failed: u32) {
        self.status.get_or_insert_with(Status::default).failed = failed;
    }

    fn set_error(&mut self, error: Option<String>) {
        self.status.get_or_insert_with(Status::default).error = error;
    }
}

/// invariant 1 + the POST-failure special case: a resource whose last
/// attempt never ran, or whose last attempt was a failed creation, is
/// considered never created regardless of what observe would otherwise see
pub fn previously_created(request_details: &HttpRequestDetails, response: &HttpResponse) -> bool {
    if response.status_code == 0 && request_details.method.is_empty() {
        return false;
    }

    if request_details.method == "POST" && response.status_code >= 400 {
        return false;
    }

    true
}

// -----------------------------------------------------------------------------
// ReconcilerError enum

#[derive(thiserror::Error, Debug)]
pub enum ReconcilerError {
    #[error("failed to compute diff between the original and modified object, {0}")]
    Diff(serde_json::Error),
    #[error("kubernetes api error, {0}")]
    Kube(#[from] kube::Error),
    #[error("failed to generate request, {0}")]
    Generator(#[from] request_generator::Error),
    #[error("failed to patch secrets, {0}")]
    Patcher(#[from] crate::svc::secret_patcher::Error),
    #[error("failed to send http request, {0}")]
    Client(#[from] crate::svc::http::client::Error),
    #[error("failed to evaluate response check, {0}")]
    Check(#[from] response_check::Error),
    #[error("failed to apply status, {0}")]
    Status(#[from] status_handler::Error),
    #[error("failed to resolve provider config, {0}")]
    ProviderConfig(#[from] provider_config::Error),
}

impl From<kube::runtime::controller::Error<Self, watcher::Error>> for ReconcilerError {
    fn from(err: kube::runtime::controller::Error<Self, watcher::Error>) -> Self {
        Self::Kube(kube::Error::Service(Box::new(err)))
    }
}

// -----------------------------------------------------------------------------
// Reconciler structure

#[derive(Clone, Default, Debug)]
pub struct Reconciler {}

impl ControllerBuilder<Request> for Reconciler {
    fn build(&self, context: Arc<Context>) -> Controller<Request> {
        Controller::new(Api::all(context.kube.to_owned()), ListParams::default())
    }
}

impl Reconciler {
    /// sends the mapping for `action`, patching secrets into the materialized
    /// request, and returns the request/response details alongside the raw
    /// http response
    async fn send(
        context: &Context,
        obj: &Request,
        action: Action,
        bearer_token: Option<SecretString>,
    ) -> Result<Option<(HttpRequestDetails, HttpResponse)>, ReconcilerError> {
        use crate::svc::capabilities::{CachedResponse, MappedHttpRequestSpec};

        let materialized = match request_generator::resolve(
            &context.evaluator,
            obj.mappings(),
            action,
            obj.default_headers(),
            obj.payload(),
            obj.response(),
            obj.cache(),
        ) {
            Ok(materialized) => materialized,
            Err(request_generator::Error::MappingNotFound(_)) => {
                warn!(action = ?action, "no mapping configured for action, skipping");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let patcher = Patcher::new(&context.secrets);
        let url = patcher.patch_into_string(&materialized.url).await?;
        let body_decrypted = patcher.patch_into_string(&materialized.body).await?;
        let headers_decrypted = patcher.patch_into_headers(&materialized.headers).await?;

        let data = RequestData {
            method: materialized.method,
            url: url.expose_secret().to_owned(),
            body_encrypted: materialized.body,
            body_decrypted,
            headers_encrypted: materialized.headers,
            headers_decrypted,
            skip_tls_verify: obj.insecure_skip_tls_verify()
                || context.config.http_client.default_insecure_skip_tls_verify,
            wait_timeout: Some(
                obj.wait_timeout()
                    .unwrap_or_else(|| context.config.http_client.default_wait_timeout()),
            ),
        };

        let client = crate::svc::http::client::Client::with_bearer_token(bearer_token);
        let (details, response) = client.send(&data).await?;
        Ok(Some((details, response)))
    }
}

#[async_trait]
impl crate::svc::k8s::Reconciler<Request> for Reconciler {
    type Error = ReconcilerError;

    async fn upsert(context: Arc<Context>, origin: Arc<Request>) -> Result<(), ReconcilerError> {
        let (namespace, name) = resource::namespaced_name(&*origin);

        // ---------------------------------------------------------------------
        // Step 1: set finalizer

        let modified = crate::svc::k8s::finalizer::add((*origin).to_owned(), FINALIZER);
        let patch = resource::diff(&*origin, &modified).map_err(ReconcilerError::Diff)?;
        let modified = resource::patch(context.kube.to_owned(), &modified, patch).await?;

        if !crate::svc::k8s::finalizer::contains(&*origin, FINALIZER) {
            recorder::normal(
                context.kube.to_owned(),
                &modified,
                &"UpsertFinalizer",
                &format!("attach finalizer '{}'", FINALIZER),
            )
            .await?;
        }

        // ---------------------------------------------------------------------
        // Step 2: resolve the provider config, failing fast if it cannot be
        // found, before any http call, mapping generation or secret read

        let credentials = provider_config::resolve(
            &context.kube,
            &modified.spec.provider_config_ref,
            &namespace,
        )
        .await?;
        let bearer_token = provider_config::bearer_token(&credentials, &context.secrets).await?;

        // ---------------------------------------------------------------------
        // Step 3: decide whether the remote resource exists

        let status = modified.status.clone().unwrap_or_default();
        let existed = previously_created(&status.request_details, &status.response);

        let observed = if existed {
            Self::send(&context, &modified, Action::Observe, bearer_token.clone()).await?
        } else {
            None
        };

        let is_removed = match &observed {
            Some((_, response)) => {
                let ctx_value =
                    request_generator::build_context(&modified.spec.payload, response);
                response_check::evaluate_is_removed(
                    &context.evaluator,
                    &modified.spec.is_removed_check,
                    response,
                    &ctx_value,
                )?
            }
            None => true,
        };

        let action = if is_removed {
            Action::Create
        } else {
            let (_, response) = observed.as_ref().expect("observed response when not removed");
            let ctx_value = request_generator::build_context(&modified.spec.payload, response);

            let expected_body = match request_generator::find_mapping(&modified.spec.mappings, Action::Update) {
                Some(mapping) => request_generator::materialize_with_cache_fallback(
                    &context.evaluator,
                    mapping,
                    &modified.spec.headers,
                    &modified.spec.payload,
                    response,
                    &status.cache,
                )
                .map(|materialized| materialized.body)
                .unwrap_or_default(),
                None => String::new(),
            };

            let up_to_date = response_check::evaluate(
                &context.evaluator,
                &modified.spec.expected_response_check,
                response,
                &expected_body,
                &ctx_value,
            )?;

            if up_to_date {
                info!(%namespace, %name, "resource is up to date");
                return Ok(());
            }

            Action::Update
        };

        // ---------------------------------------------------------------------
        // Step 4: issue the create/update call and persist the outcome

        let result = Self::send(&context, &modified, action, bearer_token).await;

        let mut setters: Vec<status_handler::Setter<Request>> = Vec::new();
        match result {
            Ok(Some((details, response))) => {
                let observed_at = Utc::now();
                setters.push(status_handler::set_response_and_request(
                    response.clone(),
                    details,
                ));

                if (200..300).contains(&response.status_code) {
                    setters.push(status_handler::set_failed(0));
                    setters.push(status_handler::set_error(None));

                    // invariant 3: only refresh the cache when every mapping
                    // fully materializes against this response, no null left
                    let cache_ctx = request_generator::build_context(&modified.spec.payload, &response);
                    if request_generator::all_mappings_materialize(
                        &context.evaluator,
                        &modified.spec.mappings,
                        &modified.spec.headers,
                        &cache_ctx,
                    ) {
                        setters.push(status_handler::set_cache_if_newer(response.clone(), observed_at));
                    }

                    let secret_ctx = serde_json::to_value(&response).unwrap_or(serde_json::Value::Null);
                    let owner = resource::OwnerInfo::from_resource(&modified);
                    let patcher = Patcher::new(&context.secrets);
                    patcher
                        .apply_response_to_secrets(
                            &context.evaluator,
                            &secret_ctx,
                            &modified.spec.secret_injection_configs,
                            Some(&owner),
                            false,
                        )
                        .await?;
                } else {
                    warn!(
                        %namespace,
                        %name,
                        status_code = response.status_code,
                        "http call succeeded with a non-2xx status"
                    );
                    setters.push(status_handler::set_failed(modified.failed() + 1));
                    setters.push(status_handler::set_error(None));
                }

                let modified = status_handler::apply(context.kube.to_owned(), &modified, setters).await?;
                recorder::normal(
                    context.kube.to_owned(),
                    &modified,
                    &format!("{:?}", action),
                    "reconciled external resource",
                )
                .await?;
            }
            Ok(None) => {
                // no mapping configured for this action: nothing to persist
            }
            Err(err) => {
                setters.push(status_handler::set_failed(modified.failed() + 1));
                setters.push(status_handler::set_error(Some(err.to_string())));
                let modified = status_handler::apply(context.kube.to_owned(), &modified, setters).await?;
                recorder::warning(
                    context.kube.to_owned(),
                    &modified,
                    &format!("{:?}", action),
                    &err.to_string(),
                )
                .await?;

                return Err(err);
            }
        }

        Ok(())
    }

    async fn delete(context: Arc<Context>, origin: Arc<Request>) -> Result<(), ReconcilerError> {
        let modified = (*origin).to_owned();
        let (namespace, _) = resource::namespaced_name(&modified);

        let bearer_token =
            match provider_config::resolve(&context.kube, &modified.spec.provider_config_ref, &namespace).await {
                Ok(credentials) => provider_config::bearer_token(&credentials, &context.secrets)
                    .await
                    .unwrap_or(None),
                Err(err) => {
                    warn!(error = %err, "failed to resolve provider config, skipping removal request");
                    None
                }
            };

        match Self::send(&context, &modified, Action::Remove, bearer_token).await {
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "failed to issue removal request, removing finalizer anyway");
            }
        }

        let modified = crate::svc::k8s::finalizer::remove(modified, FINALIZER);
        let patch = resource::diff(&*origin, &modified).map_err(ReconcilerError::Diff)?;
        let modified = resource::patch(context.kube.to_owned(), &modified, patch).await?;

        recorder::normal(
            context.kube.to_owned(),
            &modified,
            &"DeleteFinalizer",
            &format!("removed finalizer '{}'", FINALIZER),
        )
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn previously_created_is_false_for_an_empty_status() {
        assert!(!previously_created(&EMPTY_REQUEST_DETAILS, &EMPTY_RESPONSE));
    }

    #[test]
    fn previously_created_is_false_for_a_failed_post() {
        let details = HttpRequestDetails {
            method: "POST".to_string(),
            ..Default::default()
        };
        let response = HttpResponse {
            status_code: 400,
            ..Default::default()
        };

        assert!(!previously_created(&details, &response));
    }

    #[test]
    fn previously_created_is_true_for_a_successful_get() {
        let details = HttpRequestDetails {
            method: "GET".to_string(),
            ..Default::default()
        };
        let response = HttpResponse {
            status_code: 200,
            ..Default::default()
        };

        assert!(previously_created(&details, &response));
    }
}
