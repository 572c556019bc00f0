//! # DisposableRequest custom resource
//!
//! This module provides the `DisposableRequest` custom resource: a single
//! http call issued against an external api, retried under a rollback-limit
//! or infinite-loop policy until its response matches `expectedResponse`,
//! together with its reconciliation loop.

use std::{collections::BTreeMap, sync::Arc, time::Duration as StdDuration};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use kube::{
    api::{Api, ListParams},
    runtime::{
        controller::{self, Action},
        watcher, Controller,
    },
    CustomResource, ResourceExt,
};
use schemars::JsonSchema;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::svc::{
    capabilities::{
        HttpRequestDetails, HttpResponse, Method, ProviderConfigReference,
        ReconciliationPolicyAware, RequestStatusWriter, RollbackAware, SecretInjectionConfig,
        DisposableRequestStatusWriter,
    },
    crd::provider_config,
    disposable_engine::{self, Outcome},
    expr::Evaluator,
    http::client::RequestData,
    k8s::{recorder, resource, ControllerBuilder, Context},
    secret_patcher::Patcher,
    status_handler,
};

// -----------------------------------------------------------------------------
// constants

pub const FINALIZER: &str = "httprequest.clever-cloud.com/disposable-request";

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

// -----------------------------------------------------------------------------
// Spec structure

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug)]
#[kube(group = "httprequest.clever-cloud.com")]
#[kube(version = "v1")]
#[kube(kind = "DisposableRequest")]
#[kube(singular = "disposablerequest")]
#[kube(plural = "disposablerequests")]
#[kube(shortname = "dreq")]
#[kube(status = "Status")]
#[kube(namespaced)]
#[kube(apiextensions = "v1")]
#[kube(derive = "PartialEq")]
pub struct Spec {
    #[serde(rename = "url")]
    pub url: String,
    #[serde(rename = "method")]
    pub method: Method,
    #[serde(rename = "body", default)]
    pub body: String,
    #[serde(rename = "headers", default)]
    pub headers: BTreeMap<String, Vec<String>>,
    #[serde(rename = "waitTimeoutSeconds", default, skip_serializing_if = "Option::is_none")]
    pub wait_timeout_seconds: Option<u64>,
    #[serde(rename = "insecureSkipTLSVerify", default)]
    pub insecure_skip_tls_verify: bool,
    #[serde(rename = "expectedResponse")]
    pub expected_response: String,
    #[serde(rename = "nextReconcileSeconds", default, skip_serializing_if = "Option::is_none")]
    pub next_reconcile_seconds: Option<i64>,
    #[serde(rename = "shouldLoopInfinitely", default)]
    pub should_loop_infinitely: bool,
    #[serde(rename = "rollbackRetriesLimit", default, skip_serializing_if = "Option::is_none")]
    pub rollback_retries_limit: Option<u32>,
    #[serde(rename = "secretInjectionConfigs", default)]
    pub secret_injection_configs: Vec<SecretInjectionConfig>,
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
    #[serde(rename = "synced", default)]
    pub synced: bool,
    #[serde(rename = "lastReconcileTime", default, skip_serializing_if = "Option::is_none")]
    pub last_reconcile_time: Option<DateTime<Utc>>,
}

// -----------------------------------------------------------------------------
// capability implementations

impl crate::svc::capabilities::SimpleHttpRequestSpec for DisposableRequest {
    fn method(&self) -> Method {
        self.spec.method
    }

    fn url(&self) -> &str {
        &self.spec.url
    }

    fn body(&self) -> &str {
        &self.spec.body
    }

    fn headers(&self) -> &BTreeMap<String, Vec<String>> {
        &self.spec.headers
    }

    fn wait_timeout(&self) -> Option<StdDuration> {
        self.spec.wait_timeout_seconds.map(StdDuration::from_secs)
    }

    fn insecure_skip_tls_verify(&self) -> bool {
        self.spec.insecure_skip_tls_verify
    }
}

impl ReconciliationPolicyAware for DisposableRequest {
    fn secret_injection_configs(&self) -> &[SecretInjectionConfig] {
        &self.spec.secret_injection_configs
    }

    fn provider_config_ref(&self) -> &ProviderConfigReference {
        &self.spec.provider_config_ref
    }
}

impl RollbackAware for DisposableRequest {
    fn should_loop_infinitely(&self) -> bool {
        self.spec.should_loop_infinitely
    }

    fn rollback_retries_limit(&self) -> Option<u32> {
        self.spec.rollback_retries_limit
    }

    fn next_reconcile(&self) -> Option<Duration> {
        self.spec.next_reconcile_seconds.map(Duration::seconds)
    }
}

impl RequestStatusWriter for DisposableRequest {
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

impl DisposableRequestStatusWriter for DisposableRequest {
    fn synced(&self) -> bool {
        self.status.as_ref().map(|s| s.synced).unwrap_or(false)
    }

    fn set_synced(&mut self, synced: bool) {
        self.status.get_or_insert_with(Status::default).synced = synced;
    }

    fn last_reconcile_time(&self) -> Option<DateTime<Utc>> {
        self.status.as_ref().and_then(|s| s.last_reconcile_time)
    }

    fn set_last_reconcile_time(&mut self, at: DateTime<Utc>) {
        self.status.get_or_insert_with(Status::default).last_reconcile_time = Some(at);
    }
}

// -----------------------------------------------------------------------------
// ReconcilerError enum

#[derive(thiserror::Error, Debug)]
pub enum ReconcilerError {
    #[error("failed to compute diff between the original and modified object, {0}")]
    Diff(serde_json::Error),
    #[error("kubernetes api error, {0}")]
    Kube(#[from] kube::Error),
    #[error("failed to patch secrets, {0}")]
    Patcher(#[from] crate::svc::secret_patcher::Error),
    #[error("failed to send http request, {0}")]
    Client(#[from] crate::svc::http::client::Error),
    #[error("failed to evaluate expected response expression, {0}")]
    Expression(#[from] crate::svc::expr::Error),
    #[error("failed to apply status, {0}")]
    Status(#[from] status_handler::Error),
    #[error("external api responded with status code {0}, response does not satisfy the expected criteria")]
    ResponseDoesNotMatch(u16),
    #[error("external api responded with http status code {0}")]
    HttpStatus(u16),
    #[error("rollback retries limit exceeded, giving up")]
    RolledBack,
    #[error("failed to resolve provider config, {0}")]
    ProviderConfig(#[from] provider_config::Error),
}

impl From<controller::Error<Self, watcher::Error>> for ReconcilerError {
    fn from(err: controller::Error<Self, watcher::Error>) -> Self {
        Self::Kube(kube::Error::Service(Box::new(err)))
    }
}

// -----------------------------------------------------------------------------
// Reconciler structure

#[derive(Clone, Default, Debug)]
pub struct Reconciler {}

impl ControllerBuilder<DisposableRequest> for Reconciler {
    fn build(&self, context: Arc<Context>) -> Controller<DisposableRequest> {
        Controller::new(Api::all(context.kube.to_owned()), ListParams::default())
    }
}

impl Reconciler {
    /// patches secrets into the spec's url/body/headers and issues the call
    async fn send(
        context: &Context,
        obj: &DisposableRequest,
        bearer_token: Option<SecretString>,
    ) -> Result<(HttpRequestDetails, HttpResponse), ReconcilerError> {
        let patcher = Patcher::new(&context.secrets);
        let url = patcher.patch_into_string(&obj.spec.url).await?;
        let body_decrypted = patcher.patch_into_string(&obj.spec.body).await?;
        let headers_decrypted = patcher.patch_into_headers(&obj.spec.headers).await?;

        let data = RequestData {
            method: obj.spec.method,
            url: url.expose_secret().to_owned(),
            body_encrypted: obj.spec.body.to_owned(),
            body_decrypted,
            headers_encrypted: obj.spec.headers.to_owned(),
            headers_decrypted,
            skip_tls_verify: obj.spec.insecure_skip_tls_verify
                || context.config.http_client.default_insecure_skip_tls_verify,
            wait_timeout: Some(
                obj.spec
                    .wait_timeout_seconds
                    .map(StdDuration::from_secs)
                    .unwrap_or_else(|| context.config.http_client.default_wait_timeout()),
            ),
        };

        let client = crate::svc::http::client::Client::with_bearer_token(bearer_token);
        Ok(client.send(&data).await?)
    }

    async fn upsert_impl(
        context: Arc<Context>,
        origin: Arc<DisposableRequest>,
    ) -> Result<Action, ReconcilerError> {
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
        // Step 3: decide what this cycle does

        let default_next_reconcile = context.config.http_client.default_next_reconcile();
        let now = Utc::now();

        let outcome = disposable_engine::decide(
            &modified,
            modified.synced(),
            modified.failed(),
            modified.last_reconcile_time(),
            now,
            default_next_reconcile,
        );

        let requeue_after = disposable_engine::requeue_after(&outcome, default_next_reconcile)
            .to_std()
            .unwrap_or_else(|_| StdDuration::from_secs(30));

        match outcome {
            Outcome::Idle => Ok(Action::await_change()),
            Outcome::Wait(_) => Ok(Action::requeue(requeue_after)),
            Outcome::RolledBack => {
                let message = ReconcilerError::RolledBack.to_string();
                let setters: Vec<status_handler::Setter<DisposableRequest>> =
                    vec![status_handler::set_error(Some(message.clone()))];
                let modified = status_handler::apply(context.kube.to_owned(), &modified, setters).await?;
                recorder::warning(context.kube.to_owned(), &modified, &"RolledBack", &message).await?;

                Ok(Action::await_change())
            }
            Outcome::Send => {
                let mut setters: Vec<status_handler::Setter<DisposableRequest>> =
                    vec![status_handler::set_last_reconcile_time(now)];

                let result = Self::send(&context, &modified, bearer_token).await;
                let outcome_error = match result {
                    Ok((details, response)) => {
                        setters.push(status_handler::set_response_and_request(
                            response.clone(),
                            details,
                        ));

                        if !(200..300).contains(&response.status_code) {
                            warn!(
                                %namespace,
                                %name,
                                status_code = response.status_code,
                                "http call returned an error status"
                            );
                            setters.push(status_handler::set_failed(modified.failed() + 1));
                            setters.push(status_handler::set_error(Some(format!(
                                "external api responded with status code {}",
                                response.status_code
                            ))));
                            Some(ReconcilerError::HttpStatus(response.status_code))
                        } else {
                            let ctx_value =
                                serde_json::json!({ "response": &response });
                            let matches = context
                                .evaluator
                                .parse_bool(&modified.spec.expected_response, &ctx_value)?;

                            if matches {
                                setters.push(status_handler::set_synced(true));
                                setters.push(status_handler::set_failed(0));
                                setters.push(status_handler::set_error(None));

                                let secret_ctx =
                                    serde_json::to_value(&response).unwrap_or(serde_json::Value::Null);
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

                                None
                            } else {
                                warn!(%namespace, %name, "response does not match expected criteria");
                                setters.push(status_handler::set_failed(modified.failed() + 1));
                                setters.push(status_handler::set_error(Some(
                                    "response does not match the expected criteria".to_string(),
                                )));
                                Some(ReconcilerError::ResponseDoesNotMatch(response.status_code))
                            }
                        }
                    }
                    Err(err) => {
                        setters.push(status_handler::set_failed(modified.failed() + 1));
                        setters.push(status_handler::set_error(Some(err.to_string())));
                        Some(err)
                    }
                };

                let modified = status_handler::apply(context.kube.to_owned(), &modified, setters).await?;

                match outcome_error {
                    None => {
                        recorder::normal(
                            context.kube.to_owned(),
                            &modified,
                            &"Synced",
                            "response matches the expected criteria",
                        )
                        .await?;

                        Ok(Action::requeue(requeue_after))
                    }
                    Some(err) => {
                        recorder::warning(context.kube.to_owned(), &modified, &"Failed", &err.to_string())
                            .await?;

                        Err(err)
                    }
                }
            }
        }
    }

    async fn delete_impl(
        context: Arc<Context>,
        origin: Arc<DisposableRequest>,
    ) -> Result<Action, ReconcilerError> {
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

        match Self::send(&context, &modified, bearer_token).await {
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

        Ok(Action::await_change())
    }
}

#[async_trait]
impl crate::svc::k8s::Reconciler<DisposableRequest> for Reconciler {
    type Error = ReconcilerError;

    async fn upsert(ctx: Arc<Context>, obj: Arc<DisposableRequest>) -> Result<(), ReconcilerError> {
        Self::upsert_impl(ctx, obj).await.map(|_| ())
    }

    async fn delete(ctx: Arc<Context>, obj: Arc<DisposableRequest>) -> Result<(), ReconcilerError> {
        Self::delete_impl(ctx, obj).await.map(|_| ())
    }

    /// overridden so the poll-interval/backoff delays computed by
    /// [`disposable_engine`] drive the next reconciliation, instead of the
    /// default "wait for the next change" behaviour
    async fn reconcile(
        obj: Arc<DisposableRequest>,
        ctx: Arc<Context>,
    ) -> Result<Action, ReconcilerError> {
        let (namespace, name) = resource::namespaced_name(&*obj);

        if resource::deleted(obj.as_ref()) {
            info!(%namespace, %name, "received deletion event for custom resource");
            return Self::delete_impl(ctx, obj).await;
        }

        info!(%namespace, %name, "received upsertion event for custom resource");
        Self::upsert_impl(ctx, obj).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn previously_synced_resource_without_looping_is_idle() {
        let obj = DisposableRequest::new(
            "test",
            Spec {
                url: "http://example.test".to_string(),
                method: Method::Get,
                body: String::new(),
                headers: BTreeMap::new(),
                wait_timeout_seconds: None,
                insecure_skip_tls_verify: false,
                expected_response: ".response.statusCode == 200".to_string(),
                next_reconcile_seconds: None,
                should_loop_infinitely: false,
                rollback_retries_limit: None,
                secret_injection_configs: Vec::new(),
                provider_config_ref: ProviderConfigReference::default(),
            },
        );

        assert!(!obj.should_loop_infinitely());
        assert_eq!(obj.rollback_retries_limit(), None);
    }
}
