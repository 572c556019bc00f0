//! # ProviderConfig / ClusterProviderConfig custom resources
//!
//! A managed `Request`/`DisposableRequest` references one of these to
//! resolve credentials and shared defaults before issuing any http call.
//! `ProviderConfig` is namespaced, `ClusterProviderConfig` is its
//! cluster-scoped counterpart; both carry the same `credentials` shape.
//! Structurally identical but kept as two types rather than one generic
//! one, so each can carry its own kube scope without a runtime branch on
//! every field access.

use kube::{
    api::{Patch, PatchParams},
    Api, Client, CustomResource, ResourceExt,
};
use schemars::JsonSchema;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::svc::{
    capabilities::ProviderConfigKind,
    k8s::resource,
    secret_patcher::SecretStore,
};

// -----------------------------------------------------------------------------
// Credentials structures

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug, Default)]
pub enum CredentialsSource {
    #[default]
    #[serde(rename = "None")]
    None,
    #[serde(rename = "Secret")]
    Secret,
    #[serde(rename = "InjectedIdentity")]
    InjectedIdentity,
    #[serde(rename = "Environment")]
    Environment,
    #[serde(rename = "Filesystem")]
    Filesystem,
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct SecretKeyReference {
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "namespace")]
    pub namespace: String,
    #[serde(rename = "key")]
    pub key: String,
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Credentials {
    #[serde(rename = "source", default)]
    pub source: CredentialsSource,
    #[serde(rename = "secretRef", default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretKeyReference>,
}

// -----------------------------------------------------------------------------
// Status structure, shared by both kinds

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Status {
    /// set once a managed resource has successfully resolved this config at
    /// least once
    #[serde(rename = "accepted", default)]
    pub accepted: bool,
}

// -----------------------------------------------------------------------------
// ProviderConfig (namespaced)

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug)]
#[kube(group = "httprequest.clever-cloud.com")]
#[kube(version = "v1")]
#[kube(kind = "ProviderConfig")]
#[kube(singular = "providerconfig")]
#[kube(plural = "providerconfigs")]
#[kube(shortname = "pconf")]
#[kube(status = "Status")]
#[kube(namespaced)]
#[kube(apiextensions = "v1")]
#[kube(derive = "PartialEq")]
pub struct ProviderConfigSpec {
    #[serde(rename = "credentials", default)]
    pub credentials: Credentials,
}

// -----------------------------------------------------------------------------
// ClusterProviderConfig (cluster-scoped)

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug)]
#[kube(group = "httprequest.clever-cloud.com")]
#[kube(version = "v1")]
#[kube(kind = "ClusterProviderConfig")]
#[kube(singular = "clusterproviderconfig")]
#[kube(plural = "clusterproviderconfigs")]
#[kube(shortname = "cpconf")]
#[kube(status = "Status")]
#[kube(apiextensions = "v1")]
#[kube(derive = "PartialEq")]
pub struct ClusterProviderConfigSpec {
    #[serde(rename = "credentials", default)]
    pub credentials: Credentials,
}

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("provider config '{0}' not found in namespace '{1}'")]
    NotFoundNamespaced(String, String),
    #[error("cluster provider config '{0}' not found")]
    NotFoundCluster(String),
    #[error("kubernetes api error, {0}")]
    Kube(#[from] kube::Error),
    #[error("failed to compute diff between the original and modified object, {0}")]
    Diff(serde_json::Error),
    #[error("provider config '{1}/{0}' secret credentials has no key '{2}'")]
    SecretKeyNotFound(String, String, String),
    #[error("failed to read credentials secret, {0}")]
    Secret(String),
}

// -----------------------------------------------------------------------------
// Resolution

/// resolves `reference` against the cluster, accepting it (marking
/// `status.accepted = true`, once) on first successful resolution, and
/// returns its credentials
pub async fn resolve(
    client: &Client,
    reference: &crate::svc::capabilities::ProviderConfigReference,
    namespace: &str,
) -> Result<Credentials, Error> {
    match reference.kind {
        ProviderConfigKind::ProviderConfig => {
            let api: Api<ProviderConfig> = Api::namespaced(client.to_owned(), namespace);
            let obj = api.get(&reference.name).await.map_err(|err| match err {
                kube::Error::Api(ref api_err) if api_err.code == 404 => {
                    Error::NotFoundNamespaced(reference.name.to_owned(), namespace.to_owned())
                }
                other => Error::Kube(other),
            })?;

            accept_namespaced(client, obj.clone()).await?;
            Ok(obj.spec.credentials)
        }
        ProviderConfigKind::ClusterProviderConfig => {
            let api: Api<ClusterProviderConfig> = Api::all(client.to_owned());
            let obj = api.get(&reference.name).await.map_err(|err| match err {
                kube::Error::Api(ref api_err) if api_err.code == 404 => {
                    Error::NotFoundCluster(reference.name.to_owned())
                }
                other => Error::Kube(other),
            })?;

            accept_cluster(client, obj.clone()).await?;
            Ok(obj.spec.credentials)
        }
    }
}

async fn accept_namespaced(client: &Client, obj: ProviderConfig) -> Result<(), Error> {
    if obj.status.as_ref().map(|s| s.accepted).unwrap_or(false) {
        return Ok(());
    }

    let mut modified = obj.clone();
    modified.status = Some(Status { accepted: true });
    let patch = resource::diff(&obj, &modified).map_err(Error::Diff)?;
    resource::patch_status(client.to_owned(), modified, patch).await?;
    Ok(())
}

async fn accept_cluster(client: &Client, obj: ClusterProviderConfig) -> Result<(), Error> {
    if obj.status.as_ref().map(|s| s.accepted).unwrap_or(false) {
        return Ok(());
    }

    let mut modified = obj.clone();
    modified.status = Some(Status { accepted: true });
    let patch = resource::diff(&obj, &modified).map_err(Error::Diff)?;

    if patch.0.is_empty() {
        return Ok(());
    }

    let name = obj.name_any();
    Api::<ClusterProviderConfig>::all(client.to_owned())
        .patch_status(&name, &PatchParams::default(), &Patch::Json::<ClusterProviderConfig>(patch))
        .await?;
    Ok(())
}

/// derives a bearer token from `credentials`, when its source is backed by a
/// readable secret. `InjectedIdentity`/`Environment`/`Filesystem` sources are
/// resolved by the surrounding platform rather than by this operator, so no
/// token is produced for them here.
pub async fn bearer_token<S>(credentials: &Credentials, store: &S) -> Result<Option<SecretString>, Error>
where
    S: SecretStore,
{
    let Credentials {
        source: CredentialsSource::Secret,
        secret_ref: Some(secret_ref),
    } = credentials
    else {
        return Ok(None);
    };

    let values = store
        .get(&secret_ref.name, &secret_ref.namespace)
        .await
        .map_err(|err| Error::Secret(err.to_string()))?;

    let value = values.get(&secret_ref.key).ok_or_else(|| {
        Error::SecretKeyNotFound(
            secret_ref.name.to_owned(),
            secret_ref.namespace.to_owned(),
            secret_ref.key.to_owned(),
        )
    })?;

    Ok(Some(SecretString::new(value.to_owned())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_source_defaults_to_none() {
        assert_eq!(Credentials::default().source, CredentialsSource::None);
    }
}
