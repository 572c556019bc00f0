//! # Secret module
//!
//! This module implements the [`SecretStore`] contract against the
//! kubernetes `Secret` api: plain key-value reads for credential extraction,
//! and single-key writes for response-value injection.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::{ObjectMeta, Patch, PatchParams, PostParams},
    Api, Client,
};
use thiserror::Error;
use tracing::debug;

use crate::svc::{k8s::resource::OwnerInfo, secret_patcher::SecretStore};

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(Error, Debug)]
pub enum Error {
    #[error("kubernetes api error, {0}")]
    Kube(#[from] kube::Error),
    #[error("secret '{1}/{0}' has no data")]
    Empty(String, String),
}

// -----------------------------------------------------------------------------
// KubeSecretStore structure

/// a [`SecretStore`] backed by `kube::Api<Secret>`
#[derive(Clone)]
pub struct KubeSecretStore {
    client: Client,
}

impl KubeSecretStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    type Error = Error;

    async fn get(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<BTreeMap<String, String>, Self::Error> {
        let api: Api<Secret> = Api::namespaced(self.client.to_owned(), namespace);

        debug!(%name, %namespace, kind = "Secret", "execute a request to retrieve secret");
        let secret = api.get(name).await?;
        let data = secret.data.unwrap_or_default();

        if data.is_empty() {
            return Err(Error::Empty(name.to_string(), namespace.to_string()));
        }

        Ok(data
            .into_iter()
            .map(|(k, v)| (k, String::from_utf8_lossy(&v.0).into_owned()))
            .collect())
    }

    async fn put(
        &self,
        name: &str,
        namespace: &str,
        key: &str,
        value: &str,
        owner: Option<&OwnerInfo>,
    ) -> Result<(), Self::Error> {
        let api: Api<Secret> = Api::namespaced(self.client.to_owned(), namespace);

        match api.get(name).await {
            Ok(_) => {
                debug!(%name, %namespace, kind = "Secret", "patch secret with response value");
                let patch = serde_json::json!({ "stringData": { key: value } });
                api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
                    .await?;
            }
            Err(kube::Error::Api(err)) if err.code == 404 => {
                debug!(%name, %namespace, kind = "Secret", "create secret with response value");

                let mut string_data = BTreeMap::new();
                string_data.insert(key.to_string(), value.to_string());

                let secret = Secret {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        namespace: Some(namespace.to_string()),
                        owner_references: owner.map(|o| vec![o.as_owner_reference()]),
                        ..Default::default()
                    },
                    string_data: Some(string_data),
                    ..Default::default()
                };

                api.create(&PostParams::default(), &secret).await?;
            }
            Err(err) => return Err(Error::Kube(err)),
        }

        Ok(())
    }
}
