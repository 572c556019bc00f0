//! # Resource module
//!
//! This module provides helpers on kubernetes [`Resource`]

use std::fmt::Debug;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{
    api::{ObjectReference, Patch, PatchParams, PostParams},
    Api, Client, CustomResourceExt, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

// -----------------------------------------------------------------------------
// OwnerInfo structure

/// a lightweight, namespace-bearing description of a resource, used to build
/// owner references and to decide whether a secret may be owned across a
/// namespace boundary without requiring the full typed object to be in scope
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct OwnerInfo {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub uid: String,
}

impl OwnerInfo {
    pub fn from_resource<T>(obj: &T) -> Self
    where
        T: ResourceExt + CustomResourceExt,
    {
        let api_resource = T::api_resource();

        Self {
            api_version: api_resource.api_version,
            kind: api_resource.kind,
            name: obj.name_any(),
            namespace: obj.namespace().unwrap_or_default(),
            uid: obj.uid().unwrap_or_default(),
        }
    }

    pub fn as_owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: self.api_version.to_owned(),
            block_owner_deletion: Some(true),
            controller: None,
            kind: self.kind.to_owned(),
            name: self.name.to_owned(),
            uid: self.uid.to_owned(),
        }
    }
}

// -----------------------------------------------------------------------------
// Helpers functions

/// returns if the resource is considered from kubernetes point of view as deleted
pub fn deleted<T>(obj: &T) -> bool
where
    T: Resource,
{
    obj.meta().deletion_timestamp.is_some()
}

/// returns the namespace and name of the kubernetes resource.
///
/// # Panic
///
/// panics if the namespace is unset, which should not happen for a namespaced resource
pub fn namespaced_name<T>(obj: &T) -> (String, String)
where
    T: ResourceExt,
{
    (
        obj.namespace()
            .expect("resource to be owned by a namespace"),
        obj.name_any(),
    )
}

/// returns the difference between the two given objects serialized as a json patch
pub fn diff<T>(origin: &T, modified: &T) -> Result<json_patch::Patch, serde_json::Error>
where
    T: Serialize,
{
    Ok(json_patch::diff(
        &serde_json::to_value(origin)?,
        &serde_json::to_value(modified)?,
    ))
}

/// makes a patch request on the given resource using the given patch
pub async fn patch<T>(client: Client, obj: &T, patch: json_patch::Patch) -> Result<T, kube::Error>
where
    T: Resource + DeserializeOwned + Serialize + Clone + Debug,
    <T as Resource>::DynamicType: Default,
{
    let (namespace, name) = namespaced_name(obj);

    if patch.0.is_empty() {
        debug!(%name, %namespace, "skip patch request on resource, no operation to apply");
        return Ok(obj.to_owned());
    }

    debug!(%name, %namespace, "execute patch request on resource");
    Api::namespaced(client, &namespace)
        .patch(&name, &PatchParams::default(), &Patch::Json::<T>(patch))
        .await
}

/// makes a patch request on the given resource's status using the given patch
pub async fn patch_status<T>(
    client: Client,
    obj: T,
    patch: json_patch::Patch,
) -> Result<T, kube::Error>
where
    T: Resource + DeserializeOwned + Serialize + Clone + Debug,
    <T as Resource>::DynamicType: Default,
{
    let (namespace, name) = namespaced_name(&obj);

    if patch.0.is_empty() {
        debug!(%name, %namespace, "skip patch request on resource's status, no operation to apply");
        return Ok(obj);
    }

    debug!(%name, %namespace, "execute patch request on resource's status");
    Api::namespaced(client, &namespace)
        .patch_status(&name, &PatchParams::default(), &Patch::Json::<T>(patch))
        .await
}

/// creates the given resource if it does not already exist, otherwise patches
/// it in place to match
pub async fn upsert<T>(client: Client, obj: &T, cluster_scoped: bool) -> Result<T, kube::Error>
where
    T: Resource + DeserializeOwned + Serialize + Clone + Debug,
    <T as Resource>::DynamicType: Default,
{
    let api: Api<T> = if cluster_scoped {
        Api::all(client.to_owned())
    } else {
        Api::namespaced(client.to_owned(), &obj.namespace().unwrap_or_default())
    };

    let name = obj.name_any();
    match api.get(&name).await {
        Ok(existing) => {
            let patch = diff(&existing, obj)?;
            patch::<T>(client, obj, patch).await
        }
        Err(kube::Error::Api(err)) if err.code == 404 => {
            api.create(&PostParams::default(), obj).await
        }
        Err(err) => Err(err),
    }
}

/// returns an owner reference object pointing to the given resource
pub fn owner_reference<T>(obj: &T) -> OwnerReference
where
    T: ResourceExt + CustomResourceExt,
{
    OwnerInfo::from_resource(obj).as_owner_reference()
}

/// returns an object reference usable in a kubernetes event's `involvedObject`
pub fn object_reference<T>(obj: &T) -> ObjectReference
where
    T: ResourceExt + CustomResourceExt,
{
    let api_resource = T::api_resource();

    ObjectReference {
        api_version: Some(api_resource.api_version),
        kind: Some(api_resource.kind),
        name: Some(obj.name_any()),
        namespace: obj.namespace(),
        uid: obj.uid(),
        resource_version: obj.resource_version(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    fn map(name: &str, data: Option<std::collections::BTreeMap<String, String>>) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            data,
            ..Default::default()
        }
    }

    #[test]
    fn diff_produces_empty_patch_for_identical_resources() {
        let a = map("a", None);
        let b = a.clone();

        let patch = diff(&a, &b).unwrap();
        assert!(patch.0.is_empty());
    }

    #[test]
    fn diff_produces_nonempty_patch_for_changed_data() {
        let a = map("a", None);
        let mut data = std::collections::BTreeMap::new();
        data.insert("k".to_string(), "v".to_string());
        let b = map("a", Some(data));

        let patch = diff(&a, &b).unwrap();
        assert!(!patch.0.is_empty());
    }

    #[test]
    fn deleted_reflects_deletion_timestamp() {
        let obj = map("a", None);
        assert!(!deleted(&obj));
    }
}
