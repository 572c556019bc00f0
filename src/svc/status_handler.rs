//! # Status handler module
//!
//! This module applies an ordered sequence of status mutations to a clone of
//! the resource, then issues exactly one status patch per reconciliation
//! cycle. Setters never touch the object fetched from the api server
//! directly, so a single diff at the end captures every change made during
//! the cycle.

use std::fmt::Debug;

use chrono::{DateTime, Utc};
use kube::{Client, Resource};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::svc::{
    capabilities::{
        Cache, CachedResponse, DisposableRequestStatusWriter, HttpRequestDetails, HttpResponse,
        RequestStatusWriter,
    },
    k8s::resource,
};

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to compute status diff, {0}")]
    Diff(serde_json::Error),
    #[error("kubernetes api error, {0}")]
    Kube(#[from] kube::Error),
}

// -----------------------------------------------------------------------------
// Setter type

/// a single named mutation applied to a clone of the resource's status
pub type Setter<T> = Box<dyn FnOnce(&mut T) + Send>;

// -----------------------------------------------------------------------------
// Baseline setters (RequestStatusWriter)

pub fn set_response_and_request<T>(response: HttpResponse, details: HttpRequestDetails) -> Setter<T>
where
    T: RequestStatusWriter + 'static,
{
    Box::new(move |obj| {
        obj.set_response(response);
        obj.set_request_details(details);
    })
}

pub fn set_failed<T>(failed: u32) -> Setter<T>
where
    T: RequestStatusWriter + 'static,
{
    Box::new(move |obj| obj.set_failed(failed))
}

pub fn set_error<T>(error: Option<String>) -> Setter<T>
where
    T: RequestStatusWriter + 'static,
{
    Box::new(move |obj| obj.set_error(error))
}

// -----------------------------------------------------------------------------
// Conditional setters (CachedResponse)

/// overwrites the cache only when `observed_at` is not older than the cache
/// entry already recorded, so `lastUpdated` only ever advances
pub fn set_cache_if_newer<T>(response: HttpResponse, observed_at: DateTime<Utc>) -> Setter<T>
where
    T: CachedResponse + 'static,
{
    Box::new(move |obj| {
        let newer = obj
            .cache()
            .last_updated
            .map(|last| observed_at >= last)
            .unwrap_or(true);

        if newer {
            obj.set_cache(Cache {
                response,
                last_updated: Some(observed_at),
            });
        }
    })
}

// -----------------------------------------------------------------------------
// DisposableRequest setters

pub fn set_synced<T>(synced: bool) -> Setter<T>
where
    T: DisposableRequestStatusWriter + 'static,
{
    Box::new(move |obj| obj.set_synced(synced))
}

pub fn set_last_reconcile_time<T>(at: DateTime<Utc>) -> Setter<T>
where
    T: DisposableRequestStatusWriter + 'static,
{
    Box::new(move |obj| obj.set_last_reconcile_time(at))
}

// -----------------------------------------------------------------------------
// apply function

/// runs every setter in order against a clone of `origin`, then issues a
/// single status patch request capturing every accumulated change
pub async fn apply<T>(client: Client, origin: &T, setters: Vec<Setter<T>>) -> Result<T, Error>
where
    T: Resource + DeserializeOwned + Serialize + Clone + Debug,
    <T as Resource>::DynamicType: Default,
{
    let mut modified = origin.to_owned();
    for setter in setters {
        setter(&mut modified);
    }

    let patch = resource::diff(origin, &modified).map_err(Error::Diff)?;
    resource::patch_status(client, modified, patch)
        .await
        .map_err(Error::Kube)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, Default)]
    struct Dummy {
        response: HttpResponse,
        request_details: HttpRequestDetails,
        failed: u32,
        error: Option<String>,
        cache: Cache,
    }

    impl RequestStatusWriter for Dummy {
        fn response(&self) -> &HttpResponse {
            &self.response
        }
        fn set_response(&mut self, response: HttpResponse) {
            self.response = response;
        }
        fn request_details(&self) -> &HttpRequestDetails {
            &self.request_details
        }
        fn set_request_details(&mut self, details: HttpRequestDetails) {
            self.request_details = details;
        }
        fn failed(&self) -> u32 {
            self.failed
        }
        fn set_failed(&mut self, failed: u32) {
            self.failed = failed;
        }
        fn set_error(&mut self, error: Option<String>) {
            self.error = error;
        }
    }

    impl CachedResponse for Dummy {
        fn cache(&self) -> &Cache {
            &self.cache
        }
        fn set_cache(&mut self, cache: Cache) {
            self.cache = cache;
        }
    }

    #[test]
    fn setters_apply_in_order() {
        let mut dummy = Dummy::default();
        let setters: Vec<Setter<Dummy>> = vec![
            set_failed(2),
            set_error(Some("boom".to_string())),
            set_failed(0),
        ];

        for setter in setters {
            setter(&mut dummy);
        }

        assert_eq!(dummy.failed, 0);
        assert_eq!(dummy.error, Some("boom".to_string()));
    }

    #[test]
    fn cache_is_overwritten_when_newer() {
        let mut dummy = Dummy::default();
        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::seconds(1);

        set_cache_if_newer::<Dummy>(HttpResponse { status_code: 200, ..Default::default() }, t1)(&mut dummy);
        set_cache_if_newer::<Dummy>(HttpResponse { status_code: 201, ..Default::default() }, t2)(&mut dummy);

        assert_eq!(dummy.cache.response.status_code, 201);
        assert_eq!(dummy.cache.last_updated, Some(t2));
    }

    #[test]
    fn cache_is_not_overwritten_when_older() {
        let mut dummy = Dummy::default();
        let t1 = Utc::now();
        let t0 = t1 - chrono::Duration::seconds(1);

        set_cache_if_newer::<Dummy>(HttpResponse { status_code: 200, ..Default::default() }, t1)(&mut dummy);
        set_cache_if_newer::<Dummy>(HttpResponse { status_code: 500, ..Default::default() }, t0)(&mut dummy);

        assert_eq!(dummy.cache.response.status_code, 200);
    }
}
