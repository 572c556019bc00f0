//! # HTTP client module
//!
//! This module implements the `sendRequest` contract against an external
//! http api using `reqwest`: issue one request from a fully materialized
//! method/url/body/headers and return the request and response details to
//! record onto the owning resource's status.
//!
//! The decrypted view of the body/headers is used to actually send the
//! request; the encrypted view is what gets echoed back as the persisted
//! request details, so a decrypted secret never makes it into status.

use std::{collections::BTreeMap, time::Duration};

use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION},
    Client as ReqwestClient, Method as ReqwestMethod,
};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tracing::debug;

use crate::svc::capabilities::{HttpRequestDetails, HttpResponse, Method};

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to parse header name '{0}', {1}")]
    HeaderName(String, reqwest::header::InvalidHeaderName),
    #[error("failed to parse header value for '{0}', {1}")]
    HeaderValue(String, reqwest::header::InvalidHeaderValue),
    #[error("failed to build http client, {0}")]
    Build(reqwest::Error),
    #[error("failed to send http request to '{0}', {1}")]
    Send(String, reqwest::Error),
    #[error("failed to read response body from '{0}', {1}")]
    Body(String, reqwest::Error),
}

// -----------------------------------------------------------------------------
// RequestData structure

/// one fully-resolved outbound request
pub struct RequestData {
    pub method: Method,
    pub url: String,
    pub body_encrypted: String,
    pub body_decrypted: SecretString,
    pub headers_encrypted: BTreeMap<String, Vec<String>>,
    pub headers_decrypted: BTreeMap<String, Vec<String>>,
    pub skip_tls_verify: bool,
    pub wait_timeout: Option<Duration>,
}

// -----------------------------------------------------------------------------
// Client structure

/// the external http client collaborator: issues one materialized request
/// and returns the request/response details to persist onto the resource
#[derive(Clone, Debug, Default)]
pub struct Client {
    bearer_token: Option<SecretString>,
}

impl Client {
    pub fn new() -> Self {
        Self::default()
    }

    /// a bearer token injected into the `Authorization` header whenever the
    /// materialized (decrypted) headers do not already carry one
    pub fn with_bearer_token(bearer_token: Option<SecretString>) -> Self {
        Self { bearer_token }
    }

    fn build(&self, skip_tls_verify: bool, wait_timeout: Option<Duration>) -> Result<ReqwestClient, Error> {
        let mut builder = ReqwestClient::builder().danger_accept_invalid_certs(skip_tls_verify);

        if let Some(timeout) = wait_timeout {
            builder = builder.timeout(timeout);
        }

        builder.build().map_err(Error::Build)
    }

    fn headers(&self, headers: &BTreeMap<String, Vec<String>>) -> Result<HeaderMap, Error> {
        let mut map = HeaderMap::new();
        let mut has_authorization = false;

        for (name, values) in headers {
            let header_name = HeaderName::try_from(name.as_str())
                .map_err(|err| Error::HeaderName(name.to_owned(), err))?;

            if header_name == AUTHORIZATION {
                has_authorization = true;
            }

            for value in values {
                let header_value = HeaderValue::from_str(value)
                    .map_err(|err| Error::HeaderValue(name.to_owned(), err))?;
                map.append(header_name.clone(), header_value);
            }
        }

        if !has_authorization {
            if let Some(token) = &self.bearer_token {
                let value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
                    .map_err(|err| Error::HeaderValue(AUTHORIZATION.to_string(), err))?;
                map.insert(AUTHORIZATION, value);
            }
        }

        Ok(map)
    }

    /// sends the materialized request and returns the request/response
    /// details to record onto the resource's status
    pub async fn send(
        &self,
        data: &RequestData,
    ) -> Result<(HttpRequestDetails, HttpResponse), Error> {
        let client = self.build(data.skip_tls_verify, data.wait_timeout)?;
        let method = ReqwestMethod::from_bytes(data.method.as_str().as_bytes())
            .expect("capability method to map onto a valid http method");

        debug!(method = data.method.as_str(), url = %data.url, "execute http request");

        let mut req = client
            .request(method, &data.url)
            .headers(self.headers(&data.headers_decrypted)?);

        if !data.body_decrypted.expose_secret().is_empty() {
            req = req.body(data.body_decrypted.expose_secret().to_owned());
        }

        let response = req
            .send()
            .await
            .map_err(|err| Error::Send(data.url.to_owned(), err))?;
        let status_code = response.status().as_u16();

        let mut response_headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in response.headers() {
            response_headers
                .entry(name.as_str().to_string())
                .or_default()
                .push(value.to_str().unwrap_or_default().to_string());
        }

        let body = response
            .text()
            .await
            .map_err(|err| Error::Body(data.url.to_owned(), err))?;

        let request_details = HttpRequestDetails {
            method: data.method.as_str().to_string(),
            url: data.url.to_owned(),
            body: data.body_encrypted.to_owned(),
            headers: data.headers_encrypted.to_owned(),
        };

        let http_response = HttpResponse {
            status_code,
            body,
            headers: response_headers,
        };

        Ok((request_details, http_response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_injects_bearer_token_when_absent() {
        let client = Client::with_bearer_token(Some(SecretString::new("tok".to_string())));
        let headers = client.headers(&BTreeMap::new()).unwrap();

        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer tok");
    }

    #[test]
    fn headers_leaves_explicit_authorization_untouched() {
        let client = Client::with_bearer_token(Some(SecretString::new("tok".to_string())));
        let mut headers = BTreeMap::new();
        headers.insert("Authorization".to_string(), vec!["Basic abc".to_string()]);

        let built = client.headers(&headers).unwrap();
        assert_eq!(built.get(AUTHORIZATION).unwrap(), "Basic abc");
    }
}
