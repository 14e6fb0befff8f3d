//! HTTP/JSON transport to the Flintlock control plane.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode, Url};
use tracing::{debug, error};

use super::{CreateVmRequest, RemoteVm, TransportClient, TransportError};
use crate::config::{ClientConfig, ConfigError};
use crate::spec::{VmSpec, VmSpecPatch};

const MICROVM_PATH: [&str; 2] = ["v1alpha1", "microvm"];

/// Control plane client over HTTP.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    config: Arc<ClientConfig>,
}

impl HttpTransport {
    /// Create a client for the given resolved configuration.
    pub fn new(config: Arc<ClientConfig>) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self { client, config })
    }

    /// URL of the microvm collection, or of one microvm when `uid` is set.
    /// The uid is percent-encoded as a single path segment.
    fn url(&self, uid: Option<&str>) -> Result<Url, TransportError> {
        let mut url = self.config.endpoint().clone();
        {
            let mut segments = url.path_segments_mut().map_err(|()| {
                TransportError::Permanent(format!(
                    "endpoint {} cannot carry a path",
                    self.config.endpoint()
                ))
            })?;
            segments.pop_if_empty().extend(MICROVM_PATH);
            if let Some(uid) = uid {
                segments.push(uid);
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, uid: Option<&str>) -> Result<RequestBuilder, TransportError> {
        let builder = self.client.request(method, self.url(uid)?);
        Ok(match self.config.auth_token() {
            Some(token) => builder.bearer_auth(token.expose()),
            None => builder,
        })
    }

    async fn check(
        resp: reqwest::Response,
        endpoint: &'static str,
    ) -> Result<reqwest::Response, TransportError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        error!(endpoint, status = %status, body = %body, "Control plane request failed");
        Err(classify_status(status, endpoint, &body))
    }
}

/// Map an HTTP failure status to the error taxonomy.
fn classify_status(status: StatusCode, endpoint: &str, body: &str) -> TransportError {
    let message = format!("{endpoint} returned {status}: {body}");
    match status {
        StatusCode::NOT_FOUND => TransportError::NotFound(message),
        StatusCode::CONFLICT => TransportError::Conflict(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            TransportError::Transient(message)
        }
        s if s.is_server_error() => TransportError::Transient(message),
        _ => TransportError::Permanent(message),
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() || e.is_builder() {
            TransportError::Permanent(e.to_string())
        } else {
            // connect, timeout, and body errors are worth another attempt
            TransportError::Transient(e.to_string())
        }
    }
}

#[async_trait]
impl TransportClient for HttpTransport {
    async fn create(&self, spec: &VmSpec) -> Result<RemoteVm, TransportError> {
        debug!(vm_id = %spec.id, "Creating microvm");

        let resp = self
            .request(Method::POST, None)?
            .json(&CreateVmRequest::from(spec))
            .send()
            .await?;

        Ok(Self::check(resp, "create microvm").await?.json().await?)
    }

    async fn get(&self, uid: &str) -> Result<RemoteVm, TransportError> {
        debug!(remote_id = %uid, "Fetching microvm");

        let resp = self
            .request(Method::GET, Some(uid))?
            .send()
            .await?;

        Ok(Self::check(resp, "get microvm").await?.json().await?)
    }

    async fn update(&self, uid: &str, patch: &VmSpecPatch) -> Result<RemoteVm, TransportError> {
        debug!(remote_id = %uid, fields = ?patch.fields(), "Updating microvm");

        let resp = self
            .request(Method::PATCH, Some(uid))?
            .json(patch)
            .send()
            .await?;

        Ok(Self::check(resp, "update microvm").await?.json().await?)
    }

    async fn delete(&self, uid: &str) -> Result<(), TransportError> {
        debug!(remote_id = %uid, "Deleting microvm");

        let resp = self
            .request(Method::DELETE, Some(uid))?
            .send()
            .await?;

        match Self::check(resp, "delete microvm").await {
            Ok(_) | Err(TransportError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::error::ErrorKind;

    #[rstest]
    #[case(StatusCode::NOT_FOUND, ErrorKind::NotFound)]
    #[case(StatusCode::CONFLICT, ErrorKind::Conflict)]
    #[case(StatusCode::BAD_REQUEST, ErrorKind::Permanent)]
    #[case(StatusCode::UNPROCESSABLE_ENTITY, ErrorKind::Permanent)]
    #[case(StatusCode::UNAUTHORIZED, ErrorKind::Permanent)]
    #[case(StatusCode::TOO_MANY_REQUESTS, ErrorKind::Transient)]
    #[case(StatusCode::REQUEST_TIMEOUT, ErrorKind::Transient)]
    #[case(StatusCode::BAD_GATEWAY, ErrorKind::Transient)]
    #[case(StatusCode::SERVICE_UNAVAILABLE, ErrorKind::Transient)]
    fn test_classify_status(#[case] status: StatusCode, #[case] kind: ErrorKind) {
        assert_eq!(classify_status(status, "get microvm", "").kind(), kind);
    }

    fn transport(endpoint: &str) -> HttpTransport {
        let config = ClientConfig::new(endpoint, None).unwrap();
        HttpTransport::new(Arc::new(config)).unwrap()
    }

    #[test]
    fn test_url_joins_endpoint() {
        let transport = transport("http://flintlock:9090/");
        assert_eq!(
            transport.url(None).unwrap().as_str(),
            "http://flintlock:9090/v1alpha1/microvm"
        );
        assert_eq!(
            transport.url(Some("abc")).unwrap().as_str(),
            "http://flintlock:9090/v1alpha1/microvm/abc"
        );
    }

    #[test]
    fn test_url_keeps_endpoint_prefix() {
        let transport = transport("http://flintlock:9090/api/");
        assert_eq!(
            transport.url(Some("abc")).unwrap().as_str(),
            "http://flintlock:9090/api/v1alpha1/microvm/abc"
        );
    }

    #[rstest]
    #[case("a/b", "a%2Fb")]
    #[case("x?y#z", "x%3Fy%23z")]
    #[case("50%", "50%25")]
    fn test_uid_is_one_path_segment(#[case] uid: &str, #[case] encoded: &str) {
        let url = transport("http://flintlock:9090").url(Some(uid)).unwrap();
        assert_eq!(url.path(), format!("/v1alpha1/microvm/{encoded}"));
        assert!(url.query().is_none());
        assert!(url.fragment().is_none());
    }
}
