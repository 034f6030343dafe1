//! Retried, authenticated request execution

use super::{CredentialProvider, HttpRequest, HttpResponse, StreamingResponse, Transport};
use crate::error::{validate_response, StorageError};
use crate::metrics;
use crate::retry::RetryPolicy;
use std::sync::Arc;

/// Shared request executor used by every component that talks to the backend
#[derive(Clone)]
pub struct HttpExecutor {
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialProvider>,
    retry: RetryPolicy,
    user_project: Option<String>,
}

impl HttpExecutor {
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialProvider>,
        retry: RetryPolicy,
        user_project: Option<String>,
    ) -> Self {
        Self {
            transport,
            credentials,
            retry,
            user_project,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialProvider> {
        &self.credentials
    }

    async fn prepare(&self, request: &HttpRequest) -> Result<HttpRequest, StorageError> {
        let mut request = request.clone();
        if let Some(project) = &self.user_project {
            request = request.query("userProject", project.clone());
        }
        self.credentials.apply(&mut request.headers).await?;
        Ok(request)
    }

    /// Run one attempt without retrying
    pub async fn attempt(
        &self,
        request: &HttpRequest,
        path: &str,
    ) -> Result<HttpResponse, StorageError> {
        let method = request.method.to_string();
        let prepared = self.prepare(request).await?;
        let response = self.transport.request(prepared).await?;

        metrics::record_request(&method, response.status);
        tracing::trace!(
            http.method = %method,
            http.status_code = response.status,
            bytes = response.body.len(),
            "Backend responded"
        );

        validate_response(response.status, &response.body, path)?;
        Ok(response)
    }

    /// Execute `request` through the retry engine
    #[tracing::instrument(
        name = "storage.request",
        skip(self, request),
        fields(http.method = %request.method, path = %path),
        err
    )]
    pub async fn call(&self, request: HttpRequest, path: &str) -> Result<HttpResponse, StorageError> {
        self.call_with(request, path, Ok).await
    }

    /// Execute `request` through the retry engine, running `check` on each
    /// successful response inside the attempt. An error from `check` (for
    /// example a checksum mismatch) is classified like any other fault.
    pub async fn call_with<T, F>(
        &self,
        request: HttpRequest,
        path: &str,
        check: F,
    ) -> Result<T, StorageError>
    where
        F: Fn(HttpResponse) -> Result<T, StorageError>,
    {
        let name = format!("{} {}", request.method, path);
        let request = &request;
        let check = &check;
        self.retry
            .execute(&name, || async move {
                let response = self.attempt(request, path).await?;
                check(response)
            })
            .await
    }

    /// Open a streaming response through the retry engine.
    ///
    /// Only opening the response is retried; a fault while consuming the body
    /// surfaces to the caller. Error statuses are buffered and validated.
    #[tracing::instrument(
        name = "storage.stream",
        skip(self, request),
        fields(http.method = %request.method, path = %path),
        err
    )]
    pub async fn stream(
        &self,
        request: HttpRequest,
        path: &str,
    ) -> Result<StreamingResponse, StorageError> {
        let name = format!("stream {}", path);
        let request = &request;
        self.retry
            .execute(&name, || async move {
                let method = request.method.to_string();
                let prepared = self.prepare(request).await?;
                let response = self.transport.stream(prepared).await?;
                metrics::record_request(&method, response.status);
                if response.status >= 400 {
                    let buffered = response.collect().await?;
                    validate_response(buffered.status, &buffered.body, path)?;
                    return Err(StorageError::Http {
                        code: buffered.status,
                        message: String::new(),
                    });
                }
                Ok(response)
            })
            .await
    }
}
