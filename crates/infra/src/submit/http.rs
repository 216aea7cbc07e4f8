use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use dispatchq_core::Job;

use super::{SubmitError, Submitter};

/// POSTs a job's fields form-urlencoded to a fixed URL.
#[derive(Debug, Clone)]
pub struct HttpFormSubmitter {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpFormSubmitter {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Map an HTTP status to a submission outcome.
pub(crate) fn classify_status(status: StatusCode) -> Result<(), SubmitError> {
    if status.is_success() || status.is_redirection() {
        Ok(())
    } else if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        Err(SubmitError::Transient(format!("HTTP {status}")))
    } else {
        Err(SubmitError::Permanent(format!("HTTP {status}")))
    }
}

#[async_trait]
impl Submitter for HttpFormSubmitter {
    async fn submit(&self, job: &Job) -> Result<(), SubmitError> {
        let response = self
            .client
            .post(&self.url)
            .form(&job.fields)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SubmitError::Timeout(self.timeout)
                } else if e.is_connect() || e.is_request() {
                    SubmitError::Transient(e.to_string())
                } else {
                    SubmitError::Permanent(e.to_string())
                }
            })?;

        let status = response.status();
        debug!(job_id = %job.id, status = status.as_u16(), "form submitted");
        classify_status(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(classify_status(StatusCode::OK).is_ok());
        assert!(classify_status(StatusCode::FOUND).is_ok());
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            Err(SubmitError::Transient(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY),
            Err(SubmitError::Transient(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST),
            Err(SubmitError::Permanent(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND),
            Err(SubmitError::Permanent(_))
        ));
    }

    #[test]
    fn builds_with_timeout() {
        let submitter = HttpFormSubmitter::new("http://127.0.0.1:9/form", Duration::from_secs(2)).unwrap();
        assert_eq!(submitter.url(), "http://127.0.0.1:9/form");
    }
}
