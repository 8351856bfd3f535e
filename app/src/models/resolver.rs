use std::sync::Arc;

use log::{debug, warn};

use crate::error::PipelineError;

use super::transport::Transport;

/// Turns a canonical model URL into the signed URL that serves the bytes.
///
/// The model host answers the canonical URL with a short text payload
/// (`"Found. Redirecting to <url>"`) rather than a followed redirect. The
/// real URL starts at a fixed offset into that body.
pub struct RedirectResolver {
    transport: Arc<dyn Transport>,
    prefix_len: usize,
}

impl RedirectResolver {
    pub fn new(transport: Arc<dyn Transport>, prefix_len: usize) -> Self {
        Self {
            transport,
            prefix_len,
        }
    }

    /// Fetch the redirect payload for `url` and extract the actual download URL.
    ///
    /// No retries: failures go straight back to the caller.
    pub async fn resolve(&self, url: &str) -> Result<String, PipelineError> {
        let response = self.transport.fetch_text(url).await.map_err(|e| {
            warn!("Failed to fetch actual download URL for {}: {}", url, e);
            e
        })?;

        if response.status >= 400 {
            return Err(PipelineError::Network(format!(
                "Redirect request for {} failed with status {}",
                url, response.status
            )));
        }

        match parse_redirect_payload(&response.body, self.prefix_len) {
            Ok(actual) => {
                debug!("Resolved {} -> {}", url, actual);
                Ok(actual)
            }
            Err(e) => match response.location {
                Some(location) if is_http_url(&location) => {
                    warn!(
                        "Unexpected redirect payload for {} ({}), using Location header",
                        url, e
                    );
                    Ok(location)
                }
                _ => Err(e),
            },
        }
    }
}

/// Strip the fixed-length prefix from `body` and validate what remains.
fn parse_redirect_payload(body: &str, prefix_len: usize) -> Result<String, PipelineError> {
    let body = body.trim_end();
    if body.len() <= prefix_len {
        return Err(PipelineError::Protocol(format!(
            "Redirect payload too short: {} bytes, expected more than {}",
            body.len(),
            prefix_len
        )));
    }

    let actual = body
        .get(prefix_len..)
        .ok_or_else(|| {
            PipelineError::Protocol("Redirect payload prefix is not valid text".to_string())
        })?
        .trim();

    if !is_http_url(actual) {
        return Err(PipelineError::Protocol(format!(
            "Redirect payload does not carry a URL: {:?}",
            actual
        )));
    }

    Ok(actual.to_string())
}

fn is_http_url(candidate: &str) -> bool {
    reqwest::Url::parse(candidate)
        .map(|u| matches!(u.scheme(), "http" | "https") && u.host().is_some())
        .unwrap_or(false)
}
