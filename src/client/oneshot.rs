//! One-shot request/response client used by the `cert` and `status`
//! commands.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info};

use super::transport::{self, ClientError, WsStream};
use crate::protocol::{CertRequest, CertResponse, Envelope, Message, StatusResponse};
use crate::security::SignatureVerifier;

pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Authenticated connection that issues single requests.
pub struct OneShotClient {
    stream: WsStream,
    timeout: Duration,
}

impl OneShotClient {
    /// Connect and authenticate without subscribing to anything.
    pub async fn connect(
        server_url: &str,
        password: &str,
        client_id: &str,
    ) -> Result<Self, ClientError> {
        let stream = transport::connect(server_url).await?;
        let mut client = Self {
            stream,
            timeout: REQUEST_TIMEOUT,
        };

        let verifier = SignatureVerifier::new(password);
        client
            .stream
            .send(transport::auth_frame(&verifier, client_id, Vec::new())?)
            .await?;

        let result = client
            .wait_for("auth_result", AUTH_TIMEOUT, |message| match message {
                Message::AuthResult(resp) => Some(resp),
                _ => None,
            })
            .await?;
        if !result.success {
            return Err(ClientError::AuthRejected(result.message));
        }

        debug!(server = %server_url, "One-shot client authenticated");
        Ok(client)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Download the bundle for `domain`. A response carrying an error
    /// string becomes [`ClientError::Request`].
    pub async fn request_cert(
        &mut self,
        domain: &str,
        force: bool,
    ) -> Result<CertResponse, ClientError> {
        self.stream
            .send(transport::text_frame(Message::CertRequest(CertRequest {
                domain: domain.to_string(),
                force,
            }))?)
            .await?;

        let timeout = self.timeout;
        let response = self
            .wait_for("cert_response", timeout, |message| match message {
                Message::CertResponse(resp) => Some(resp),
                _ => None,
            })
            .await?;

        if response.is_error() {
            return Err(ClientError::Request(response.error));
        }
        info!(domain = %response.domain, files = response.files.len(), "Certificate downloaded");
        Ok(response)
    }

    pub async fn request_status(&mut self) -> Result<StatusResponse, ClientError> {
        self.stream
            .send(transport::text_frame(Message::StatusRequest)?)
            .await?;

        let timeout = self.timeout;
        let response = self
            .wait_for("status_response", timeout, |message| match message {
                Message::StatusResponse(resp) => Some(resp),
                _ => None,
            })
            .await?;

        if !response.error.is_empty() {
            return Err(ClientError::Request(response.error));
        }
        Ok(response)
    }

    pub async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }

    /// Read frames until `pick` accepts one. Server `error` messages abort
    /// the wait; anything else is skipped.
    async fn wait_for<T>(
        &mut self,
        what: &'static str,
        timeout: Duration,
        mut pick: impl FnMut(Message) -> Option<T>,
    ) -> Result<T, ClientError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let frame = tokio::time::timeout_at(deadline, self.stream.next())
                .await
                .map_err(|_| ClientError::Timeout(what))?;

            let text = match frame {
                None | Some(Ok(WsMessage::Close(_))) => return Err(ClientError::Closed),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(WsMessage::Text(text))) => text,
                Some(Ok(_)) => continue,
            };

            let message = match Envelope::decode(&text).and_then(|env| env.message()) {
                Ok(message) => message,
                Err(e) => {
                    debug!(error = %e, "Skipping undecodable frame");
                    continue;
                }
            };

            if let Message::Error(err) = message {
                return Err(ClientError::Server {
                    code: err.code,
                    message: err.message,
                });
            }
            if let Some(value) = pick(message) {
                return Ok(value);
            }
        }
    }
}
