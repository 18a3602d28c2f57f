use crate::error::PushError;
use crate::gateway::{Attributes, PushGateway};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Gateway backed by a JSON-over-HTTPS push relay.
///
/// | operation | request |
/// |---|---|
/// | register | `POST /endpoints` |
/// | send | `POST /endpoints/{arn}/publish` |
/// | get attributes | `GET /endpoints/{arn}/attributes` |
/// | set attributes | `PUT /endpoints/{arn}/attributes` |
/// | delete | `DELETE /endpoints/{arn}` |
pub struct HttpGateway {
    client: Client,
    base: Url,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    service: &'a str,
    token: &'a str,
    custom_user_data: &'a str,
}

#[derive(Serialize)]
struct PublishRequest<'a> {
    message: &'a str,
}

#[derive(Deserialize)]
struct EndpointReply {
    arn: String,
}

impl HttpGateway {
    pub fn new(relay_url: &str, api_key: Option<String>) -> Result<Self, PushError> {
        let base = Url::parse(relay_url)
            .map_err(|e| PushError::Gateway(format!("bad relay url {relay_url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(PushError::Gateway(format!("bad relay url {relay_url}")));
        }
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PushError::Gateway(e.to_string()))?;
        Ok(Self {
            client,
            base,
            api_key: api_key.filter(|k| !k.is_empty()),
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, PushError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| PushError::Gateway("relay url cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn call(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<serde_json::Value>,
    ) -> Result<String, PushError> {
        let mut req = self.client.request(method, self.url(segments)?);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| PushError::Gateway(e.without_url().to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| PushError::Gateway(e.without_url().to_string()))?;
        if status.is_success() {
            Ok(text)
        } else {
            Err(map_status(status, &text))
        }
    }
}

/// Translate a relay error reply into a [`PushError`].
fn map_status(status: StatusCode, body: &str) -> PushError {
    match status {
        StatusCode::CONFLICT => match serde_json::from_str::<EndpointReply>(body) {
            Ok(reply) => PushError::EndpointExists { arn: reply.arn },
            Err(_) => PushError::Gateway(format!("relay returned {status} without an arn")),
        },
        StatusCode::GONE => PushError::InvalidToken(format!("relay returned {status}")),
        StatusCode::PAYLOAD_TOO_LARGE => PushError::PayloadTooLarge { size: body.len() },
        StatusCode::NOT_FOUND => PushError::NotRegistered,
        StatusCode::FORBIDDEN => PushError::EndpointDisabled,
        _ => PushError::Gateway(format!("relay returned {status}")),
    }
}

#[async_trait]
impl PushGateway for HttpGateway {
    async fn register_endpoint(
        &self,
        service: &str,
        token: &str,
        custom_data: &str,
    ) -> Result<String, PushError> {
        let body = serde_json::to_value(RegisterRequest {
            service,
            token,
            custom_user_data: custom_data,
        })?;
        let text = self.call(Method::POST, &["endpoints"], Some(body)).await?;
        let reply: EndpointReply = serde_json::from_str(&text)?;
        Ok(reply.arn)
    }

    async fn send(&self, arn: &str, message: &str) -> Result<(), PushError> {
        let body = serde_json::to_value(PublishRequest { message })?;
        self.call(Method::POST, &["endpoints", arn, "publish"], Some(body))
            .await?;
        Ok(())
    }

    async fn get_attributes(&self, arn: &str) -> Result<Attributes, PushError> {
        let text = self
            .call(Method::GET, &["endpoints", arn, "attributes"], None)
            .await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn set_attributes(&self, arn: &str, attributes: &Attributes) -> Result<(), PushError> {
        let body = serde_json::to_value(attributes)?;
        self.call(Method::PUT, &["endpoints", arn, "attributes"], Some(body))
            .await?;
        Ok(())
    }

    async fn delete_endpoint(&self, arn: &str) -> Result<(), PushError> {
        self.call(Method::DELETE, &["endpoints", arn], None).await?;
        Ok(())
    }
}
