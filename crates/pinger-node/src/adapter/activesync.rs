use super::{AdapterError, MailAdapter, PollOutcome, redact_user};
use async_trait::async_trait;
use pinger::mail_info::MailPingInformation;
use reqwest::header::{
    ACCEPT, ACCEPT_ENCODING, ACCEPT_LANGUAGE, CONNECTION, HeaderMap, HeaderName, HeaderValue,
};
use reqwest::{Client, Proxy, StatusCode, Url};
use std::error::Error as _;
use std::time::Duration;
use zeroize::Zeroizing;

/// Read limit for a 200 reply when neither reply blob is known.
const DEFAULT_MAX_RESPONSE: usize = 10 * 1024;
/// Non-200 replies are only read far enough to log them.
const ERROR_BODY_LIMIT: usize = 1024;

/// ActiveSync long-poll over HTTPS: each poll POSTs the client's Ping (or
/// Sync) request and compares the reply with the blobs the client supplied.
pub struct ActiveSyncAdapter {
    url: Url,
    headers: HeaderMap,
    username: Zeroizing<String>,
    password: Zeroizing<String>,
    request_data: Zeroizing<Vec<u8>>,
    expected_reply: Zeroizing<Vec<u8>>,
    no_change_reply: Zeroizing<Vec<u8>>,
    is_sync_request: bool,
    timeout: Option<Duration>,
    proxy: Option<String>,
    client: Option<Client>,
}

impl ActiveSyncAdapter {
    pub fn new(info: &MailPingInformation, proxy: Option<&str>) -> Result<Self, AdapterError> {
        let url = Url::parse(&info.mail_server_url)
            .map_err(|e| AdapterError::Fatal(format!("bad mail server url: {e}")))?;
        Ok(Self {
            url,
            headers: request_headers(info)?,
            username: Zeroizing::new(info.mail_server_credentials.username.clone()),
            password: Zeroizing::new(info.mail_server_credentials.password.clone()),
            request_data: Zeroizing::new(info.request_data.clone()),
            expected_reply: Zeroizing::new(info.expected_reply.clone()),
            no_change_reply: Zeroizing::new(info.no_change_reply.clone()),
            is_sync_request: info.is_sync_request,
            timeout: request_timeout(info.response_timeout),
            proxy: proxy.map(str::to_string),
            client: None,
        })
    }

    fn max_response_size(&self) -> usize {
        match self.expected_reply.len().max(self.no_change_reply.len()) {
            0 => DEFAULT_MAX_RESPONSE,
            n => n,
        }
    }

    fn log_url(&self) -> &str {
        self.url.as_str().split('?').next().unwrap_or_default()
    }
}

/// The client's headers minus `Accept-Encoding`, plus defaults for
/// `Accept`, `Accept-Language` and `Connection` when missing.
fn request_headers(info: &MailPingInformation) -> Result<HeaderMap, AdapterError> {
    let mut headers = HeaderMap::new();
    for (name, value) in &info.http_headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| AdapterError::Fatal(format!("bad header name {name:?}: {e}")))?;
        if name == ACCEPT_ENCODING {
            continue;
        }
        let value = HeaderValue::from_str(value)
            .map_err(|e| AdapterError::Fatal(format!("bad value for header {name}: {e}")))?;
        headers.append(name, value);
    }
    for (name, default) in [
        (ACCEPT, "*/*"),
        (ACCEPT_LANGUAGE, "en-us"),
        (CONNECTION, "keep-alive"),
    ] {
        headers
            .entry(name)
            .or_insert(HeaderValue::from_static(default));
    }
    Ok(headers)
}

/// The server holds a Ping open for `response_timeout`; give it 10% more so
/// the client does not give up first. Zero means requests never time out.
fn request_timeout(response_timeout_ms: u64) -> Option<Duration> {
    match response_timeout_ms {
        0 => None,
        ms => Some(Duration::from_millis(ms.saturating_add(ms / 10))),
    }
}

/// Map a mail-server reply to a poll outcome.
fn classify_reply(
    status: StatusCode,
    body: &[u8],
    expected_reply: &[u8],
    no_change_reply: &[u8],
    is_sync_request: bool,
) -> Result<PollOutcome, AdapterError> {
    if status == StatusCode::UNAUTHORIZED {
        return Ok(PollOutcome::ReRegister);
    }
    if status != StatusCode::OK {
        return Err(AdapterError::Transient(format!("mail server returned {status}")));
    }
    if is_sync_request {
        return Ok(if body.is_empty() {
            PollOutcome::NoChange
        } else {
            PollOutcome::NewMail
        });
    }
    if !no_change_reply.is_empty() && body == no_change_reply {
        return Ok(PollOutcome::NoChange);
    }
    if expected_reply.is_empty() || body == expected_reply {
        return Ok(PollOutcome::NewMail);
    }
    Err(AdapterError::Transient(format!(
        "unhandled reply of {} bytes",
        body.len()
    )))
}

/// A vanished host or an untrusted certificate will not fix itself; anything
/// else is retried.
fn classify_transport(message: &str) -> AdapterError {
    let lower = message.to_ascii_lowercase();
    let message = redact_user(message);
    let no_such_host = [
        "dns error",
        "failed to lookup address",
        "no such host",
        "name or service not known",
    ];
    let unknown_ca = [
        "unknownissuer",
        "unknown issuer",
        "unknown certificate authority",
    ];
    if no_such_host
        .iter()
        .chain(unknown_ca.iter())
        .any(|p| lower.contains(p))
    {
        AdapterError::ReRegister(message)
    } else {
        AdapterError::Transient(message)
    }
}

/// `error: cause: cause ...`, so classification sees the root cause.
fn error_chain(e: &reqwest::Error) -> String {
    let mut text = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

async fn read_capped(resp: &mut reqwest::Response, limit: usize) -> Result<Vec<u8>, reqwest::Error> {
    let mut body = Vec::new();
    while body.len() < limit {
        let Some(chunk) = resp.chunk().await? else {
            break;
        };
        let take = chunk.len().min(limit - body.len());
        body.extend_from_slice(&chunk[..take]);
    }
    Ok(body)
}

#[async_trait]
impl MailAdapter for ActiveSyncAdapter {
    async fn connect(&mut self) -> Result<(), AdapterError> {
        let mut builder = Client::builder();
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        builder = match &self.proxy {
            Some(proxy) => builder.proxy(
                Proxy::all(proxy.as_str())
                    .map_err(|e| AdapterError::Fatal(format!("bad PINGER_PROXY: {e}")))?,
            ),
            None => builder.no_proxy(),
        };
        let client = builder
            .build()
            .map_err(|e| AdapterError::Fatal(format!("http client: {e}")))?;
        tracing::debug!(url = %self.log_url(), timeout = ?self.timeout, "activesync client ready");
        self.client = Some(client);
        Ok(())
    }

    async fn poll(&mut self) -> Result<PollOutcome, AdapterError> {
        let Some(client) = &self.client else {
            return Err(AdapterError::Fatal("poll before connect".to_string()));
        };
        let mut req = client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .body(self.request_data.to_vec());
        if !self.username.is_empty() && !self.password.is_empty() {
            req = req.basic_auth(self.username.as_str(), Some(self.password.as_str()));
        }

        let mut resp = req
            .send()
            .await
            .map_err(|e| classify_transport(&error_chain(&e.without_url())))?;
        let status = resp.status();
        let limit = if status == StatusCode::OK {
            self.max_response_size()
        } else {
            ERROR_BODY_LIMIT
        };
        let body = read_capped(&mut resp, limit)
            .await
            .map_err(|e| AdapterError::Transient(redact_user(&error_chain(&e.without_url()))))?;
        tracing::debug!(%status, size = body.len(), "activesync reply");

        classify_reply(
            status,
            &body,
            &self.expected_reply,
            &self.no_change_reply,
            self.is_sync_request,
        )
    }

    async fn release(&mut self) {
        self.client = None;
    }
}
