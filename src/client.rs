use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures::StreamExt;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client as ReqwestClient, Response};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::conversation::Conversation;
use crate::error::{Error, Result};
use crate::keys::Credentials;
use crate::message::{Message, WireMessage};
use crate::observability::{
    CLIENT_CANCELLED, CLIENT_REQUEST_DURATION, CLIENT_REQUEST_ERRORS, CLIENT_REQUESTS,
    STREAM_DELTAS, STREAM_TTFB,
};
use crate::provider::Provider;
use crate::render::Renderer;
use crate::spinner::{self, Spinner};
use crate::sse::{StreamLine, process_sse};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(60);
const INTERRUPT_POLL: Duration = Duration::from_millis(50);

/// How one request/response exchange ended.
#[derive(Debug)]
pub enum Exchange {
    /// The model replied.
    Reply(Message),
    /// The user interrupted the exchange; nothing was produced.
    Cancelled,
    /// The network or the provider failed; the error was already reported.
    Failed(Error),
}

impl Exchange {
    /// The reply, if the exchange produced one.
    pub fn into_reply(self) -> Option<Message> {
        match self {
            Exchange::Reply(message) => Some(message),
            Exchange::Cancelled | Exchange::Failed(_) => None,
        }
    }
}

/// Coarse classification of an HTTP error status, used for logging.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StatusClass {
    /// 401: the key was rejected.
    Unauthorized,
    /// 404: unknown endpoint or model.
    NotFound,
    /// 422: the request body failed validation.
    Unprocessable,
    /// 429: rate limited or out of quota.
    RateLimited,
    /// 503: the provider is overloaded.
    ServiceUnavailable,
    /// Any other 4xx.
    ClientError,
    /// Any other 5xx.
    ServerError,
    /// Anything else at or above 400.
    Other,
}

impl StatusClass {
    /// Classifies an HTTP status code.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => StatusClass::Unauthorized,
            404 => StatusClass::NotFound,
            422 => StatusClass::Unprocessable,
            429 => StatusClass::RateLimited,
            503 => StatusClass::ServiceUnavailable,
            400..=499 => StatusClass::ClientError,
            500..=599 => StatusClass::ServerError,
            _ => StatusClass::Other,
        }
    }

    /// Short human-readable description.
    pub fn description(&self) -> &'static str {
        match self {
            StatusClass::Unauthorized => "unauthorized: check the API key",
            StatusClass::NotFound => "not found: check the model name",
            StatusClass::Unprocessable => "unprocessable request",
            StatusClass::RateLimited => "rate limited or quota exhausted",
            StatusClass::ServiceUnavailable => "service unavailable",
            StatusClass::ClientError => "client error",
            StatusClass::ServerError => "server error",
            StatusClass::Other => "unexpected status",
        }
    }
}

/// Converts an HTTP error status and body into a protocol error.
///
/// Returns `Ok(())` for statuses below 400: there are no errors to report and
/// the caller may extract content.
pub fn check_status(
    provider: Provider,
    status: u16,
    body: &str,
    request_id: Option<String>,
    retry_after: Option<u64>,
) -> std::result::Result<(), Error> {
    if status < 400 {
        return Ok(());
    }
    let class = StatusClass::from_status(status);
    let envelope = provider.parse_error_envelope(body);
    warn!(
        provider = %provider,
        status,
        class = class.description(),
        summary = %envelope.summary,
        "provider returned an error"
    );
    let summary = envelope.summary;
    Err(match class {
        StatusClass::Unauthorized => Error::authentication(summary),
        StatusClass::NotFound => Error::not_found(summary),
        StatusClass::Unprocessable => Error::bad_request(status, summary),
        StatusClass::RateLimited => Error::rate_limit(summary, retry_after),
        StatusClass::ServiceUnavailable => Error::service_unavailable(summary, retry_after),
        StatusClass::ClientError if status == 400 => Error::bad_request(status, summary),
        StatusClass::ServerError if status == 500 => Error::internal_server(summary, request_id),
        _ => Error::api(status, envelope.error_type, summary, request_id),
    })
}

/// Pulls `choices[0].message.content` out of a non-streaming response.
///
/// # Errors
///
/// A body that is not a JSON object violates the caller's contract and yields
/// a validation error; an object without the field path is a malformed
/// response and yields a serialization error.
pub fn extract_content(body: &Value) -> Result<String> {
    let Some(object) = body.as_object() else {
        return Err(Error::validation(
            "response body must be a JSON object",
            Some("body".to_string()),
        ));
    };
    let message = object
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .ok_or_else(|| Error::serialization("response has no choices[0].message", None))?;
    match message.get("content") {
        Some(Value::String(content)) => Ok(content.clone()),
        Some(Value::Null) | None => Ok(String::new()),
        Some(other) => Err(Error::serialization(
            format!("choices[0].message.content is not a string: {other}"),
            None,
        )),
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    stream: bool,
    messages: Vec<WireMessage<'a>>,
}

/// Client for a provider's chat-completions endpoint.
pub struct Client {
    provider: Provider,
    credentials: Credentials,
    client: ReqwestClient,
    base_url: String,
    timeout: Duration,
    stream_timeout: Duration,
    spinner_interval: Option<Duration>,
}

impl Client {
    /// Create a new client for `provider`.
    pub fn new(provider: Provider, credentials: Credentials) -> Result<Self> {
        Self::with_options(provider, credentials, None, None, None)
    }

    /// Create a new client with custom settings.
    ///
    /// `timeout` applies to non-streaming requests (default 30 s) and
    /// `stream_timeout` to streaming ones (default 60 s).
    pub fn with_options(
        provider: Provider,
        credentials: Credentials,
        base_url: Option<String>,
        timeout: Option<Duration>,
        stream_timeout: Option<Duration>,
    ) -> Result<Self> {
        let client = ReqwestClient::builder().build().map_err(|e| {
            Error::http_client(
                format!("Failed to build HTTP client: {e}"),
                Some(Box::new(e)),
            )
        })?;
        let mut base_url = base_url.unwrap_or_else(|| provider.default_base_url().to_string());
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Ok(Self {
            provider,
            credentials,
            client,
            base_url,
            timeout: timeout.unwrap_or(DEFAULT_TIMEOUT),
            stream_timeout: stream_timeout.unwrap_or(DEFAULT_STREAM_TIMEOUT),
            spinner_interval: Some(spinner::DEFAULT_INTERVAL),
        })
    }

    /// Sets the thinking spinner's frame interval; `None` disables it.
    pub fn with_spinner_interval(mut self, interval: Option<Duration>) -> Self {
        self.spinner_interval = interval;
        self
    }

    /// The provider this client talks to.
    pub fn provider(&self) -> Provider {
        self.provider
    }

    /// The chat-completions URL requests are sent to.
    pub fn endpoint(&self) -> String {
        format!("{}chat/completions", self.base_url)
    }

    /// Resolves the API key, reading it from disk on first use only.
    pub fn resolve_key(&self) -> Result<&str> {
        self.credentials.resolve()
    }

    fn headers(&self) -> Result<HeaderMap> {
        let key = self.resolve_key()?;
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("text/event-stream"),
        );
        let bearer = HeaderValue::from_str(&format!("Bearer {key}")).map_err(|_| {
            Error::validation(
                "API key contains characters not allowed in a header",
                Some("key".to_string()),
            )
        })?;
        headers.insert(header::AUTHORIZATION, bearer);
        Ok(headers)
    }

    /// Runs one exchange over `conversation` and reports its outcome.
    ///
    /// Transport and protocol failures are printed through `renderer` and come
    /// back as [`Exchange::Failed`]; the session keeps going. Configuration
    /// errors, malformed responses, and contract violations are returned as
    /// `Err`.
    pub async fn exchange(
        &self,
        model: &str,
        conversation: &Conversation,
        stream: bool,
        renderer: &mut dyn Renderer,
        interrupted: &AtomicBool,
    ) -> Result<Exchange> {
        let result = if stream {
            self.stream(model, conversation, renderer, interrupted).await
        } else {
            self.complete(model, conversation, renderer, interrupted).await
        };
        match result {
            Ok(Some(message)) => Ok(Exchange::Reply(message)),
            Ok(None) => Ok(Exchange::Cancelled),
            Err(err) if err.is_transport() || err.is_protocol() => {
                warn!(provider = %self.provider, error = %err, "exchange failed");
                renderer.print_error(&err.to_string());
                Ok(Exchange::Failed(err))
            }
            Err(err) => Err(err),
        }
    }

    /// Sends a non-streaming request and prints the reply in one piece.
    ///
    /// Returns `Ok(None)` if the user interrupted the request.
    pub async fn complete(
        &self,
        model: &str,
        conversation: &Conversation,
        renderer: &mut dyn Renderer,
        interrupted: &AtomicBool,
    ) -> Result<Option<Message>> {
        let started = Instant::now();
        let Some(response) = self
            .send_request(model, conversation, false, renderer, interrupted)
            .await?
        else {
            return Ok(None);
        };
        let text = response
            .text()
            .await
            .map_err(|e| self.transport_error(e, self.timeout))?;
        CLIENT_REQUEST_DURATION.add(started.elapsed().as_secs_f64());
        let body: Value = serde_json::from_str(&text).map_err(|e| {
            Error::serialization(format!("Failed to parse response: {e}"), Some(Box::new(e)))
        })?;
        let content = extract_content(&body)?;
        renderer.print_text(&content);
        renderer.finish_response();
        Message::reply(self.provider, content, model).map(Some)
    }

    /// Sends a streaming request, printing each fragment as it arrives.
    ///
    /// Returns `Ok(None)` if the user interrupted the request or the stream;
    /// any partial reply is discarded.
    pub async fn stream(
        &self,
        model: &str,
        conversation: &Conversation,
        renderer: &mut dyn Renderer,
        interrupted: &AtomicBool,
    ) -> Result<Option<Message>> {
        let started = Instant::now();
        let Some(response) = self
            .send_request(model, conversation, true, renderer, interrupted)
            .await?
        else {
            return Ok(None);
        };

        let mut lines = pin!(process_sse(response.bytes_stream()));
        let mut reply = String::new();
        loop {
            // An interrupt wins over lines that are already buffered.
            let next = tokio::select! {
                biased;
                _ = wait_for_interrupt(interrupted) => {
                    CLIENT_CANCELLED.click();
                    info!(provider = %self.provider, "stream interrupted by user");
                    renderer.print_interrupted();
                    return Ok(None);
                }
                line = lines.next() => line,
            };
            match next {
                Some(Ok(StreamLine::Delta(fragment))) => {
                    STREAM_DELTAS.click();
                    renderer.print_text(&fragment);
                    reply.push_str(&fragment);
                }
                Some(Ok(StreamLine::Skip)) => {}
                Some(Ok(StreamLine::Done)) | None => break,
                Some(Err(err)) => {
                    CLIENT_REQUEST_ERRORS.click();
                    renderer.finish_response();
                    return Err(err);
                }
            }
        }
        renderer.finish_response();
        CLIENT_REQUEST_DURATION.add(started.elapsed().as_secs_f64());
        debug!(
            provider = %self.provider,
            chars = reply.len(),
            "stream complete"
        );
        Message::reply(self.provider, reply, model).map(Some)
    }

    /// Sends the request and waits for response headers.
    ///
    /// The thinking spinner runs only while waiting. Returns `Ok(None)` when
    /// the user interrupts before the headers arrive.
    async fn send_request(
        &self,
        model: &str,
        conversation: &Conversation,
        stream: bool,
        renderer: &mut dyn Renderer,
        interrupted: &AtomicBool,
    ) -> Result<Option<Response>> {
        let headers = self.headers()?;
        let body = ChatRequest {
            model,
            stream,
            messages: conversation.wire_messages(),
        };
        let timeout = if stream {
            self.stream_timeout
        } else {
            self.timeout
        };
        info!(
            provider = %self.provider,
            model,
            stream,
            messages = body.messages.len(),
            context_tokens = conversation.tokens(),
            "sending chat request"
        );
        CLIENT_REQUESTS.click();
        let request = self
            .client
            .post(self.endpoint())
            .headers(headers)
            .timeout(timeout)
            .json(&body);

        let spinner = match self.spinner_interval {
            Some(interval) if renderer.animate() => Spinner::start(interval, "thinking"),
            _ => Spinner::disabled(),
        };
        let started = Instant::now();
        let outcome = tokio::select! {
            result = request.send() => Some(result),
            _ = wait_for_interrupt(interrupted) => None,
        };
        spinner.stop().await;

        let Some(result) = outcome else {
            CLIENT_CANCELLED.click();
            info!(provider = %self.provider, "request interrupted by user");
            renderer.print_interrupted();
            return Ok(None);
        };
        let response = result.map_err(|e| self.transport_error(e, timeout))?;
        STREAM_TTFB.add(started.elapsed().as_secs_f64());

        if !response.status().is_success() {
            CLIENT_REQUEST_ERRORS.click();
            return Err(self.process_error_response(response).await);
        }
        Ok(Some(response))
    }

    /// Process API response errors and convert to our Error type
    async fn process_error_response(&self, response: Response) -> Error {
        let status = response.status().as_u16();

        let request_id = response
            .headers()
            .get("x-request-id")
            .and_then(|val| val.to_str().ok())
            .map(String::from);

        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|val| val.to_str().ok())
            .and_then(|val| val.parse::<u64>().ok());

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                return Error::http_client(
                    format!("Failed to read error response: {e}"),
                    Some(Box::new(e)),
                );
            }
        };

        match check_status(self.provider, status, &body, request_id, retry_after) {
            Ok(()) => Error::api(status, None, body, None),
            Err(err) => err,
        }
    }

    fn transport_error(&self, e: reqwest::Error, timeout: Duration) -> Error {
        CLIENT_REQUEST_ERRORS.click();
        if e.is_timeout() {
            Error::timeout(
                format!("Request timed out: {e}"),
                Some(timeout.as_secs_f64()),
            )
        } else if e.is_connect() {
            Error::connection(format!("Connection error: {e}"), Some(Box::new(e)))
        } else {
            Error::http_client(format!("Request failed: {e}"), Some(Box::new(e)))
        }
    }
}

/// Resolves once `interrupted` is set.
async fn wait_for_interrupt(interrupted: &AtomicBool) {
    while !interrupted.load(Ordering::Relaxed) {
        tokio::time::sleep(INTERRUPT_POLL).await;
    }
}
