//! End-to-end exchanges against a mock chat-completions server.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use parley::chat::{ChatConfig, ChatSession};
use parley::{
    Client, Conversation, Credentials, Exchange, KeyStore, Message, Provider, Renderer, Storage,
};

#[derive(Default)]
struct RecordingRenderer {
    texts: Vec<String>,
    errors: Vec<String>,
    finished: usize,
    interrupted: usize,
    // Set after the first fragment, like a Ctrl-C mid-reply.
    interrupt_after_text: Option<Arc<AtomicBool>>,
}

impl Renderer for RecordingRenderer {
    fn print_text(&mut self, text: &str) {
        self.texts.push(text.to_string());
        if let Some(flag) = &self.interrupt_after_text {
            flag.store(true, Ordering::Relaxed);
        }
    }

    fn print_error(&mut self, error: &str) {
        self.errors.push(error.to_string());
    }

    fn print_info(&mut self, _info: &str) {}

    fn finish_response(&mut self) {
        self.finished += 1;
    }

    fn print_interrupted(&mut self) {
        self.interrupted += 1;
    }

    fn clear_screen(&mut self) {}
}

fn credentials(provider: Provider) -> Credentials {
    Credentials::new(
        provider,
        Some("test-key".to_string()),
        KeyStore::new("/nonexistent/keys"),
    )
}

fn client(server: &MockServer, provider: Provider) -> Client {
    Client::with_options(
        provider,
        credentials(provider),
        Some(format!("{}/v1/", server.uri())),
        Some(Duration::from_secs(5)),
        Some(Duration::from_secs(5)),
    )
    .unwrap()
}

fn conversation(provider: Provider, text: &str) -> Conversation {
    Conversation::from_messages([
        Message::user(provider, "user", text, provider.default_model()).unwrap(),
    ])
}

fn sse(fragments: &[&str]) -> String {
    let mut body = String::new();
    for fragment in fragments {
        let chunk = json!({"choices": [{"index": 0, "delta": {"content": fragment}}]});
        body.push_str(&format!("data: {chunk}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

async fn request_bodies(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|request| request.body_json().unwrap())
        .collect()
}

#[tokio::test]
async fn streamed_reply_is_printed_per_fragment() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(header("accept", "text/event-stream"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(sse(&["Hel", "lo"]), "text/event-stream"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let provider = Provider::OpenAI;
    let client = client(&server, provider);
    let mut conversation = conversation(provider, "Say hello");
    let mut renderer = RecordingRenderer::default();
    let interrupted = AtomicBool::new(false);

    let outcome = client
        .exchange(
            provider.default_model(),
            &conversation,
            true,
            &mut renderer,
            &interrupted,
        )
        .await
        .unwrap();
    let Exchange::Reply(reply) = outcome else {
        panic!("expected a reply, got {outcome:?}");
    };
    assert_eq!(renderer.texts, vec!["Hel", "lo"]);
    assert_eq!(renderer.finished, 1);
    assert_eq!(reply.content(), "Hello");
    assert_eq!(reply.role(), "assistant");
    assert!(reply.is_reply());

    let before = conversation.tokens();
    conversation.add(reply.clone());
    assert_eq!(conversation.len(), 2);
    assert_eq!(conversation.tokens(), before + u64::from(reply.tokens()));

    let bodies = request_bodies(&server).await;
    assert_eq!(
        bodies[0],
        json!({
            "model": provider.default_model(),
            "stream": true,
            "messages": [{"role": "user", "content": "Say hello"}],
        })
    );
}

#[tokio::test]
async fn stream_ignores_noise_lines() {
    let server = MockServer::start().await;
    let body = concat!(
        ": keep-alive\n\n",
        "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
        "data: not json\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let provider = Provider::Mistral;
    let client = client(&server, provider);
    let mut renderer = RecordingRenderer::default();
    let outcome = client
        .exchange(
            provider.default_model(),
            &conversation(provider, "Hi"),
            true,
            &mut renderer,
            &AtomicBool::new(false),
        )
        .await
        .unwrap();
    assert_eq!(outcome.into_reply().unwrap().content(), "ok");
    assert_eq!(renderer.texts, vec!["ok"]);
}

#[tokio::test]
async fn non_streamed_reply_is_printed_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"stream": false})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-1",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Hi there"},
                "finish_reason": "stop"
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = Provider::OpenAI;
    let client = client(&server, provider);
    let mut renderer = RecordingRenderer::default();
    let outcome = client
        .exchange(
            provider.default_model(),
            &conversation(provider, "Hello"),
            false,
            &mut renderer,
            &AtomicBool::new(false),
        )
        .await
        .unwrap();
    let reply = outcome.into_reply().unwrap();
    assert_eq!(reply.content(), "Hi there");
    assert!(reply.is_reply());
    assert_eq!(renderer.texts, vec!["Hi there"]);
    assert_eq!(renderer.finished, 1);
}

#[tokio::test]
async fn unauthorized_reports_envelope_summary() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": {
                "message": "bad key",
                "type": "invalid_request_error",
                "param": null,
                "code": "invalid_api_key"
            }
        })))
        .mount(&server)
        .await;

    let provider = Provider::OpenAI;
    let client = client(&server, provider);
    let mut conversation = conversation(provider, "Hello");
    let mut renderer = RecordingRenderer::default();
    let outcome = client
        .exchange(
            provider.default_model(),
            &conversation,
            true,
            &mut renderer,
            &AtomicBool::new(false),
        )
        .await
        .unwrap();

    let Exchange::Failed(err) = outcome else {
        panic!("expected a failure, got {outcome:?}");
    };
    assert!(err.is_authentication());
    assert!(renderer.texts.is_empty());
    assert_eq!(renderer.errors.len(), 1);
    assert!(
        renderer.errors[0].contains("bad key: invalid_request_error: invalid_api_key"),
        "{}",
        renderer.errors[0]
    );

    conversation.add(None);
    assert_eq!(conversation.len(), 1);
}

#[tokio::test]
async fn mistral_validation_error_is_a_protocol_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({
            "object": "error",
            "message": "Invalid model: nope",
            "type": "invalid_model",
            "param": null,
            "code": "1500"
        })))
        .mount(&server)
        .await;

    let provider = Provider::Mistral;
    let client = client(&server, provider);
    let mut renderer = RecordingRenderer::default();
    let outcome = client
        .exchange(
            provider.default_model(),
            &conversation(provider, "Hello"),
            false,
            &mut renderer,
            &AtomicBool::new(false),
        )
        .await
        .unwrap();
    let Exchange::Failed(err) = outcome else {
        panic!("expected a failure, got {outcome:?}");
    };
    assert_eq!(err.status_code(), Some(422));
    assert!(renderer.errors[0].contains("Invalid model: nope"));
}

#[tokio::test]
async fn connection_failure_produces_no_message() {
    let provider = Provider::OpenAI;
    let client = Client::with_options(
        provider,
        credentials(provider),
        Some("http://127.0.0.1:1/v1/".to_string()),
        Some(Duration::from_secs(2)),
        Some(Duration::from_secs(2)),
    )
    .unwrap();
    let mut renderer = RecordingRenderer::default();
    let outcome = client
        .exchange(
            provider.default_model(),
            &conversation(provider, "Hello"),
            true,
            &mut renderer,
            &AtomicBool::new(false),
        )
        .await
        .unwrap();
    let Exchange::Failed(err) = outcome else {
        panic!("expected a failure, got {outcome:?}");
    };
    assert!(err.is_transport());
    assert_eq!(renderer.errors.len(), 1);
}

#[tokio::test]
async fn interrupt_cancels_pending_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse(&["late"]), "text/event-stream")
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let provider = Provider::OpenAI;
    let client = client(&server, provider);
    let mut renderer = RecordingRenderer::default();
    let outcome = client
        .exchange(
            provider.default_model(),
            &conversation(provider, "Hello"),
            true,
            &mut renderer,
            &AtomicBool::new(true),
        )
        .await
        .unwrap();
    assert!(matches!(outcome, Exchange::Cancelled));
    assert!(renderer.texts.is_empty());
    assert_eq!(renderer.interrupted, 1);
}

#[tokio::test]
async fn interrupt_mid_stream_discards_partial_reply() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(sse(&["Hel", "lo"]), "text/event-stream"),
        )
        .mount(&server)
        .await;

    let provider = Provider::OpenAI;
    let client = client(&server, provider);
    let interrupted = Arc::new(AtomicBool::new(false));
    let mut renderer = RecordingRenderer {
        interrupt_after_text: Some(interrupted.clone()),
        ..RecordingRenderer::default()
    };
    let mut conversation = conversation(provider, "Say hello");
    let outcome = client
        .exchange(
            provider.default_model(),
            &conversation,
            true,
            &mut renderer,
            &interrupted,
        )
        .await
        .unwrap();
    assert!(matches!(outcome, Exchange::Cancelled), "{outcome:?}");
    assert_eq!(renderer.texts, vec!["Hel"]);
    assert_eq!(renderer.interrupted, 1);
    assert!(renderer.errors.is_empty());

    let before = conversation.tokens();
    conversation.add(outcome.into_reply());
    assert_eq!(conversation.len(), 1);
    assert_eq!(conversation.tokens(), before);
}

#[tokio::test]
async fn slow_provider_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"choices": [{"message": {"content": "late"}}]}))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let provider = Provider::Mistral;
    let client = Client::with_options(
        provider,
        credentials(provider),
        Some(format!("{}/v1/", server.uri())),
        Some(Duration::from_millis(200)),
        Some(Duration::from_millis(200)),
    )
    .unwrap();
    let mut renderer = RecordingRenderer::default();
    let outcome = client
        .exchange(
            provider.default_model(),
            &conversation(provider, "Hello"),
            false,
            &mut renderer,
            &AtomicBool::new(false),
        )
        .await
        .unwrap();
    let Exchange::Failed(err) = outcome else {
        panic!("expected a failure, got {outcome:?}");
    };
    assert!(err.is_timeout(), "{err}");
    assert!(err.is_transport());
    assert!(renderer.texts.is_empty());
    assert_eq!(renderer.errors.len(), 1);
}

#[tokio::test]
async fn malformed_body_is_a_decode_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let provider = Provider::OpenAI;
    let client = client(&server, provider);
    let mut renderer = RecordingRenderer::default();
    let err = client
        .exchange(
            provider.default_model(),
            &conversation(provider, "Hello"),
            false,
            &mut renderer,
            &AtomicBool::new(false),
        )
        .await
        .unwrap_err();
    assert!(err.is_decode(), "{err}");
    assert!(!err.is_protocol());
    assert!(!err.is_transport());
    assert!(renderer.texts.is_empty());
    assert!(renderer.errors.is_empty());
}

#[tokio::test]
async fn missing_key_is_returned_as_error() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let provider = Provider::Mistral;
    let credentials = Credentials::new(provider, None, KeyStore::new(dir.path())).ignore_environment();
    let client = Client::with_options(
        provider,
        credentials,
        Some(format!("{}/v1/", server.uri())),
        None,
        None,
    )
    .unwrap();
    let mut renderer = RecordingRenderer::default();
    let err = client
        .exchange(
            provider.default_model(),
            &conversation(provider, "Hello"),
            true,
            &mut renderer,
            &AtomicBool::new(false),
        )
        .await
        .unwrap_err();
    assert!(err.is_configuration());
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn session_without_context_sends_only_the_latest_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(sse(&["fine"]), "text/event-stream"),
        )
        .expect(2)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let provider = Provider::OpenAI;
    let config = ChatConfig::new(provider).without_context().without_color();
    let mut session = ChatSession::new(
        client(&server, provider),
        config,
        Storage::new(dir.path().join("conversations")),
    )
    .unwrap();
    let mut renderer = RecordingRenderer::default();
    let interrupted = AtomicBool::new(false);

    session.send("first", &mut renderer, &interrupted).await.unwrap();
    assert!(session.conversation().is_empty());
    assert_eq!(session.conversation().tokens(), 0);

    session.send("second", &mut renderer, &interrupted).await.unwrap();
    let bodies = request_bodies(&server).await;
    assert_eq!(
        bodies[1]["messages"],
        json!([{"role": "user", "content": "second"}])
    );
    assert_eq!(session.stats().replies, 2);
}

#[tokio::test]
async fn session_without_context_flushes_after_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "fine"}}]
        })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let provider = Provider::OpenAI;
    let config = ChatConfig::new(provider)
        .without_context()
        .without_stream()
        .without_color();
    let mut session = ChatSession::new(
        client(&server, provider),
        config,
        Storage::new(dir.path().join("conversations")),
    )
    .unwrap();
    let mut renderer = RecordingRenderer::default();
    let interrupted = AtomicBool::new(false);

    let err = session
        .send("first", &mut renderer, &interrupted)
        .await
        .unwrap_err();
    assert!(err.is_decode());
    assert!(session.conversation().is_empty());
    assert_eq!(session.conversation().tokens(), 0);

    let outcome = session.send("second", &mut renderer, &interrupted).await.unwrap();
    assert_eq!(outcome.into_reply().unwrap().content(), "fine");
    let bodies = request_bodies(&server).await;
    assert_eq!(bodies.len(), 2);
    assert_eq!(
        bodies[1]["messages"],
        json!([{"role": "user", "content": "second"}])
    );
    let stats = session.stats();
    assert_eq!((stats.requests, stats.replies, stats.failures), (2, 1, 1));
}

#[tokio::test]
async fn session_without_context_stores_each_exchange() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(sse(&["ok"]), "text/event-stream"),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let storage = Storage::new(dir.path().join("conversations"));
    let provider = Provider::Mistral;
    let config = ChatConfig::new(provider)
        .without_context()
        .with_store()
        .without_color();
    let mut session = ChatSession::new(client(&server, provider), config, storage.clone()).unwrap();
    let mut renderer = RecordingRenderer::default();
    let interrupted = AtomicBool::new(false);

    for text in ["one", "two", "three"] {
        session.send(text, &mut renderer, &interrupted).await.unwrap();
    }
    // All three land within the same second or two; none may be overwritten.
    let files = storage.list().unwrap();
    assert_eq!(files.len(), 3);
    let firsts: Vec<String> = files
        .iter()
        .map(|path| {
            let stored = parley::storage::load(path).unwrap();
            stored.iter().next().unwrap().content().to_string()
        })
        .collect();
    assert_eq!(firsts, vec!["one", "two", "three"]);
}

#[tokio::test]
async fn session_with_context_accumulates() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(sse(&["A", "B"]), "text/event-stream"),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let provider = Provider::Mistral;
    let config = ChatConfig::new(provider).with_store();
    let mut session = ChatSession::new(
        client(&server, provider),
        config,
        Storage::new(dir.path().join("conversations")),
    )
    .unwrap();
    let mut renderer = RecordingRenderer::default();
    let interrupted = AtomicBool::new(false);

    session.send("one", &mut renderer, &interrupted).await.unwrap();
    session.send("two", &mut renderer, &interrupted).await.unwrap();
    assert_eq!(session.conversation().len(), 4);
    let summed: u64 = session
        .conversation()
        .iter()
        .map(|m| u64::from(m.tokens()))
        .sum();
    assert_eq!(session.conversation().tokens(), summed);

    let bodies = request_bodies(&server).await;
    assert_eq!(bodies[1]["messages"].as_array().unwrap().len(), 3);
    assert_eq!(bodies[1]["messages"][1], json!({"role": "assistant", "content": "AB"}));

    let path = session.finish().unwrap().unwrap();
    let stored = parley::storage::load(&path).unwrap();
    assert_eq!(stored.len(), 4);
    assert_eq!(stored.tokens(), summed);
}
