use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use doc_rag::config::Config;
use doc_rag::embedding::HashEmbedder;
use doc_rag::llm::{ChatClient, ChatCompletion, RawUsage};
use doc_rag::models::{ConversationTurn, Role};
use doc_rag::prompt::FALLBACK_SYSTEM_PROMPT;
use doc_rag::server::{self, AppState};

/// Answers with a fixed citation and records every message list it receives.
#[derive(Default)]
struct RecordingChat {
    calls: Mutex<Vec<Vec<ConversationTurn>>>,
    fail: bool,
}

impl RecordingChat {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<Vec<ConversationTurn>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatClient for RecordingChat {
    async fn chat(
        &self,
        _model: &str,
        messages: &[ConversationTurn],
        _temperature: f32,
    ) -> Result<ChatCompletion> {
        self.calls.lock().unwrap().push(messages.to_vec());
        if self.fail {
            bail!("upstream model unavailable");
        }
        Ok(ChatCompletion {
            content: "It is an existential test [1].".to_string(),
            usage: Some(RawUsage {
                prompt_tokens: Some(42),
                completion_tokens: Some(7),
                total_tokens: None,
            }),
        })
    }
}

fn test_config(tmp: &TempDir) -> Config {
    let mut config = Config::default();
    config.store.path = tmp.path().join("data/vectors.sqlite");
    config.store.collection = "server_test".to_string();
    config.ingest.data_path = tmp.path().join("raw");
    config.prompts.dir = tmp.path().join("prompts");
    config.retrieval.top_k = 3;
    config
}

async fn spawn(state: AppState) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        server::serve(listener, state).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn start(tmp: &TempDir, chat: Arc<RecordingChat>) -> String {
    let state = AppState::build(&test_config(tmp), Arc::new(HashEmbedder::new(256)), chat).unwrap();
    spawn(state).await
}

async fn upload_and_ingest(client: &reqwest::Client, base: &str, name: &str, body: &str) -> Value {
    let part = reqwest::multipart::Part::bytes(body.as_bytes().to_vec()).file_name(name.to_string());
    let form = reqwest::multipart::Form::new().part("file", part);
    let resp = client
        .post(format!("{}/admin/raw-files/upload-and-ingest", base))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200, "upload of {} failed", name);
    resp.json().await.unwrap()
}

async fn ask(client: &reqwest::Client, base: &str, body: Value) -> (u16, Value) {
    let resp = client
        .post(format!("{}/v1/chat/completions", base))
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

#[tokio::test]
async fn test_health() {
    let tmp = TempDir::new().unwrap();
    let base = start(&tmp, Arc::new(RecordingChat::default())).await;

    let body: Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["default_model"], "gpt-4.1-mini");
    assert_eq!(body["collection"], "server_test");
}

#[tokio::test]
async fn test_chat_rejects_blank_user_and_input() {
    let tmp = TempDir::new().unwrap();
    let chat = Arc::new(RecordingChat::default());
    let base = start(&tmp, chat.clone()).await;
    let client = reqwest::Client::new();

    let (status, body) = ask(&client, &base, json!({ "user": "  ", "input": "hello" })).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "bad_request");
    assert!(body["error"]["message"].as_str().unwrap().contains("user"));

    let (status, body) = ask(&client, &base, json!({ "user": "u1", "input": "\n" })).await;
    assert_eq!(status, 400);
    assert!(body["error"]["message"].as_str().unwrap().contains("input"));

    let (status, body) = ask(&client, &base, json!({ "user": 123, "input": "q" })).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "bad_request");
    assert!(body["error"]["message"].as_str().unwrap().contains("user"));

    let resp = client
        .post(format!("{}/v1/chat/completions", base))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");

    let resp = client
        .post(format!("{}/v1/retrieve", base))
        .json(&json!({ "input": ["q"] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");

    let resp = client
        .get(format!("{}/admin/raw-files?recursive=maybe", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");

    assert!(chat.calls().is_empty());
}

#[tokio::test]
async fn test_history_roles_pass_through_unchanged() {
    let tmp = TempDir::new().unwrap();
    let chat = Arc::new(RecordingChat::default());
    let base = start(&tmp, chat.clone()).await;
    let client = reqwest::Client::new();

    upload_and_ingest(
        &client,
        &base,
        "nietzsche.txt",
        "The eternal return is an existential test.",
    )
    .await;

    let (status, body) = ask(
        &client,
        &base,
        json!({
            "user": "u1",
            "input": "What is the eternal return?",
            "history": [
                { "role": "tool", "content": "x" },
                { "role": "developer", "content": "be brief" }
            ]
        }),
    )
    .await;
    assert_eq!(status, 200, "{}", body);

    let calls = chat.calls();
    assert_eq!(calls.len(), 1);
    let messages = &calls[0];
    assert_eq!(messages.len(), 4);
    assert_eq!(
        messages[1],
        ConversationTurn {
            role: Role::Other("tool".to_string()),
            content: "x".to_string(),
        }
    );
    assert_eq!(messages[2].role, Role::Other("developer".to_string()));
    assert_eq!(messages[2].content, "be brief");
    assert_eq!(messages[3].role, Role::User);
}

#[tokio::test]
async fn test_chat_with_empty_collection_skips_model() {
    let tmp = TempDir::new().unwrap();
    let chat = Arc::new(RecordingChat::default());
    let base = start(&tmp, chat.clone()).await;
    let client = reqwest::Client::new();

    let (status, body) = ask(
        &client,
        &base,
        json!({ "user": "u1", "input": "What is the eternal return?" }),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(
        body["choices"][0]["message"]["content"],
        "No document found for this query."
    );
    assert_eq!(
        body["usage"],
        json!({ "prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0 })
    );
    assert_eq!(body["sources"], json!([]));
    assert!(chat.calls().is_empty());
}

#[tokio::test]
async fn test_upload_ingest_and_answer_with_citations() {
    let tmp = TempDir::new().unwrap();
    let chat = Arc::new(RecordingChat::default());
    let base = start(&tmp, chat.clone()).await;
    let client = reqwest::Client::new();

    let uploaded = upload_and_ingest(
        &client,
        &base,
        "nietzsche.txt",
        "The eternal return is an existential test: to will every moment again, identically.",
    )
    .await;
    assert_eq!(uploaded["saved_as"], "nietzsche.txt");
    assert_eq!(uploaded["chunks"], 1);
    upload_and_ingest(
        &client,
        &base,
        "tropical.txt",
        "Bananas grow in tropical climates and need warm weather.",
    )
    .await;

    let (status, body) = ask(
        &client,
        &base,
        json!({
            "user": " u1 ",
            "input": " What is the eternal return? ",
            "model": "local-model",
            "session_id": "s-1",
            "history": [
                { "role": "user", "content": "Hi" },
                { "role": "assistant", "content": "Hello" }
            ]
        }),
    )
    .await;
    assert_eq!(status, 200, "{}", body);

    assert!(body["id"].as_str().unwrap().starts_with("chatcmpl_"));
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "local-model");
    assert_eq!(body["choices"][0]["index"], 0);
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert_eq!(
        body["choices"][0]["message"]["content"],
        "It is an existential test [1]."
    );
    assert_eq!(
        body["usage"],
        json!({ "prompt_tokens": 42, "completion_tokens": 7, "total_tokens": 0 })
    );

    let sources = body["sources"].as_array().unwrap();
    assert_eq!(sources.len(), 2);
    assert_eq!(sources[0]["ref"], 1);
    assert_eq!(sources[0]["source_file"], "nietzsche.txt");
    assert_eq!(sources[1]["ref"], 2);

    let calls = chat.calls();
    assert_eq!(calls.len(), 1);
    let messages = &calls[0];
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[0], ConversationTurn::system(FALLBACK_SYSTEM_PROMPT));
    assert_eq!(messages[1], ConversationTurn::user("Hi"));
    assert_eq!(messages[2], ConversationTurn::assistant("Hello"));
    assert_eq!(messages[3].role, Role::User);
    let prompt = &messages[3].content;
    assert!(prompt.starts_with("QUESTION:\nWhat is the eternal return?\n\nCONTEXT:\n[1] source_file=nietzsche.txt\n"));
    assert!(prompt.contains("\n\n---\n\n[2] source_file=tropical.txt\n"));
}

#[tokio::test]
async fn test_delete_document_removes_it_from_answers() {
    let tmp = TempDir::new().unwrap();
    let chat = Arc::new(RecordingChat::default());
    let base = start(&tmp, chat.clone()).await;
    let client = reqwest::Client::new();

    upload_and_ingest(&client, &base, "nietzsche.txt", "The eternal return is a test.").await;

    let files: Value = client
        .get(format!("{}/admin/raw-files", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(files["files"][0]["name"], "nietzsche.txt");
    assert_eq!(files["files"][0]["ext"], ".txt");

    let resp = client
        .delete(format!("{}/admin/raw-files/nietzsche.txt", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let deleted: Value = resp.json().await.unwrap();
    assert_eq!(deleted["deleted_file"], "nietzsche.txt");
    assert_eq!(deleted["deleted_embeddings"], 1);
    assert_eq!(deleted["rebuilt"], true);

    let (_, body) = ask(&client, &base, json!({ "user": "u1", "input": "eternal return" })).await;
    assert_eq!(
        body["choices"][0]["message"]["content"],
        "No document found for this query."
    );
    assert!(chat.calls().is_empty());

    let resp = client
        .delete(format!("{}/admin/raw-files/nietzsche.txt", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn test_admin_rejects_bad_paths_and_extensions() {
    let tmp = TempDir::new().unwrap();
    let base = start(&tmp, Arc::new(RecordingChat::default())).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/admin/ingest/..%2Fsecret.txt", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let part = reqwest::multipart::Part::bytes(b"MZ".to_vec()).file_name("tool.exe");
    let form = reqwest::multipart::Form::new().part("file", part);
    let resp = client
        .post(format!("{}/admin/raw-files/upload", base))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"]["message"].as_str().unwrap().contains(".exe"));

    let form = reqwest::multipart::Form::new().text("other", "x");
    let resp = client
        .post(format!("{}/admin/raw-files/upload", base))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_model_failure_is_internal_error() {
    let tmp = TempDir::new().unwrap();
    let chat = Arc::new(RecordingChat::failing());
    let base = start(&tmp, chat.clone()).await;
    let client = reqwest::Client::new();

    upload_and_ingest(&client, &base, "doc.txt", "Some content about testing.").await;
    let (status, body) = ask(&client, &base, json!({ "user": "u1", "input": "testing" })).await;
    assert_eq!(status, 500);
    assert_eq!(body["error"]["code"], "internal");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("upstream model unavailable"));
    assert_eq!(chat.calls().len(), 1);
}

#[tokio::test]
async fn test_api_key_guards_everything_but_health() {
    let tmp = TempDir::new().unwrap();
    let state = AppState::build(
        &test_config(&tmp),
        Arc::new(HashEmbedder::new(64)),
        Arc::new(RecordingChat::default()),
    )
    .unwrap()
    .with_api_key(Some("secret".to_string()));
    let base = spawn(state).await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("{}/health", base)).send().await.unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .post(format!("{}/v1/retrieve", base))
        .json(&json!({ "input": "anything" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "unauthorized");

    let resp = client
        .get(format!("{}/admin/raw-files", base))
        .header("X-API-Key", "wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = client
        .post(format!("{}/v1/retrieve", base))
        .header("X-API-Key", "secret")
        .json(&json!({ "input": "anything" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["chunks"], json!([]));
}

#[tokio::test]
async fn test_retrieve_and_rebuild_endpoints() {
    let tmp = TempDir::new().unwrap();
    let base = start(&tmp, Arc::new(RecordingChat::default())).await;
    let client = reqwest::Client::new();

    upload_and_ingest(&client, &base, "a.txt", "Rust ownership and borrowing.").await;

    let body: Value = client
        .post(format!("{}/v1/retrieve", base))
        .json(&json!({ "input": "ownership" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let chunks = body["chunks"].as_array().unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0]["metadata"]["source_file"], "a.txt");
    assert_eq!(chunks[0]["metadata"]["chunk_index"], 0);
    assert_eq!(chunks[0]["metadata"]["doc_id"].as_str().unwrap().len(), 24);
    assert!(chunks[0]["score"].as_f64().unwrap() > 0.0);

    let resp = client
        .post(format!("{}/admin/rebuild", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .delete(format!("{}/admin/vector/reset", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["deleted"], 1);

    let resp = client
        .post(format!("{}/v1/retrieve", base))
        .json(&json!({ "input": "" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}
