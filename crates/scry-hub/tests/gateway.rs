use reqwest::{Client, Method, StatusCode};
use scry_hub::{router, HubConfig, HubState};
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tempfile::TempDir;

struct Hub {
    base: String,
    state: Arc<HubState>,
    dir: TempDir,
    client: Client,
}

impl Hub {
    async fn start(use_store: bool) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = HubConfig::for_base(dir.path().join("obs"));
        config.transcript_root = dir.path().join("projects");
        config.use_store = use_store;
        fs::create_dir_all(&config.transcript_root).expect("transcript root");

        let state = Arc::new(HubState::new(config).expect("state"));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let app = router(Arc::clone(&state));
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });

        Self {
            base: format!("http://{addr}"),
            state,
            dir,
            client: Client::new(),
        }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    async fn post(&self, body: Value) -> (StatusCode, Value) {
        let response = self
            .client
            .post(format!("{}/events", self.base))
            .json(&body)
            .send()
            .await
            .expect("post");
        let status = response.status();
        (status, response.json().await.expect("json body"))
    }

    async fn get(&self, path_and_query: &str) -> (StatusCode, Value) {
        let response = self
            .client
            .get(format!("{}{path_and_query}", self.base))
            .send()
            .await
            .expect("get");
        let status = response.status();
        (status, response.json().await.unwrap_or(Value::Null))
    }

    async fn session(&self, id: &str) -> Vec<Value> {
        let (status, body) = self.get(&format!("/session?id={id}")).await;
        assert_eq!(status, StatusCode::OK);
        body.as_array().cloned().expect("event array")
    }
}

#[tokio::test]
async fn posted_session_start_reads_back_alone() {
    let hub = Hub::start(false).await;
    let (status, body) = hub
        .post(json!({
            "event_type": "session_start",
            "session_id": "s1",
            "timestamp": 1_771_848_000_000_i64,
            "cwd": "/work/scry",
            "model": "claude-opus"
        }))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["ok"], true);

    let events = hub.session("s1").await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["event_type"], "session_start");
    assert_eq!(events[0]["session_id"], "s1");
    assert_eq!(events[0]["id"], body["id"]);

    let (status, listed) = hub.get("/api/sessions").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed[0]["id"], "s1");
    assert_eq!(listed[0]["project"], "scry");
    assert_eq!(listed[0]["active"], true);
}

#[tokio::test]
async fn dispatch_then_completions_resolve_once() {
    let hub = Hub::start(false).await;
    let (status, _) = hub
        .post(json!({
            "event_type": "tool_start",
            "session_id": "s2",
            "timestamp": 1_000,
            "agent_id": "ag_main",
            "tool_name": "Task",
            "tool_input": {"subagent_type": "explore", "description": "Map the storage layer"}
        }))
        .await;
    assert_eq!(status, StatusCode::CREATED);

    for ts in [2_000, 3_000] {
        let (status, _) = hub
            .post(json!({
                "event_type": "agent_complete",
                "session_id": "s2",
                "timestamp": ts,
                "agent_type": "explore"
            }))
            .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let events = hub.session("s2").await;
    assert_eq!(events.len(), 3);
    let spawned = events[0]["spawns_agent_id"].as_str().expect("spawn id");
    assert!(spawned.starts_with("ag_"));
    assert_eq!(events[0]["agent_spawn_label"], "explore");

    assert_eq!(events[1]["agent_id"], spawned);
    assert_eq!(events[1]["task_description"], "Map the storage layer");
    assert_eq!(events[1]["parent_agent_id"], "ag_main");

    assert_eq!(events[2]["agent_id"], "ag_unknown");
}

#[tokio::test]
async fn malformed_events_are_rejected() {
    let hub = Hub::start(false).await;
    let response = hub
        .client
        .post(format!("{}/events", hub.base))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .expect("post");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let (status, body) = hub.post(json!({"timestamp": 5})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Missing event_type or timestamp");

    let (status, _) = hub.post(json!({"event_type": "session_start"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = hub
        .post(json!({"event_type": "future_kind", "timestamp": 7, "session_id": "s"}))
        .await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn unknown_session_reads_empty() {
    let hub = Hub::start(false).await;
    assert!(hub.session("nope").await.is_empty());
    let (status, body) = hub.get("/session").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn transcript_routes_enforce_the_path_guard() {
    let hub = Hub::start(false).await;
    let project = hub.root().join("projects").join("demo");
    fs::create_dir_all(&project).expect("project dir");
    let transcript = project.join("abc.jsonl");
    fs::write(
        &transcript,
        concat!(
            r#"{"type":"user","message":{"content":"Hello transcript"}}"#,
            "\n",
            r#"{"type":"summary","summary":"Squashed history"}"#,
            "\n"
        ),
    )
    .expect("transcript");
    let root = hub.root().join("projects");
    let root = root.display();

    let (status, _) = hub.get("/transcript").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = hub.get(&format!("/transcript?path={}", transcript.display())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["prompt"], "Hello transcript");

    let (status, _) = hub.get("/transcript?path=/etc/passwd").await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = hub
        .get(&format!("/transcript?path={root}/..%2F..%2F..%2Fetc%2Fpasswd"))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = hub
        .get(&format!("/api/transcript?path={root}/demo/../../outside.jsonl"))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = hub.get(&format!("/transcript?path={root}/demo/missing.jsonl")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = hub
        .get(&format!("/compaction-summary?path={}&index=0", transcript.display()))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["summary"], "Squashed history");

    let (status, _) = hub
        .get(&format!("/compaction-summary?path={}&index=3", transcript.display()))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = hub.get("/subagents").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, body) = hub
        .get(&format!("/subagents?transcript={}", transcript.display()))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn disguised_paths_never_reach_files_outside_the_root() {
    let hub = Hub::start(false).await;
    let outside = hub.root().join("outside");
    fs::create_dir_all(outside.join("deep")).expect("outside");
    fs::write(
        outside.join("secret.jsonl"),
        r#"{"type":"user","message":{"content":"top secret"}}"#,
    )
    .expect("secret");
    let root = hub.root().join("projects");

    let (status, body) = hub
        .get(&format!(
            "/transcript?path={}/..%2Foutside%2Fsecret.jsonl",
            root.display()
        ))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(!body.to_string().contains("top secret"));

    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(outside.join("deep"), root.join("link")).expect("symlink");
        let (status, body) = hub
            .get(&format!(
                "/transcript?path={}/link/../secret.jsonl",
                root.display()
            ))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(!body.to_string().contains("top secret"));

        let (status, _) = hub
            .get(&format!(
                "/compaction-summary?path={}/link%2F..%2Fsecret.jsonl",
                root.display()
            ))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
}

#[tokio::test]
async fn project_memory_and_instructions_are_served() {
    let hub = Hub::start(false).await;
    let memory_dir = hub.root().join("projects").join("-work-app").join("memory");
    fs::create_dir_all(&memory_dir).expect("memory dir");
    fs::write(memory_dir.join("MEMORY.md"), "# Notes\nuse sqlite").expect("memory");

    let (status, _) = hub.get("/api/memory").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = hub.get("/api/memory?project=/work/app").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["content"], "# Notes\nuse sqlite");
    assert_eq!(body["lineCount"], 2);

    let (status, body) = hub.get("/api/memory?project=/work/missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "MEMORY.md not found");

    let (status, body) = hub.get("/api/memory?project=..").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body.get("content").is_none());

    let project = hub.root().join("app");
    fs::create_dir_all(&project).expect("project");
    let url = format!("/api/claude-md?project={}", project.display());
    let (status, body) = hub.get(&url).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["paths"].as_array().map(Vec::len), Some(2));

    fs::write(project.join("CLAUDE.md"), "Run the linters.").expect("claude md");
    let (status, body) = hub.get(&url).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["content"], "Run the linters.");
    assert_eq!(body["lineCount"], 1);
}

#[tokio::test]
async fn reported_transcripts_widen_the_allow_list() {
    let hub = Hub::start(false).await;
    let elsewhere = hub.root().join("elsewhere");
    fs::create_dir_all(&elsewhere).expect("elsewhere");
    let transcript = elsewhere.join("main.jsonl");
    fs::write(&transcript, r#"{"type":"user","message":{"content":"hi"}}"#).expect("write");
    let url = format!("/transcript?path={}", transcript.display());

    let (status, _) = hub.get(&url).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    hub.post(json!({
        "event_type": "session_start",
        "session_id": "s3",
        "timestamp": 1,
        "transcript_path": transcript.display().to_string()
    }))
    .await;

    let (status, body) = hub.get(&url).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["prompt"], "hi");

    let (_, map) = hub.get("/agent-transcripts").await;
    assert_eq!(map["ag_main"], transcript.display().to_string());
}

#[tokio::test]
async fn live_stream_preserves_acceptance_order() {
    let hub = Hub::start(false).await;
    let mut stream = hub
        .client
        .get(format!("{}/events", hub.base))
        .send()
        .await
        .expect("subscribe");
    assert_eq!(stream.status(), StatusCode::OK);

    let mut posted = Vec::new();
    for ts in 1..=3 {
        let (_, body) = hub
            .post(json!({"event_type": "notification", "session_id": "s4", "timestamp": ts}))
            .await;
        posted.push(body["id"].as_str().expect("id").to_string());
    }

    let mut buffer = String::new();
    let mut received = Vec::new();
    while received.len() < posted.len() {
        let chunk = tokio::time::timeout(Duration::from_secs(5), stream.chunk())
            .await
            .expect("stream stalled")
            .expect("chunk")
            .expect("stream ended");
        buffer.push_str(&String::from_utf8_lossy(&chunk));
        received = received_ids(&buffer);
    }
    assert_eq!(received, posted);
}

fn received_ids(buffer: &str) -> Vec<String> {
    buffer
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .filter_map(|data| serde_json::from_str::<Value>(data).ok())
        .filter_map(|event| event["id"].as_str().map(ToString::to_string))
        .collect()
}

#[tokio::test]
async fn health_and_preflight() {
    let hub = Hub::start(false).await;
    let (status, body) = hub.get("/api/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let response = hub
        .client
        .request(Method::OPTIONS, format!("{}/events", hub.base))
        .send()
        .await
        .expect("preflight");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .and_then(|value| value.to_str().ok()),
        Some("*")
    );
}

#[tokio::test]
async fn store_follows_accepted_events() {
    let hub = Hub::start(true).await;
    for body in [
        json!({"event_type": "session_start", "session_id": "s5", "timestamp": 1_000, "cwd": "/work/app"}),
        json!({"event_type": "user_prompt", "session_id": "s5", "timestamp": 2_000, "prompt_text": "ship the release"}),
        json!({"event_type": "tool_start", "session_id": "s5", "timestamp": 3_000, "tool_name": "Bash", "tool_use_id": "toolu_1"}),
    ] {
        let (status, _) = hub.post(body).await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let store = hub.state.store().expect("store configured");
    let store = store.lock().unwrap_or_else(PoisonError::into_inner);
    let session = store.session("s5").expect("query").expect("session row");
    assert_eq!(session.project.as_deref(), Some("app"));
    assert_eq!(session.first_prompt.as_deref(), Some("ship the release"));
    assert_eq!(session.tool_call_count, 1);
    assert_eq!(store.search_sessions("release", 10).expect("search").len(), 1);
}
