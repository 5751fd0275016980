// SPDX-FileCopyrightText: 2026 Dingflow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end handler tests against a mocked DingTalk API and a scripted
//! completion provider.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tempfile::TempDir;
use tracing_test::traced_test;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use dingflow_agent::handler::{ERROR_REPLY, INTERRUPTED_NOTICE, NEW_SESSION_REPLY};
use dingflow_agent::{DedupStore, HandleOutcome, HandlerSettings, MessageHandler, SessionStore};
use dingflow_core::types::{MessageBody, Quote};
use dingflow_dingtalk::{CardCache, CardEngine, DingTalkClient, Messenger, TokenCache};
use dingflow_resilience::RetryPolicy;
use dingflow_test_utils::fixtures::{account, in_group, message, text_message};
use dingflow_test_utils::{MockProvider, Script};

const STREAMING: &str = "/v1.0/card/streaming";
const INSTANCES: &str = "/v1.0/card/instances";
const CREATE: &str = "/v1.0/card/instances/createAndDeliver";
const DIRECT_SEND: &str = "/v1.0/robot/oToMessages/batchSend";

struct Fixture {
    server: MockServer,
    provider: Arc<MockProvider>,
    handler: MessageHandler,
    _media_dir: TempDir,
}

struct Options {
    card_enabled: bool,
    card_create_ok: bool,
    /// Streaming pushes accepted before the endpoint starts answering 500.
    streaming_ok_pushes: Option<u64>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            card_enabled: true,
            card_create_ok: true,
            streaming_ok_pushes: None,
        }
    }
}

async fn mount_ok(server: &MockServer, verb: &str, route: &str) {
    Mock::given(method(verb))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
        .mount(server)
        .await;
}

async fn fixture(provider: MockProvider, options: Options) -> Fixture {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1.0/oauth2/accessToken"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"accessToken": "tok", "expireIn": 7200})),
        )
        .mount(&server)
        .await;
    if options.card_create_ok {
        mount_ok(&server, "POST", CREATE).await;
    } else {
        Mock::given(method("POST"))
            .and(path(CREATE))
            .respond_with(ResponseTemplate::new(500).set_body_string("unavailable"))
            .mount(&server)
            .await;
    }
    mount_ok(&server, "PUT", INSTANCES).await;
    match options.streaming_ok_pushes {
        None => mount_ok(&server, "PUT", STREAMING).await,
        Some(accepted) => {
            Mock::given(method("PUT"))
                .and(path(STREAMING))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
                .up_to_n_times(accepted)
                .mount(&server)
                .await;
            Mock::given(method("PUT"))
                .and(path(STREAMING))
                .respond_with(ResponseTemplate::new(500).set_body_string("card service down"))
                .mount(&server)
                .await;
        }
    }
    mount_ok(&server, "POST", DIRECT_SEND).await;
    mount_ok(&server, "POST", "/v1.0/robot/groupMessages/send").await;

    let client = Arc::new(DingTalkClient::with_bases(&server.uri(), &server.uri()).unwrap());
    let tokens = Arc::new(TokenCache::new(Arc::clone(&client), RetryPolicy::none()));
    let engine = Arc::new(CardEngine::new(
        Arc::clone(&client),
        Arc::clone(&tokens),
        RetryPolicy::none(),
        "tpl.schema",
    ));
    let cards = Arc::new(CardCache::new(engine));
    let messenger = Messenger::new(client, tokens, RetryPolicy::none());

    let media_dir = TempDir::new().unwrap();
    let settings = HandlerSettings {
        throttle: Duration::from_millis(300),
        session_timeout: Duration::from_secs(1800),
        session_max_age: Duration::from_secs(86_400),
        card_enabled: options.card_enabled,
        media_markers: true,
        media_dir: media_dir.path().to_path_buf(),
        system_instructions: vec!["Be brief.".into()],
    };

    let provider = Arc::new(provider);
    let handler = MessageHandler::new(
        Arc::clone(&provider) as Arc<dyn dingflow_core::CompletionProvider>,
        cards,
        messenger,
        Arc::new(SessionStore::new("dingtalk")),
        Arc::new(DedupStore::new()),
        [Arc::new(account())],
        settings,
    );

    Fixture {
        server,
        provider,
        handler,
        _media_dir: media_dir,
    }
}

async fn bodies(server: &MockServer, route: &str) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.url.path() == route)
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect()
}

async fn pushes(server: &MockServer) -> Vec<(String, bool)> {
    bodies(server, STREAMING)
        .await
        .into_iter()
        .map(|b| {
            (
                b["content"].as_str().unwrap().to_string(),
                b["isFinalize"].as_bool().unwrap(),
            )
        })
        .collect()
}

async fn flow_statuses(server: &MockServer) -> Vec<String> {
    bodies(server, INSTANCES)
        .await
        .into_iter()
        .filter_map(|b| b["cardData"]["cardParamMap"]["flowStatus"].as_str().map(str::to_string))
        .collect()
}

#[tokio::test]
async fn new_session_command_confirms_without_completion() {
    let f = fixture(MockProvider::new(), Options::default()).await;

    let outcome = f
        .handler
        .handle(text_message("m1", "u1", " /NEW "))
        .await
        .unwrap();

    assert_eq!(outcome, HandleOutcome::SessionReset);
    assert_eq!(f.provider.call_count().await, 0);
    assert_eq!(f.handler.sessions().len(), 1);

    let sends = bodies(&f.server, DIRECT_SEND).await;
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0]["msgKey"], "sampleText");
    assert_eq!(sends[0]["userIds"], json!(["staff-u1"]));
    let param: Value = serde_json::from_str(sends[0]["msgParam"].as_str().unwrap()).unwrap();
    assert_eq!(param["content"], NEW_SESSION_REPLY);
    assert!(bodies(&f.server, CREATE).await.is_empty());
}

#[tokio::test]
async fn streamed_reply_drives_card_through_lifecycle() {
    let provider = MockProvider::with_scripts(vec![Script::fragments(["hello ", "world"])]);
    let f = fixture(provider, Options::default()).await;

    let outcome = f.handler.handle(text_message("m1", "u1", "hi")).await.unwrap();
    assert_eq!(outcome, HandleOutcome::Card);

    // The first fragment is pushed at once; the second lands inside the throttle window.
    let pushes = pushes(&f.server).await;
    assert_eq!(
        pushes,
        vec![("hello ".to_string(), false), ("hello world".to_string(), true)]
    );
    // Inputting once, then the trailing Finished status.
    assert_eq!(flow_statuses(&f.server).await, vec!["2", "3"]);
    assert_eq!(bodies(&f.server, CREATE).await.len(), 1);
}

#[tokio::test]
async fn slow_stream_pushes_each_cumulative_text() {
    let provider = MockProvider::with_scripts(vec![Script::fragments(["hello ", "world"])])
        .with_fragment_delay(Duration::from_millis(400));
    let f = fixture(provider, Options::default()).await;

    f.handler.handle(text_message("m1", "u1", "hi")).await.unwrap();

    assert_eq!(
        pushes(&f.server).await,
        vec![
            ("hello ".to_string(), false),
            ("hello world".to_string(), false),
            ("hello world".to_string(), true),
        ]
    );
    let statuses = flow_statuses(&f.server).await;
    assert_eq!(statuses.iter().filter(|s| *s == "2").count(), 1);
}

#[tokio::test]
async fn missing_marker_file_becomes_status_line_without_upload() {
    let reply = r#"Here you go.[DINGTALK_FILE]{"path":"/nonexistent","fileName":"a.txt"}[/DINGTALK_FILE]"#;
    let provider = MockProvider::with_scripts(vec![Script::fragments([reply])]);
    let f = fixture(provider, Options::default()).await;

    f.handler.handle(text_message("m1", "u1", "send the file")).await.unwrap();

    let pushes = pushes(&f.server).await;
    let (intermediate, _) = &pushes[0];
    assert!(!intermediate.contains("DINGTALK_FILE"));
    let (last, finalize) = pushes.last().unwrap();
    assert!(finalize);
    assert!(!last.contains("DINGTALK_FILE"));
    assert!(last.starts_with("Here you go."));
    assert_eq!(last.matches("not found").count(), 1);

    let uploads = f
        .server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.url.path() == "/media/upload")
        .count();
    assert_eq!(uploads, 0);
}

#[tokio::test]
async fn concurrent_duplicates_are_handled_once() {
    let provider = MockProvider::with_scripts(vec![Script::fragments(["ok"])]);
    let f = fixture(provider, Options::default()).await;
    let msg = text_message("same-id", "u1", "hi");

    let (a, b) = tokio::join!(f.handler.handle(msg.clone()), f.handler.handle(msg));
    let mut outcomes = vec![a.unwrap(), b.unwrap()];
    outcomes.sort_by_key(|o| *o == HandleOutcome::Duplicate);

    assert_eq!(outcomes, vec![HandleOutcome::Card, HandleOutcome::Duplicate]);
    assert_eq!(f.provider.call_count().await, 1);
}

#[tokio::test]
async fn falls_back_to_markdown_when_card_creation_fails() {
    let provider = MockProvider::with_scripts(vec![Script::fragments(["## Answer\n", "42"])]);
    let f = fixture(
        provider,
        Options {
            card_create_ok: false,
            ..Default::default()
        },
    )
    .await;

    let outcome = f.handler.handle(text_message("m1", "u1", "q")).await.unwrap();
    assert_eq!(outcome, HandleOutcome::Batched);
    assert!(pushes(&f.server).await.is_empty());

    let sends = bodies(&f.server, DIRECT_SEND).await;
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0]["msgKey"], "sampleMarkdown");
    let param: Value = serde_json::from_str(sends[0]["msgParam"].as_str().unwrap()).unwrap();
    assert_eq!(param["title"], "Answer");
    assert_eq!(param["text"], "## Answer\n42");
}

#[tokio::test]
async fn cards_disabled_uses_batched_mode() {
    let f = fixture(
        MockProvider::with_scripts(vec![Script::fragments(["plain"])]),
        Options {
            card_enabled: false,
            ..Default::default()
        },
    )
    .await;

    let outcome = f.handler.handle(text_message("m1", "u1", "q")).await.unwrap();
    assert_eq!(outcome, HandleOutcome::Batched);
    assert!(bodies(&f.server, CREATE).await.is_empty());
}

#[tokio::test]
async fn interrupted_stream_finalizes_card_with_notice() {
    let provider = MockProvider::with_scripts(vec![Script::interrupted(["partial"], "connection reset")]);
    let f = fixture(provider, Options::default()).await;

    let result = f.handler.handle(text_message("m1", "u1", "hi")).await;
    assert!(result.is_err());

    let (last, finalize) = pushes(&f.server).await.pop().unwrap();
    assert!(finalize);
    assert_eq!(last, format!("partial\n\n{INTERRUPTED_NOTICE}"));
}

#[tokio::test]
async fn failed_push_mid_stream_marks_card_failed() {
    let provider = MockProvider::with_scripts(vec![Script::fragments(["partial", " more"])])
        .with_fragment_delay(Duration::from_millis(400));
    let f = fixture(
        provider,
        Options {
            streaming_ok_pushes: Some(1),
            ..Default::default()
        },
    )
    .await;

    let result = f.handler.handle(text_message("m1", "u1", "hi")).await;
    assert!(result.is_err());

    let pushes = pushes(&f.server).await;
    assert_eq!(pushes[0], ("partial".to_string(), false));
    assert_eq!(pushes[1], ("partial more".to_string(), false));
    let (last, finalize) = pushes.last().unwrap();
    assert!(*finalize);
    assert_eq!(*last, format!("partial more\n\n{INTERRUPTED_NOTICE}"));

    let statuses = flow_statuses(&f.server).await;
    assert_eq!(statuses.first().map(String::as_str), Some("2"));
    assert_eq!(statuses.last().map(String::as_str), Some("5"));
    assert!(!statuses.contains(&"3".to_string()));
}

#[tokio::test]
async fn rejected_completion_aborts_card() {
    let provider = MockProvider::with_scripts(vec![Script::rejected(502)]);
    let f = fixture(provider, Options::default()).await;

    let result = f.handler.handle(text_message("m1", "u1", "hi")).await;
    assert!(result.is_err());

    assert_eq!(pushes(&f.server).await, vec![(ERROR_REPLY.to_string(), true)]);
    assert_eq!(flow_statuses(&f.server).await, vec!["5"]);
}

#[tokio::test]
async fn session_key_is_kept_until_reset() {
    let f = fixture(MockProvider::new(), Options::default()).await;

    f.handler.handle(text_message("m1", "u1", "one")).await.unwrap();
    f.handler.handle(text_message("m2", "u1", "two")).await.unwrap();
    f.handler.handle(text_message("m3", "u1", "/new")).await.unwrap();
    f.handler.handle(text_message("m4", "u1", "three")).await.unwrap();

    let requests = f.provider.requests().await;
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[0].session_key, requests[1].session_key);
    assert_ne!(requests[1].session_key, requests[2].session_key);
    assert!(requests[0].session_key.starts_with("dingtalk:u1:"));
    assert_eq!(requests[0].system_instructions, vec!["Be brief.".to_string()]);
}

#[tokio::test]
async fn quoted_text_is_rendered_into_prompt() {
    let f = fixture(MockProvider::new(), Options::default()).await;
    let msg = message(
        "m1",
        "u1",
        MessageBody::Text {
            text: "what about this?".into(),
            quoted: Some(Quote {
                sender: Some("Alice".into()),
                text: "earlier point".into(),
            }),
        },
    );

    f.handler.handle(msg).await.unwrap();

    let requests = f.provider.requests().await;
    assert_eq!(
        requests[0].user_content,
        "> Alice: earlier point\n\nwhat about this?"
    );
}

#[tokio::test]
async fn picture_is_downloaded_and_referenced() {
    let f = fixture(MockProvider::new(), Options::default()).await;
    Mock::given(method("POST"))
        .and(path("/v1.0/robot/messageFiles/download"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"downloadUrl": format!("{}/signed/pic", f.server.uri())})),
        )
        .mount(&f.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/signed/pic"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0x89, b'P', b'N', b'G']))
        .mount(&f.server)
        .await;

    let msg = message(
        "m1",
        "u1",
        MessageBody::Picture {
            download_code: "dc-1".into(),
        },
    );
    f.handler.handle(msg).await.unwrap();

    let content = f.provider.requests().await[0].user_content.clone();
    let local = content
        .strip_prefix("[Image: ")
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap();
    assert_eq!(std::fs::read(local).unwrap(), vec![0x89, b'P', b'N', b'G']);
}

#[tokio::test]
async fn unrecognized_body_is_ignored() {
    let f = fixture(MockProvider::new(), Options::default()).await;
    let msg = message(
        "m1",
        "u1",
        MessageBody::Unrecognized {
            msgtype: "interactiveCard".into(),
        },
    );

    assert_eq!(f.handler.handle(msg).await.unwrap(), HandleOutcome::Ignored);
    assert_eq!(f.provider.call_count().await, 0);
}

#[tokio::test]
async fn group_messages_address_the_conversation() {
    let f = fixture(MockProvider::new(), Options::default()).await;
    let msg = in_group(text_message("m1", "u1", "hi"), "cid-group");

    f.handler.handle(msg).await.unwrap();

    let created = bodies(&f.server, CREATE).await;
    assert_eq!(created[0]["openSpaceId"], "dtv1.card//IM_GROUP.cid-group");
}

#[tokio::test]
async fn unknown_account_is_rejected() {
    let f = fixture(MockProvider::new(), Options::default()).await;
    let mut msg = text_message("m1", "u1", "hi");
    msg.account_id = "other".into();

    assert!(f.handler.handle(msg).await.is_err());
    assert_eq!(f.provider.call_count().await, 0);
}

#[tokio::test]
async fn sweep_reports_finished_work() {
    let f = fixture(MockProvider::new(), Options::default()).await;
    f.handler.handle(text_message("m1", "u1", "hi")).await.unwrap();

    // Nothing is old enough yet.
    let report = f.handler.sweep();
    assert_eq!(report.sessions, 0);
    assert_eq!(report.dedup, 0);

    f.handler.shutdown_sweep();
    assert!(f.handler.dedup().is_empty());
}

#[tokio::test]
#[traced_test]
async fn logs_never_carry_credentials() {
    let f = fixture(MockProvider::new(), Options::default()).await;
    f.handler.handle(text_message("m1", "u1", "hi")).await.unwrap();

    assert!(logs_contain("card reply finished"));
    assert!(!logs_contain("ding-app-secret"));
}
