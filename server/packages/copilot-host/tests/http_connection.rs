use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use copilot_host::connection::{AgentConnection, ConnectionFactory, ConnectionSettings};
use copilot_host::http_connection::HttpConnectionFactory;
use copilot_host::testing::eventually;
use copilot_host::HostError;
use copilot_host_activity_schema::{Activity, ActivityType, ROLE_BOT, ROLE_USER};
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use url::Url;

const TOKEN: &str = "backend-token";

#[derive(Default)]
struct Recorded {
    created: Vec<Value>,
    posted: Vec<(String, Value)>,
    deleted: Vec<String>,
}

#[derive(Clone)]
struct Backend {
    recorded: Arc<Mutex<Recorded>>,
    inbound: broadcast::Sender<String>,
}

impl Backend {
    fn recorded<R>(&self, f: impl FnOnce(&Recorded) -> R) -> R {
        f(&self.recorded.lock().expect("recorded lock"))
    }

    fn push(&self, activity: &Activity) {
        let data = serde_json::to_string(activity).expect("serialize activity");
        self.inbound.send(data).expect("a reader is attached");
    }
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .map_or(false, |value| value == format!("Bearer {TOKEN}"))
}

async fn create_conversation(
    State(backend): State<Backend>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    backend.recorded.lock().expect("lock").created.push(body);
    Json(json!({ "conversationId": "conv-1" })).into_response()
}

async fn post_activity(
    State(backend): State<Backend>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> StatusCode {
    backend.recorded.lock().expect("lock").posted.push((id, body));
    StatusCode::ACCEPTED
}

async fn stream_activities(
    State(backend): State<Backend>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(backend.inbound.subscribe())
        .filter_map(|item| async move { item.ok().map(|data| Ok(Event::default().data(data))) });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_millis(50)))
}

async fn delete_conversation(
    State(backend): State<Backend>,
    Path(id): Path<String>,
) -> StatusCode {
    backend.recorded.lock().expect("lock").deleted.push(id);
    StatusCode::NO_CONTENT
}

async fn spawn_backend() -> (Backend, Url) {
    let (inbound, _rx) = broadcast::channel(16);
    let backend = Backend {
        recorded: Arc::new(Mutex::new(Recorded::default())),
        inbound,
    };
    let app = Router::new()
        .route("/agents/v1/conversations", post(create_conversation))
        .route(
            "/agents/v1/conversations/:id",
            axum::routing::delete(delete_conversation),
        )
        .route(
            "/agents/v1/conversations/:id/activities",
            get(stream_activities).post(post_activity),
        )
        .with_state(backend.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind backend");
    let addr = listener.local_addr().expect("backend addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    let endpoint = Url::parse(&format!("http://{addr}/agents/")).expect("endpoint");
    (backend, endpoint)
}

fn settings(token: &str) -> ConnectionSettings {
    ConnectionSettings {
        token: token.to_string(),
        environment_id: "env-1".to_string(),
        agent_identifier: "cr123_agent".to_string(),
        show_typing: false,
    }
}

#[tokio::test]
async fn opens_a_conversation_and_posts_activities() {
    let (backend, endpoint) = spawn_backend().await;
    let factory = HttpConnectionFactory::new(endpoint);

    let connection = factory.connect(settings(TOKEN)).await.expect("connect");
    backend.recorded(|recorded| {
        assert_eq!(
            recorded.created,
            vec![json!({
                "environmentId": "env-1",
                "agentIdentifier": "cr123_agent",
                "showTyping": false
            })]
        );
    });

    connection
        .send(Activity::message(ROLE_USER, "hello"))
        .await
        .expect("send");
    backend.recorded(|recorded| {
        assert_eq!(recorded.posted.len(), 1);
        assert_eq!(recorded.posted[0].0, "conv-1");
        assert_eq!(recorded.posted[0].1["text"], "hello");
    });
}

#[tokio::test]
async fn rejected_credentials_fail_the_connect() {
    let (_backend, endpoint) = spawn_backend().await;
    let factory = HttpConnectionFactory::new(endpoint);
    let err = factory
        .connect(settings("wrong"))
        .await
        .err()
        .expect("connect should fail");
    assert!(matches!(err, HostError::ConnectionFailed { .. }), "{err}");
}

#[tokio::test]
async fn inbound_activities_arrive_in_order() {
    let (backend, endpoint) = spawn_backend().await;
    let factory = HttpConnectionFactory::new(endpoint);
    let connection = factory.connect(settings(TOKEN)).await.expect("connect");

    let mut activities = connection.activities();
    assert!(eventually(|| backend.inbound.receiver_count() > 0).await);

    backend.push(&Activity::typing(Vec::new()));
    backend.push(&Activity::message(ROLE_BOT, "done"));

    let first = tokio::time::timeout(Duration::from_secs(3), activities.next())
        .await
        .expect("first in time")
        .expect("first activity");
    let second = tokio::time::timeout(Duration::from_secs(3), activities.next())
        .await
        .expect("second in time")
        .expect("second activity");
    assert_eq!(first.activity_type, ActivityType::Typing);
    assert_eq!(second.text(), Some("done"));
    assert!(second.is_from_bot());
}

#[tokio::test]
async fn ending_closes_the_conversation_once() {
    let (backend, endpoint) = spawn_backend().await;
    let factory = HttpConnectionFactory::new(endpoint);
    let connection = factory.connect(settings(TOKEN)).await.expect("connect");

    let mut activities = connection.activities();
    assert!(eventually(|| backend.inbound.receiver_count() > 0).await);

    connection.end();
    connection.end();
    assert!(eventually(|| backend.recorded(|recorded| recorded.deleted.len() == 1)).await);
    assert!(tokio::time::timeout(Duration::from_secs(3), activities.next())
        .await
        .expect("stream ends in time")
        .is_none());

    let err = connection
        .send(Activity::message(ROLE_USER, "too late"))
        .await
        .err()
        .expect("send after end fails");
    assert!(matches!(err, HostError::ConnectionFailed { .. }));
    tokio::time::sleep(Duration::from_millis(50)).await;
    backend.recorded(|recorded| {
        assert_eq!(recorded.deleted, vec!["conv-1".to_string()]);
        assert!(recorded.posted.is_empty());
    });
}
