//! End-to-end conversations through a registry tab: agent activities pushed
//! on the mock connection, observed at the renderer and on the wire.

mod common;

use std::sync::Arc;
use std::time::Duration;

use copilot_host::host::{HostField, HostFlag};
use copilot_host::registry::TabRegistry;
use copilot_host::testing::{eventually, MockConnection};
use copilot_host_activity_schema::plan::{PLAN_RECEIVED, PLAN_STEP_TRIGGERED};
use copilot_host_activity_schema::{
    Activity, Entity, ADAPTIVE_CARD_CONTENT_TYPE, CONTEXT_KEY, ENTITY_THOUGHT, ROLE_BOT,
    THOUGHT_STATUS_COMPLETE,
};
use serde_json::{json, Map};

use common::Fixture;

async fn live_tab(fixture: &Fixture) -> (TabRegistry, Arc<MockConnection>) {
    let registry = fixture.registry(5);
    let tab = registry
        .create_session(fixture.params.clone())
        .expect("tab");
    tab.bootstrap.await.expect("join").expect("bootstrap");
    let connection = fixture.connections.last_connection().expect("connection");
    (registry, connection)
}

fn plan_received() -> Activity {
    Activity::event(
        PLAN_RECEIVED,
        json!({
            "planIdentifier": "p1",
            "toolDefinitions": [
                {"identifier": "t1", "llmIdentifierPrefix": "Lookup", "description": "look up record"}
            ]
        }),
    )
}

fn step(thought: &str) -> Activity {
    Activity::event(
        PLAN_STEP_TRIGGERED,
        json!({
            "planIdentifier": "p1",
            "taskDialogId": "cr123_agent.action.t1",
            "thought": thought
        }),
    )
}

fn thought(text: &str) -> Entity {
    Entity {
        entity_type: ENTITY_THOUGHT.to_string(),
        status: Some(THOUGHT_STATUS_COMPLETE.to_string()),
        title: None,
        text: Some(text.to_string()),
        extra: Map::new(),
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn plan_steps_emit_a_single_tool_call_card() {
    let fixture = Fixture::new().with_flags(&[HostFlag::ShowToolCalls]);
    let (registry, connection) = live_tab(&fixture).await;

    connection.push(plan_received());
    connection.push(step("checking ledger"));
    assert!(eventually(|| fixture.renderer.rendered().len() == 1).await);

    connection.push(step("checking ledger again"));
    connection.push(Activity::message(ROLE_BOT, "Record found."));
    assert!(eventually(|| fixture.renderer.rendered().len() == 2).await);

    let rendered = fixture.renderer.rendered();
    let card = &rendered[0];
    assert!(card.is_reasoning());
    let attachments = card.attachments.as_ref().expect("card attachment");
    assert_eq!(attachments[0].content_type, ADAPTIVE_CARD_CONTENT_TYPE);
    let body = attachments[0].content.to_string();
    assert!(body.contains("Lookup"));
    assert!(body.contains("checking ledger"));
    assert!(!body.contains("checking ledger again"));
    assert_eq!(rendered[1].text(), Some("Record found."));

    let session = registry.active_session().expect("active");
    let reasoning = session
        .pipeline()
        .with_plans(|plans| plans.get("p1").map(|plan| plan.tools[0].reasoning.clone()));
    assert_eq!(reasoning.as_deref(), Some("checking ledger again"));
}

#[tokio::test]
async fn tool_calls_stay_hidden_until_enabled() {
    let fixture = Fixture::new();
    let (_registry, connection) = live_tab(&fixture).await;

    connection.push(plan_received());
    connection.push(step("first look"));
    settle().await;
    assert!(fixture.renderer.rendered().is_empty());

    fixture.host.set_flag(HostFlag::ShowToolCalls, true);
    fixture.host.set_flag(HostFlag::ShowThoughts, true);
    connection.push(step("second look"));
    assert!(eventually(|| fixture.renderer.rendered().len() == 1).await);

    let summary = &fixture.renderer.rendered()[0];
    assert!(summary.is_reasoning());
    assert!(summary.attachments.is_none());
    let text = summary.text().expect("summary text");
    assert!(text.starts_with("🔧 **Tool Call**"));
    assert!(text.contains("⚡ **Lookup** — look up record"));
    assert!(text.contains("💭 second look"));
}

#[tokio::test]
async fn thoughts_render_as_tagged_bubbles_and_typing_is_dropped() {
    let fixture = Fixture::new().with_flags(&[HostFlag::ShowThoughts]);
    let (_registry, connection) = live_tab(&fixture).await;

    connection.push(Activity::typing(Vec::new()));
    connection.push(Activity::typing(vec![thought("weighing vendors")]));
    connection.push(Activity::message(ROLE_BOT, "Vendor 1001 is best."));
    assert!(eventually(|| fixture.renderer.rendered().len() == 2).await);

    let rendered = fixture.renderer.rendered();
    assert!(rendered.iter().all(|activity| !activity.is_typing()));
    assert!(rendered[0].is_message());
    assert!(rendered[0].is_reasoning());
    assert_eq!(rendered[0].text(), Some("💭 weighing vendors"));
    assert!(!rendered[1].is_reasoning());
}

#[tokio::test]
async fn reasoning_does_not_answer_a_queued_message() {
    let fixture = Fixture::new().with_flags(&[HostFlag::ShowThoughts]);
    let (_registry, connection) = live_tab(&fixture).await;
    let mut responses = fixture.host.subscribe_responses();

    fixture.host.set_pending_message("which vendor?");
    assert!(eventually(|| connection.sent().len() == 1).await);

    connection.push(Activity::typing(vec![thought("comparing prices")]));
    connection.push(Activity::message(ROLE_BOT, "Vendor 1001."));
    connection.push(Activity::message(ROLE_BOT, "Anything else?"));

    let reply = tokio::time::timeout(Duration::from_secs(2), responses.recv())
        .await
        .expect("reply in time")
        .expect("reply");
    assert_eq!(reply, "Vendor 1001.");
    settle().await;
    assert!(responses.try_recv().is_err());
}

#[tokio::test]
async fn context_rides_along_only_when_enabled() {
    let fixture = Fixture::new();
    fixture.host.set_field(HostField::LegalEntity, "USMF");
    fixture.host.set_field(HostField::TableName, "VendTable");
    let (_registry, connection) = live_tab(&fixture).await;

    fixture.host.set_pending_message("plain");
    assert!(eventually(|| connection.sent().len() == 1).await);
    assert!(connection.sent()[0].channel_data.is_none());

    fixture.host.set_flag(HostFlag::SendContext, true);
    fixture.host.set_pending_message("with context");
    assert!(eventually(|| connection.sent().len() == 2).await);
    let sent = &connection.sent()[1];
    let context = &sent.channel_data.as_ref().expect("channel data")[CONTEXT_KEY];
    assert_eq!(context["legalEntity"], "USMF");
    assert_eq!(context["currentRecord"]["tableName"], "VendTable");
}

#[tokio::test]
async fn closing_a_tab_mid_token_request_never_connects() {
    let fixture = Fixture::new();
    let registry = fixture.registry(5);
    let first = registry
        .create_session(fixture.params.clone())
        .expect("first");
    first.bootstrap.await.expect("join").expect("bootstrap");

    let gate = fixture.identity.hold_tokens();
    let pending = registry
        .create_session(fixture.params.clone())
        .expect("pending");
    assert!(eventually(|| fixture.identity.silent_calls() == 2).await);

    registry.close_session(&pending.id);
    gate.release();
    let result = pending.bootstrap.await.expect("join");
    assert!(matches!(
        result,
        Err(copilot_host::HostError::StaleAttempt { .. })
    ));

    assert_eq!(fixture.connections.settings().len(), 1);
    assert_eq!(fixture.renderer.renders(), 1);
    assert_eq!(registry.active_id().as_deref(), Some(first.id.as_str()));
}

#[tokio::test]
async fn restarting_a_tab_forgets_its_plans() {
    let fixture = Fixture::new().with_flags(&[HostFlag::ShowToolCalls]);
    let (registry, connection) = live_tab(&fixture).await;
    connection.push(plan_received());
    let session = registry.active_session().expect("active");
    assert!(eventually(|| session.pipeline().plan_count() == 1).await);

    registry
        .restart_session(session.id())
        .await
        .expect("restart");
    assert_eq!(session.pipeline().plan_count(), 0);

    let fresh = fixture.connections.last_connection().expect("fresh connection");
    fresh.push(step("orphan step"));
    fresh.push(Activity::message(ROLE_BOT, "after restart"));
    assert!(eventually(|| fixture
        .renderer
        .rendered()
        .iter()
        .any(|activity| activity.text() == Some("after restart")))
    .await);
    assert!(fixture
        .renderer
        .rendered()
        .iter()
        .all(|activity| !activity.is_reasoning()));
}
