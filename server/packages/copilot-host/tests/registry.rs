mod common;

use std::sync::Arc;

use copilot_host::registry::CloseOutcome;
use copilot_host::render::BOOTSTRAP_FAILED_MESSAGE;
use copilot_host::session::SessionPhase;
use copilot_host::testing::eventually;
use copilot_host::HostError;

use common::Fixture;

#[tokio::test]
async fn creation_is_capped_and_names_are_never_reused() {
    let fixture = Fixture::new();
    let registry = fixture.registry(2);

    let first = registry
        .create_session(fixture.params.clone())
        .expect("first tab");
    let second = registry
        .create_session(fixture.params.clone())
        .expect("second tab");
    assert!(registry.create_session(fixture.params.clone()).is_none());
    assert_eq!(registry.len(), 2);

    first.bootstrap.await.expect("join").expect("bootstrap");
    second.bootstrap.await.expect("join").expect("bootstrap");

    assert!(matches!(
        registry.close_session(&first.id),
        CloseOutcome::Closed { .. }
    ));
    let third = registry
        .create_session(fixture.params.clone())
        .expect("third tab");
    third.bootstrap.await.expect("join").expect("bootstrap");

    let names = registry
        .list()
        .into_iter()
        .map(|tab| tab.name)
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["Chat 2".to_string(), "Chat 3".to_string()]);
    assert_eq!(fixture.identity.created(), 1);
}

#[tokio::test]
async fn newest_tab_is_active_and_only_it_is_visible() {
    let fixture = Fixture::new();
    let registry = fixture.registry(5);
    let a = registry.create_session(fixture.params.clone()).expect("a");
    let b = registry.create_session(fixture.params.clone()).expect("b");

    assert_eq!(registry.active_id().as_deref(), Some(b.id.as_str()));
    let session_a = registry.session(&a.id).expect("a");
    let session_b = registry.session(&b.id).expect("b");
    assert!(!session_a.target().is_visible());
    assert!(session_b.target().is_visible());

    assert!(registry.switch_active(&a.id));
    assert!(session_a.target().is_visible());
    assert!(!session_b.target().is_visible());

    assert!(!registry.switch_active("tab-99"));
    assert_eq!(registry.active_id().as_deref(), Some(a.id.as_str()));
}

#[tokio::test]
async fn last_tab_cannot_be_closed() {
    let fixture = Fixture::new();
    let registry = fixture.registry(5);
    let only = registry.create_session(fixture.params.clone()).expect("tab");
    only.bootstrap.await.expect("join").expect("bootstrap");

    assert!(matches!(
        registry.close_session(&only.id),
        CloseOutcome::LastSession
    ));
    assert!(matches!(
        registry.close_session("tab-404"),
        CloseOutcome::NotFound
    ));
    assert_eq!(registry.len(), 1);
    assert!(registry.session(&only.id).expect("still there").is_live());
}

#[tokio::test]
async fn closing_the_active_tab_activates_the_neighbor_at_its_index() {
    let fixture = Fixture::new();
    let registry = fixture.registry(5);
    let ids = (0..3)
        .map(|_| registry.create_session(fixture.params.clone()).expect("tab").id)
        .collect::<Vec<_>>();

    registry.switch_active(&ids[1]);
    registry.close_session(&ids[1]);
    assert_eq!(registry.active_id().as_deref(), Some(ids[2].as_str()));

    registry.close_session(&ids[2]);
    assert_eq!(registry.active_id().as_deref(), Some(ids[0].as_str()));
    assert!(registry.session(&ids[0]).expect("remaining").target().is_visible());
}

#[tokio::test]
async fn closing_an_inactive_tab_keeps_the_active_one() {
    let fixture = Fixture::new();
    let registry = fixture.registry(5);
    let a = registry.create_session(fixture.params.clone()).expect("a");
    let b = registry.create_session(fixture.params.clone()).expect("b");
    b.bootstrap.await.expect("join").expect("bootstrap");
    a.bootstrap.await.expect("join").expect("bootstrap");

    registry.close_session(&a.id);
    assert_eq!(registry.active_id().as_deref(), Some(b.id.as_str()));
    assert_eq!(fixture.renderer.mounted(), 1);
    assert_eq!(
        fixture
            .connections
            .connections()
            .iter()
            .filter(|connection| connection.is_ended())
            .count(),
        1
    );
}

#[tokio::test]
async fn rename_rejects_blank_names() {
    let fixture = Fixture::new();
    let registry = fixture.registry(5);
    let tab = registry.create_session(fixture.params.clone()).expect("tab");

    assert_eq!(registry.rename(&tab.id, "  Invoices ").expect("rename"), "Invoices");
    assert_eq!(registry.rename(&tab.id, "   ").expect("rename"), "Invoices");
    assert!(matches!(
        registry.rename("tab-404", "x"),
        Err(HostError::SessionNotFound { .. })
    ));
}

#[tokio::test]
async fn failed_bootstrap_is_isolated_to_its_tab() {
    let fixture = Fixture::new();
    let registry = fixture.registry(5);
    let healthy = registry.create_session(fixture.params.clone()).expect("healthy");
    healthy.bootstrap.await.expect("join").expect("bootstrap");

    fixture.connections.fail_with(HostError::ConnectionFailed {
        message: "backend rejected".to_string(),
    });
    let broken = registry.create_session(fixture.params.clone()).expect("broken");
    assert!(broken.bootstrap.await.expect("join").is_err());

    let broken_session = registry.session(&broken.id).expect("broken session");
    assert_eq!(
        broken_session.target().error().as_deref(),
        Some(BOOTSTRAP_FAILED_MESSAGE)
    );
    assert_eq!(broken_session.phase(), SessionPhase::Idle);
    assert!(registry.session(&healthy.id).expect("healthy").is_live());
    assert_eq!(registry.len(), 2);
}

#[tokio::test]
async fn pending_messages_reach_only_the_active_tab() {
    let fixture = Fixture::new();
    let registry = fixture.registry(5);
    let a = registry.create_session(fixture.params.clone()).expect("a");
    a.bootstrap.await.expect("join").expect("bootstrap");
    let b = registry.create_session(fixture.params.clone()).expect("b");
    b.bootstrap.await.expect("join").expect("bootstrap");

    let connections = fixture.connections.connections();
    let (conn_a, conn_b) = (&connections[0], &connections[1]);

    fixture.host.set_pending_message("to b");
    assert!(eventually(|| conn_b.sent().len() == 1).await);
    assert!(conn_a.sent().is_empty());

    registry.switch_active(&a.id);
    fixture.host.set_pending_message("to a");
    assert!(eventually(|| conn_a.sent().len() == 1).await);
    assert_eq!(conn_b.sent().len(), 1);
    assert_eq!(conn_a.sent()[0].text(), Some("to a"));
}

#[tokio::test]
async fn restart_keeps_membership_and_reuses_tokens() {
    let fixture = Fixture::new();
    let registry = fixture.registry(5);
    let tab = registry.create_session(fixture.params.clone()).expect("tab");
    tab.bootstrap.await.expect("join").expect("bootstrap");

    registry.restart_session(&tab.id).await.expect("restart");

    assert_eq!(registry.ids(), vec![tab.id.clone()]);
    assert_eq!(fixture.connections.connections().len(), 2);
    assert_eq!(fixture.renderer.mounted(), 1);
    assert_eq!(fixture.identity.created(), 1);
    assert!(matches!(
        registry.restart_session("tab-404").await,
        Err(HostError::SessionNotFound { .. })
    ));
}

#[tokio::test]
async fn dispose_all_tears_everything_down() {
    let fixture = Fixture::new();
    let registry = fixture.registry(5);
    for _ in 0..3 {
        let tab = registry.create_session(fixture.params.clone()).expect("tab");
        tab.bootstrap.await.expect("join").expect("bootstrap");
    }

    assert!(registry.dispose_all().is_empty());
    assert!(registry.is_empty());
    assert_eq!(registry.active_id(), None);
    assert_eq!(fixture.renderer.mounted(), 0);
    assert!(fixture
        .connections
        .connections()
        .iter()
        .all(|connection| connection.is_ended()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_leave_the_newest_tab_active() {
    let fixture = Fixture::new();
    let registry = Arc::new(fixture.registry(16));

    let creates = (0..8)
        .map(|_| {
            let registry = registry.clone();
            let params = fixture.params.clone();
            tokio::spawn(async move { registry.create_session(params).map(|tab| tab.id) })
        })
        .collect::<Vec<_>>();
    for create in creates {
        create.await.expect("join").expect("tab");
    }

    let ids = registry.ids();
    assert_eq!(ids.len(), 8);
    assert_eq!(registry.active_id().as_deref(), ids.last().map(String::as_str));
    let visible = ids
        .iter()
        .filter_map(|id| registry.session(id))
        .filter(|session| session.target().is_visible())
        .map(|session| session.id().to_string())
        .collect::<Vec<_>>();
    assert_eq!(visible, vec![ids[7].clone()]);
}
