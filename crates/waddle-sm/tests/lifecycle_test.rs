//! Connection lifecycle tests: close grace, auth timeout, eviction,
//! stale connection removal and stream moves.

mod common;

use std::sync::Arc;
use std::time::Duration;

use jid::{BareJid, Jid};
use tokio::sync::broadcast;
use tokio::time::timeout;
use waddle_sm::{
    AuthState, Command, Packet, Plugin, PluginPipeline, PluginSettings, ResourceConnection,
    SessionEvent, SessionManagerConfig, StanzaErrorCondition, StopListener, AUTH_TIMEOUT_KEY,
    ERROR_KEY,
};

use common::{command, conn_id, is_command, presence, TestHarness, DEFAULT_TIMEOUT};

fn alice() -> BareJid {
    "alice@localhost".parse().unwrap()
}

async fn next_disconnect(
    events: &mut broadcast::Receiver<SessionEvent>,
    limit: Duration,
) -> SessionEvent {
    timeout(limit, async {
        loop {
            let event = events.recv().await.expect("event bus open");
            if matches!(event, SessionEvent::UserDisconnected { .. }) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for disconnect")
}

async fn wait_closed(conn: &ResourceConnection) {
    timeout(DEFAULT_TIMEOUT, async {
        while conn.state() != AuthState::Closed {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("connection finalized");
}

fn count_disconnects(events: &mut broadcast::Receiver<SessionEvent>) -> usize {
    let mut count = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, SessionEvent::UserDisconnected { .. }) {
            count += 1;
        }
    }
    count
}

#[tokio::test(start_paused = true)]
async fn test_stream_finished_within_grace_finalizes_once() {
    let mut h = TestHarness::with_defaults();
    let conn = h.login("b1", "alice@localhost", "phone").await;
    let mut events = h.router.subscribe();

    h.router.process(command("b1", Command::StreamClosed, &[]));
    assert!(conn.is_closing());
    assert!(h.router.connection(&conn_id("b1")).is_some());

    tokio::time::advance(Duration::from_secs(3)).await;
    h.router.process(command("b1", Command::StreamFinished, &[]));

    let event = next_disconnect(&mut events, DEFAULT_TIMEOUT).await;
    assert_eq!(
        event,
        SessionEvent::UserDisconnected {
            jid: Some(alice()),
            conn_id: conn_id("b1"),
        }
    );

    // Past the end of the grace period nothing finalizes again.
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(count_disconnects(&mut events), 0);
    assert_eq!(h.router.stats().closed_connections, 1);
    assert!(h.router.connection(&conn_id("b1")).is_none());
    assert!(h.router.session(&alice()).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_grace_expiry_finalizes_once() {
    let mut h = TestHarness::with_defaults();
    h.login("c1", "alice@localhost", "phone").await;
    let mut events = h.router.subscribe();

    let closed_at = tokio::time::Instant::now();
    h.router.process(command("c1", Command::StreamClosed, &[]));

    next_disconnect(&mut events, Duration::from_secs(60)).await;
    assert!(closed_at.elapsed() >= Duration::from_secs(10));
    assert!(h.router.connection(&conn_id("c1")).is_none());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(count_disconnects(&mut events), 0);
    assert_eq!(h.router.stats().closed_connections, 1);

    timeout(DEFAULT_TIMEOUT, async {
        while h.auth.logouts().is_empty() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("logout recorded");
    assert_eq!(h.auth.logouts(), vec![alice()]);
}

#[tokio::test]
async fn test_rebinding_resource_evicts_previous_holder() {
    let mut h = TestHarness::with_defaults();
    let old = h.login("e1", "alice@localhost", "phone").await;
    let new = h.login("e2", "alice@localhost", "phone").await;

    let session = h.router.session(&alice()).unwrap();
    let active = session.active_connections();
    assert_eq!(active.len(), 1);
    assert!(Arc::ptr_eq(&active[0], &new));
    assert!(h.router.connection(&conn_id("e1")).is_none());
    assert!(old.is_closing());

    let old_jid = conn_id("e1").into_jid();
    let close = h
        .wait_for(|p| is_command(p, Command::Close) && p.stanza_to() == Some(&old_jid))
        .await;
    assert!(close.command_child("conflict").is_some());
}

#[tokio::test]
async fn test_connection_limit_evicts_oldest() {
    let config = SessionManagerConfig {
        max_user_connections: 1,
        ..Default::default()
    };
    let mut h = TestHarness::new(config, PluginPipeline::new());
    h.login("l1", "alice@localhost", "phone").await;
    h.login("l2", "alice@localhost", "laptop").await;

    let session = h.router.session(&alice()).unwrap();
    assert_eq!(session.len(), 1);
    assert!(h.router.connection(&conn_id("l1")).is_none());

    let old_jid = conn_id("l1").into_jid();
    let close = h
        .wait_for(|p| is_command(p, Command::Close) && p.stanza_to() == Some(&old_jid))
        .await;
    assert!(close.command_child("policy-violation").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_auth_timeout_closes_unauthenticated_stream() {
    let mut h = TestHarness::with_defaults();
    let conn = h.open_stream("f1").await;

    let conn_jid = conn_id("f1").into_jid();
    h.wait_for_within(Duration::from_secs(300), |p| {
        is_command(p, Command::Close) && p.stanza_to() == Some(&conn_jid)
    })
    .await;

    assert!(h.router.connection(&conn_id("f1")).is_none());
    assert!(conn.has_data(AUTH_TIMEOUT_KEY));
    assert_eq!(h.router.stats().auth_timeouts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_authorized_stream_survives_auth_timeout() {
    let mut h = TestHarness::with_defaults();
    h.login("f2", "alice@localhost", "phone").await;

    tokio::time::sleep(Duration::from_secs(300)).await;
    let conn_jid = conn_id("f2").into_jid();
    let closes = h
        .drain()
        .into_iter()
        .filter(|p| is_command(p, Command::Close) && p.stanza_to() == Some(&conn_jid))
        .count();
    assert_eq!(closes, 0);
    assert!(h.router.connection(&conn_id("f2")).is_some());
    assert_eq!(h.router.stats().auth_timeouts, 0);
}

#[tokio::test]
async fn test_sweep_removes_queued_stale_connection() {
    let mut h = TestHarness::with_defaults();
    let conn = h.login("r1", "alice@localhost", "phone").await;

    assert!(h.router.queue_stale(conn.id()));
    assert!(h.router.queue_stale(conn_id("unknown")));
    assert_eq!(h.router.sweep_stale(), 1);

    assert!(h.router.connection(&conn_id("r1")).is_none());
    assert!(h.router.session(&alice()).is_none());
    assert_eq!(h.router.stats().stale_removed, 1);

    timeout(DEFAULT_TIMEOUT, async {
        while h.auth.logouts().is_empty() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("logout recorded");

    // Unknown ids are not carried over to the next sweep.
    assert_eq!(h.router.sweep_stale(), 0);
}

#[tokio::test]
async fn test_failed_connection_check_closes_old_connection() {
    let mut h = TestHarness::with_defaults();
    h.login("k1", "alice@localhost", "phone").await;
    h.login("k2", "alice@localhost", "laptop").await;

    let old_jid = conn_id("k1").into_jid();
    let check = h
        .wait_for(|p| is_command(p, Command::CheckUserConnection) && p.stanza_to() == Some(&old_jid))
        .await;

    let answer = check
        .error_response(StanzaErrorCondition::ItemNotFound, None)
        .unwrap();
    assert_eq!(h.router.process(answer), waddle_sm::RoutingResult::Command);

    assert!(h.router.connection(&conn_id("k1")).is_none());
    assert!(h.router.connection(&conn_id("k2")).is_some());
    assert_eq!(h.router.session(&alice()).unwrap().len(), 1);
}

#[tokio::test]
async fn test_confirmed_connection_check_keeps_connection() {
    let mut h = TestHarness::with_defaults();
    h.login("k3", "alice@localhost", "phone").await;
    h.login("k4", "alice@localhost", "laptop").await;

    let old_jid = conn_id("k3").into_jid();
    let check = h
        .wait_for(|p| is_command(p, Command::CheckUserConnection) && p.stanza_to() == Some(&old_jid))
        .await;
    let answer = check.ok_result(None);
    assert_eq!(h.router.process(answer), waddle_sm::RoutingResult::Command);

    assert!(h.router.connection(&conn_id("k3")).is_some());
    assert_eq!(h.router.session(&alice()).unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_connection_check_closes_old_connection() {
    let mut h = TestHarness::with_defaults();
    let old = h.login("k5", "alice@localhost", "phone").await;
    h.login("k6", "alice@localhost", "laptop").await;

    let old_jid = conn_id("k5").into_jid();
    h.wait_for(|p| is_command(p, Command::CheckUserConnection) && p.stanza_to() == Some(&old_jid))
        .await;

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert!(h.router.connection(&conn_id("k5")).is_some());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(old.state(), AuthState::Closed);
    assert!(h.router.connection(&conn_id("k5")).is_none());
    assert!(h.router.connection(&conn_id("k6")).is_some());
    assert_eq!(h.router.session(&alice()).unwrap().len(), 1);
}

#[tokio::test]
async fn test_stream_move_transfers_session_state() {
    let mut h = TestHarness::with_defaults();
    let old = h.login("m1", "alice@localhost", "phone").await;
    h.router.process(command("m1", Command::StreamClosed, &[]));
    assert!(old.is_closing());

    h.open_stream("m2").await;
    let old_id = conn_id("m1").to_string();
    h.router.process(command(
        "m2",
        Command::StreamMoved,
        &[("old-conn-jid", old_id.as_str()), ("resumption-id", "r-42")],
    ));

    let moved = h.router.connection(&conn_id("m2")).unwrap();
    assert!(Arc::ptr_eq(&moved, &old));
    assert!(moved.is_authorized());
    assert_eq!(moved.resource().as_deref(), Some("phone"));
    assert!(h.router.connection(&conn_id("m1")).is_none());

    let full = "alice@localhost/phone".parse().unwrap();
    let target = h.router.resource_connection(&full).unwrap();
    assert!(Arc::ptr_eq(&target, &old));

    let old_jid = conn_id("m1").into_jid();
    let notice = h
        .wait_for(|p| is_command(p, Command::StreamMoved) && p.stanza_to() == Some(&old_jid))
        .await;
    assert_eq!(notice.command_field("new-conn-jid"), Some(conn_id("m2").to_string()));
}

/// Emits an unavailable presence for every stream that goes away.
struct Goodbye;

impl Plugin for Goodbye {
    fn id(&self) -> &str {
        "goodbye"
    }
}

impl StopListener for Goodbye {
    fn stopped(
        &self,
        conn: &Arc<ResourceConnection>,
        _settings: &PluginSettings,
        results: &mut Vec<Packet>,
    ) {
        let Some(jid) = conn.jid() else {
            return;
        };
        let element = minidom::Element::builder("presence", waddle_sm::ns::CLIENT)
            .attr("from", jid.to_string())
            .attr("type", "unavailable")
            .build();
        if let Ok(packet) = Packet::new(element) {
            results.push(packet);
        }
    }
}

#[tokio::test]
async fn test_stop_listeners_run_on_normal_close() {
    let pipeline = PluginPipeline::new().with_stop_listener(Arc::new(Goodbye));
    let mut h = TestHarness::new(SessionManagerConfig::default(), pipeline);
    h.login("g1", "alice@localhost", "phone").await;

    h.router.process(command("g1", Command::StreamFinished, &[]));
    let goodbye = h
        .wait_for(|p| p.element().attr("type") == Some("unavailable"))
        .await;
    assert_eq!(
        goodbye.stanza_from().map(|j| j.to_string()).as_deref(),
        Some("alice@localhost/phone")
    );
}

#[tokio::test]
async fn test_logout_closes_stream_and_waits_for_finish() {
    let mut h = TestHarness::with_defaults();
    let conn = h.login("o1", "alice@localhost", "phone").await;

    h.router.logout(&conn);
    assert!(h.router.session(&alice()).is_none());
    assert!(conn.is_closing());
    assert!(h.router.connection(&conn_id("o1")).is_some());

    let conn_jid = conn_id("o1").into_jid();
    h.wait_for(|p| is_command(p, Command::Close) && p.stanza_to() == Some(&conn_jid))
        .await;

    h.router.process(command("o1", Command::StreamFinished, &[]));
    wait_closed(&conn).await;
    assert!(h.router.connection(&conn_id("o1")).is_none());
    assert_eq!(h.router.stats().closed_connections, 1);
}

#[tokio::test]
async fn test_logout_leaves_other_resources_online() {
    let mut h = TestHarness::with_defaults();
    let phone = h.login("m1", "alice@localhost", "phone").await;
    let laptop = h.login("m2", "alice@localhost", "laptop").await;
    h.router.set_presence(&phone, &presence(10));
    h.router.set_presence(&laptop, &presence(1));

    h.router.logout(&phone);
    assert_eq!(h.router.session(&alice()).unwrap().len(), 1);
    let bare: Jid = alice().into();
    assert_eq!(h.router.resource_connection(&bare).unwrap().id(), laptop.id());
    let phone_jid: Jid = "alice@localhost/phone".parse().unwrap();
    assert!(h.router.resource_connection(&phone_jid).is_none());

    h.router.process(command("m1", Command::StreamClosed, &[]));
    h.router.process(command("m1", Command::StreamFinished, &[]));
    wait_closed(&phone).await;

    assert!(h.router.connection(&conn_id("m1")).is_none());
    assert!(h.router.connection(&conn_id("m2")).is_some());
    assert_eq!(h.router.session(&alice()).unwrap().len(), 1);
    assert!(h.auth.logouts().is_empty());
}

#[tokio::test]
async fn test_logout_of_finalized_connection_sends_nothing() {
    let mut h = TestHarness::with_defaults();
    let conn = h.login("q1", "alice@localhost", "phone").await;

    h.router.process(command("q1", Command::StreamFinished, &[]));
    wait_closed(&conn).await;
    h.drain();

    h.router.logout(&conn);
    let conn_jid = conn_id("q1").into_jid();
    let sent = h.drain();
    assert!(!sent
        .iter()
        .any(|p| is_command(p, Command::Close) && p.stanza_to() == Some(&conn_jid)));
    assert_eq!(conn.state(), AuthState::Closed);
    assert_eq!(h.router.stats().closed_connections, 1);
}

#[tokio::test]
async fn test_error_key_travels_with_close() {
    let mut h = TestHarness::with_defaults();
    let conn = h.login("o2", "alice@localhost", "phone").await;
    conn.put_data(ERROR_KEY, "system-shutdown".to_string());

    h.router.logout(&conn);
    let conn_jid = conn_id("o2").into_jid();
    let close = h
        .wait_for(|p| is_command(p, Command::Close) && p.stanza_to() == Some(&conn_jid))
        .await;
    assert!(close.command_child("system-shutdown").is_some());
}
