//! Routing tests: resource selection, processor dispatch and error synthesis.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use minidom::Element;
use tokio::sync::{mpsc, Notify};
use tokio_test::{assert_err, assert_ok};
use waddle_sm::{
    ns, Authorization, Concurrency, OutputFilter, Packet, Plugin, PluginPipeline, PluginSettings,
    Preprocessor, ProcessContext, Processor, ResourceConnection, RoutingResult,
    SessionManagerConfig, StanzaErrorCondition, StanzaKind, StanzaType, XmppError,
};

use common::{conn_id, error_condition, iq, message, presence, TestHarness};

const ECHO_NS: &str = "urn:example:echo";
const DENIED_NS: &str = "urn:example:denied";
const PANIC_NS: &str = "urn:example:panic";
const TINY_NS: &str = "urn:example:tiny";

fn query_ns(packet: &Packet) -> Option<String> {
    packet
        .element()
        .children()
        .find(|c| c.name() == "query")
        .map(|c| c.ns())
}

/// Answers iq queries in its namespace with an empty result.
struct EchoProcessor;

impl Plugin for EchoProcessor {
    fn id(&self) -> &str {
        "echo"
    }
}

#[async_trait]
impl Processor for EchoProcessor {
    fn can_handle(&self, packet: &Packet, _conn: Option<&ResourceConnection>) -> Option<Authorization> {
        (query_ns(packet).as_deref() == Some(ECHO_NS)).then_some(Authorization::Authorized)
    }

    async fn process(
        &self,
        packet: &Packet,
        _conn: Option<&Arc<ResourceConnection>>,
        _ctx: &ProcessContext<'_>,
        results: &mut Vec<Packet>,
    ) -> Result<(), XmppError> {
        results.push(packet.ok_result(None));
        Ok(())
    }
}

/// Echo processor asking for an empty queue layout.
struct TinyProcessor;

impl Plugin for TinyProcessor {
    fn id(&self) -> &str {
        "tiny"
    }
}

#[async_trait]
impl Processor for TinyProcessor {
    fn can_handle(&self, packet: &Packet, _conn: Option<&ResourceConnection>) -> Option<Authorization> {
        (query_ns(packet).as_deref() == Some(TINY_NS)).then_some(Authorization::Authorized)
    }

    async fn process(
        &self,
        packet: &Packet,
        _conn: Option<&Arc<ResourceConnection>>,
        _ctx: &ProcessContext<'_>,
        results: &mut Vec<Packet>,
    ) -> Result<(), XmppError> {
        results.push(packet.ok_result(None));
        Ok(())
    }

    fn concurrency(&self) -> Option<Concurrency> {
        Some(Concurrency {
            queues: 0,
            queue_depth: 0,
        })
    }
}

/// Refuses iq queries in its namespace.
struct DenyingProcessor;

impl Plugin for DenyingProcessor {
    fn id(&self) -> &str {
        "denier"
    }
}

#[async_trait]
impl Processor for DenyingProcessor {
    fn can_handle(&self, packet: &Packet, _conn: Option<&ResourceConnection>) -> Option<Authorization> {
        (query_ns(packet).as_deref() == Some(DENIED_NS))
            .then_some(Authorization::Denied(StanzaErrorCondition::Forbidden))
    }

    async fn process(
        &self,
        _packet: &Packet,
        _conn: Option<&Arc<ResourceConnection>>,
        _ctx: &ProcessContext<'_>,
        _results: &mut Vec<Packet>,
    ) -> Result<(), XmppError> {
        Ok(())
    }
}

struct PanickingProcessor;

impl Plugin for PanickingProcessor {
    fn id(&self) -> &str {
        "panicker"
    }
}

#[async_trait]
impl Processor for PanickingProcessor {
    fn can_handle(&self, packet: &Packet, _conn: Option<&ResourceConnection>) -> Option<Authorization> {
        (query_ns(packet).as_deref() == Some(PANIC_NS)).then_some(Authorization::Authorized)
    }

    async fn process(
        &self,
        _packet: &Packet,
        _conn: Option<&Arc<ResourceConnection>>,
        _ctx: &ProcessContext<'_>,
        _results: &mut Vec<Packet>,
    ) -> Result<(), XmppError> {
        panic!("processor bug");
    }
}

/// Takes every message and holds its single worker until released.
struct BlockingProcessor {
    started: mpsc::UnboundedSender<()>,
    release: Arc<Notify>,
}

impl Plugin for BlockingProcessor {
    fn id(&self) -> &str {
        "blocking"
    }
}

#[async_trait]
impl Processor for BlockingProcessor {
    fn can_handle(&self, packet: &Packet, _conn: Option<&ResourceConnection>) -> Option<Authorization> {
        (packet.kind() == StanzaKind::Message).then_some(Authorization::Authorized)
    }

    async fn process(
        &self,
        _packet: &Packet,
        _conn: Option<&Arc<ResourceConnection>>,
        _ctx: &ProcessContext<'_>,
        _results: &mut Vec<Packet>,
    ) -> Result<(), XmppError> {
        let _ = self.started.send(());
        self.release.notified().await;
        Ok(())
    }

    fn concurrency(&self) -> Option<Concurrency> {
        Some(Concurrency::new(1, 1))
    }
}

/// Stops messages addressed to `blocked@localhost`.
struct BlockList;

impl Plugin for BlockList {
    fn id(&self) -> &str {
        "block-list"
    }
}

impl Preprocessor for BlockList {
    fn preprocess(
        &self,
        packet: &Packet,
        _conn: Option<&Arc<ResourceConnection>>,
        _settings: &PluginSettings,
        _results: &mut Vec<Packet>,
    ) -> bool {
        packet
            .stanza_to()
            .is_some_and(|to| to.to_bare().to_string() == "blocked@localhost")
    }
}

/// Drops results whose id is `drop-me`.
struct DropFilter;

impl Plugin for DropFilter {
    fn id(&self) -> &str {
        "drop-filter"
    }
}

impl OutputFilter for DropFilter {
    fn filter(
        &self,
        _packet: Option<&Packet>,
        _conn: Option<&Arc<ResourceConnection>>,
        results: &mut Vec<Packet>,
    ) {
        results.retain(|p| p.id() != Some("drop-me"));
    }
}

fn pipeline() -> PluginPipeline {
    PluginPipeline::new()
        .with_preprocessor(Arc::new(BlockList))
        .with_processor(Arc::new(EchoProcessor))
        .with_processor(Arc::new(DenyingProcessor))
        .with_processor(Arc::new(PanickingProcessor))
        .with_filter(Arc::new(DropFilter))
}

fn harness() -> TestHarness {
    TestHarness::new(SessionManagerConfig::default(), pipeline())
}

#[tokio::test]
async fn test_bare_jid_routes_to_highest_priority() {
    let mut h = harness();
    let phone = h.login("a1", "alice@localhost", "phone").await;
    let laptop = h.login("a2", "alice@localhost", "laptop").await;
    h.router.set_presence(&phone, &presence(5));
    h.router.set_presence(&laptop, &presence(10));

    let alice = "alice@localhost".parse().unwrap();
    let target = h.router.resource_connection(&alice).unwrap();
    assert_eq!(target.id(), laptop.id());

    // A full JID still reaches its own resource.
    let full = "alice@localhost/phone".parse().unwrap();
    assert_eq!(h.router.resource_connection(&full).unwrap().id(), phone.id());

    h.login("b1", "bob@localhost", "desk").await;
    let result = h.send_from("b1", message("alice@localhost", "hi"));
    assert!(matches!(result, RoutingResult::Dispatched { .. }));

    // The first pass forwards the message out with bob's address stamped on it.
    let outgoing = h
        .wait_for(|p| p.kind() == StanzaKind::Message && p.packet_to().is_none())
        .await;
    assert_eq!(
        outgoing.stanza_from().map(|j| j.to_string()).as_deref(),
        Some("bob@localhost/desk")
    );

    // Coming back in, it is delivered to alice's preferred connection.
    h.router.process(outgoing);
    let laptop_id = laptop.id();
    let delivered = h
        .wait_for(|p| p.kind() == StanzaKind::Message && p.packet_to() == Some(&laptop_id))
        .await;
    assert!(delivered.element().get_child("body", ns::CLIENT).is_some());
}

#[tokio::test]
async fn test_saturated_queue_answers_resource_constraint() {
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let release = Arc::new(Notify::new());
    let pipeline = PluginPipeline::new().with_processor(Arc::new(BlockingProcessor {
        started: started_tx,
        release: release.clone(),
    }));
    let mut h = TestHarness::new(SessionManagerConfig::default(), pipeline);
    let conn = h.login("d1", "alice@localhost", "phone").await;

    let first = h.send_from("d1", message("bob@example.com", "1"));
    assert_eq!(
        first,
        RoutingResult::Dispatched {
            processors: vec!["blocking".to_string()]
        }
    );
    started_rx.recv().await.unwrap();

    // The worker is busy; the next message fills the queue.
    let second = h.send_from("d1", message("bob@example.com", "2"));
    assert!(matches!(second, RoutingResult::Dispatched { .. }));

    let third = h.send_from("d1", message("bob@example.com", "3"));
    assert_eq!(
        third,
        RoutingResult::Rejected {
            condition: StanzaErrorCondition::ResourceConstraint
        }
    );

    let conn_id = conn.id();
    let error = h
        .wait_for(|p| p.is_error() && p.packet_to() == Some(&conn_id))
        .await;
    assert_eq!(error_condition(&error).as_deref(), Some("resource-constraint"));
    assert_eq!(
        error.stanza_to().map(|j| j.to_string()).as_deref(),
        Some("alice@localhost/phone")
    );

    let stats = h.router.stats();
    let pool = stats.pools.iter().find(|p| p.name == "blocking").unwrap();
    assert_eq!(pool.dropped, 1);
    assert!(stats.errors_synthesized >= 1);

    release.notify_waiters();
}

#[tokio::test]
async fn test_processor_result_reaches_sender() {
    let mut h = harness();
    let conn = h.login("p1", "alice@localhost", "phone").await;

    let result = h.send_from("p1", iq("localhost", "echo-1", ECHO_NS));
    assert_eq!(
        result,
        RoutingResult::Dispatched {
            processors: vec!["echo".to_string()]
        }
    );

    let conn_id = conn.id();
    let reply = h
        .wait_for(|p| p.id() == Some("echo-1") && p.packet_to() == Some(&conn_id))
        .await;
    assert_eq!(reply.stanza_type(), Some(StanzaType::Result));
}

#[tokio::test]
async fn test_empty_declared_concurrency_gets_one_queue() {
    let pipeline = PluginPipeline::new().with_processor(Arc::new(TinyProcessor));
    let mut h = TestHarness::new(SessionManagerConfig::default(), pipeline);
    let conn = h.login("z1", "alice@localhost", "phone").await;

    let pool = h
        .router
        .stats()
        .pools
        .into_iter()
        .find(|p| p.name == "tiny")
        .unwrap();
    assert_eq!((pool.queues, pool.queue_depth), (1, 1));

    h.send_from("z1", iq("localhost", "tiny-1", TINY_NS));
    let conn_id = conn.id();
    let reply = h
        .wait_for(|p| p.id() == Some("tiny-1") && p.packet_to() == Some(&conn_id))
        .await;
    assert_eq!(reply.stanza_type(), Some(StanzaType::Result));
}

#[tokio::test]
async fn test_output_filter_drops_results() {
    let mut h = harness();
    h.login("f1", "alice@localhost", "phone").await;

    h.send_from("f1", iq("localhost", "drop-me", ECHO_NS));
    h.send_from("f1", iq("localhost", "keep", ECHO_NS));

    // Both items run on the same queue, so "drop-me" would arrive first.
    let reply = h
        .wait_for(|p| {
            assert_ne!(p.id(), Some("drop-me"), "filtered result was delivered");
            p.id() == Some("keep")
        })
        .await;
    assert_eq!(reply.stanza_type(), Some(StanzaType::Result));
}

#[tokio::test]
async fn test_unhandled_iq_gets_feature_not_implemented() {
    let mut h = harness();
    let conn = h.login("u1", "alice@localhost", "phone").await;

    let result = h.send_from("u1", iq("localhost", "q1", "urn:example:unknown"));
    assert_eq!(
        result,
        RoutingResult::Rejected {
            condition: StanzaErrorCondition::FeatureNotImplemented
        }
    );

    let conn_id = conn.id();
    let error = h
        .wait_for(|p| p.id() == Some("q1") && p.packet_to() == Some(&conn_id))
        .await;
    assert_eq!(error_condition(&error).as_deref(), Some("feature-not-implemented"));
}

#[tokio::test]
async fn test_denied_packet_reports_processor_condition() {
    let mut h = harness();
    h.login("n1", "alice@localhost", "phone").await;

    let result = h.send_from("n1", iq("localhost", "deny-1", DENIED_NS));
    assert_eq!(
        result,
        RoutingResult::Rejected {
            condition: StanzaErrorCondition::Forbidden
        }
    );
    let error = h.wait_for(|p| p.id() == Some("deny-1")).await;
    assert_eq!(error_condition(&error).as_deref(), Some("forbidden"));
}

#[tokio::test]
async fn test_preprocessor_stop_answers_service_unavailable() {
    let mut h = harness();
    h.login("s1", "alice@localhost", "phone").await;

    let result = h.send_from("s1", message("blocked@localhost", "hello?"));
    assert_eq!(
        result,
        RoutingResult::Rejected {
            condition: StanzaErrorCondition::ServiceUnavailable
        }
    );
}

#[tokio::test]
async fn test_panicking_processor_answers_internal_error() {
    let mut h = harness();
    h.login("x1", "alice@localhost", "phone").await;

    h.send_from("x1", iq("localhost", "boom", PANIC_NS));
    let error = h.wait_for(|p| p.id() == Some("boom")).await;
    assert_eq!(error_condition(&error).as_deref(), Some("internal-server-error"));
}

#[tokio::test]
async fn test_message_before_auth_is_not_authorized() {
    let mut h = harness();
    let conn = h.open_stream("na1").await;

    let result = h.send_from("na1", message("bob@localhost", "hi"));
    assert_eq!(result, RoutingResult::Handled);

    let conn_id = conn.id();
    let error = h
        .wait_for(|p| p.is_error() && p.packet_to() == Some(&conn_id))
        .await;
    assert_eq!(error_condition(&error).as_deref(), Some("not-authorized"));
}

#[tokio::test]
async fn test_message_before_bind_is_not_authorized() {
    let mut h = harness();
    let conn = h.open_stream("nb1").await;
    h.router
        .authorize(&conn, &"alice@localhost".parse().unwrap(), false)
        .await
        .unwrap();

    let result = h.send_from("nb1", message("bob@localhost", "hi"));
    assert_eq!(result, RoutingResult::Handled);
    let conn_id = conn.id();
    let error = h
        .wait_for(|p| p.is_error() && p.packet_to() == Some(&conn_id))
        .await;
    assert_eq!(error_condition(&error).as_deref(), Some("not-authorized"));
}

#[tokio::test]
async fn test_packet_for_closed_connection_is_broken() {
    let mut h = harness();

    let element = Element::builder("message", ns::CLIENT)
        .attr("from", "bob@localhost/desk")
        .attr("to", "alice@localhost/gone")
        .attr("id", "m1")
        .build();
    let packet = Packet::new(element).unwrap().with_packet_from(conn_id("ghost"));
    let result = h.router.process(packet);
    assert_eq!(
        result,
        RoutingResult::Rejected {
            condition: StanzaErrorCondition::ServiceUnavailable
        }
    );

    let ghost = conn_id("ghost");
    let error = h.wait_for(|p| p.packet_to() == Some(&ghost)).await;
    assert_eq!(error_condition(&error).as_deref(), Some("service-unavailable"));

    // Presences for a closed connection are dropped quietly.
    let element = Element::builder("presence", ns::CLIENT)
        .attr("from", "bob@localhost/desk")
        .attr("to", "alice@localhost/gone")
        .build();
    let packet = Packet::new(element).unwrap().with_packet_from(conn_id("ghost"));
    assert_eq!(h.router.process(packet), RoutingResult::Dropped);
}

#[tokio::test]
async fn test_message_to_domain_goes_to_admins() {
    let config = SessionManagerConfig {
        admins: vec!["admin@localhost".to_string()],
        ..Default::default()
    };
    let mut h = TestHarness::new(config, PluginPipeline::new());
    let admin = h.login("ad1", "admin@localhost", "console").await;

    let element = Element::builder("message", ns::CLIENT)
        .attr("from", "someone@example.com/home")
        .attr("to", "localhost")
        .append(Element::builder("body", ns::CLIENT).append("hello admins".to_string()))
        .build();
    let result = h.router.process(Packet::new(element).unwrap());
    assert_eq!(result, RoutingResult::Handled);

    let admin_id = admin.id();
    let forwarded = h
        .wait_for(|p| p.kind() == StanzaKind::Message && p.packet_to() == Some(&admin_id))
        .await;
    assert_eq!(
        forwarded.stanza_to().map(|j| j.to_string()).as_deref(),
        Some("admin@localhost")
    );
    assert_eq!(
        forwarded.stanza_from().map(|j| j.to_string()).as_deref(),
        Some("someone@example.com/home")
    );
}

#[tokio::test]
async fn test_iq_result_to_domain_is_consumed() {
    let h = harness();
    let element = Element::builder("iq", ns::CLIENT)
        .attr("from", "someone@example.com/home")
        .attr("to", "localhost")
        .attr("type", "result")
        .attr("id", "r1")
        .build();
    assert_eq!(h.router.process(Packet::new(element).unwrap()), RoutingResult::Handled);
}

#[tokio::test]
async fn test_reload_replaces_pipeline() {
    let mut h = TestHarness::with_defaults();
    h.login("r1", "alice@localhost", "phone").await;

    let before = h.send_from("r1", iq("localhost", "r-1", ECHO_NS));
    assert!(matches!(before, RoutingResult::Rejected { .. }));

    assert_ok!(h.router.reload(pipeline()));
    let ids: Vec<String> = h.router.plugins().into_iter().map(|d| d.id).collect();
    assert!(ids.contains(&"echo".to_string()));

    let after = h.send_from("r1", iq("localhost", "r-2", ECHO_NS));
    assert!(matches!(after, RoutingResult::Dispatched { .. }));
    h.wait_for(|p| p.id() == Some("r-2") && !p.is_error()).await;
}

#[tokio::test]
async fn test_reload_rejects_reserved_ids() {
    struct Impostor;

    impl Plugin for Impostor {
        fn id(&self) -> &str {
            "session-open"
        }
    }

    #[async_trait]
    impl Processor for Impostor {
        fn can_handle(
            &self,
            _packet: &Packet,
            _conn: Option<&ResourceConnection>,
        ) -> Option<Authorization> {
            None
        }

        async fn process(
            &self,
            _packet: &Packet,
            _conn: Option<&Arc<ResourceConnection>>,
            _ctx: &ProcessContext<'_>,
            _results: &mut Vec<Packet>,
        ) -> Result<(), XmppError> {
            Ok(())
        }
    }

    let h = TestHarness::with_defaults();
    assert_err!(h
        .router
        .reload(PluginPipeline::new().with_processor(Arc::new(Impostor))));
}
