//! Client transport against a real server.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use foreman_client::{
    ClientConfig, ClientUpdate, ConnectionState, EventKind, HistoryClient, Notice, TransportManager,
};
use foreman_core::{ClientEvent, Identity, Responder, Role, ServerEvent};
use foreman_llm::{ChunkConfig, MockReply, MockResponder, StreamingResponder};
use foreman_ratelimit::{LimitSettings, MemoryCounterStore};
use foreman_server::{ChatConfig, ForemanServer, ServerConfig, ServerHandle, ServerParts, StaticTokenVerifier};
use foreman_store::Database;

const TIMEOUT: Duration = Duration::from_secs(5);

struct TestServer {
    handle: ServerHandle,
    server: ForemanServer,
}

impl TestServer {
    fn url(&self) -> String {
        format!("http://{}", self.handle.addr)
    }

    fn config(&self, token: &str) -> ClientConfig {
        let mut cfg = ClientConfig::new(self.url(), token);
        cfg.reconnect_base = Duration::from_millis(20);
        cfg.reconnect_max = Duration::from_millis(200);
        cfg.typing_ttl = Duration::from_millis(300);
        cfg
    }
}

async fn boot_with(mock: MockResponder, config: ServerConfig) -> TestServer {
    let responder: Arc<dyn Responder> = Arc::new(mock);
    let server = ForemanServer::new(
        config,
        ServerParts {
            db: Database::in_memory().unwrap(),
            counters: Arc::new(MemoryCounterStore::new()),
            limits: LimitSettings::default(),
            responder: StreamingResponder::new(responder, ChunkConfig::default()),
            verifier: Arc::new(StaticTokenVerifier::new([("tok-u1", "U1")])),
            chat: ChatConfig::default(),
        },
    );
    let handle = server.listen().await.unwrap();
    TestServer { handle, server }
}

async fn boot(mock: MockResponder) -> TestServer {
    boot_with(mock, ServerConfig::default()).await
}

fn answer(parts: &[&str]) -> MockReply {
    MockReply::Fragments(parts.iter().map(ToString::to_string).collect())
}

/// Forward every update of the given kinds into a channel.
fn subscribe(m: &TransportManager, kinds: &[EventKind]) -> mpsc::UnboundedReceiver<ClientUpdate> {
    let (tx, rx) = mpsc::unbounded_channel();
    for kind in kinds {
        let tx = tx.clone();
        m.on(*kind, move |u| {
            let _ = tx.send(u.clone());
        });
    }
    rx
}

async fn next(rx: &mut mpsc::UnboundedReceiver<ClientUpdate>) -> ClientUpdate {
    timeout(TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for an update")
        .expect("channel closed")
}

async fn next_matching<F>(rx: &mut mpsc::UnboundedReceiver<ClientUpdate>, mut pred: F) -> ClientUpdate
where
    F: FnMut(&ClientUpdate) -> bool,
{
    loop {
        let update = next(rx).await;
        if pred(&update) {
            return update;
        }
    }
}

async fn wait_state(m: &TransportManager, want: ConnectionState) {
    let mut rx = m.watch_state();
    timeout(TIMEOUT, rx.wait_for(|s| *s == want))
        .await
        .expect("timed out waiting for state")
        .unwrap();
}

#[tokio::test]
async fn streamed_answer_is_reassembled_and_persisted() {
    let ts = boot(MockResponder::new(vec![answer(&["Two ", "RFIs ", "are open."])])).await;
    let m = TransportManager::new(ts.config("tok-u1"));
    let mut rx = subscribe(&m, &[EventKind::Ack, EventKind::Assembled]);

    m.connect(None).unwrap();
    m.send(ClientEvent::message("status?", Some("m1".into()))).unwrap();

    let ack = next(&mut rx).await;
    let ClientUpdate::Server(ServerEvent::Ack { duplicate, .. }) = ack else {
        panic!("expected ack, got {ack:?}");
    };
    assert!(!duplicate);

    let ClientUpdate::Assembled(done) = next(&mut rx).await else {
        panic!("expected assembled message");
    };
    assert_eq!(done.content, "Two RFIs are open.");
    assert!(!done.possibly_incomplete);
    let session = m.session_id().expect("session learned from ack");
    assert_eq!(done.session_id, session);

    let history = HistoryClient::new(m.config()).unwrap();
    let page = history.fetch_messages(&session, 50, 0).await.unwrap();
    let roles: Vec<Role> = page.messages.iter().map(|msg| msg.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant]);
    assert_eq!(page.messages[1].content, "Two RFIs are open.");

    m.disconnect().await;
}

#[tokio::test]
async fn events_queued_before_connecting_flush_in_order() {
    let ts = boot(MockResponder::new(vec![answer(&["one"]), answer(&["two"])])).await;
    let m = TransportManager::new(ts.config("tok-u1"));
    let mut rx = subscribe(&m, &[EventKind::Assembled]);

    m.send(ClientEvent::message("first?", None)).unwrap();
    m.send(ClientEvent::message("second?", None)).unwrap();
    assert_eq!(m.queued(), 2);
    m.connect(None).unwrap();

    for expected in ["one", "two"] {
        let ClientUpdate::Assembled(done) = next(&mut rx).await else {
            panic!("expected assembled message");
        };
        assert_eq!(done.content, expected);
    }
    assert_eq!(m.queued(), 0);

    let session = m.session_id().unwrap();
    let history = HistoryClient::new(m.config()).unwrap();
    let contents: Vec<String> = history
        .fetch_messages(&session, 50, 0)
        .await
        .unwrap()
        .messages
        .into_iter()
        .map(|msg| msg.content)
        .collect();
    assert_eq!(contents, vec!["first?", "one", "second?", "two"]);
    m.disconnect().await;
}

#[tokio::test]
async fn reconnects_to_the_same_session_after_a_drop() {
    let ts = boot(MockResponder::repeating(answer(&["ok"]))).await;
    let m = TransportManager::new(ts.config("tok-u1"));
    let mut rx = subscribe(&m, &[EventKind::Assembled, EventKind::Notice, EventKind::Connected]);

    m.connect(None).unwrap();
    m.send(ClientEvent::message("before", None)).unwrap();
    let _ = next_matching(&mut rx, |u| matches!(u, ClientUpdate::Assembled(_))).await;
    let session = m.session_id().unwrap();

    ts.server.registry().close_all();

    let notice = next_matching(&mut rx, |u| matches!(u, ClientUpdate::Notice(_))).await;
    assert!(matches!(notice, ClientUpdate::Notice(Notice::Disconnected { .. })), "{notice:?}");
    let notice = next_matching(&mut rx, |u| matches!(u, ClientUpdate::Notice(_))).await;
    assert!(matches!(notice, ClientUpdate::Notice(Notice::Reconnected { .. })), "{notice:?}");

    let connected = next_matching(&mut rx, |u| {
        matches!(u, ClientUpdate::Server(ServerEvent::Connected { .. }))
    })
    .await;
    let ClientUpdate::Server(ServerEvent::Connected { session_id, .. }) = connected else {
        unreachable!();
    };
    assert_eq!(session_id.as_ref(), Some(&session));

    m.send(ClientEvent::message("after", None)).unwrap();
    let ClientUpdate::Assembled(done) =
        next_matching(&mut rx, |u| matches!(u, ClientUpdate::Assembled(_))).await
    else {
        unreachable!();
    };
    assert_eq!(done.session_id, session);
    assert_eq!(m.state(), ConnectionState::Connected);
    m.disconnect().await;
}

#[tokio::test]
async fn resend_of_the_same_client_message_id_is_not_duplicated() {
    let ts = boot(MockResponder::repeating(answer(&["once"]))).await;
    let m = TransportManager::new(ts.config("tok-u1"));
    let mut rx = subscribe(&m, &[EventKind::Ack, EventKind::Assembled]);
    m.connect(None).unwrap();

    m.send(ClientEvent::message("status?", Some("m1".into()))).unwrap();
    let _ = next_matching(&mut rx, |u| matches!(u, ClientUpdate::Assembled(_))).await;

    m.send(ClientEvent::message("status?", Some("m1".into()))).unwrap();
    let ack = next_matching(&mut rx, |u| matches!(u, ClientUpdate::Server(ServerEvent::Ack { .. }))).await;
    let ClientUpdate::Server(ServerEvent::Ack { duplicate, .. }) = ack else {
        unreachable!();
    };
    assert!(duplicate);

    let history = HistoryClient::new(m.config()).unwrap();
    let page = history.fetch_messages(&m.session_id().unwrap(), 50, 0).await.unwrap();
    assert_eq!(page.messages.len(), 2);
    m.disconnect().await;
}

#[tokio::test]
async fn gives_up_after_the_reconnect_budget() {
    let port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let mut cfg = ClientConfig::new(format!("http://127.0.0.1:{port}"), "tok-u1");
    cfg.reconnect_base = Duration::from_millis(5);
    cfg.reconnect_max = Duration::from_millis(20);
    cfg.max_reconnect_attempts = 3;
    let m = TransportManager::new(cfg);
    let mut rx = subscribe(&m, &[EventKind::Notice]);

    m.send(ClientEvent::message("queued", None)).unwrap();
    m.connect(None).unwrap();

    let ClientUpdate::Notice(Notice::Failed { code, .. }) = next(&mut rx).await else {
        panic!("expected failure notice");
    };
    assert_eq!(code, "TRANSPORT_FAILURE");
    wait_state(&m, ConnectionState::Failed).await;
    assert_eq!(m.queued(), 1, "queued events survive a failed connection");
}

#[tokio::test]
async fn refused_credentials_fail_without_retrying() {
    let ts = boot(MockResponder::new(vec![])).await;
    let m = TransportManager::new(ts.config("wrong"));
    let mut rx = subscribe(&m, &[EventKind::Notice]);
    m.connect(None).unwrap();

    let ClientUpdate::Notice(Notice::Failed { code, .. }) = next(&mut rx).await else {
        panic!("expected failure notice");
    };
    assert_eq!(code, "UNAUTHORIZED");
    assert_eq!(m.state(), ConnectionState::Failed);
}

#[tokio::test]
async fn typing_from_another_tab_expires() {
    let ts = boot(MockResponder::repeating(answer(&["hi"]))).await;
    let a = TransportManager::new(ts.config("tok-u1"));
    let mut a_rx = subscribe(&a, &[EventKind::Assembled, EventKind::Typing]);
    a.connect(None).unwrap();
    a.send(ClientEvent::message("hello", None)).unwrap();
    let _ = next_matching(&mut a_rx, |u| matches!(u, ClientUpdate::Assembled(_))).await;
    let session = a.session_id().unwrap();

    let b = TransportManager::new(ts.config("tok-u1"));
    let mut b_rx = subscribe(&b, &[EventKind::Connected]);
    b.connect(Some(session.clone())).unwrap();
    let _ = next(&mut b_rx).await;
    b.send(ClientEvent::Typing).unwrap();

    let ClientUpdate::Typing(on) = next_matching(&mut a_rx, |u| matches!(u, ClientUpdate::Typing(_))).await
    else {
        unreachable!();
    };
    assert!(on.active);
    assert_eq!(on.identity, Identity::new("U1"));
    assert!(a.is_typing(&Identity::new("U1")));

    let ClientUpdate::Typing(off) = next(&mut a_rx).await else {
        panic!("expected typing expiry");
    };
    assert!(!off.active);
    assert!(!a.is_typing(&Identity::new("U1")));

    a.disconnect().await;
    b.disconnect().await;
}

#[tokio::test]
async fn heartbeats_are_answered_automatically() {
    let config = ServerConfig {
        heartbeat_interval_secs: 1,
        heartbeat_timeout_secs: 2,
        ..ServerConfig::default()
    };
    let ts = boot_with(MockResponder::new(vec![]), config).await;
    let m = TransportManager::new(ts.config("tok-u1"));
    let mut rx = subscribe(&m, &[EventKind::Notice]);
    m.connect(None).unwrap();
    wait_state(&m, ConnectionState::Connected).await;

    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert!(rx.try_recv().is_err(), "connection should not have dropped");
    assert_eq!(m.state(), ConnectionState::Connected);
    assert_eq!(ts.server.registry().connection_count(), 1);
    m.disconnect().await;
}

#[tokio::test]
async fn intentional_disconnect_does_not_reconnect() {
    let ts = boot(MockResponder::new(vec![])).await;
    let m = TransportManager::new(ts.config("tok-u1"));
    let mut rx = subscribe(&m, &[EventKind::Notice]);
    m.connect(None).unwrap();
    wait_state(&m, ConnectionState::Connected).await;

    m.disconnect().await;
    assert_eq!(m.state(), ConnectionState::Closed);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(ts.server.registry().connection_count(), 0);
}
