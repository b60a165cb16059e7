use super::*;
use std::collections::HashMap;
use std::io;
use std::sync::Mutex;
use std::time::Duration;

use tokio::io::{DuplexStream, duplex};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::board::PeerAddr;
use crate::session::{BoxedStream, SessionState};

// =============================================================================
// In-memory network
// =============================================================================

/// Routes dials to controllers in the same process over `duplex` pipes.
#[derive(Default)]
struct MemoryNetwork {
    peers: Mutex<HashMap<PeerAddr, ReplicationController>>,
    accepted: Mutex<Vec<SessionHandle>>,
    /// Peers that accept the connection but never answer.
    silent: Mutex<HashMap<PeerAddr, Vec<DuplexStream>>>,
}

impl MemoryNetwork {
    fn register(&self, controller: &ReplicationController) {
        self.peers
            .lock()
            .expect("peers")
            .insert(controller.config().local_peer(), controller.clone());
    }

    fn add_silent(&self, peer: PeerAddr) {
        self.silent.lock().expect("silent").insert(peer, Vec::new());
    }

    fn close_accepted(&self) {
        for session in self.accepted.lock().expect("accepted").drain(..) {
            session.close();
        }
    }
}

struct MemoryDialer(Arc<MemoryNetwork>);

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self, peer: &PeerAddr) -> io::Result<BoxedStream> {
        let (near, far) = duplex(64 * 1024);
        if let Some(parked) = self.0.silent.lock().expect("silent").get_mut(peer) {
            parked.push(far);
            return Ok(Box::new(near));
        }
        let target = self.0.peers.lock().expect("peers").get(peer).cloned();
        let Some(target) = target else {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, format!("no peer at {peer}")));
        };
        let session = target.accept(far, "memory");
        self.0.accepted.lock().expect("accepted").push(session);
        Ok(Box::new(near))
    }
}

fn config(host: &str, port: u16) -> PeerConfig {
    PeerConfig { host: host.into(), port, snapshot_timeout_ms: 500, ..PeerConfig::default() }
}

fn peer(network: &Arc<MemoryNetwork>, host: &str, port: u16) -> ReplicationController {
    let controller = ReplicationController::new(config(host, port), Arc::new(MemoryDialer(Arc::clone(network))));
    network.register(&controller);
    controller
}

fn owner_and_subscriber() -> (Arc<MemoryNetwork>, ReplicationController, ReplicationController) {
    let network = Arc::new(MemoryNetwork::default());
    let owner = peer(&network, "10.0.0.1", 5000);
    let subscriber = peer(&network, "10.0.0.2", 5000);
    (network, owner, subscriber)
}

async fn shared_board(owner: &ReplicationController, name: &str) -> BoardId {
    let id = owner.create_named_board(name).await.expect("create");
    assert!(owner.set_shared(&id, true).await.expect("share"));
    id
}

fn path(raw: &str) -> Path {
    Path::new(raw).expect("valid path")
}

async fn wait_for(rx: &mut broadcast::Receiver<BoardEvent>, want: &BoardEvent) {
    let found = timeout(Duration::from_secs(2), async {
        loop {
            match rx.recv().await {
                Ok(event) if &event == want => return true,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return false,
            }
        }
    })
    .await;
    assert_eq!(found, Ok(true), "expected {want:?}");
}

/// Let spawned tasks run until they block.
async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

async fn eventually(what: &str, mut done: impl FnMut() -> bool) {
    let reached = timeout(Duration::from_secs(1), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {what}");
}

fn mirror_link(entry: Option<BoardEntry>) -> SessionHandle {
    entry.and_then(|entry| entry.mirror_session().cloned()).expect("mirror link")
}

/// Subscribe and wait until the owner has registered the listener (the
/// confirming snapshot arrives after LISTEN is processed).
async fn subscribe_and_settle(subscriber: &ReplicationController, id: &BoardId) -> u64 {
    let mut events = subscriber.events();
    let version = subscriber.subscribe(id).await.expect("subscribe");
    wait_for(&mut events, &BoardEvent::Updated { id: id.clone(), version }).await;
    version
}

// -----------------------------------------------------------------------------
// Raw wire peer
// -----------------------------------------------------------------------------

struct WirePeer {
    stream: DuplexStream,
}

impl WirePeer {
    fn attach(controller: &ReplicationController) -> Self {
        let (near, far) = duplex(64 * 1024);
        controller.accept(far, "wire");
        Self { stream: near }
    }

    async fn send(&mut self, message: Message) {
        frames::write_frame(&mut self.stream, &message.to_frame()).await.expect("write");
    }

    async fn recv(&mut self) -> Message {
        let frame = timeout(Duration::from_millis(500), frames::read_frame(&mut self.stream, frames::MAX_FRAME_BYTES))
            .await
            .expect("frame arrives")
            .expect("read ok")
            .expect("not eof");
        Message::from_frame(&frame).expect("decode")
    }

    async fn assert_silent(&mut self) {
        let read = timeout(Duration::from_millis(80), frames::read_frame(&mut self.stream, frames::MAX_FRAME_BYTES)).await;
        assert!(read.is_err(), "no frame expected, got {read:?}");
    }
}

// =============================================================================
// Owner role
// =============================================================================

#[tokio::test]
async fn wire_scenario_get_listen_and_path_update() {
    let network = Arc::new(MemoryNetwork::default());
    let owner = peer(&network, "10.0.0.1", 5000);
    let id = shared_board(&owner, "board1").await;
    let mut wire = WirePeer::attach(&owner);

    wire.send(Message::GetBoardData(id.clone())).await;
    let data = wire.recv().await;
    assert_eq!(data.event(), "BOARD_DATA");
    assert_eq!(data.payload(), "10.0.0.1:5000:board1%0%");

    wire.send(Message::Listen(id.clone())).await;
    wire.send(Message::GetBoardData(id.clone())).await;
    assert_eq!(wire.recv().await.payload(), "10.0.0.1:5000:board1%0%");

    let outcome = owner.propose_path(&id, path("L0,0,10,10,black"), 0).await.expect("propose");
    assert_eq!(outcome, EditOutcome::Accepted { version: 1 });

    let update = wire.recv().await;
    assert_eq!(update.event(), "PATH_UPDATE");
    assert_eq!(update.payload(), "10.0.0.1:5000:board1%1%L0,0,10,10,black");
}

#[tokio::test]
async fn unknown_and_unshared_boards_are_refused() {
    let network = Arc::new(MemoryNetwork::default());
    let owner = peer(&network, "10.0.0.1", 5000);
    let private = owner.create_named_board("private").await.expect("create");
    let mut wire = WirePeer::attach(&owner);

    wire.send(Message::GetBoardData(private.clone())).await;
    let Message::BoardError(notice) = wire.recv().await else {
        panic!("expected BOARD_ERROR");
    };
    assert!(notice.starts_with("E_BOARD_NOT_SHARED: "), "{notice}");

    wire.send(Message::Listen("10.0.0.1:5000:ghost".parse().expect("id"))).await;
    let Message::BoardError(notice) = wire.recv().await else {
        panic!("expected BOARD_ERROR");
    };
    assert!(notice.starts_with("E_BOARD_NOT_FOUND: "), "{notice}");
    assert_eq!(owner.listener_count(&private).await, 0);
}

#[tokio::test]
async fn relayed_proposal_is_applied_and_broadcast() {
    let network = Arc::new(MemoryNetwork::default());
    let owner = peer(&network, "10.0.0.1", 5000);
    let id = shared_board(&owner, "board1").await;
    let mut listener = WirePeer::attach(&owner);
    let mut proposer = WirePeer::attach(&owner);

    listener.send(Message::Listen(id.clone())).await;
    listener.send(Message::GetBoardData(id.clone())).await;
    listener.recv().await;

    proposer
        .send(Message::relay_for(id.clone(), &Mutation::AddPath(path("L1,1,2,2,red")), 0))
        .await;

    let expected = "10.0.0.1:5000:board1%1%L1,1,2,2,red";
    assert_eq!(listener.recv().await.payload(), expected);
    let direct = proposer.recv().await;
    assert_eq!(direct.event(), "PATH_UPDATE", "non-listening proposer hears the result directly");
    assert_eq!(direct.payload(), expected);
    assert_eq!(owner.snapshot(&id).await.expect("board").version(), 1);
}

#[tokio::test]
async fn stale_relayed_proposal_gets_board_data() {
    let network = Arc::new(MemoryNetwork::default());
    let owner = peer(&network, "10.0.0.1", 5000);
    let id = shared_board(&owner, "board1").await;
    owner.propose_path(&id, path("first"), 0).await.expect("propose");

    let mut wire = WirePeer::attach(&owner);
    wire.send(Message::relay_for(id.clone(), &Mutation::Clear, 0)).await;

    let reply = wire.recv().await;
    assert_eq!(reply.event(), "BOARD_DATA");
    assert_eq!(reply.payload(), "10.0.0.1:5000:board1%1%first");
    assert_eq!(owner.snapshot(&id).await.expect("board").paths().len(), 1);
}

#[tokio::test]
async fn proposal_queued_behind_delete_is_refused() {
    let network = Arc::new(MemoryNetwork::default());
    let owner = peer(&network, "10.0.0.1", 5000);
    let id = owner.create_named_board("board1").await.expect("create");
    let mut events = owner.events();

    let entry = owner.inner.directory.get(&id).await.expect("entry");
    let held = entry.board.lock().await;
    let deleting = tokio::spawn({
        let owner = owner.clone();
        let id = id.clone();
        async move { owner.delete_board(&id).await }
    });
    settle().await;
    let proposing = tokio::spawn({
        let owner = owner.clone();
        let id = id.clone();
        async move { owner.propose_path(&id, path("x"), 0).await }
    });
    settle().await;
    drop(held);

    deleting.await.expect("join").expect("delete");
    let err = proposing.await.expect("join").expect_err("board is gone");
    assert!(matches!(err, ReplicationError::NotFound(_)), "{err:?}");
    assert!(owner.snapshot(&id).await.is_none());
    assert_eq!(entry.board.lock().await.version(), 0, "orphaned state untouched");

    wait_for(&mut events, &BoardEvent::Removed { id: id.clone(), reason: Removal::Deleted }).await;
    assert!(events.try_recv().is_err(), "nothing published after removal");
}

#[tokio::test]
async fn relay_queued_behind_delete_is_refused() {
    let network = Arc::new(MemoryNetwork::default());
    let owner = peer(&network, "10.0.0.1", 5000);
    let id = shared_board(&owner, "board1").await;
    let mut wire = WirePeer::attach(&owner);

    let entry = owner.inner.directory.get(&id).await.expect("entry");
    let held = entry.board.lock().await;
    let deleting = tokio::spawn({
        let owner = owner.clone();
        let id = id.clone();
        async move { owner.delete_board(&id).await }
    });
    settle().await;
    wire.send(Message::relay_for(id.clone(), &Mutation::AddPath(path("x")), 0)).await;
    settle().await;
    drop(held);

    deleting.await.expect("join").expect("delete");
    let Message::BoardError(notice) = wire.recv().await else {
        panic!("expected BOARD_ERROR");
    };
    assert!(notice.starts_with("E_BOARD_NOT_FOUND: "), "{notice}");
    assert_eq!(entry.board.lock().await.version(), 0);
}

#[tokio::test]
async fn second_delete_of_same_board_is_not_found() {
    let network = Arc::new(MemoryNetwork::default());
    let owner = peer(&network, "10.0.0.1", 5000);
    let id = owner.create_named_board("board1").await.expect("create");

    let (first, second) = tokio::join!(owner.delete_board(&id), owner.delete_board(&id));
    let results = [first, second];
    assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1, "{results:?}");
    assert!(results.iter().any(|result| matches!(result, Err(ReplicationError::NotFound(_)))));
}

#[tokio::test]
async fn unlisten_stops_updates() {
    let network = Arc::new(MemoryNetwork::default());
    let owner = peer(&network, "10.0.0.1", 5000);
    let id = shared_board(&owner, "board1").await;
    let mut wire = WirePeer::attach(&owner);

    wire.send(Message::Listen(id.clone())).await;
    wire.send(Message::Unlisten(id.clone())).await;
    wire.send(Message::GetBoardData(id.clone())).await;
    wire.recv().await;
    assert_eq!(owner.listener_count(&id).await, 0);

    owner.propose_undo(&id, 0).await.expect("propose");
    owner.propose_clear(&id, 0).await.expect("propose");
    wire.assert_silent().await;
}

#[tokio::test]
async fn closed_link_leaves_listener_sets() {
    let network = Arc::new(MemoryNetwork::default());
    let owner = peer(&network, "10.0.0.1", 5000);
    let id = shared_board(&owner, "board1").await;
    let mut wire = WirePeer::attach(&owner);

    wire.send(Message::Listen(id.clone())).await;
    wire.send(Message::GetBoardData(id.clone())).await;
    wire.recv().await;
    assert_eq!(owner.listener_count(&id).await, 1);

    drop(wire);
    timeout(Duration::from_secs(1), async {
        while owner.listener_count(&id).await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("listener removed after close");
}

#[tokio::test]
async fn concurrent_local_proposals_consume_one_version() {
    let network = Arc::new(MemoryNetwork::default());
    let owner = peer(&network, "10.0.0.1", 5000);
    let id = owner.create_named_board("board1").await.expect("create");
    let mut events = owner.events();

    let (a, b) = tokio::join!(
        owner.propose_path(&id, path("from-a"), 0),
        owner.propose_path(&id, path("from-b"), 0),
    );
    let outcomes = [a.expect("a"), b.expect("b")];
    assert!(outcomes.contains(&EditOutcome::Accepted { version: 1 }), "{outcomes:?}");
    assert!(outcomes.contains(&EditOutcome::Rejected { current: 1 }), "{outcomes:?}");
    wait_for(&mut events, &BoardEvent::Rejected { id: id.clone(), current: 1 }).await;
}

#[tokio::test]
async fn undo_on_empty_board_is_rejected() {
    let network = Arc::new(MemoryNetwork::default());
    let owner = peer(&network, "10.0.0.1", 5000);
    let id = owner.create_named_board("board1").await.expect("create");
    assert_eq!(owner.propose_undo(&id, 0).await.expect("propose"), EditOutcome::Rejected { current: 0 });
}

// =============================================================================
// Subscriber role
// =============================================================================

#[tokio::test]
async fn subscriber_mirror_follows_owner() {
    let (_network, owner, subscriber) = owner_and_subscriber();
    let id = shared_board(&owner, "board1").await;

    assert_eq!(subscribe_and_settle(&subscriber, &id).await, 0);
    assert_eq!(owner.listener_count(&id).await, 1);

    let mut events = subscriber.events();
    assert_eq!(
        owner.propose_path(&id, path("L0,0,10,10,black"), 0).await.expect("propose"),
        EditOutcome::Accepted { version: 1 }
    );
    wait_for(&mut events, &BoardEvent::Updated { id: id.clone(), version: 1 }).await;

    let mirror = subscriber.snapshot(&id).await.expect("mirror");
    assert!(!mirror.is_owned());
    assert_eq!(mirror.version(), 1);
    assert_eq!(mirror.paths(), &[path("L0,0,10,10,black")]);
    assert_eq!(mirror.serialize(), "10.0.0.1:5000:board1%1%L0,0,10,10,black");
}

#[tokio::test]
async fn subscriber_edits_are_forwarded_not_applied() {
    let (_network, owner, subscriber) = owner_and_subscriber();
    let id = shared_board(&owner, "board1").await;
    subscribe_and_settle(&subscriber, &id).await;

    let mut events = subscriber.events();
    let outcome = subscriber.propose_path(&id, path("remote"), 0).await.expect("propose");
    assert_eq!(outcome, EditOutcome::Forwarded);

    wait_for(&mut events, &BoardEvent::Updated { id: id.clone(), version: 1 }).await;
    assert_eq!(owner.snapshot(&id).await.expect("owner").paths(), &[path("remote")]);
    assert_eq!(subscriber.snapshot(&id).await.expect("mirror").version(), 1);
}

#[tokio::test]
async fn stale_subscriber_edit_resyncs_mirror() {
    let (_network, owner, subscriber) = owner_and_subscriber();
    let id = shared_board(&owner, "board1").await;
    subscribe_and_settle(&subscriber, &id).await;

    let mut events = subscriber.events();
    owner.propose_path(&id, path("a"), 0).await.expect("propose");
    owner.propose_path(&id, path("b"), 1).await.expect("propose");
    wait_for(&mut events, &BoardEvent::Updated { id: id.clone(), version: 2 }).await;

    assert_eq!(subscriber.propose_clear(&id, 0).await.expect("propose"), EditOutcome::Forwarded);
    wait_for(&mut events, &BoardEvent::Updated { id: id.clone(), version: 2 }).await;
    assert_eq!(owner.snapshot(&id).await.expect("owner").version(), 2);
    assert_eq!(subscriber.snapshot(&id).await.expect("mirror").paths().len(), 2);
}

#[tokio::test]
async fn boards_from_one_owner_share_a_link() {
    let (network, owner, subscriber) = owner_and_subscriber();
    let a = shared_board(&owner, "a").await;
    let b = shared_board(&owner, "b").await;

    subscribe_and_settle(&subscriber, &a).await;
    subscribe_and_settle(&subscriber, &b).await;
    assert_eq!(network.accepted.lock().expect("accepted").len(), 1);
}

#[tokio::test]
async fn owner_deletion_removes_mirror() {
    let (_network, owner, subscriber) = owner_and_subscriber();
    let id = shared_board(&owner, "board1").await;
    subscribe_and_settle(&subscriber, &id).await;

    let mut events = subscriber.events();
    owner.delete_board(&id).await.expect("delete");
    wait_for(&mut events, &BoardEvent::Removed { id: id.clone(), reason: Removal::Deleted }).await;
    assert!(subscriber.snapshot(&id).await.is_none());
    assert!(owner.snapshot(&id).await.is_none());
}

#[tokio::test]
async fn board_error_closes_link_and_fails_subscribe() {
    let (_network, owner, subscriber) = owner_and_subscriber();
    let private = owner.create_named_board("private").await.expect("create");

    let err = subscriber.subscribe(&private).await.expect_err("not shared");
    assert!(matches!(err, ReplicationError::LinkClosed(_)), "{err:?}");
    assert!(subscriber.snapshot(&private).await.is_none());
}

#[tokio::test]
async fn link_close_tears_down_every_mirror_it_fed() {
    let (network, owner, subscriber) = owner_and_subscriber();
    let a = shared_board(&owner, "a").await;
    let b = shared_board(&owner, "b").await;
    subscribe_and_settle(&subscriber, &a).await;
    subscribe_and_settle(&subscriber, &b).await;

    let mut events = subscriber.events();
    network.close_accepted();
    wait_for(&mut events, &BoardEvent::Removed { id: a.clone(), reason: Removal::Disconnected }).await;
    wait_for(&mut events, &BoardEvent::Removed { id: b.clone(), reason: Removal::Disconnected }).await;
    assert!(subscriber.snapshot(&a).await.is_none());
    assert!(subscriber.snapshot(&b).await.is_none());
    assert!(subscriber.boards().await.is_empty());
}

#[tokio::test]
async fn snapshot_wait_is_bounded() {
    let network = Arc::new(MemoryNetwork::default());
    let subscriber = ReplicationController::new(
        PeerConfig { snapshot_timeout_ms: 100, ..config("10.0.0.2", 5000) },
        Arc::new(MemoryDialer(Arc::clone(&network))),
    );
    network.add_silent(PeerAddr::new("10.0.0.9", 5000));

    let id: BoardId = "10.0.0.9:5000:board1".parse().expect("id");
    let err = subscriber.subscribe(&id).await.expect_err("no answer");
    assert!(matches!(err, ReplicationError::SnapshotTimeout(_)), "{err:?}");
    assert_eq!(err.error_code(), "E_SNAPSHOT_TIMEOUT");
    assert!(subscriber.snapshot(&id).await.is_none());
}

#[tokio::test]
async fn unreachable_owner_fails_subscribe() {
    let (_network, _owner, subscriber) = owner_and_subscriber();
    let id: BoardId = "10.0.0.7:5000:board1".parse().expect("id");
    let err = subscriber.subscribe(&id).await.expect_err("unreachable");
    assert_eq!(err.error_code(), "E_PEER_UNREACHABLE");
    assert!(subscriber.boards().await.is_empty());
}

#[tokio::test]
async fn subscribing_to_own_board_is_refused() {
    let (_network, owner, _subscriber) = owner_and_subscriber();
    let id = shared_board(&owner, "board1").await;
    assert!(matches!(owner.subscribe(&id).await, Err(ReplicationError::OwnedHere(_))));
}

#[tokio::test]
async fn unsubscribe_sends_unlisten_and_closes_idle_link() {
    let (_network, owner, subscriber) = owner_and_subscriber();
    let id = shared_board(&owner, "board1").await;
    subscribe_and_settle(&subscriber, &id).await;

    subscriber.unsubscribe(&id).await.expect("unsubscribe");
    assert!(subscriber.snapshot(&id).await.is_none());
    timeout(Duration::from_secs(1), async {
        while owner.listener_count(&id).await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("owner dropped the listener");
}

#[tokio::test]
async fn join_works_with_single_slot_send_queue() {
    let network = Arc::new(MemoryNetwork::default());
    let owner = peer(&network, "10.0.0.1", 5000);
    let subscriber = ReplicationController::new(
        PeerConfig { send_queue: 1, ..config("10.0.0.2", 5000) },
        Arc::new(MemoryDialer(Arc::clone(&network))),
    );
    let id = shared_board(&owner, "board1").await;

    assert_eq!(subscribe_and_settle(&subscriber, &id).await, 0);
    assert_eq!(owner.listener_count(&id).await, 1);
    assert!(!subscriber.inner.directory.is_joining(&id));
}

#[tokio::test]
async fn failed_listen_handshake_rolls_back_mirror() {
    let (_network, owner, subscriber) = owner_and_subscriber();
    let id = shared_board(&owner, "board1").await;

    let (link, writer) = SessionHandle::new("gone", 1);
    drop(writer);
    subscriber
        .inner
        .directory
        .insert(BoardState::new_mirror(id.clone()), Role::Mirror { session: link.clone() })
        .await
        .expect("insert");
    let mut events = subscriber.events();

    let err = subscriber.confirm_listen(&id, &link).await.expect_err("writer gone");
    assert!(matches!(err, ReplicationError::Session(SessionError::Closed(_))), "{err:?}");
    wait_for(&mut events, &BoardEvent::Removed { id: id.clone(), reason: Removal::Disconnected }).await;
    assert!(subscriber.snapshot(&id).await.is_none());
    assert!(!subscriber.inner.directory.is_joining(&id));

    assert_eq!(subscribe_and_settle(&subscriber, &id).await, 0, "a fresh join follows");
    assert_eq!(owner.listener_count(&id).await, 1);
}

#[tokio::test]
async fn concurrent_subscribes_report_the_first_snapshot() {
    let (network, owner, subscriber) = owner_and_subscriber();
    let id = shared_board(&owner, "board1").await;
    owner.propose_path(&id, path("a"), 0).await.expect("propose");

    let (first, second) = tokio::join!(subscriber.subscribe(&id), subscriber.subscribe(&id));
    assert_eq!(first.expect("first"), 1);
    assert_eq!(second.expect("second"), 1);
    assert_eq!(network.accepted.lock().expect("accepted").len(), 1);
}

#[tokio::test]
async fn deletion_notice_closes_idle_owner_link() {
    let (_network, owner, subscriber) = owner_and_subscriber();
    let id = shared_board(&owner, "board1").await;
    subscribe_and_settle(&subscriber, &id).await;
    let link = mirror_link(subscriber.inner.directory.get(&id).await);

    owner.delete_board(&id).await.expect("delete");
    eventually("idle link to close", || link.is_closed()).await;
    assert!(subscriber.inner.directory.take_links().await.is_empty());
}

#[tokio::test]
async fn link_stays_open_while_another_mirror_uses_it() {
    let (_network, owner, subscriber) = owner_and_subscriber();
    let a = shared_board(&owner, "a").await;
    let b = shared_board(&owner, "b").await;
    subscribe_and_settle(&subscriber, &a).await;
    subscribe_and_settle(&subscriber, &b).await;
    let link = mirror_link(subscriber.inner.directory.get(&a).await);

    subscriber.board_unshared(&a).await;
    assert!(subscriber.snapshot(&a).await.is_none());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!link.is_closed(), "b still mirrors over this link");

    subscriber.board_unshared(&b).await;
    eventually("idle link to close", || link.is_closed()).await;
}

// =============================================================================
// Local management and discovery
// =============================================================================

#[tokio::test]
async fn created_boards_are_owned_unshared_and_distinct() {
    let network = Arc::new(MemoryNetwork::default());
    let owner = peer(&network, "10.0.0.1", 5000);
    let a = owner.create_board().await.expect("a");
    let b = owner.create_board().await.expect("b");

    assert_ne!(a, b);
    assert!(a.name().starts_with("board"));
    assert_eq!(a.owner(), &PeerAddr::new("10.0.0.1", 5000));

    let summaries = owner.boards().await;
    assert_eq!(summaries.len(), 2);
    assert!(summaries.iter().all(|s| s.owned && !s.shared && s.version == 0));
    assert!(matches!(owner.create_named_board(a.name()).await, Err(ReplicationError::Exists(_))));
}

#[tokio::test]
async fn share_toggles_are_announced() {
    let network = Arc::new(MemoryNetwork::default());
    let owner = peer(&network, "10.0.0.1", 5000);
    let (announcer, mut announced) = SessionHandle::new("index", 8);
    announcer.advance(SessionState::Connected);
    owner.set_announcer(Some(announcer)).await;

    let id = owner.create_named_board("board1").await.expect("create");
    assert!(owner.set_shared(&id, true).await.expect("share"));
    assert!(!owner.set_shared(&id, true).await.expect("no-op"));
    assert!(owner.set_shared(&id, false).await.expect("unshare"));

    let first = Message::from_frame(&announced.recv().await.expect("share")).expect("decode");
    let second = Message::from_frame(&announced.recv().await.expect("unshare")).expect("decode");
    assert_eq!(first, Message::ShareBoard(id.clone()));
    assert_eq!(second, Message::UnshareBoard(id));
    assert!(announced.try_recv().is_err());
}

#[tokio::test]
async fn mirror_cannot_be_shared() {
    let (_network, owner, subscriber) = owner_and_subscriber();
    let id = shared_board(&owner, "board1").await;
    subscribe_and_settle(&subscriber, &id).await;
    assert!(matches!(subscriber.set_shared(&id, true).await, Err(ReplicationError::NotOwned(_))));
}

#[tokio::test]
async fn sharing_notice_subscribes_and_unsharing_notice_drops() {
    let (_network, owner, subscriber) = owner_and_subscriber();
    let id = shared_board(&owner, "board1").await;
    let mut events = subscriber.events();

    subscriber.board_shared(&id).await;
    wait_for(&mut events, &BoardEvent::Mirrored { id: id.clone(), version: 0 }).await;

    subscriber.board_unshared(&id).await;
    wait_for(&mut events, &BoardEvent::Removed { id: id.clone(), reason: Removal::Unshared }).await;
    assert!(subscriber.snapshot(&id).await.is_none());
}

#[tokio::test]
async fn shutdown_unshares_and_unlistens() {
    let (_network, owner, subscriber) = owner_and_subscriber();
    let theirs = shared_board(&owner, "theirs").await;
    let mine = shared_board(&subscriber, "mine").await;
    subscribe_and_settle(&subscriber, &theirs).await;

    subscriber.shutdown().await;
    assert!(subscriber.boards().await.is_empty());
    assert!(subscriber.snapshot(&mine).await.is_none());

    timeout(Duration::from_secs(1), async {
        while owner.listener_count(&theirs).await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("owner dropped the listener");
}

#[tokio::test]
async fn event_stream_reports_lifecycle() {
    let network = Arc::new(MemoryNetwork::default());
    let owner = peer(&network, "10.0.0.1", 5000);
    let mut events = owner.events();
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if tx.send(event).is_err() {
                break;
            }
        }
    });

    let id = owner.create_named_board("board1").await.expect("create");
    owner.set_shared(&id, true).await.expect("share");
    owner.propose_clear(&id, 0).await.expect("clear");
    owner.delete_board(&id).await.expect("delete");

    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.push(timeout(Duration::from_millis(500), rx.recv()).await.expect("event").expect("open"));
    }
    assert_eq!(
        seen,
        vec![
            BoardEvent::Created { id: id.clone() },
            BoardEvent::Shared { id: id.clone() },
            BoardEvent::Updated { id: id.clone(), version: 1 },
            BoardEvent::Removed { id, reason: Removal::Deleted },
        ]
    );
}
