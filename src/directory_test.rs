use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::session::SessionState;

fn local() -> PeerAddr {
    PeerAddr::new("10.0.0.1", 5000)
}

fn id(raw: &str) -> BoardId {
    raw.parse().expect("valid id")
}

fn session() -> SessionHandle {
    let (handle, _rx) = SessionHandle::new("peer", 4);
    handle.advance(SessionState::Connected);
    handle
}

#[test]
fn ownership_is_decided_by_host_and_port() {
    let directory = PeerDirectory::new(local());
    assert!(directory.is_local(&id("10.0.0.1:5000:board1")));
    assert!(!directory.is_local(&id("10.0.0.1:5001:board1")));
    assert!(!directory.is_local(&id("10.0.0.2:5000:board1")));
}

#[tokio::test]
async fn insert_refuses_duplicates() {
    let directory = PeerDirectory::new(local());
    let board = id("10.0.0.1:5000:board1");
    assert!(directory.insert(BoardState::new_owned(board.clone()), Role::Owned).await.is_some());
    assert!(directory.insert(BoardState::new_owned(board.clone()), Role::Owned).await.is_none());

    let entry = directory.get(&board).await.expect("present");
    assert!(entry.is_owned());
    assert!(entry.mirror_session().is_none());
}

#[tokio::test]
async fn boards_lock_independently() {
    let directory = PeerDirectory::new(local());
    let a = directory
        .insert(BoardState::new_owned(id("10.0.0.1:5000:a")), Role::Owned)
        .await
        .expect("a");
    let b = directory
        .insert(BoardState::new_owned(id("10.0.0.1:5000:b")), Role::Owned)
        .await
        .expect("b");

    let _held = a.lock().await;
    let mut other = b.try_lock().expect("b is not blocked by a");
    assert!(other.propose_clear(0).is_accepted());
}

#[tokio::test]
async fn mirrors_on_filters_by_session() {
    let directory = PeerDirectory::new(local());
    let s1 = session();
    let s2 = session();
    for (raw, s) in [("10.0.0.2:5000:a", &s1), ("10.0.0.2:5000:b", &s1), ("10.0.0.3:5000:c", &s2)] {
        let board = id(raw);
        directory
            .insert(BoardState::new_mirror(board), Role::Mirror { session: s.clone() })
            .await
            .expect("insert");
    }

    assert_eq!(directory.mirrors_on(s1.id()).await, vec![id("10.0.0.2:5000:a"), id("10.0.0.2:5000:b")]);
    assert_eq!(directory.mirrors_on(s2.id()).await, vec![id("10.0.0.3:5000:c")]);
}

#[tokio::test]
async fn entries_are_sorted() {
    let directory = PeerDirectory::new(local());
    for name in ["c", "a", "b"] {
        directory
            .insert(BoardState::new_owned(id(&format!("10.0.0.1:5000:{name}"))), Role::Owned)
            .await
            .expect("insert");
    }
    let names: Vec<_> = directory
        .entries()
        .await
        .into_iter()
        .map(|(id, _)| id.name().to_owned())
        .collect();
    assert_eq!(names, ["a", "b", "c"]);
}

#[tokio::test]
async fn link_is_reused_until_closed() {
    let directory = PeerDirectory::new(local());
    let peer = PeerAddr::new("10.0.0.2", 5000);
    let counter = AtomicUsize::new(0);
    let dials = &counter;
    let dial = move || async move {
        dials.fetch_add(1, Ordering::SeqCst);
        Ok::<_, std::io::Error>(session())
    };

    let first = directory.link_or_dial(&peer, dial).await.expect("dial");
    let again = directory.link_or_dial(&peer, dial).await.expect("reuse");
    assert_eq!(first, again);
    assert_eq!(dials.load(Ordering::SeqCst), 1);

    first.advance(SessionState::Closed);
    let fresh = directory.link_or_dial(&peer, dial).await.expect("redial");
    assert_ne!(fresh, first);
    assert_eq!(dials.load(Ordering::SeqCst), 2);

    assert_eq!(directory.remove_link(fresh.id()).await, Some(peer));
    assert_eq!(directory.remove_link(fresh.id()).await, None);
}

#[tokio::test]
async fn failed_dial_is_not_cached() {
    let directory = PeerDirectory::new(local());
    let peer = PeerAddr::new("10.0.0.2", 5000);
    let err = directory
        .link_or_dial(&peer, || async { Err::<SessionHandle, _>("refused") })
        .await
        .expect_err("dial fails");
    assert_eq!(err, "refused");
    assert!(directory.take_links().await.is_empty());
}

#[tokio::test]
async fn snapshot_waiter_is_fulfilled_once() {
    let directory = PeerDirectory::new(local());
    let board = id("10.0.0.2:5000:a");
    let waiter = directory.expect_snapshot(&board);

    assert!(directory.fulfill_snapshot(&board, 7));
    assert!(!directory.fulfill_snapshot(&board, 8));
    assert_eq!(waiter.await.expect("fulfilled"), 7);
}

#[tokio::test]
async fn removing_a_board_cancels_its_waiter() {
    let directory = PeerDirectory::new(local());
    let board = id("10.0.0.2:5000:a");
    directory
        .insert(BoardState::new_mirror(board.clone()), Role::Mirror { session: session() })
        .await
        .expect("insert");
    let waiter = directory.expect_snapshot(&board);

    assert!(directory.remove(&board).await.is_some());
    assert!(waiter.await.is_err());
}

#[tokio::test]
async fn mirrors_join_until_ready_or_removed() {
    let directory = PeerDirectory::new(local());
    let owned = id("10.0.0.1:5000:board1");
    let first = id("10.0.0.2:5000:board1");
    let second = id("10.0.0.2:5000:board2");
    let link = session();

    directory.insert(BoardState::new_owned(owned.clone()), Role::Owned).await;
    directory.insert(BoardState::new_mirror(first.clone()), Role::Mirror { session: link.clone() }).await;
    directory.insert(BoardState::new_mirror(second.clone()), Role::Mirror { session: link }).await;
    assert!(!directory.is_joining(&owned));
    assert!(directory.is_joining(&first));

    directory.mark_ready(&first);
    assert!(!directory.is_joining(&first));

    directory.remove(&second).await;
    assert!(!directory.is_joining(&second));
}
