#![forbid(unsafe_code)]

use quadchat_domain::{SessionId, UserId};
use quadchat_protocol::ServerEvent;
use quadchat_store::ChatStore;
use tokio::sync::mpsc;

use crate::server::registry::{ConnectionRegistry, OutboundSender};

async fn registry() -> ConnectionRegistry {
	let store = ChatStore::connect_in_memory().await.expect("store");
	ConnectionRegistry::new(store.sessions())
}

fn channel() -> (OutboundSender, mpsc::Receiver<ServerEvent>) {
	mpsc::channel(8)
}

fn session(name: &str) -> SessionId {
	SessionId::new(name).expect("session id")
}

#[tokio::test]
async fn register_then_unregister_round_trips() {
	let registry = registry().await;
	let user = UserId::new_v4();
	let id = session("s1");
	let (tx, _rx) = channel();

	let record = registry.register(&id, user, tx).await.unwrap();
	assert_eq!(record.user_id, user);
	assert_eq!(registry.live_count().await, 1);

	let removed = registry.unregister(&id).await.unwrap();
	assert_eq!(removed.map(|r| r.user_id), Some(user));
	assert_eq!(registry.live_count().await, 0);

	// a second unregister is a no-op
	assert!(registry.unregister(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn one_user_resolves_to_all_of_their_sessions() {
	let registry = registry().await;
	let user = UserId::new_v4();
	let other = UserId::new_v4();

	let (tx_a, _rx_a) = channel();
	let (tx_b, _rx_b) = channel();
	let (tx_other, _rx_other) = channel();
	registry.register(&session("a"), user, tx_a).await.unwrap();
	registry.register(&session("b"), user, tx_b).await.unwrap();
	registry.register(&session("c"), other, tx_other).await.unwrap();

	let mut sessions: Vec<String> = registry
		.senders_for_users(&[user])
		.await
		.unwrap()
		.into_iter()
		.map(|(id, _)| id.to_string())
		.collect();
	sessions.sort();
	assert_eq!(sessions, ["a", "b"]);

	let all = registry.senders_for_users(&[user, other]).await.unwrap();
	assert_eq!(all.len(), 3);
}

#[tokio::test]
async fn unknown_users_resolve_to_no_senders() {
	let registry = registry().await;
	assert!(registry.senders_for_users(&[]).await.unwrap().is_empty());
	assert!(registry.senders_for_users(&[UserId::new_v4()]).await.unwrap().is_empty());
}

#[tokio::test]
async fn unregistered_session_is_not_a_delivery_target() {
	let registry = registry().await;
	let user = UserId::new_v4();

	let (tx_a, _rx_a) = channel();
	let (tx_b, _rx_b) = channel();
	registry.register(&session("a"), user, tx_a).await.unwrap();
	registry.register(&session("b"), user, tx_b).await.unwrap();

	registry.unregister(&session("a")).await.unwrap();

	let senders = registry.senders_for_users(&[user]).await.unwrap();
	assert_eq!(senders.len(), 1);
	assert_eq!(senders[0].0.to_string(), "b");
}

#[tokio::test]
async fn clear_stale_drops_everything() {
	let registry = registry().await;
	let user = UserId::new_v4();

	let (tx, _rx) = channel();
	registry.register(&session("old"), user, tx).await.unwrap();

	let cleared = registry.clear_stale().await.unwrap();
	assert_eq!(cleared, 1);
	assert_eq!(registry.live_count().await, 0);
	assert!(registry.senders_for_users(&[user]).await.unwrap().is_empty());
}
