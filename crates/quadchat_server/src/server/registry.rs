#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use quadchat_domain::{ChatError, SessionId, UserId};
use quadchat_protocol::ServerEvent;
use quadchat_store::{SessionRecord, SessionStore};
use tokio::sync::{RwLock, mpsc};
use tracing::debug;

/// Per-session outbound channel; the connection's writer task drains it.
pub type OutboundSender = mpsc::Sender<ServerEvent>;

pub const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

/// Maps authenticated users to their live connections.
///
/// The durable side (the session table) survives for cross-instance lookups;
/// the channel map is process-local and holds the actual delivery handles.
/// One user may hold several sessions at once, one per device.
#[derive(Clone)]
pub struct ConnectionRegistry {
	sessions: SessionStore,
	live: Arc<RwLock<HashMap<SessionId, OutboundSender>>>,
}

impl ConnectionRegistry {
	pub fn new(sessions: SessionStore) -> Self {
		Self {
			sessions,
			live: Arc::new(RwLock::new(HashMap::new())),
		}
	}

	/// Purge sessions left behind by a previous process. Run once at startup
	/// before accepting connections; entries from before this process started
	/// cannot correspond to live connections.
	pub async fn clear_stale(&self) -> Result<u64, ChatError> {
		self.live.write().await.clear();
		self.sessions.clear_all().await
	}

	pub async fn register(
		&self,
		session_id: &SessionId,
		user_id: UserId,
		outbound: OutboundSender,
	) -> Result<SessionRecord, ChatError> {
		let record = self.sessions.register(session_id, user_id).await?;
		self.live.write().await.insert(session_id.clone(), outbound);
		debug!(session = %session_id, user = %user_id, "session registered");
		Ok(record)
	}

	pub async fn unregister(&self, session_id: &SessionId) -> Result<Option<SessionRecord>, ChatError> {
		self.live.write().await.remove(session_id);
		let removed = self.sessions.unregister(session_id).await?;
		if removed.is_some() {
			debug!(session = %session_id, "session unregistered");
		}
		Ok(removed)
	}

	/// Resolve every live delivery handle for the given users. Sessions that
	/// are in the table but have no local channel (already torn down) are
	/// skipped.
	pub async fn senders_for_users(
		&self,
		user_ids: &[UserId],
	) -> Result<Vec<(SessionId, OutboundSender)>, ChatError> {
		if user_ids.is_empty() {
			return Ok(Vec::new());
		}

		let records = self.sessions.find_by_user_ids(user_ids).await?;
		let live = self.live.read().await;
		Ok(records
			.into_iter()
			.filter_map(|record| {
				live.get(&record.session_id)
					.map(|sender| (record.session_id, sender.clone()))
			})
			.collect())
	}

	pub async fn live_count(&self) -> usize {
		self.live.read().await.len()
	}
}
