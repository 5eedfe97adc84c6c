#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};
use huddle_domain::{MessageId, UserId};
use huddle_protocol::pb;
use tokio::sync::Mutex;

use crate::util::time::unix_ms_now;

/// Canonical persisted chat message. The id and timestamp are assigned here,
/// never by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
	pub id: MessageId,
	pub sender: UserId,
	pub receiver: UserId,
	pub content: String,
	pub timestamp_unix_ms: i64,
}

impl StoredMessage {
	fn assign(sender: &UserId, receiver: &UserId, content: &str) -> Self {
		Self {
			id: MessageId::new_v4(),
			sender: sender.clone(),
			receiver: receiver.clone(),
			content: content.to_string(),
			timestamp_unix_ms: unix_ms_now(),
		}
	}

	/// Wire form delivered to both legs of a chat relay.
	pub fn to_wire(&self) -> pb::ReceiveMessage {
		pb::ReceiveMessage {
			id: self.id.to_string(),
			sender: self.sender.as_str().to_string(),
			receiver: self.receiver.as_str().to_string(),
			content: self.content.clone(),
			timestamp_unix_ms: self.timestamp_unix_ms,
		}
	}
}

/// Durable message storage consumed by the relay.
///
/// `persist_message` must complete (or be known to have failed) before a chat
/// message is relayed; offline receivers recover missed messages through
/// `fetch_history`, never through relay retry.
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
	async fn persist_message(&self, sender: &UserId, receiver: &UserId, content: &str) -> anyhow::Result<StoredMessage>;

	/// All messages between `a` and `b`, in either direction, ascending by
	/// timestamp. Offline receivers catch up through this, not relay retry.
	#[allow(dead_code)]
	async fn fetch_history(&self, a: &UserId, b: &UserId) -> anyhow::Result<Vec<StoredMessage>>;
}

/// Process-lifetime store for development and tests.
#[derive(Default)]
pub struct InMemoryMessageStore {
	inner: Mutex<Vec<StoredMessage>>,
}

#[async_trait::async_trait]
impl MessageStore for InMemoryMessageStore {
	async fn persist_message(&self, sender: &UserId, receiver: &UserId, content: &str) -> anyhow::Result<StoredMessage> {
		let message = StoredMessage::assign(sender, receiver, content);
		let mut guard = self.inner.lock().await;
		guard.push(message.clone());
		Ok(message)
	}

	async fn fetch_history(&self, a: &UserId, b: &UserId) -> anyhow::Result<Vec<StoredMessage>> {
		let guard = self.inner.lock().await;
		let mut history = guard
			.iter()
			.filter(|m| (&m.sender == a && &m.receiver == b) || (&m.sender == b && &m.receiver == a))
			.cloned()
			.collect::<Vec<_>>();
		history.sort_by_key(|m| m.timestamp_unix_ms);
		Ok(history)
	}
}

/// Database-backed store, selected by URL scheme.
#[derive(Clone)]
pub struct SqlMessageStore {
	backend: SqlBackend,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
	Mysql(sqlx::MySqlPool),
}

impl SqlMessageStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			Ok(Self {
				backend: SqlBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self {
				backend: SqlBackend::Postgres(pool),
			})
		} else if database_url.starts_with("mysql:") || database_url.starts_with("mariadb:") {
			let pool = sqlx::MySqlPool::connect(database_url).await.context("connect mysql")?;
			sqlx::migrate!("migrations/mysql")
				.run(&pool)
				.await
				.context("run mysql migrations")?;

			Ok(Self {
				backend: SqlBackend::Mysql(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite:, postgres:, mysql:)"))
		}
	}
}

type MessageRow = (String, String, String, String, i64);

fn row_to_message(row: MessageRow) -> anyhow::Result<StoredMessage> {
	let (id, sender, receiver, content, timestamp_unix_ms) = row;
	Ok(StoredMessage {
		id: MessageId::parse(&id).map_err(|e| anyhow!("corrupt message id in store: {e}"))?,
		sender: UserId::new(sender).map_err(|e| anyhow!("corrupt sender in store: {e}"))?,
		receiver: UserId::new(receiver).map_err(|e| anyhow!("corrupt receiver in store: {e}"))?,
		content,
		timestamp_unix_ms,
	})
}

#[async_trait::async_trait]
impl MessageStore for SqlMessageStore {
	async fn persist_message(&self, sender: &UserId, receiver: &UserId, content: &str) -> anyhow::Result<StoredMessage> {
		let message = StoredMessage::assign(sender, receiver, content);

		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO messages (id, sender, receiver, content, timestamp_unix_ms) VALUES (?, ?, ?, ?, ?)",
				)
				.bind(message.id.to_string())
				.bind(message.sender.as_str())
				.bind(message.receiver.as_str())
				.bind(&message.content)
				.bind(message.timestamp_unix_ms)
				.execute(pool)
				.await
				.context("insert message (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO messages (id, sender, receiver, content, timestamp_unix_ms) VALUES ($1, $2, $3, $4, $5)",
				)
				.bind(message.id.to_string())
				.bind(message.sender.as_str())
				.bind(message.receiver.as_str())
				.bind(&message.content)
				.bind(message.timestamp_unix_ms)
				.execute(pool)
				.await
				.context("insert message (postgres)")?;
			}
			SqlBackend::Mysql(pool) => {
				sqlx::query(
					"INSERT INTO messages (id, sender, receiver, content, timestamp_unix_ms) VALUES (?, ?, ?, ?, ?)",
				)
				.bind(message.id.to_string())
				.bind(message.sender.as_str())
				.bind(message.receiver.as_str())
				.bind(&message.content)
				.bind(message.timestamp_unix_ms)
				.execute(pool)
				.await
				.context("insert message (mysql)")?;
			}
		}

		metrics::counter!("huddle_server_messages_persisted_total").increment(1);
		Ok(message)
	}

	async fn fetch_history(&self, a: &UserId, b: &UserId) -> anyhow::Result<Vec<StoredMessage>> {
		let rows: Vec<MessageRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as(
					"SELECT id, sender, receiver, content, timestamp_unix_ms FROM messages \
					WHERE (sender = ? AND receiver = ?) OR (sender = ? AND receiver = ?) \
					ORDER BY timestamp_unix_ms ASC",
				)
				.bind(a.as_str())
				.bind(b.as_str())
				.bind(b.as_str())
				.bind(a.as_str())
				.fetch_all(pool)
				.await
				.context("select history (sqlite)")?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as(
					"SELECT id, sender, receiver, content, timestamp_unix_ms FROM messages \
					WHERE (sender = $1 AND receiver = $2) OR (sender = $3 AND receiver = $4) \
					ORDER BY timestamp_unix_ms ASC",
				)
				.bind(a.as_str())
				.bind(b.as_str())
				.bind(b.as_str())
				.bind(a.as_str())
				.fetch_all(pool)
				.await
				.context("select history (postgres)")?
			}
			SqlBackend::Mysql(pool) => {
				sqlx::query_as(
					"SELECT id, sender, receiver, content, timestamp_unix_ms FROM messages \
					WHERE (sender = ? AND receiver = ?) OR (sender = ? AND receiver = ?) \
					ORDER BY timestamp_unix_ms ASC",
				)
				.bind(a.as_str())
				.bind(b.as_str())
				.bind(b.as_str())
				.bind(a.as_str())
				.fetch_all(pool)
				.await
				.context("select history (mysql)")?
			}
		};

		rows.into_iter().map(row_to_message).collect()
	}
}
