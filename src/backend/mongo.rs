use std::fmt::Display;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use async_trait::async_trait;
use bson::doc;
use futures::{Stream, StreamExt, TryStreamExt};
use mongodb::{
    change_stream::{event::ChangeStreamEvent, ChangeStream},
    error::{ErrorKind, WriteError, WriteFailure},
    options::IndexOptions,
    Client, Collection, Database, IndexModel,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{
    check_password, now, Auth, Realtime, Tables, ALREADY_REGISTERED, FEED_CAPACITY,
    INVALID_CREDENTIALS,
};
use crate::error::BackendError;
use crate::schemas::{ChangeEvent, Expense, Group, NewExpense, NewGroup, Session, Table, User};
use crate::token::{hash_password, verify_password, SessionSigner};

#[derive(Deserialize, Serialize)]
struct AuthAccount {
    id: String,
    email: String,
    salt: String,
    hash: String,
}

#[derive(Deserialize, Serialize)]
struct SessionRecord {
    id: String,
    user_id: String,
    expires_at: i64,
    /// Same instant as `expires_at`; the TTL index reads this one.
    expires: bson::DateTime,
}

pub struct MongoBackend {
    db: Database,
    signer: SessionSigner,
    groups_feed: broadcast::Sender<ChangeEvent>,
    expenses_feed: broadcast::Sender<ChangeEvent>,
    /// Set when change streams are unavailable (standalone server) or have
    /// closed; inserts made by this process are then published directly.
    publish_locally: Arc<AtomicBool>,
}

fn unique_email_index() -> IndexModel {
    IndexModel::builder()
        .keys(doc! { "email": 1 })
        .options(IndexOptions::builder().unique(true).build())
        .build()
}

fn session_expiry_index() -> IndexModel {
    IndexModel::builder()
        .keys(doc! { "expires": 1 })
        .options(IndexOptions::builder().expire_after(Duration::ZERO).build())
        .build()
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(WriteError { code: 11000, .. }))
    )
}

impl MongoBackend {
    pub async fn connect(
        uri: &str,
        database: &str,
        signer: SessionSigner,
    ) -> Result<Self, BackendError> {
        let client = Client::with_uri_str(uri).await?;
        let db = client.database(database);
        let (groups_feed, _) = broadcast::channel(FEED_CAPACITY);
        let (expenses_feed, _) = broadcast::channel(FEED_CAPACITY);

        let backend = MongoBackend {
            db,
            signer,
            groups_feed,
            expenses_feed,
            publish_locally: Arc::new(AtomicBool::new(false)),
        };
        backend.create_indexes().await?;
        if let Err(err) = backend.watch_inserts().await {
            warn!(
                "change streams unavailable, live updates limited to this process: {}",
                err
            );
            backend.publish_locally.store(true, Ordering::SeqCst);
        }
        info!("connected to MongoDB database {}", database);
        Ok(backend)
    }

    async fn create_indexes(&self) -> Result<(), BackendError> {
        self.accounts().create_index(unique_email_index(), None).await?;
        self.users().create_index(unique_email_index(), None).await?;
        self.sessions().create_index(session_expiry_index(), None).await?;
        Ok(())
    }

    async fn watch_inserts(&self) -> Result<(), BackendError> {
        let groups = open_insert_stream(&self.groups()).await?;
        let expenses = open_insert_stream(&self.expenses()).await?;
        tokio::spawn(forward(
            groups.map(|event| event.map(|event| event.full_document)),
            self.groups_feed.clone(),
            ChangeEvent::GroupInserted,
            self.publish_locally.clone(),
        ));
        tokio::spawn(forward(
            expenses.map(|event| event.map(|event| event.full_document)),
            self.expenses_feed.clone(),
            ChangeEvent::ExpenseInserted,
            self.publish_locally.clone(),
        ));
        Ok(())
    }

    fn users(&self) -> Collection<User> {
        self.db.collection("User")
    }

    fn accounts(&self) -> Collection<AuthAccount> {
        self.db.collection("auth_users")
    }

    fn sessions(&self) -> Collection<SessionRecord> {
        self.db.collection("sessions")
    }

    fn groups(&self) -> Collection<Group> {
        self.db.collection("Groups")
    }

    fn expenses(&self) -> Collection<Expense> {
        self.db.collection("expenses")
    }

    fn publish(&self, feed: &broadcast::Sender<ChangeEvent>, event: ChangeEvent) {
        if self.publish_locally.load(Ordering::SeqCst) {
            let _ = feed.send(event);
        }
    }
}

async fn open_insert_stream<T>(
    collection: &Collection<T>,
) -> Result<ChangeStream<ChangeStreamEvent<T>>, BackendError>
where
    T: DeserializeOwned + Unpin + Send + Sync,
{
    let pipeline = [doc! { "$match": { "operationType": "insert" } }];
    Ok(collection.watch(pipeline, None).await?)
}

/// Relays inserted rows until the stream fails or ends, then hands
/// publishing over to the inserting process.
async fn forward<S, T, E>(
    mut stream: S,
    feed: broadcast::Sender<ChangeEvent>,
    wrap: fn(T) -> ChangeEvent,
    publish_locally: Arc<AtomicBool>,
) where
    S: Stream<Item = Result<Option<T>, E>> + Unpin,
    E: Display,
{
    while let Some(event) = stream.next().await {
        match event {
            Ok(Some(row)) => {
                let _ = feed.send(wrap(row));
            }
            Ok(None) => {}
            Err(err) => {
                error!("change stream closed: {}", err);
                break;
            }
        }
    }
    warn!("live updates limited to this process from now on");
    publish_locally.store(true, Ordering::SeqCst);
}

#[async_trait]
impl Tables for MongoBackend {
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, BackendError> {
        Ok(self.users().find_one(doc! { "email": email }, None).await?)
    }

    async fn groups_created_by(&self, user_id: &str) -> Result<Vec<Group>, BackendError> {
        let cursor = self.groups().find(doc! { "created_by": user_id }, None).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn expenses_for_group(&self, group_id: &str) -> Result<Vec<Expense>, BackendError> {
        let cursor = self.expenses().find(doc! { "group_id": group_id }, None).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn insert_group(&self, group: NewGroup) -> Result<Group, BackendError> {
        let group = group.into_row()?;
        self.groups().insert_one(&group, None).await?;
        self.publish(&self.groups_feed, ChangeEvent::GroupInserted(group.clone()));
        Ok(group)
    }

    async fn insert_expense(&self, expense: NewExpense) -> Result<Expense, BackendError> {
        let expense = expense.into_row()?;
        self.expenses().insert_one(&expense, None).await?;
        self.publish(&self.expenses_feed, ChangeEvent::ExpenseInserted(expense.clone()));
        Ok(expense)
    }
}

#[async_trait]
impl Auth for MongoBackend {
    async fn sign_up(&self, email: &str, password: &str) -> Result<User, BackendError> {
        check_password(password)?;
        let user = User {
            id: Uuid::new_v4().to_string(),
            email: email.to_string(),
        };
        let (salt, hash) = hash_password(password);
        let account = AuthAccount {
            id: user.id.clone(),
            email: user.email.clone(),
            salt,
            hash,
        };
        // Both collections carry a unique index on email.
        if let Err(err) = self.accounts().insert_one(&account, None).await {
            return Err(registration_error(err));
        }
        if let Err(err) = self.users().insert_one(&user, None).await {
            let orphan = doc! { "id": user.id.as_str() };
            if let Err(cleanup) = self.accounts().delete_one(orphan, None).await {
                error!(user_id = %user.id, "could not remove orphaned account: {}", cleanup);
            }
            return Err(registration_error(err));
        }
        Ok(user)
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, BackendError> {
        let account = self.accounts().find_one(doc! { "email": email }, None).await?;
        let account = match account {
            Some(account) if verify_password(password, &account.salt, &account.hash) => account,
            _ => return Err(BackendError::Rejected(INVALID_CREDENTIALS.to_string())),
        };
        let (access_token, claims) = self.signer.issue(&account.id, now());
        let record = SessionRecord {
            id: claims.session_id,
            user_id: claims.user_id,
            expires_at: claims.expires_at,
            expires: bson::DateTime::from_millis(claims.expires_at.saturating_mul(1000)),
        };
        self.sessions().insert_one(&record, None).await?;
        Ok(Session {
            access_token,
            expires_at: record.expires_at,
            user: User {
                id: account.id,
                email: account.email,
            },
        })
    }

    async fn get_user(&self, access_token: &str) -> Result<Option<User>, BackendError> {
        let Some(claims) = self.signer.verify(access_token, now()) else {
            return Ok(None);
        };
        let session = self
            .sessions()
            .find_one(doc! { "id": claims.session_id.as_str() }, None)
            .await?;
        if session.is_none() {
            return Ok(None);
        }
        let user = self
            .users()
            .find_one(doc! { "id": claims.user_id.as_str() }, None)
            .await?;
        Ok(user)
    }

    async fn sign_out(&self, access_token: &str) -> Result<(), BackendError> {
        if let Some(claims) = self.signer.verify(access_token, now()) {
            self.sessions()
                .delete_one(doc! { "id": claims.session_id }, None)
                .await?;
        }
        Ok(())
    }
}

fn registration_error(err: mongodb::error::Error) -> BackendError {
    if is_duplicate_key(&err) {
        BackendError::Rejected(ALREADY_REGISTERED.to_string())
    } else {
        err.into()
    }
}

impl Realtime for MongoBackend {
    fn subscribe(&self, table: Table) -> broadcast::Receiver<ChangeEvent> {
        match table {
            Table::Groups => self.groups_feed.subscribe(),
            Table::Expenses => self.expenses_feed.subscribe(),
        }
    }
}
