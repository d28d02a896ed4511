use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::BackendError;
use crate::schemas::{ChangeEvent, Expense, Group, NewExpense, NewGroup, Session, Table, User};

pub mod memory;
pub mod mongo;

pub use memory::MemoryBackend;
pub use mongo::MongoBackend;

/// Capacity of each realtime channel before slow subscribers start lagging.
pub(crate) const FEED_CAPACITY: usize = 256;

pub(crate) const MIN_PASSWORD_LEN: usize = 6;
pub(crate) const SHORT_PASSWORD: &str = "Password should be at least 6 characters.";
pub(crate) const ALREADY_REGISTERED: &str = "User already registered";
pub(crate) const INVALID_CREDENTIALS: &str = "Invalid login credentials";

#[async_trait]
pub trait Tables: Send + Sync {
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, BackendError>;
    async fn groups_created_by(&self, user_id: &str) -> Result<Vec<Group>, BackendError>;
    async fn expenses_for_group(&self, group_id: &str) -> Result<Vec<Expense>, BackendError>;
    async fn insert_group(&self, group: NewGroup) -> Result<Group, BackendError>;
    async fn insert_expense(&self, expense: NewExpense) -> Result<Expense, BackendError>;
}

#[async_trait]
pub trait Auth: Send + Sync {
    async fn sign_up(&self, email: &str, password: &str) -> Result<User, BackendError>;
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, BackendError>;
    /// Resolves an access token to its user; `None` for unknown, expired or
    /// revoked tokens.
    async fn get_user(&self, access_token: &str) -> Result<Option<User>, BackendError>;
    async fn sign_out(&self, access_token: &str) -> Result<(), BackendError>;
}

/// Insert notifications, one channel per table.
pub trait Realtime: Send + Sync {
    fn subscribe(&self, table: Table) -> broadcast::Receiver<ChangeEvent>;
}

/// The three ports bundled together; cheap to clone into handlers.
#[derive(Clone)]
pub struct Backend {
    pub tables: Arc<dyn Tables>,
    pub auth: Arc<dyn Auth>,
    pub realtime: Arc<dyn Realtime>,
}

impl Backend {
    pub fn new<B>(inner: Arc<B>) -> Self
    where
        B: Tables + Auth + Realtime + 'static,
    {
        Backend {
            tables: inner.clone(),
            auth: inner.clone(),
            realtime: inner,
        }
    }
}

pub(crate) fn check_password(password: &str) -> Result<(), BackendError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(BackendError::Rejected(SHORT_PASSWORD.to_string()));
    }
    Ok(())
}

pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
