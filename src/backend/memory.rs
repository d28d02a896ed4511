use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
#[cfg(test)]
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{
    check_password, now, Auth, Realtime, Tables, ALREADY_REGISTERED, FEED_CAPACITY,
    INVALID_CREDENTIALS,
};
use crate::error::BackendError;
use crate::schemas::{ChangeEvent, Expense, Group, NewExpense, NewGroup, Session, Table, User};
use crate::token::{hash_password, verify_password, SessionSigner};

struct Account {
    user: User,
    salt: String,
    hash: String,
}

#[derive(Default)]
struct State {
    accounts: HashMap<String, Account>,
    users: Vec<User>,
    groups: Vec<Group>,
    expenses: Vec<Expense>,
    /// Session id to expiry.
    sessions: HashMap<String, i64>,
}

impl State {
    fn open_session(&mut self, session_id: String, expires_at: i64, now: i64) {
        self.sessions.retain(|_, expiry| *expiry > now);
        self.sessions.insert(session_id, expires_at);
    }
}

/// Keeps every table in process memory. Used when no MongoDB URI is
/// configured and by the test suites.
pub struct MemoryBackend {
    signer: SessionSigner,
    state: Mutex<State>,
    groups_feed: broadcast::Sender<ChangeEvent>,
    expenses_feed: broadcast::Sender<ChangeEvent>,
    #[cfg(test)]
    calls: AtomicUsize,
    #[cfg(test)]
    outage: Mutex<Option<String>>,
}

impl MemoryBackend {
    pub fn new(signer: SessionSigner) -> Self {
        let (groups_feed, _) = broadcast::channel(FEED_CAPACITY);
        let (expenses_feed, _) = broadcast::channel(FEED_CAPACITY);
        MemoryBackend {
            signer,
            state: Mutex::new(State::default()),
            groups_feed,
            expenses_feed,
            #[cfg(test)]
            calls: AtomicUsize::new(0),
            #[cfg(test)]
            outage: Mutex::new(None),
        }
    }

    /// Number of calls that reached the service so far.
    #[cfg(test)]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Makes every following call fail with `message`, or heals the service.
    #[cfg(test)]
    pub fn set_outage(&self, message: Option<&str>) {
        if let Ok(mut outage) = self.outage.lock() {
            *outage = message.map(str::to_string);
        }
    }

    fn begin(&self) -> Result<MutexGuard<'_, State>, BackendError> {
        #[cfg(test)]
        {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(message) = self.outage.lock().ok().and_then(|outage| outage.clone()) {
                return Err(BackendError::Unavailable(message));
            }
        }
        self.state
            .lock()
            .map_err(|_| BackendError::Unavailable("memory store poisoned".to_string()))
    }
}

#[async_trait]
impl Tables for MemoryBackend {
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, BackendError> {
        let state = self.begin()?;
        Ok(state.users.iter().find(|user| user.email == email).cloned())
    }

    async fn groups_created_by(&self, user_id: &str) -> Result<Vec<Group>, BackendError> {
        let state = self.begin()?;
        Ok(state
            .groups
            .iter()
            .filter(|group| group.created_by == user_id)
            .cloned()
            .collect())
    }

    async fn expenses_for_group(&self, group_id: &str) -> Result<Vec<Expense>, BackendError> {
        let state = self.begin()?;
        Ok(state
            .expenses
            .iter()
            .filter(|expense| expense.group_id == group_id)
            .cloned()
            .collect())
    }

    async fn insert_group(&self, group: NewGroup) -> Result<Group, BackendError> {
        let mut state = self.begin()?;
        let group = group.into_row()?;
        state.groups.push(group.clone());
        drop(state);
        // No subscribers is not an error.
        let _ = self.groups_feed.send(ChangeEvent::GroupInserted(group.clone()));
        Ok(group)
    }

    async fn insert_expense(&self, expense: NewExpense) -> Result<Expense, BackendError> {
        let mut state = self.begin()?;
        let expense = expense.into_row()?;
        state.expenses.push(expense.clone());
        drop(state);
        let _ = self.expenses_feed.send(ChangeEvent::ExpenseInserted(expense.clone()));
        Ok(expense)
    }
}

#[async_trait]
impl Auth for MemoryBackend {
    async fn sign_up(&self, email: &str, password: &str) -> Result<User, BackendError> {
        let mut state = self.begin()?;
        check_password(password)?;
        if state.accounts.contains_key(email) {
            return Err(BackendError::Rejected(ALREADY_REGISTERED.to_string()));
        }
        let user = User {
            id: Uuid::new_v4().to_string(),
            email: email.to_string(),
        };
        let (salt, hash) = hash_password(password);
        state.accounts.insert(
            email.to_string(),
            Account {
                user: user.clone(),
                salt,
                hash,
            },
        );
        state.users.push(user.clone());
        Ok(user)
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, BackendError> {
        let mut state = self.begin()?;
        let user = match state.accounts.get(email) {
            Some(account) if verify_password(password, &account.salt, &account.hash) => {
                account.user.clone()
            }
            _ => return Err(BackendError::Rejected(INVALID_CREDENTIALS.to_string())),
        };
        let issued_at = now();
        let (access_token, claims) = self.signer.issue(&user.id, issued_at);
        state.open_session(claims.session_id, claims.expires_at, issued_at);
        Ok(Session {
            access_token,
            expires_at: claims.expires_at,
            user,
        })
    }

    async fn get_user(&self, access_token: &str) -> Result<Option<User>, BackendError> {
        let state = self.begin()?;
        let Some(claims) = self.signer.verify(access_token, now()) else {
            return Ok(None);
        };
        if !state.sessions.contains_key(&claims.session_id) {
            return Ok(None);
        }
        Ok(state.users.iter().find(|user| user.id == claims.user_id).cloned())
    }

    async fn sign_out(&self, access_token: &str) -> Result<(), BackendError> {
        let mut state = self.begin()?;
        if let Some(claims) = self.signer.verify(access_token, now()) {
            state.sessions.remove(&claims.session_id);
        }
        Ok(())
    }
}

impl Realtime for MemoryBackend {
    fn subscribe(&self, table: Table) -> broadcast::Receiver<ChangeEvent> {
        match table {
            Table::Groups => self.groups_feed.subscribe(),
            Table::Expenses => self.expenses_feed.subscribe(),
        }
    }
}
