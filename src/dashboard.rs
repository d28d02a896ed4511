use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, Tables};
use crate::error::BackendError;
use crate::schemas::{ChangeEvent, Expense, Group, GroupId, NewExpense, NewGroup, Table, User};
use crate::store::RecordStore;

pub const ENTER_GROUP_NAME: &str = "Enter a group name!";
pub const ALL_FIELDS_REQUIRED: &str = "All fields are required!";
pub const AMOUNT_NOT_A_NUMBER: &str = "Amount must be a number!";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    Auth,
    Dashboard,
}

impl Route {
    pub fn path(self) -> &'static str {
        match self {
            Route::Auth => "/auth",
            Route::Dashboard => "/dashboard",
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum Outcome {
    Done,
    Alert(String),
    Redirect(Route),
    /// The backend call failed; already logged.
    Failed(String),
}

/// Who is signed in. Handed to every data-access call instead of being read
/// from ambient state.
#[derive(Clone, Debug, PartialEq)]
pub struct AuthContext {
    pub user: User,
    pub access_token: String,
}

async fn fetch_groups(tables: &dyn Tables, ctx: &AuthContext) -> Result<Vec<Group>, BackendError> {
    tables.groups_created_by(&ctx.user.id).await
}

async fn insert_group(
    tables: &dyn Tables,
    ctx: &AuthContext,
    name: String,
) -> Result<Group, BackendError> {
    tables
        .insert_group(NewGroup {
            name,
            created_by: ctx.user.id.clone(),
        })
        .await
}

async fn insert_expense(
    tables: &dyn Tables,
    ctx: &AuthContext,
    group_id: GroupId,
    description: String,
    amount: f64,
) -> Result<Expense, BackendError> {
    tables
        .insert_expense(NewExpense {
            description: Some(Value::String(description)),
            amount: Some(Value::from(amount)),
            group_id,
            user_id: Some(Value::String(ctx.user.id.clone())),
        })
        .await
}

/// A pending expense fetch for one selection. Runs without borrowing the
/// dashboard so a newer selection can start before it resolves.
pub struct ExpenseLoad {
    epoch: u64,
    group_id: GroupId,
    tables: Arc<dyn Tables>,
}

pub struct LoadedExpenses {
    epoch: u64,
    group_id: GroupId,
    result: Result<Vec<Expense>, BackendError>,
}

impl ExpenseLoad {
    pub async fn run(self) -> LoadedExpenses {
        let result = self.tables.expenses_for_group(&self.group_id).await;
        LoadedExpenses {
            epoch: self.epoch,
            group_id: self.group_id,
            result,
        }
    }
}

#[derive(Debug, PartialEq, Serialize)]
pub struct GroupButton {
    pub id: GroupId,
    pub name: String,
    pub selected: bool,
}

#[derive(Debug, PartialEq, Serialize)]
pub struct ExpenseRow {
    pub id: String,
    pub description: String,
    pub amount: String,
}

#[cfg(test)]
impl std::fmt::Display for ExpenseRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} | {}", self.description, self.amount)
    }
}

#[derive(Debug, PartialEq, Serialize)]
pub struct DashboardView {
    pub welcome: String,
    pub groups: Vec<GroupButton>,
    pub expenses: Option<Vec<ExpenseRow>>,
}

pub struct Dashboard {
    backend: Backend,
    context: Option<AuthContext>,
    groups: RecordStore<Group>,
    expenses: RecordStore<Expense>,
    selected_group: Option<GroupId>,
    epoch: u64,
    group_name: String,
    expense_amount: String,
    expense_description: String,
    group_feed: Option<broadcast::Receiver<ChangeEvent>>,
    expense_feed: Option<broadcast::Receiver<ChangeEvent>>,
}

impl Dashboard {
    pub fn new(backend: Backend) -> Self {
        Dashboard {
            backend,
            context: None,
            groups: RecordStore::default(),
            expenses: RecordStore::default(),
            selected_group: None,
            epoch: 0,
            group_name: String::new(),
            expense_amount: String::new(),
            expense_description: String::new(),
            group_feed: None,
            expense_feed: None,
        }
    }

    pub fn user(&self) -> Option<&User> {
        self.context.as_ref().map(|ctx| &ctx.user)
    }

    #[cfg(test)]
    pub fn selected_group(&self) -> Option<&str> {
        self.selected_group.as_deref()
    }

    #[cfg(test)]
    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.iter()
    }

    #[cfg(test)]
    pub fn expenses(&self) -> impl Iterator<Item = &Expense> {
        self.expenses.iter()
    }

    pub fn set_group_name(&mut self, name: impl Into<String>) {
        self.group_name = name.into();
    }

    pub fn set_expense_amount(&mut self, amount: impl Into<String>) {
        self.expense_amount = amount.into();
    }

    pub fn set_expense_description(&mut self, description: impl Into<String>) {
        self.expense_description = description.into();
    }

    /// Checks the session and loads the user's groups. Without a valid
    /// session nothing else happens.
    pub async fn mount(&mut self, access_token: Option<&str>) -> Outcome {
        let Some(token) = access_token else {
            return Outcome::Redirect(Route::Auth);
        };
        let user = match self.backend.auth.get_user(token).await {
            Ok(Some(user)) => user,
            Ok(None) => return Outcome::Redirect(Route::Auth),
            Err(err) => {
                warn!("session check failed: {}", err);
                return Outcome::Redirect(Route::Auth);
            }
        };

        self.context = Some(AuthContext {
            user,
            access_token: token.to_string(),
        });
        // Subscribe before fetching so nothing inserted in between is missed.
        self.group_feed = Some(self.backend.realtime.subscribe(Table::Groups));
        self.refresh_groups().await
    }

    pub async fn refresh_groups(&mut self) -> Outcome {
        let Some(ctx) = &self.context else {
            return Outcome::Redirect(Route::Auth);
        };
        match fetch_groups(&*self.backend.tables, ctx).await {
            Ok(groups) => {
                self.groups.replace_all(groups);
                Outcome::Done
            }
            Err(err) => {
                error!("Failed to fetch groups: {}", err);
                Outcome::Failed(err.to_string())
            }
        }
    }
    pub async fn select_group(&mut self, group_id: &str) -> Outcome {
        match self.begin_select(group_id) {
            Ok(load) => {
                let loaded = load.run().await;
                self.complete_select(loaded)
            }
            Err(outcome) => outcome,
        }
    }

    pub fn begin_select(&mut self, group_id: &str) -> Result<ExpenseLoad, Outcome> {
        if self.context.is_none() {
            return Err(Outcome::Redirect(Route::Auth));
        }
        self.epoch += 1;
        self.selected_group = Some(group_id.to_string());
        self.expenses.clear();
        if self.expense_feed.is_none() {
            self.expense_feed = Some(self.backend.realtime.subscribe(Table::Expenses));
        }
        Ok(ExpenseLoad {
            epoch: self.epoch,
            group_id: group_id.to_string(),
            tables: self.backend.tables.clone(),
        })
    }

    /// Applies a finished fetch unless another selection started after it.
    pub fn complete_select(&mut self, loaded: LoadedExpenses) -> Outcome {
        if loaded.epoch != self.epoch {
            debug!(group_id = %loaded.group_id, "dropping expenses of a superseded selection");
            return Outcome::Done;
        }
        match loaded.result {
            Ok(expenses) => {
                self.expenses.replace_all(expenses);
                Outcome::Done
            }
            Err(err) => {
                error!("Failed to fetch expenses: {}", err);
                Outcome::Failed(err.to_string())
            }
        }
    }

    pub async fn create_group(&mut self) -> Outcome {
        let Some(ctx) = &self.context else {
            return Outcome::Redirect(Route::Auth);
        };
        if self.group_name.is_empty() {
            return Outcome::Alert(ENTER_GROUP_NAME.to_string());
        }
        match insert_group(&*self.backend.tables, ctx, self.group_name.clone()).await {
            Ok(group) => {
                info!(group_id = %group.id, "group created");
                self.group_name.clear();
                Outcome::Done
            }
            Err(err) => {
                error!("Error creating group: {}", err);
                Outcome::Failed(err.to_string())
            }
        }
    }

    pub async fn create_expense(&mut self) -> Outcome {
        let Some(ctx) = &self.context else {
            return Outcome::Redirect(Route::Auth);
        };
        let filled = !self.expense_amount.is_empty() && !self.expense_description.is_empty();
        let group_id = match &self.selected_group {
            Some(group_id) if filled => group_id.clone(),
            _ => return Outcome::Alert(ALL_FIELDS_REQUIRED.to_string()),
        };
        let amount = match self.expense_amount.trim().parse::<f64>() {
            Ok(amount) if amount.is_finite() => amount,
            _ => return Outcome::Alert(AMOUNT_NOT_A_NUMBER.to_string()),
        };

        let description = self.expense_description.clone();
        match insert_expense(&*self.backend.tables, ctx, group_id, description, amount).await {
            Ok(expense) => {
                info!(expense_id = %expense.id, group_id = %expense.group_id, "expense created");
                self.expense_amount.clear();
                self.expense_description.clear();
                Outcome::Done
            }
            Err(err) => {
                error!("Error creating expense: {}", err);
                Outcome::Failed(err.to_string())
            }
        }
    }

    /// Ends the session and drops every subscription and loaded row.
    pub async fn sign_out(&mut self) -> Outcome {
        if let Some(ctx) = self.context.take() {
            if let Err(err) = self.backend.auth.sign_out(&ctx.access_token).await {
                warn!("sign out failed: {}", err);
            }
        }
        self.group_feed = None;
        self.expense_feed = None;
        self.groups.clear();
        self.expenses.clear();
        self.selected_group = None;
        // Invalidates loads still in flight.
        self.epoch += 1;
        Outcome::Redirect(Route::Auth)
    }

    /// Waits for the next live notification. `None` once no subscription is
    /// open.
    pub async fn next_change(&mut self) -> Option<ChangeEvent> {
        loop {
            let received = match (self.group_feed.as_mut(), self.expense_feed.as_mut()) {
                (None, None) => return None,
                (Some(groups), None) => groups.recv().await,
                (None, Some(expenses)) => expenses.recv().await,
                (Some(groups), Some(expenses)) => tokio::select! {
                    event = groups.recv() => event,
                    event = expenses.recv() => event,
                },
            };
            match received {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("live feed lagged, {} notifications skipped", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Folds a notification into the view. Returns true when a row was added.
    ///
    /// Group inserts are filtered by creator, the same rule as the initial
    /// fetch. Unlike the web client this screen replaces, other users' groups
    /// never appear live.
    pub fn apply(&mut self, event: ChangeEvent) -> bool {
        match event {
            ChangeEvent::GroupInserted(group) => match &self.context {
                Some(ctx) if group.created_by == ctx.user.id => self.groups.upsert(group),
                _ => false,
            },
            // Compared with the selection at delivery time, not subscription time.
            ChangeEvent::ExpenseInserted(expense) => {
                if self.selected_group.as_deref() == Some(expense.group_id.as_str()) {
                    self.expenses.upsert(expense)
                } else {
                    false
                }
            }
        }
    }

    pub fn render(&self) -> DashboardView {
        let email = self.user().map(|user| user.email.as_str()).unwrap_or_default();
        let groups = self
            .groups
            .iter()
            .map(|group| GroupButton {
                id: group.id.clone(),
                name: group.name.clone(),
                selected: self.selected_group.as_deref() == Some(group.id.as_str()),
            })
            .collect();
        let expenses = self.selected_group.as_ref().map(|_| {
            self.expenses
                .iter()
                .map(|expense| ExpenseRow {
                    id: expense.id.clone(),
                    description: expense.description.clone(),
                    amount: format!("${}", expense.amount),
                })
                .collect()
        });
        DashboardView {
            welcome: format!("Welcome, {email}"),
            groups,
            expenses,
        }
    }
}
