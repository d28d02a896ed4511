use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::BackendError;

pub type UserId = String;
pub type GroupId = String;

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Expense {
    pub id: String,
    pub description: String,
    pub amount: f64,
    pub group_id: GroupId,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct NewGroup {
    pub name: String,
    pub created_by: UserId,
}

/// Expense row as handed to the store. Columns hold raw JSON so request
/// bodies pass through untouched; the store coerces and checks them.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct NewExpense {
    pub description: Option<Value>,
    pub amount: Option<Value>,
    pub group_id: GroupId,
    pub user_id: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Session {
    pub access_token: String,
    pub expires_at: i64,
    pub user: User,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Table {
    Groups,
    Expenses,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ChangeEvent {
    GroupInserted(Group),
    ExpenseInserted(Expense),
}

fn not_null(column: &str) -> BackendError {
    BackendError::Rejected(format!(
        "null value in column \"{column}\" violates not-null constraint"
    ))
}

fn invalid_input(kind: &str, value: &Value) -> BackendError {
    let shown = match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    BackendError::Rejected(format!(
        "invalid input syntax for type {kind}: \"{shown}\""
    ))
}

fn text_column(column: &str, value: Option<Value>) -> Result<String, BackendError> {
    match value {
        None | Some(Value::Null) => Err(not_null(column)),
        Some(Value::String(text)) => Ok(text),
        Some(value @ (Value::Number(_) | Value::Bool(_))) => Ok(value.to_string()),
        Some(value) => Err(invalid_input("text", &value)),
    }
}

// Numeric strings are accepted the way a SQL numeric column casts them.
fn numeric_column(column: &str, value: Option<Value>) -> Result<f64, BackendError> {
    let value = match value {
        None | Some(Value::Null) => return Err(not_null(column)),
        Some(value) => value,
    };
    let parsed = match &value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(amount) if amount.is_finite() => Ok(amount),
        _ => Err(invalid_input("numeric", &value)),
    }
}

impl NewGroup {
    pub fn into_row(self) -> Result<Group, BackendError> {
        if self.name.is_empty() {
            return Err(not_null("name"));
        }
        Ok(Group {
            id: Uuid::new_v4().to_string(),
            name: self.name,
            created_by: self.created_by,
            created_at: Utc::now(),
        })
    }
}

impl NewExpense {
    pub fn into_row(self) -> Result<Expense, BackendError> {
        let description = text_column("description", self.description)?;
        let amount = numeric_column("amount", self.amount)?;
        let user_id = text_column("user_id", self.user_id)?;
        Ok(Expense {
            id: Uuid::new_v4().to_string(),
            description,
            amount,
            group_id: self.group_id,
            user_id,
            created_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_amount_is_rejected_by_column() {
        let expense = NewExpense {
            description: Some("Lunch".into()),
            amount: Some(Value::Null),
            group_id: "g1".into(),
            user_id: Some("u1".into()),
        };
        let err = expense.into_row().unwrap_err();
        assert_eq!(
            err.to_string(),
            "null value in column \"amount\" violates not-null constraint"
        );
    }

    #[test]
    fn amount_accepts_numbers_and_numeric_strings() {
        for amount in [json!(12.5), json!("12.5"), json!(" 12.5 ")] {
            let expense = NewExpense {
                description: Some(json!("Lunch")),
                amount: Some(amount),
                group_id: "g1".into(),
                user_id: Some(json!("u1")),
            };
            assert_eq!(expense.into_row().unwrap().amount, 12.5);
        }
    }

    #[test]
    fn non_numeric_amount_is_rejected_by_type() {
        for (amount, shown) in [(json!("abc"), "abc"), (json!(true), "true"), (json!([1]), "[1]")] {
            let expense = NewExpense {
                description: Some(json!("Lunch")),
                amount: Some(amount),
                group_id: "g1".into(),
                user_id: Some(json!("u1")),
            };
            assert_eq!(
                expense.into_row().unwrap_err().to_string(),
                format!("invalid input syntax for type numeric: \"{shown}\"")
            );
        }
    }

    #[test]
    fn complete_expense_gets_an_id() {
        let expense = NewExpense {
            description: Some("Lunch".into()),
            amount: Some(12.5_f64.into()),
            group_id: "g1".into(),
            user_id: Some("u1".into()),
        }
        .into_row()
        .unwrap();
        assert!(!expense.id.is_empty());
        assert_eq!(expense.group_id, "g1");
        assert_eq!(expense.amount, 12.5);
    }
}
