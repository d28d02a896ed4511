use actix_web::{http::StatusCode, web, HttpResponse};
use serde::Deserialize;
use serde_json::Value;
use tracing::error;

use crate::backend::Backend;
use crate::error::error_body;
use crate::schemas::NewExpense;

// Fields stay raw JSON; the store decides what it accepts.
#[derive(Deserialize)]
struct ExpenseBody {
    description: Option<Value>,
    amount: Option<Value>,
    #[serde(rename = "userId")]
    user_id: Option<Value>,
}

async fn get_expenses(backend: web::Data<Backend>, group_id: web::Path<String>) -> HttpResponse {
    match backend.tables.expenses_for_group(&group_id).await {
        Ok(expenses) => HttpResponse::Ok().json(expenses),
        Err(err) => {
            error!(group_id = %group_id, "listing expenses failed: {}", err);
            error_body(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

async fn add_expense(
    backend: web::Data<Backend>,
    group_id: web::Path<String>,
    json: web::Json<ExpenseBody>,
) -> HttpResponse {
    let body = json.into_inner();
    let expense = NewExpense {
        description: body.description,
        amount: body.amount,
        group_id: group_id.into_inner(),
        user_id: body.user_id,
    };
    match backend.tables.insert_expense(expense).await {
        Ok(expense) => HttpResponse::Ok().json([expense]),
        Err(err) => {
            error!("adding expense failed: {}", err);
            error_body(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

async fn method_not_allowed() -> HttpResponse {
    error_body(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/api/expenses/{group_id}")
            .route(web::get().to(get_expenses))
            .route(web::post().to(add_expense))
            .default_service(web::to(method_not_allowed)),
    );
}
