use std::convert::Infallible;

use actix_web::{
    cookie::Cookie,
    get,
    http::{header, StatusCode},
    post,
    web::{self, Bytes},
    HttpRequest, HttpResponse,
};
use futures::{future, stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::auth::{access_token, SESSION_COOKIE};
use crate::backend::Backend;
use crate::dashboard::{Dashboard, Outcome, Route};
use crate::error::error_body;

#[derive(Deserialize)]
struct DashboardQuery {
    group: Option<String>,
}

#[derive(Deserialize)]
struct GroupForm {
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
struct ExpenseForm {
    #[serde(default)]
    amount: String,
    #[serde(default)]
    description: String,
}

fn redirect(route: Route) -> HttpResponse {
    HttpResponse::SeeOther()
        .insert_header((header::LOCATION, route.path()))
        .finish()
}

// Each request mounts a fresh dashboard for the caller's session.
async fn open(
    backend: &Backend,
    request: &HttpRequest,
    group: Option<&str>,
) -> Result<Dashboard, HttpResponse> {
    let mut dashboard = Dashboard::new(backend.clone());
    if let Outcome::Redirect(route) = dashboard.mount(access_token(request).as_deref()).await {
        return Err(redirect(route));
    }
    if let Some(group) = group {
        if let Outcome::Redirect(route) = dashboard.select_group(group).await {
            return Err(redirect(route));
        }
    }
    Ok(dashboard)
}

fn respond(outcome: Outcome, dashboard: &Dashboard) -> HttpResponse {
    match outcome {
        Outcome::Done => HttpResponse::Ok().json(dashboard.render()),
        Outcome::Alert(message) => error_body(StatusCode::BAD_REQUEST, message),
        Outcome::Failed(message) => error_body(StatusCode::INTERNAL_SERVER_ERROR, message),
        Outcome::Redirect(route) => redirect(route),
    }
}

fn sse_frame(rendered: &impl Serialize) -> Bytes {
    match serde_json::to_string(rendered) {
        Ok(json) => Bytes::from(format!("data: {json}\n\n")),
        Err(err) => {
            error!("could not encode dashboard view: {}", err);
            Bytes::from_static(b"event: error\ndata: {}\n\n")
        }
    }
}

#[get("/dashboard")]
async fn dashboard_page(
    backend: web::Data<Backend>,
    request: HttpRequest,
    query: web::Query<DashboardQuery>,
) -> HttpResponse {
    match open(&backend, &request, query.group.as_deref()).await {
        Ok(dashboard) => HttpResponse::Ok().json(dashboard.render()),
        Err(response) => response,
    }
}

#[post("/dashboard/groups")]
async fn create_group(
    backend: web::Data<Backend>,
    request: HttpRequest,
    json: web::Json<GroupForm>,
) -> HttpResponse {
    let mut dashboard = match open(&backend, &request, None).await {
        Ok(dashboard) => dashboard,
        Err(response) => return response,
    };
    dashboard.set_group_name(json.into_inner().name);
    let outcome = dashboard.create_group().await;
    if outcome == Outcome::Done {
        // Show the new group without waiting for its notification.
        dashboard.refresh_groups().await;
    }
    respond(outcome, &dashboard)
}

#[post("/dashboard/groups/{group_id}/expenses")]
async fn create_expense(
    backend: web::Data<Backend>,
    request: HttpRequest,
    group_id: web::Path<String>,
    json: web::Json<ExpenseForm>,
) -> HttpResponse {
    let mut dashboard = match open(&backend, &request, Some(group_id.as_str())).await {
        Ok(dashboard) => dashboard,
        Err(response) => return response,
    };
    let form = json.into_inner();
    dashboard.set_expense_amount(form.amount);
    dashboard.set_expense_description(form.description);
    let outcome = dashboard.create_expense().await;
    if outcome == Outcome::Done {
        dashboard.select_group(&group_id).await;
    }
    respond(outcome, &dashboard)
}

#[get("/dashboard/live")]
async fn live(
    backend: web::Data<Backend>,
    request: HttpRequest,
    query: web::Query<DashboardQuery>,
) -> HttpResponse {
    let dashboard = match open(&backend, &request, query.group.as_deref()).await {
        Ok(dashboard) => dashboard,
        Err(response) => return response,
    };

    let first = sse_frame(&dashboard.render());
    let updates = stream::unfold(dashboard, |mut dashboard| async move {
        loop {
            let event = dashboard.next_change().await?;
            if dashboard.apply(event) {
                return Some((sse_frame(&dashboard.render()), dashboard));
            }
        }
    });
    let frames = stream::once(future::ready(first))
        .chain(updates)
        .map(Ok::<_, Infallible>);

    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .streaming(frames)
}

#[post("/dashboard/sign-out")]
async fn sign_out(backend: web::Data<Backend>, request: HttpRequest) -> HttpResponse {
    let mut dashboard = match open(&backend, &request, None).await {
        Ok(dashboard) => dashboard,
        Err(response) => return response,
    };
    let route = match dashboard.sign_out().await {
        Outcome::Redirect(route) => route,
        _ => Route::Auth,
    };
    let mut cookie = Cookie::build(SESSION_COOKIE, "").path("/").finish();
    cookie.make_removal();
    HttpResponse::SeeOther()
        .insert_header((header::LOCATION, route.path()))
        .cookie(cookie)
        .finish()
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(dashboard_page)
        .service(create_group)
        .service(create_expense)
        .service(live)
        .service(sign_out);
}
