use actix_web::{
    cookie::{Cookie, SameSite},
    get,
    http::{header, StatusCode},
    post, web, HttpRequest, HttpResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use crate::backend::Backend;
use crate::dashboard::Route;
use crate::error::{error_body, BackendError};
use crate::schemas::Session;

pub const SESSION_COOKIE: &str = "access_token";

pub const EMAIL_EXISTS: &str = "Email already exists. Please log in.";
pub const CHECK_EMAIL: &str = "Check your email for confirmation!";
pub const EMAIL_NOT_FOUND: &str = "Email not found. Please sign up.";
pub const GENERIC_FAILURE: &str = "An error occurred, please try again.";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    #[default]
    SignIn,
    SignUp,
}

#[derive(Debug, PartialEq)]
pub enum AuthOutcome {
    Notice(String),
    /// The auth service refused the request; its message is shown as is.
    Rejected(String),
    Failed,
    SignedIn(Session),
}

#[derive(Debug, PartialEq, Serialize)]
pub struct AuthView {
    pub mode: AuthMode,
    pub title: &'static str,
    pub button: &'static str,
    pub button_disabled: bool,
    pub toggle_prompt: &'static str,
    pub toggle_link: &'static str,
}

#[derive(Debug, Default)]
pub struct AuthForm {
    email: String,
    password: String,
    loading: bool,
    mode: AuthMode,
}

impl AuthForm {
    pub fn new(mode: AuthMode) -> Self {
        AuthForm {
            mode,
            ..Default::default()
        }
    }

    pub fn set_email(&mut self, email: impl Into<String>) {
        self.email = email.into();
    }

    pub fn set_password(&mut self, password: impl Into<String>) {
        self.password = password.into();
    }

    #[cfg(test)]
    pub fn toggle_mode(&mut self) {
        self.mode = match self.mode {
            AuthMode::SignIn => AuthMode::SignUp,
            AuthMode::SignUp => AuthMode::SignIn,
        };
    }

    pub fn mode(&self) -> AuthMode {
        self.mode
    }

    #[cfg(test)]
    pub fn is_loading(&self) -> bool {
        self.loading
    }

    /// Looks the email up in the `User` table before calling the auth
    /// service. The lookup only picks a friendlier message; uniqueness is
    /// enforced by the auth service.
    pub async fn submit(&mut self, backend: &Backend) -> AuthOutcome {
        self.loading = true;
        let result = match self.mode {
            AuthMode::SignUp => self.sign_up(backend).await,
            AuthMode::SignIn => self.sign_in(backend).await,
        };
        self.loading = false;

        result.unwrap_or_else(|err| {
            error!("Error checking email: {}", err);
            AuthOutcome::Failed
        })
    }

    async fn sign_up(&mut self, backend: &Backend) -> Result<AuthOutcome, BackendError> {
        if backend.tables.find_user_by_email(&self.email).await?.is_some() {
            return Ok(AuthOutcome::Notice(EMAIL_EXISTS.to_string()));
        }
        match backend.auth.sign_up(&self.email, &self.password).await {
            Ok(user) => {
                info!(user_id = %user.id, "account created");
                self.mode = AuthMode::SignIn;
                Ok(AuthOutcome::Notice(CHECK_EMAIL.to_string()))
            }
            Err(err) => Ok(AuthOutcome::Rejected(err.to_string())),
        }
    }

    async fn sign_in(&mut self, backend: &Backend) -> Result<AuthOutcome, BackendError> {
        if backend.tables.find_user_by_email(&self.email).await?.is_none() {
            return Ok(AuthOutcome::Notice(EMAIL_NOT_FOUND.to_string()));
        }
        match backend.auth.sign_in_with_password(&self.email, &self.password).await {
            Ok(session) => Ok(AuthOutcome::SignedIn(session)),
            Err(err) => Ok(AuthOutcome::Rejected(err.to_string())),
        }
    }

    pub fn render(&self) -> AuthView {
        let (title, busy, toggle_prompt, toggle_link) = match self.mode {
            AuthMode::SignUp => (
                "Sign Up",
                "Signing Up...",
                "Already have an account?",
                "Log in here",
            ),
            AuthMode::SignIn => (
                "Sign In",
                "Logging In...",
                "Don't have an account?",
                "Sign up here",
            ),
        };
        AuthView {
            mode: self.mode,
            title,
            button: if self.loading { busy } else { title },
            button_disabled: self.loading,
            toggle_prompt,
            toggle_link,
        }
    }
}

/// Reads the access token from `Authorization: Bearer ...` or the session
/// cookie.
pub fn access_token(request: &HttpRequest) -> Option<String> {
    let bearer = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string());
    bearer.or_else(|| {
        request
            .cookie(SESSION_COOKIE)
            .map(|cookie| cookie.value().to_string())
    })
}

#[derive(Deserialize)]
struct AuthQuery {
    mode: Option<AuthMode>,
}

#[derive(Deserialize)]
struct Credentials {
    email: String,
    password: String,
}

#[get("/auth")]
async fn auth_page(query: web::Query<AuthQuery>) -> HttpResponse {
    let form = AuthForm::new(query.mode.unwrap_or_default());
    HttpResponse::Ok().json(form.render())
}

#[post("/auth/sign-up")]
async fn sign_up(backend: web::Data<Backend>, json: web::Json<Credentials>) -> HttpResponse {
    submit(AuthMode::SignUp, &backend, json.into_inner()).await
}

#[post("/auth/sign-in")]
async fn sign_in(backend: web::Data<Backend>, json: web::Json<Credentials>) -> HttpResponse {
    submit(AuthMode::SignIn, &backend, json.into_inner()).await
}

async fn submit(mode: AuthMode, backend: &Backend, credentials: Credentials) -> HttpResponse {
    let mut form = AuthForm::new(mode);
    form.set_email(credentials.email);
    form.set_password(credentials.password);

    match form.submit(backend).await {
        AuthOutcome::Notice(message) => {
            HttpResponse::Ok().json(json!({ "message": message, "mode": form.mode() }))
        }
        AuthOutcome::Rejected(message) => error_body(StatusCode::BAD_REQUEST, message),
        AuthOutcome::Failed => error_body(StatusCode::INTERNAL_SERVER_ERROR, GENERIC_FAILURE),
        AuthOutcome::SignedIn(session) => {
            let cookie = Cookie::build(SESSION_COOKIE, session.access_token.clone())
                .path("/")
                .http_only(true)
                .same_site(SameSite::Lax)
                .finish();
            HttpResponse::SeeOther()
                .insert_header((header::LOCATION, Route::Dashboard.path()))
                .cookie(cookie)
                .json(session)
        }
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(auth_page).service(sign_up).service(sign_in);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{INVALID_CREDENTIALS, SHORT_PASSWORD};
    use crate::testing::{memory_backend, signed_in, PASSWORD};
    use actix_web::{test, App};

    fn form(mode: AuthMode, email: &str, password: &str) -> AuthForm {
        let mut form = AuthForm::new(mode);
        form.set_email(email);
        form.set_password(password);
        form
    }

    #[tokio::test]
    async fn sign_up_with_known_email_never_reaches_auth() {
        let (backend, memory) = memory_backend();
        signed_in(&memory, "ana@example.com").await;
        let before = memory.calls();

        let mut form = form(AuthMode::SignUp, "ana@example.com", PASSWORD);
        let outcome = form.submit(&backend).await;

        assert_eq!(outcome, AuthOutcome::Notice(EMAIL_EXISTS.to_string()));
        // Only the existence check ran.
        assert_eq!(memory.calls(), before + 1);
        assert_eq!(form.mode(), AuthMode::SignUp);
    }

    #[tokio::test]
    async fn sign_up_switches_to_sign_in() {
        let (backend, _) = memory_backend();
        let mut form = form(AuthMode::SignUp, "new@example.com", PASSWORD);

        let outcome = form.submit(&backend).await;

        assert_eq!(outcome, AuthOutcome::Notice(CHECK_EMAIL.to_string()));
        assert_eq!(form.mode(), AuthMode::SignIn);
        assert!(backend.tables.find_user_by_email("new@example.com").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sign_up_surfaces_backend_message() {
        let (backend, _) = memory_backend();
        let outcome = form(AuthMode::SignUp, "new@example.com", "abc").submit(&backend).await;
        assert_eq!(outcome, AuthOutcome::Rejected(SHORT_PASSWORD.to_string()));
    }

    #[tokio::test]
    async fn sign_in_with_unknown_email_never_checks_password() {
        let (backend, memory) = memory_backend();
        let mut form = form(AuthMode::SignIn, "ghost@example.com", PASSWORD);

        let outcome = form.submit(&backend).await;

        assert_eq!(outcome, AuthOutcome::Notice(EMAIL_NOT_FOUND.to_string()));
        assert_eq!(memory.calls(), 1);
    }

    #[tokio::test]
    async fn sign_in_outcomes() {
        let (backend, memory) = memory_backend();
        signed_in(&memory, "ana@example.com").await;

        let wrong = form(AuthMode::SignIn, "ana@example.com", "wrong-password")
            .submit(&backend)
            .await;
        assert_eq!(wrong, AuthOutcome::Rejected(INVALID_CREDENTIALS.to_string()));

        match form(AuthMode::SignIn, "ana@example.com", PASSWORD).submit(&backend).await {
            AuthOutcome::SignedIn(session) => assert_eq!(session.user.email, "ana@example.com"),
            other => panic!("expected a session, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_check_clears_loading() {
        let (backend, memory) = memory_backend();
        memory.set_outage(Some("connection reset"));
        let mut form = form(AuthMode::SignIn, "ana@example.com", PASSWORD);

        assert_eq!(form.submit(&backend).await, AuthOutcome::Failed);
        assert!(!form.is_loading());
        assert!(!form.render().button_disabled);
    }

    #[actix_web::test]
    async fn render_follows_mode() {
        let mut form = AuthForm::new(AuthMode::SignIn);
        assert_eq!(form.render().title, "Sign In");
        assert_eq!(form.render().toggle_link, "Sign up here");
        form.toggle_mode();
        assert_eq!(form.render().title, "Sign Up");
        form.loading = true;
        assert_eq!(form.render().button, "Signing Up...");
    }

    #[actix_web::test]
    async fn sign_in_redirects_to_dashboard_with_cookie() {
        let (backend, memory) = memory_backend();
        signed_in(&memory, "ana@example.com").await;
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(backend))
                .configure(configure),
        )
        .await;

        let request = test::TestRequest::post()
            .uri("/auth/sign-in")
            .set_json(json!({ "email": "ana@example.com", "password": PASSWORD }))
            .to_request();
        let response = test::call_service(&app, request).await;

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers().get(header::LOCATION).unwrap(), "/dashboard");
        let cookie = response
            .response()
            .cookies()
            .find(|cookie| cookie.name() == SESSION_COOKIE)
            .unwrap();
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Lax));
        let session: Session = test::read_body_json(response).await;
        assert_eq!(session.user.email, "ana@example.com");
    }

    #[actix_web::test]
    async fn sign_up_with_known_email_reports_notice() {
        let (backend, memory) = memory_backend();
        signed_in(&memory, "ana@example.com").await;
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(backend))
                .configure(configure),
        )
        .await;

        let request = test::TestRequest::post()
            .uri("/auth/sign-up")
            .set_json(json!({ "email": "ana@example.com", "password": PASSWORD }))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, request).await;

        assert_eq!(body, json!({ "message": EMAIL_EXISTS, "mode": "sign_up" }));
    }

    #[actix_web::test]
    async fn reads_bearer_before_cookie() {
        let request = test::TestRequest::default()
            .insert_header((header::AUTHORIZATION, "Bearer abc"))
            .cookie(Cookie::new(SESSION_COOKIE, "from-cookie"))
            .to_http_request();
        assert_eq!(access_token(&request).as_deref(), Some("abc"));

        let request = test::TestRequest::default()
            .cookie(Cookie::new(SESSION_COOKIE, "from-cookie"))
            .to_http_request();
        assert_eq!(access_token(&request).as_deref(), Some("from-cookie"));
        assert_eq!(access_token(&test::TestRequest::default().to_http_request()), None);
    }
}
