use std::{io, sync::Arc};

use actix_cors::Cors;
use actix_web::{get, middleware::Logger, web, App, HttpResponse, HttpServer};
use serde_json::json;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod api;
mod auth;
mod backend;
mod config;
mod dashboard;
mod error;
mod pages;
mod schemas;
mod store;
#[cfg(test)]
mod testing;
mod token;

use backend::{Backend, MemoryBackend, MongoBackend};
use config::{Config, StoreConfig};
use token::SessionSigner;

#[get("/health")]
async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

fn routes(cfg: &mut web::ServiceConfig) {
    cfg.app_data(error::json_config())
        .service(health)
        .configure(auth::configure)
        .configure(api::configure)
        .configure(pages::configure);
}

// Credentials are only shared with an explicitly configured origin.
fn cors(origin: Option<&str>) -> Cors {
    match origin {
        Some(origin) => Cors::default()
            .allowed_origin(origin)
            .allow_any_method()
            .allow_any_header()
            .supports_credentials(),
        None => Cors::default()
            .allow_any_origin()
            .send_wildcard()
            .allow_any_method()
            .allow_any_header(),
    }
}

async fn connect(config: &Config) -> io::Result<Backend> {
    let signer = SessionSigner::new(&config.session_secret, config.session_ttl);
    match &config.store {
        StoreConfig::Mongo { uri, database } => {
            let mongo = MongoBackend::connect(uri, database, signer)
                .await
                .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;
            Ok(Backend::new(Arc::new(mongo)))
        }
        StoreConfig::Memory => {
            warn!("MONGODB_URI is not set, data is kept in memory and lost on exit");
            Ok(Backend::new(Arc::new(MemoryBackend::new(signer))))
        }
    }
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    let _ = dotenvy::dotenv();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::from_env().map_err(|err| {
        error!("invalid configuration: {}", err);
        io::Error::new(io::ErrorKind::InvalidInput, err.to_string())
    })?;
    let backend = connect(&config).await?;

    info!("listening on {}:{}", config.bind_addr, config.port);
    let cors_origin = config.cors_origin.clone();
    HttpServer::new(move || {
        App::new()
            .wrap(cors(cors_origin.as_deref()))
            .wrap(Logger::default())
            .app_data(web::Data::new(backend.clone()))
            .configure(routes)
    })
    .bind((config.bind_addr.clone(), config.port))?
    .run()
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{
        http::{header, StatusCode},
        test,
    };

    #[actix_web::test]
    async fn serves_health_and_every_surface() {
        let (backend, _) = testing::memory_backend();
        let app = test::init_service(
            App::new()
                .wrap(cors(None))
                .app_data(web::Data::new(backend))
                .configure(routes),
        )
        .await;

        let request = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, request).await;
        assert_eq!(body, json!({ "status": "ok" }));

        let request = test::TestRequest::get().uri("/auth").to_request();
        assert_eq!(test::call_service(&app, request).await.status(), StatusCode::OK);

        let request = test::TestRequest::get().uri("/api/expenses/g1").to_request();
        assert_eq!(test::call_service(&app, request).await.status(), StatusCode::OK);

        let request = test::TestRequest::get().uri("/dashboard").to_request();
        assert_eq!(test::call_service(&app, request).await.status(), StatusCode::SEE_OTHER);
    }

    #[actix_web::test]
    async fn foreign_origins_never_get_credentialed_responses() {
        let (backend, memory) = testing::memory_backend();
        let session = testing::signed_in(&memory, "ana@example.com").await;
        let app = test::init_service(
            App::new()
                .wrap(cors(None))
                .app_data(web::Data::new(backend))
                .configure(routes),
        )
        .await;

        let request = test::TestRequest::get()
            .uri("/dashboard")
            .insert_header((header::ORIGIN, "https://evil.example"))
            .cookie(actix_web::cookie::Cookie::new(
                auth::SESSION_COOKIE,
                session.access_token,
            ))
            .to_request();
        let response = test::call_service(&app, request).await;
        let headers = response.headers();
        assert_eq!(headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
        assert!(headers.get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS).is_none());
    }
}
