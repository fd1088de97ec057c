//! AxoBucket server binary.
//!
//! A session-authenticated gateway in front of per-tenant blob containers.
//! The main entry point selects the storage backend, builds the Axum router
//! and starts the HTTP listener plus an optional HTTPS listener.

mod atomic;
mod auth;
mod background;
mod config;
mod containers;
mod error;
mod files;
mod frontend;
mod http;
mod identity;
mod listing;
mod logging;
mod namespace;
mod staging;
mod store;
mod tls;
mod upload;
mod version;

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{delete, get, post};
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::io::{Error as IoError, ErrorKind};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span, warn};

use crate::auth::{AuthConfig, seed_admin};
use crate::background::spawn_background_tasks;
use crate::config::{Args, Backend};
use crate::containers::Containers;
use crate::http::{RequestScheme, build_cors_layer};
use crate::identity::MemoryIdentityStore;
use crate::namespace::resolve;
use crate::staging::Staging;
use crate::store::BlobStore;
use crate::store::azure::AzureBlobStore;
use crate::store::fs::FsBlobStore;
use crate::store::memory::MemoryBlobStore;

shadow!(build);

/// Starts the AxoBucket server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), IoError> {
    let args = Args::parse();
    logging::init_logging(&args.log_level);

    let store_timeout = Duration::from_secs(args.store_timeout_secs);
    let store = build_store(&args, store_timeout).await?;
    let default_namespace = resolve(&args.default_namespace);
    let containers = Arc::new(Containers::new(
        store,
        default_namespace.clone(),
        store_timeout,
        args.admin_concurrency,
    ));
    if let Err(err) = containers.ensure(&default_namespace).await {
        warn!(namespace = %default_namespace, error = %err, "default namespace not provisioned");
    }

    let staging = Arc::new(Staging::new(
        PathBuf::from(&args.staging_dir),
        args.upload_max_size,
    ));
    staging.ensure_dir().await?;
    info!(dir = ?staging.dir(), "staging directory ready");

    let auth_config = Arc::new(AuthConfig {
        session_ttl: Duration::from_secs(args.session_ttl_secs),
        login_window: Duration::from_secs(args.login_window_secs),
        login_max_attempts: args.login_max_attempts,
        login_lockout: Duration::from_secs(args.login_lockout_secs),
        ..AuthConfig::new(Arc::new(MemoryIdentityStore::new()), default_namespace)
    });
    match args.admin_pass.as_deref() {
        Some(password) => seed_admin(&auth_config, &args.admin_name, &args.admin_email, password)
            .await
            .map_err(IoError::other)?,
        None => warn!("no admin password configured, admin view unavailable"),
    }

    let auth_for_tasks = auth_config.clone();
    let staging_for_tasks = staging.clone();

    let mut app = Router::new()
        .route("/api/auth/register", post(auth::auth_register))
        .route("/api/auth/login", post(auth::auth_login))
        .route("/api/auth/logout", post(auth::auth_logout))
        .route("/api/auth/status", get(auth::auth_status))
        .route(
            "/api/upload",
            post(upload::upload_file).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/files", get(files::list_files))
        .route("/api/files/delete", delete(files::delete_blob))
        .route("/api/admin/files", get(files::admin_list_files))
        .route("/blobs/{namespace}/{*name}", get(files::download_blob))
        .route("/api/version", get(version::get_version_info))
        .fallback(frontend::serve_frontend)
        .layer(middleware::from_fn(auth::auth_middleware))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let forwarded_ip = request
                        .headers()
                        .get("x-forwarded-for")
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.split(',').next().unwrap_or("").trim().to_string());
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.to_string());
                    let client_ip = forwarded_ip
                        .or(connect_ip)
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(containers.clone()))
        .layer(Extension(staging))
        .layer(Extension(auth_config));

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| IoError::new(ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let handle = Handle::new();

    info!(backend = containers.backend(), "🚀 Starting HTTP server at {}", http_addr);
    let http_app = app.clone().layer(Extension(RequestScheme::Http));
    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(http_app.into_make_service_with_connect_info::<SocketAddr>());

    let https_server = match args.https_port {
        Some(port) => {
            let https_addr = SocketAddr::new(host, port);
            let tls_config =
                tls::build_rustls_config(args.tls_cert.as_deref(), args.tls_key.as_deref(), host)
                    .await?;
            info!("🔒 Starting HTTPS server at {}", https_addr);
            let https_app = app.layer(Extension(RequestScheme::Https));
            Some(
                axum_server::bind_rustls(https_addr, tls_config)
                    .handle(handle.clone())
                    .serve(https_app.into_make_service_with_connect_info::<SocketAddr>()),
            )
        }
        None => None,
    };
    let https_server = async {
        match https_server {
            Some(server) => server.await,
            None => Ok(()),
        }
    };

    spawn_background_tasks(
        auth_for_tasks,
        staging_for_tasks,
        Duration::from_secs(args.staging_ttl_secs),
    );
    tokio::spawn(shutdown_signal(handle));
    tokio::try_join!(http_server, https_server)?;

    Ok(())
}

async fn build_store(args: &Args, timeout: Duration) -> Result<Arc<dyn BlobStore>, IoError> {
    match args.backend {
        Backend::Fs => {
            let store = FsBlobStore::new(PathBuf::from(&args.storage_dir));
            store.ensure_root().await?;
            Ok(Arc::new(store))
        }
        Backend::Azure => {
            let connection_string = args.azure_connection_string.as_deref().ok_or_else(|| {
                IoError::new(
                    ErrorKind::InvalidInput,
                    "--azure-connection-string is required for the azure backend",
                )
            })?;
            let store = AzureBlobStore::from_connection_string(connection_string, timeout)
                .map_err(|err| IoError::new(ErrorKind::InvalidInput, err.to_string()))?;
            Ok(Arc::new(store))
        }
        Backend::Memory => Ok(Arc::new(MemoryBlobStore::new())),
    }
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
