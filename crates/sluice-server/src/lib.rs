// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Public + admin HTTP surface.
//!
//! # Routes
//!
//! ```text
//! POST /v1/chat/completions          OpenAI chat (and video via video_config)
//! POST /v1/images/generations        OpenAI images
//! POST /v1/images/edits              multipart image edit
//! GET  /v1/models                    model catalog
//! GET  /v1/files/{kind}/{name}       media proxy (unauthenticated)
//! /api/v1/admin/...                  operator surface (admin key)
//! ```
//!
//! Streaming responses are `data:`-framed SSE terminated by `data: [DONE]`.

use std::sync::Arc;

use anyhow::Context;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, patch, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::info;

use sluice_batch::BatchEngine;
use sluice_config::Config;
use sluice_core::Pipeline;
use sluice_media::MediaCache;
use sluice_pool::{spawn_refresh_worker, TokenPool};
use sluice_store::{FileStore, TokenStore};
use sluice_translate::MediaSink;
use sluice_upstream::{Transport, UpstreamClient};

mod auth;
mod error;
mod glue;
mod openai;
mod routes;

pub use glue::{GatewayMediaSink, UpstreamQuotaProbe, UpstreamTokenOps};

/// Shared handler state; cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: TokenPool,
    pub pipeline: Pipeline,
    pub batch: BatchEngine,
    pub media: Arc<MediaCache>,
}

/// Assemble every subsystem from configuration: store → pool → upstream
/// client → media cache → pipeline → batch engine.  Spawns the pool's
/// background tasks and the quota refresh worker.
pub async fn build_state(config: Config) -> anyhow::Result<AppState> {
    let config = Arc::new(config);

    let store: Arc<dyn TokenStore> = Arc::new(FileStore::new(config.store.path.clone()));
    let pool = TokenPool::load(store, config.pool.clone())
        .await
        .context("loading token catalog")?;
    pool.start().await;

    let upstream =
        Arc::new(UpstreamClient::new(config.upstream.clone()).context("building upstream client")?);
    spawn_refresh_worker(
        pool.clone(),
        Arc::new(UpstreamQuotaProbe::new(upstream.clone())),
    );

    let media = Arc::new(
        MediaCache::open(config.media.root.clone(), config.media.max_bytes)
            .context("opening media cache")?,
    );
    let base_url = config.server.public_base_url.clone().unwrap_or_default();
    let sink: Arc<dyn MediaSink> = Arc::new(GatewayMediaSink::new(
        media.clone(),
        upstream.clone(),
        base_url,
    ));

    let transport: Arc<dyn Transport> = upstream.clone();
    let pipeline = Pipeline::new(pool.clone(), transport, sink, config.clone());
    let batch = BatchEngine::new(
        pool.clone(),
        Arc::new(UpstreamTokenOps::new(upstream, pool.clone())),
        config.batch.clone(),
    );

    Ok(AppState {
        config,
        pool,
        pipeline,
        batch,
        media,
    })
}

/// Build the full router.  Public routes sit behind the API-key layer,
/// admin routes behind the admin-key layer; the media proxy is open.
pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/v1/chat/completions", post(routes::chat::chat_completions))
        .route("/v1/images/generations", post(routes::images::generations))
        .route("/v1/images/edits", post(routes::images::edits))
        .route("/v1/models", get(routes::models::list_models))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::public_auth,
        ))
        .layer(CorsLayer::permissive());

    let files = Router::new().route("/v1/files/:kind/:name", get(routes::files::media_file));

    let admin = Router::new()
        .route("/api/v1/admin/pool", get(routes::admin::pool_snapshot))
        .route("/api/v1/admin/pool/events", get(routes::admin::pool_events))
        .route("/api/v1/admin/tokens", post(routes::admin::import_tokens))
        .route(
            "/api/v1/admin/tokens/delete",
            post(routes::admin::delete_tokens),
        )
        .route("/api/v1/admin/tokens/:id", patch(routes::admin::patch_token))
        .route("/api/v1/admin/batch", post(routes::admin::submit_batch))
        .route(
            "/api/v1/admin/batch/:id/events",
            get(routes::admin::batch_events),
        )
        .route(
            "/api/v1/admin/batch/:id/cancel",
            post(routes::admin::cancel_batch),
        )
        .route("/api/v1/admin/media/stat", get(routes::admin::media_stat))
        .route("/api/v1/admin/media/clear", post(routes::admin::media_clear))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::admin_auth,
        ));

    Router::new()
        .merge(public)
        .merge(files)
        .merge(admin)
        // Image edits upload raw files; everything else is small JSON.
        .layer(DefaultBodyLimit::max(32 * 1024 * 1024))
        .with_state(state)
}

/// Bind and serve until ctrl-c, then flush pool state before returning.
pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let addr: std::net::SocketAddr = state
        .config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", state.config.server.bind))?;
    let app = router(state.clone());
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(bind = %addr, auth = state.config.server.api_key.is_some(), "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    // Don't lose in-flight quota/failure bookkeeping on the way out.
    state.pool.flush_now().await;
    Ok(())
}
