use axum::body::Bytes;
use axum::extract::{RawQuery, State};
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::from_fn_with_state;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::{Extension, Router};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tower_http::services::ServeDir;
use uuid::Uuid;

use crate::error::ConfigError;
use crate::inject::AppContext;
use crate::persistence::{persist_filter, UnitOfWork};
use crate::settings::UiSettings;
use crate::ui::html::{error_body, layout, RESOURCE_PREFIX};
use crate::ui::{
    Mounts, PageContext, PageError, PageRegistry, PageResponse, ResourceRegistry, VisitorStore,
    WebParts,
};

pub const SESSION_COOKIE: &str = "CROQUET_SESSION";
pub const LOGIN_PATH: &str = "/login";

const REAPER_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone)]
struct WebState {
    ctx: AppContext,
    pages: PageRegistry,
    resources: ResourceRegistry,
    states: VisitorStore,
    mounts: Arc<Mounts>,
}

#[derive(Clone)]
struct MountedPage(String);

#[derive(Clone)]
struct MountedResource(String);

/// Resolves page mounts: configured paths, the home page at `/` and the login page at
/// `/login` unless it is mounted elsewhere.
pub fn page_mounts(ui: &UiSettings, pages: &PageRegistry) -> Result<Mounts, ConfigError> {
    let mut paths = ui.pages.clone();
    if let Some(home) = &ui.home_page {
        paths.insert("/".to_string(), home.clone());
    }
    if let Some(login) = &ui.login_page {
        if !paths.values().any(|id| id == login) {
            paths.insert(LOGIN_PATH.to_string(), login.clone());
        }
    }

    for (path, id) in &paths {
        if !path.starts_with('/') {
            return Err(ConfigError::InvalidMountPath(path.clone()));
        }
        if !pages.contains(id) {
            return Err(ConfigError::UnknownPage {
                path: path.clone(),
                page: id.clone(),
            });
        }
    }
    Ok(Mounts::new(paths))
}

/// Builds the complete HTTP application: pages, resources, static files and REST routers,
/// wrapped in a unit of work per request when a database is configured.
pub fn router(ctx: AppContext, parts: WebParts, states: VisitorStore) -> Result<Router, ConfigError> {
    let ui = ctx.ui().clone();
    let mounts = page_mounts(&ui, &parts.pages)?;

    if let Some(exception) = &ui.exception_page {
        if !parts.pages.contains(exception) {
            warn!("Exception page '{}' is not registered, using the built-in one", exception);
        }
    }

    let mut web = Router::new();
    for (path, id) in mounts.iter() {
        debug!("Mounting page '{}' at {}", id, path);
        web = web.route(
            path,
            get(page_handler)
                .post(page_handler)
                .layer(Extension(MountedPage(id.to_string()))),
        );
    }
    for (path, id) in &ui.resources {
        if !path.starts_with('/') {
            return Err(ConfigError::InvalidMountPath(path.clone()));
        }
        if !parts.resources.contains(id) {
            return Err(ConfigError::UnknownResource {
                path: path.clone(),
                resource: id.clone(),
            });
        }
        debug!("Mounting resource '{}' at {}", id, path);
        web = web.route(
            path,
            get(resource_handler).layer(Extension(MountedResource(id.clone()))),
        );
    }

    let state = WebState {
        ctx: ctx.clone(),
        pages: parts.pages,
        resources: parts.resources,
        states,
        mounts: Arc::new(mounts),
    };
    let mut app = web
        .nest_service(RESOURCE_PREFIX, ServeDir::new(&ui.resource_dir))
        .fallback(not_found)
        .with_state(state);

    for rest in parts.routers {
        app = app.merge(rest.with_state(ctx.clone()));
    }

    if let Some(persist) = ctx.persistence() {
        app = app.layer(from_fn_with_state(persist.clone(), persist_filter));
    }
    Ok(app)
}

/// Periodically drops expired visitor state.
pub fn spawn_state_reaper(states: VisitorStore) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(REAPER_INTERVAL);
        loop {
            interval.tick().await;
            let removed = states.clear_expired().await;
            if removed > 0 {
                debug!("Expired {} visitor state entries", removed);
            }
        }
    })
}

fn visitor_id(headers: &HeaderMap) -> Option<Uuid> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .and_then(|(_, value)| Uuid::parse_str(value).ok())
}

fn parse_pairs(input: &[u8]) -> HashMap<String, String> {
    url::form_urlencoded::parse(input).into_owned().collect()
}

#[allow(clippy::too_many_arguments)]
async fn page_handler(
    State(web): State<WebState>,
    Extension(MountedPage(id)): Extension<MountedPage>,
    method: Method,
    uow: Option<UnitOfWork>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    let (visitor, fresh) = match visitor_id(&headers) {
        Some(visitor) => (visitor, false),
        None => (Uuid::new_v4(), true),
    };
    let query = query.map(|q| parse_pairs(q.as_bytes())).unwrap_or_default();
    let form = if method == Method::POST {
        parse_pairs(&body)
    } else {
        HashMap::new()
    };

    let mut ctx = PageContext::new(
        web.ctx.clone(),
        id.clone(),
        visitor,
        query,
        form,
        uow,
        web.states.clone(),
        web.mounts.clone(),
    );

    let mut response = match web.pages.get(&id) {
        Some(page) => {
            let result = if method == Method::POST {
                page.submit(&mut ctx).await
            } else {
                page.render(&mut ctx).await.map(PageResponse::Html)
            };
            if web.ctx.ui().stateless_checker() && ctx.is_stateful() {
                debug!("Page '{}' keeps state for visitor {}", id, visitor);
            }
            match result {
                Ok(PageResponse::Html(body)) => {
                    let messages = ctx.take_messages().await;
                    Html(layout(web.ctx.ui(), &id, &page.title(), &body, &messages)).into_response()
                }
                Ok(PageResponse::Redirect(location)) => Redirect::to(&location).into_response(),
                Err(e) => error_page(&web, ctx, e).await,
            }
        }
        None => error_page(&web, ctx, PageError::NotFound(id.clone())).await,
    };

    if fresh {
        let cookie = format!("{}={}; Path=/; HttpOnly; SameSite=Lax", SESSION_COOKIE, visitor);
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().append(SET_COOKIE, value);
        }
    }
    response
}

async fn error_page(web: &WebState, ctx: PageContext, e: PageError) -> Response {
    let status = e.status();
    let page_id = ctx.page_id().to_string();
    if status.is_server_error() {
        error!("Page '{}' failed: {}", page_id, e);
    } else {
        info!("Page '{}' answered {}: {}", page_id, status, e);
    }
    let detail = web.ctx.is_development().then(|| e.to_string());

    let ui = web.ctx.ui();
    if let Some(exception) = ui.exception_page.as_deref() {
        if exception != page_id {
            if let Some(page) = web.pages.get(exception) {
                let message = detail.clone().unwrap_or_else(|| status.to_string());
                let mut ctx = ctx.with_error(exception.to_string(), message);
                match page.render(&mut ctx).await {
                    Ok(body) => {
                        let html = layout(ui, exception, &page.title(), &body, &[]);
                        return (status, Html(html)).into_response();
                    }
                    Err(e) => error!("Exception page '{}' failed: {}", exception, e),
                }
            }
        }
    }

    let html = layout(
        ui,
        &page_id,
        "Error",
        &error_body(status.as_u16(), detail.as_deref()),
        &[],
    );
    (status, Html(html)).into_response()
}

async fn resource_handler(
    State(web): State<WebState>,
    Extension(MountedResource(id)): Extension<MountedResource>,
) -> Response {
    match web.resources.get(&id) {
        Some(resource) => resource.respond(&web.ctx).await,
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn not_found(State(web): State<WebState>) -> Response {
    let html = layout(
        web.ctx.ui(),
        "not-found",
        "Not found",
        &error_body(StatusCode::NOT_FOUND.as_u16(), None),
        &[],
    );
    (StatusCode::NOT_FOUND, Html(html)).into_response()
}
