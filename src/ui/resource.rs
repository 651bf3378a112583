use async_trait::async_trait;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::inject::AppContext;

/// A shared, mountable non-page endpoint answering GET.
#[async_trait]
pub trait Resource: Send + Sync + 'static {
    async fn respond(&self, ctx: &AppContext) -> Response;
}

/// Answers `SUCCESS` as long as the process is serving.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthCheck;

pub const HEALTH_CHECK_ID: &str = "health-check";

#[async_trait]
impl Resource for HealthCheck {
    async fn respond(&self, _ctx: &AppContext) -> Response {
        (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
                (header::CACHE_CONTROL, "no-cache, no-store"),
            ],
            "SUCCESS",
        )
            .into_response()
    }
}

#[derive(Default, Clone)]
pub struct ResourceRegistry {
    resources: BTreeMap<String, Arc<dyn Resource>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: impl Into<String>, resource: impl Resource) {
        self.resources.insert(id.into(), Arc::new(resource));
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Resource>> {
        self.resources.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.resources.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inject::Bindings;
    use crate::settings::UiSettings;

    #[tokio::test]
    async fn test_health_check_answers_success() {
        let mut registry = ResourceRegistry::new();
        registry.register(HEALTH_CHECK_ID, HealthCheck);
        assert!(registry.contains(HEALTH_CHECK_ID));

        let ctx = AppContext::new(Bindings::new(), None, UiSettings::default());
        let response = registry.get(HEALTH_CHECK_ID).unwrap().respond(&ctx).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "no-cache, no-store"
        );
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"SUCCESS");
    }
}
