use axum::body::{to_bytes, Body};
use axum::http::header::{CONTENT_TYPE, COOKIE, SET_COOKIE};
use axum::http::Request;
use axum::response::Response;
use parking_lot::Mutex;
use tower::ServiceExt;

use crate::croquet::{Croquet, Prepared};
use crate::error::CroquetError;
use crate::inject::AppContext;
use crate::server::SESSION_COOKIE;

/// Runs an application in-process without a listener. Requests keep one visitor
/// cookie, like a single browser would.
pub struct CroquetTester {
    prepared: Prepared,
    cookie: Mutex<Option<String>>,
}

impl CroquetTester {
    pub(crate) async fn start<E>(croquet: Croquet<E>) -> Result<Self, CroquetError>
    where
        E: Clone + Send + Sync + 'static,
    {
        let (prepared, _, _) = croquet.prepare().await?;
        Ok(Self {
            prepared,
            cookie: Mutex::new(None),
        })
    }

    pub fn context(&self) -> &AppContext {
        &self.prepared.context
    }

    pub async fn get(&self, uri: &str) -> Response {
        self.request(Request::get(uri).body(Body::empty()).unwrap_or_default())
            .await
    }

    pub async fn post_form(&self, uri: &str, fields: &[(&str, &str)]) -> Response {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(fields)
            .finish();
        let request = Request::post(uri)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body))
            .unwrap_or_default();
        self.request(request).await
    }

    pub async fn request(&self, mut request: Request<Body>) -> Response {
        if let Some(cookie) = self.cookie.lock().clone() {
            if let Ok(value) = cookie.parse() {
                request.headers_mut().insert(COOKIE, value);
            }
        }

        let response = match self.prepared.router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        };

        let visitor = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(|value| value.split(';').next())
            .find(|pair| pair.starts_with(SESSION_COOKIE))
            .map(str::to_string);
        if let Some(visitor) = visitor {
            *self.cookie.lock() = Some(visitor);
        }
        response
    }

    /// Reads a whole response body as text.
    pub async fn text(response: Response) -> String {
        match to_bytes(response.into_body(), usize::MAX).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => String::new(),
        }
    }

    pub async fn stop(mut self) {
        self.prepared.teardown().await;
    }
}
