//! Axum + Askama dashboard for tracking book prices interactively.

use std::sync::{Arc, Mutex, PoisonError};

use askama::Template;
use axum::{
    extract::{Form, Path as AxumPath, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use bookwatch_core::{format_price, PriceChange};
use bookwatch_sync::{Notifier, WatchError, WatchHandle};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "bookwatch-web";

const APP_CSS: &str = include_str!("../assets/app.css");

#[derive(Debug, Clone)]
pub struct Alert {
    pub id: Uuid,
    pub raised_at: DateTime<Utc>,
    pub change: PriceChange,
}

/// Pending price alerts. The catalog worker pushes; page handlers read and dismiss.
#[derive(Debug, Default)]
pub struct AlertBoard {
    alerts: Mutex<Vec<Alert>>,
}

impl AlertBoard {
    pub fn list(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn dismiss(&self, id: Uuid) -> bool {
        let mut alerts = self.alerts.lock().unwrap_or_else(PoisonError::into_inner);
        let before = alerts.len();
        alerts.retain(|a| a.id != id);
        alerts.len() != before
    }
}

impl Notifier for AlertBoard {
    fn notify(&self, change: &PriceChange) {
        info!(isbn = %change.isbn, "queued price alert for '{}'", change.title);
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Alert {
                id: Uuid::new_v4(),
                raised_at: Utc::now(),
                change: change.clone(),
            });
    }
}

#[derive(Clone)]
pub struct AppState {
    pub handle: WatchHandle,
    pub alerts: Arc<AlertBoard>,
}

impl AppState {
    pub fn new(handle: WatchHandle, alerts: Arc<AlertBoard>) -> Self {
        Self { handle, alerts }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BookRow {
    pub isbn: String,
    pub title: String,
    pub price: String,
    pub listing_url: String,
}

#[derive(Debug, Clone)]
struct AlertRow {
    id: String,
    isbn: String,
    title: String,
    old_price: String,
    new_price: String,
    listing_url: String,
    raised_at: String,
}

impl From<Alert> for AlertRow {
    fn from(alert: Alert) -> Self {
        Self {
            id: alert.id.to_string(),
            raised_at: alert.raised_at.format("%Y-%m-%d %H:%M UTC").to_string(),
            isbn: alert.change.isbn,
            title: alert.change.title,
            old_price: format_price(alert.change.old_price),
            new_price: format_price(alert.change.new_price),
            listing_url: alert.change.listing_url,
        }
    }
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    books: Vec<BookRow>,
    alerts: Vec<AlertRow>,
}

#[derive(Template)]
#[template(path = "error.html")]
struct ErrorTemplate {
    heading: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct AddBookForm {
    isbn: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/books", post(add_book_handler))
        .route("/books/{isbn}/remove", post(remove_book_handler))
        .route("/books/{isbn}/open", get(open_book_handler))
        .route("/refresh", post(refresh_handler))
        .route("/alerts/{id}/dismiss", post(dismiss_alert_handler))
        .route("/api/books", get(api_books_handler))
        .route("/assets/static/app.css", get(app_css_handler))
        .with_state(Arc::new(state))
}

/// Serve the dashboard on `0.0.0.0:port` until `shutdown` flips.
pub async fn serve(
    state: AppState,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(addr = %listener.local_addr()?, "dashboard listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

async fn book_rows(state: &AppState) -> Result<Vec<BookRow>, WatchError> {
    let catalog = state.handle.latest().await?;
    Ok(catalog
        .iter()
        .map(|entry| BookRow {
            isbn: entry.isbn.clone(),
            title: entry.title.clone(),
            price: format_price(entry.last_price),
            listing_url: state.handle.listing_url(&entry.isbn),
        })
        .collect())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    match book_rows(&state).await {
        Ok(books) => render_html(IndexTemplate {
            books,
            alerts: state.alerts.list().into_iter().map(AlertRow::from).collect(),
        }),
        Err(err) => watch_error(err),
    }
}

async fn add_book_handler(
    State(state): State<Arc<AppState>>,
    Form(form): Form<AddBookForm>,
) -> Response {
    match state.handle.add(&form.isbn).await {
        Ok(_) => Redirect::to("/").into_response(),
        Err(err) => watch_error(err),
    }
}

async fn remove_book_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(isbn): AxumPath<String>,
) -> Response {
    match state.handle.remove(&isbn).await {
        Ok(_) => Redirect::to("/").into_response(),
        Err(err) => watch_error(err),
    }
}

async fn open_book_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(isbn): AxumPath<String>,
) -> Response {
    match state.handle.latest().await {
        Ok(catalog) if catalog.contains(&isbn) => {
            Redirect::to(&state.handle.listing_url(&isbn)).into_response()
        }
        Ok(_) => watch_error(WatchError::UnknownIsbn(isbn)),
        Err(err) => watch_error(err),
    }
}

async fn refresh_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.handle.request_refresh().await {
        Ok(()) => Redirect::to("/").into_response(),
        Err(err) => watch_error(err),
    }
}

async fn dismiss_alert_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    if state.alerts.dismiss(id) {
        Redirect::to("/").into_response()
    } else {
        error_page(StatusCode::NOT_FOUND, "Alert not found", "That alert was already dismissed.")
    }
}

async fn api_books_handler(State(state): State<Arc<AppState>>) -> Response {
    match book_rows(&state).await {
        Ok(books) => Json(books).into_response(),
        Err(err) => watch_error(err),
    }
}

async fn app_css_handler() -> Response {
    ([(header::CONTENT_TYPE, "text/css; charset=utf-8")], APP_CSS).into_response()
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Html(format!("Server error: {err}")),
        )
            .into_response(),
    }
}

fn error_page(status: StatusCode, heading: &str, message: &str) -> Response {
    let mut resp = render_html(ErrorTemplate {
        heading: heading.to_string(),
        message: message.to_string(),
    });
    *resp.status_mut() = status;
    resp
}

fn watch_error(err: WatchError) -> Response {
    let (status, heading) = match &err {
        WatchError::DuplicateIsbn(_) => (StatusCode::CONFLICT, "Already tracked"),
        WatchError::InvalidIsbn(_) => (StatusCode::BAD_REQUEST, "Invalid ISBN"),
        WatchError::UnknownIsbn(_) => (StatusCode::NOT_FOUND, "Not tracked"),
        WatchError::Lookup(_) => (StatusCode::BAD_GATEWAY, "Could not add book"),
        WatchError::Catalog(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Catalog error"),
        WatchError::WorkerGone => (StatusCode::SERVICE_UNAVAILABLE, "Shutting down"),
    };
    error_page(status, heading, &err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use bookwatch_adapters::{Listing, LookupError, PriceSource};
    use bookwatch_storage::CatalogStore;
    use bookwatch_sync::{CatalogWorker, Reconciler};
    use http_body_util::BodyExt;
    use rust_decimal::Decimal;
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    struct FixedSource {
        price: Mutex<Decimal>,
    }

    #[async_trait]
    impl PriceSource for FixedSource {
        fn listing_url(&self, isbn: &str) -> String {
            format!("https://books.test/isbn/{isbn}")
        }

        async fn fetch(&self, isbn: &str) -> Result<Listing, LookupError> {
            if isbn == "000" {
                return Err(LookupError::PriceNotFound {
                    isbn: isbn.to_string(),
                });
            }
            Ok(Listing {
                title: format!("Title {isbn}"),
                price: *self.price.lock().unwrap(),
                listing_url: self.listing_url(isbn),
            })
        }
    }

    struct Harness {
        dir: TempDir,
        state: AppState,
        source: Arc<FixedSource>,
    }

    fn harness(seed: &str) -> Harness {
        let dir = tempdir().unwrap();
        let path = dir.path().join("books.txt");
        std::fs::write(&path, seed).unwrap();
        let source = Arc::new(FixedSource {
            price: Mutex::new(Decimal::new(1000, 2)),
        });
        let alerts = Arc::new(AlertBoard::default());
        let reconciler = Reconciler::new(source.clone(), alerts.clone());
        let (handle, _task) = CatalogWorker::new(CatalogStore::new(&path), reconciler).spawn();
        Harness {
            dir,
            state: AppState::new(handle, alerts),
            source,
        }
    }

    async fn body_text(resp: Response) -> String {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(body.to_vec()).unwrap()
    }

    fn post(uri: &str, form: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(form.to_string()))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn catalog_text(h: &Harness) -> String {
        std::fs::read_to_string(h.dir.path().join("books.txt")).unwrap()
    }

    #[tokio::test]
    async fn index_lists_tracked_books() {
        let h = harness("ISBN,Price,Title\n111,10.00,Dune\n");
        let resp = app(h.state.clone()).oneshot(get_req("/")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = body_text(resp).await;
        assert!(text.contains("Book Price Tracker"));
        assert!(text.contains("Dune"));
        assert!(text.contains("10.00"));
    }

    #[tokio::test]
    async fn add_then_duplicate_add_is_conflict() {
        let h = harness("ISBN,Price,Title\n");
        let app = app(h.state.clone());

        let resp = app.clone().oneshot(post("/books", "isbn=222")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert_eq!(catalog_text(&h), "ISBN,Price,Title\n222,10.00,Title 222\n");

        let resp = app.oneshot(post("/books", "isbn=222")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert!(body_text(resp).await.contains("already in the catalog"));
        assert_eq!(catalog_text(&h), "ISBN,Price,Title\n222,10.00,Title 222\n");
    }

    #[tokio::test]
    async fn add_with_failed_lookup_is_bad_gateway() {
        let h = harness("ISBN,Price,Title\n");
        let resp = app(h.state.clone()).oneshot(post("/books", "isbn=000")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(catalog_text(&h), "ISBN,Price,Title\n");
    }

    #[tokio::test]
    async fn remove_and_open_are_keyed_by_isbn() {
        let h = harness("ISBN,Price,Title\n111,1.00,A\n222,2.00,B\n");
        let app = app(h.state.clone());

        let resp = app.clone().oneshot(get_req("/books/222/open")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert_eq!(
            resp.headers()[header::LOCATION].to_str().unwrap(),
            "https://books.test/isbn/222"
        );

        let resp = app.clone().oneshot(post("/books/111/remove", "")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert_eq!(catalog_text(&h), "ISBN,Price,Title\n222,2.00,B\n");

        let resp = app.oneshot(get_req("/books/111/open")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn refresh_raises_dismissable_alert() {
        let h = harness("ISBN,Price,Title\n111,10.00,Dune\n");
        *h.source.price.lock().unwrap() = Decimal::new(1250, 2);
        let app = app(h.state.clone());

        let resp = app.clone().oneshot(post("/refresh", "")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        // Commands are served in order, so this waits for the queued pass.
        h.state.handle.snapshot().await.unwrap();

        let alerts = h.state.alerts.list();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].change.message(), "Title 111\nOld: £10.00\nNew: £12.50");

        let text = body_text(app.clone().oneshot(get_req("/")).await.unwrap()).await;
        assert!(text.contains("Open listing"));
        assert!(text.contains("12.50"));

        let uri = format!("/alerts/{}/dismiss", alerts[0].id);
        let resp = app.clone().oneshot(post(&uri, "")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert!(h.state.alerts.list().is_empty());

        let resp = app.oneshot(post(&uri, "")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn api_books_returns_json_rows() {
        let h = harness("ISBN,Price\n111,3.5\n");
        let resp = app(h.state.clone()).oneshot(get_req("/api/books")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "application/json"
        );
        let rows: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(rows[0]["isbn"], "111");
        assert_eq!(rows[0]["price"], "3.50");
        assert_eq!(rows[0]["listing_url"], "https://books.test/isbn/111");
    }

    #[tokio::test]
    async fn add_with_invalid_isbn_is_bad_request() {
        let h = harness("ISBN,Price,Title\n");
        let resp = app(h.state.clone())
            .oneshot(post("/books", "isbn=12%2F34"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(resp).await.contains("Invalid ISBN"));
        assert_eq!(catalog_text(&h), "ISBN,Price,Title\n");
    }

    #[tokio::test]
    async fn unreadable_catalog_is_server_error() {
        let h = harness("ISBN,Price,Title\n111,1.00,A\n");
        let path = h.dir.path().join("books.txt");
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        let resp = app(h.state.clone())
            .oneshot(post("/books/111/remove", ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_text(resp).await.contains("Catalog error"));
    }

    #[tokio::test]
    async fn stylesheet_is_served() {
        let h = harness("ISBN,Price\n");
        let resp = app(h.state.clone())
            .oneshot(get_req("/assets/static/app.css"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_text(resp).await.contains("table"));
    }
}
