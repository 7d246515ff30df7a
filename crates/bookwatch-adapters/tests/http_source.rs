use std::time::Duration;

use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;
use bookwatch_adapters::{AbeBooksSource, LookupErrorKind, PriceSource};
use bookwatch_storage::{HttpClientConfig, HttpFetcher};
use rust_decimal::Decimal;

const TEST_AGENT: &str = "bookwatch-test-agent/1.0";

async fn listing(Path((isbn, suffix)): Path<(String, String)>, headers: HeaderMap) -> impl IntoResponse {
    let agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if agent != TEST_AGENT {
        return (StatusCode::FORBIDDEN, Html(String::new()));
    }
    match isbn.as_str() {
        "404404" => (StatusCode::NOT_FOUND, Html(String::new())),
        "no-price" => (
            StatusCode::OK,
            Html(r#"<span data-test-id="listing-title">Out of print</span>"#.to_string()),
        ),
        _ => (
            StatusCode::OK,
            Html(format!(
                r#"<span data-test-id="listing-title">Book {isbn} via {suffix}</span>
                   <p class="item-price" id="item-price-1">Ł1,204.99</p>"#
            )),
        ),
    }
}

async fn spawn_site() -> String {
    let app = Router::new().route("/book-search/isbn/{isbn}/n/{suffix}", get(listing));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}/book-search/isbn")
}

fn source(base_url: String) -> AbeBooksSource {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(5),
        user_agent: TEST_AGENT.to_string(),
    })
    .unwrap();
    AbeBooksSource::new(http, base_url)
}

#[tokio::test]
async fn fetch_parses_live_listing_with_configured_user_agent() {
    let base = spawn_site().await;
    let listing = source(base.clone()).fetch("9780441478125").await.unwrap();
    assert_eq!(listing.title, "Book 9780441478125 via 100121502");
    assert_eq!(listing.price, Decimal::new(120499, 2));
    assert_eq!(listing.listing_url, format!("{base}/9780441478125/n/100121502"));
}

#[tokio::test]
async fn non_success_status_is_http_status_error() {
    let base = spawn_site().await;
    let err = source(base).fetch("404404").await.unwrap_err();
    assert_eq!(err.kind(), LookupErrorKind::HttpStatus);
    assert!(err.to_string().contains("404404"));
}

#[tokio::test]
async fn missing_price_element_is_reported_after_fetch() {
    let base = spawn_site().await;
    let err = source(base).fetch("no-price").await.unwrap_err();
    assert_eq!(err.kind(), LookupErrorKind::PriceNotFound);
}

#[tokio::test]
async fn unreachable_host_is_network_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = source(format!("http://{addr}/book-search/isbn"))
        .fetch("111")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), LookupErrorKind::Network);
}
