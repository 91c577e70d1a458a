//! PayTR fetcher against an in-process fake of the report endpoint.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Form, Router};
use chrono::{NaiveDate, TimeZone, Utc};
use payrecon_paytr::{report_token, PaytrConfig, PaytrReportFetcher};
use payrecon_types::{
    DateRange, GatewayError, GatewayRecordKind, SettlementReportFetcher, SettlementStatus,
};
use rust_decimal_macros::dec;

type FormFields = HashMap<String, String>;
type Responder = Arc<dyn Fn(&FormFields) -> (StatusCode, String) + Send + Sync>;

#[derive(Clone)]
struct FakePaytr {
    requests: Arc<Mutex<Vec<FormFields>>>,
    respond: Responder,
}

async fn report(
    State(fake): State<FakePaytr>,
    Form(form): Form<FormFields>,
) -> (StatusCode, String) {
    let reply = (fake.respond)(&form);
    fake.requests.lock().unwrap().push(form);
    reply
}

async fn spawn_fake(
    respond: impl Fn(&FormFields) -> (StatusCode, String) + Send + Sync + 'static,
) -> (String, Arc<Mutex<Vec<FormFields>>>) {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let state = FakePaytr {
        requests: Arc::clone(&requests),
        respond: Arc::new(respond),
    };
    let app = Router::new()
        .route("/rapor/islem-dokumu", post(report))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{address}"), requests)
}

fn config(base_url: &str) -> PaytrConfig {
    PaytrConfig::new("123456", "key-abc", "salt-xyz")
        .with_base_url(base_url)
        .with_request_timeout(Duration::from_secs(5))
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 1, d).unwrap()
}

fn sale(reference: &str, local_time: &str) -> String {
    format!(
        r#"{{"merchant_oid": "{reference}", "islem_tipi": "S", "islem_tutari": "100,00",
            "para_birimi": "TL", "islem_tarihi": "{local_time}"}}"#
    )
}

fn success(records: &[String]) -> (StatusCode, String) {
    (
        StatusCode::OK,
        format!(r#"{{"status": "success", "data": [{}]}}"#, records.join(",")),
    )
}

#[tokio::test]
async fn multi_day_range_is_fetched_per_window_and_merged() {
    let (base_url, requests) = spawn_fake(|form| match form["start_date"].as_str() {
        "2026-01-05 03:00:00" => success(&[
            sale("ORD-2", "2026-01-05 15:00:00"),
            sale("ORD-1", "2026-01-05 12:30:00"),
            sale("ORD-3", "2026-01-05 20:00:00"),
            sale("ORD-3", "2026-01-05 20:00:00"),
            sale("ORD-EARLY", "2026-01-05 01:00:00"),
        ]),
        _ => success(&[sale("ORD-4", "2026-01-06 10:00:00")]),
    })
    .await;
    let fetcher = PaytrReportFetcher::new(config(&base_url)).unwrap();
    let range = DateRange::days(day(5), day(6)).unwrap();

    let records = fetcher.fetch_settlement_report(range).await.unwrap();

    let references: Vec<&str> = records.iter().map(|r| r.external_ref.as_str()).collect();
    assert_eq!(references, vec!["ORD-1", "ORD-2", "ORD-3", "ORD-4"]);
    assert_eq!(
        records[0].settled_at,
        Utc.with_ymd_and_hms(2026, 1, 5, 9, 30, 0).unwrap()
    );
    assert_eq!(records[0].amount, dec!(100));
    assert_eq!(records[0].kind, GatewayRecordKind::Sale);
    assert_eq!(records[0].status, SettlementStatus::Settled);

    let requests = requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0]["merchant_id"], "123456");
    assert_eq!(requests[0]["end_date"], "2026-01-06 02:59:59");
    assert_eq!(requests[1]["start_date"], "2026-01-06 03:00:00");
}

#[tokio::test]
async fn requests_carry_a_valid_token() {
    let (base_url, requests) = spawn_fake(|_| success(&[])).await;
    let fetcher = PaytrReportFetcher::new(config(&base_url)).unwrap();

    fetcher
        .fetch_settlement_report(DateRange::days(day(5), day(5)).unwrap())
        .await
        .unwrap();

    let requests = requests.lock().unwrap();
    let form = &requests[0];
    let expected = report_token(
        "123456",
        "key-abc",
        "salt-xyz",
        &form["start_date"],
        &form["end_date"],
    )
    .unwrap();
    assert_eq!(form["paytr_token"], expected);
}

#[tokio::test]
async fn empty_day_yields_no_records() {
    let (base_url, _) = spawn_fake(|_| {
        (
            StatusCode::OK,
            r#"{"status": "failed", "err_msg": "Islem bulunamadi"}"#.to_owned(),
        )
    })
    .await;
    let fetcher = PaytrReportFetcher::new(config(&base_url)).unwrap();

    let records = fetcher
        .fetch_settlement_report(DateRange::days(day(5), day(5)).unwrap())
        .await
        .unwrap();

    assert!(records.is_empty());
}

async fn fetch_error(status: StatusCode, body: &'static str) -> GatewayError {
    let (base_url, _) = spawn_fake(move |_| (status, body.to_owned())).await;
    let fetcher = PaytrReportFetcher::new(config(&base_url)).unwrap();
    fetcher
        .fetch_settlement_report(DateRange::days(day(5), day(5)).unwrap())
        .await
        .unwrap_err()
}

#[tokio::test]
async fn server_errors_and_throttling_are_transient() {
    assert!(matches!(
        fetch_error(StatusCode::SERVICE_UNAVAILABLE, "down").await,
        GatewayError::Unavailable { .. }
    ));
    assert!(matches!(
        fetch_error(StatusCode::TOO_MANY_REQUESTS, "slow down").await,
        GatewayError::Unavailable { .. }
    ));
}

#[tokio::test]
async fn credential_problems_are_auth_errors() {
    assert!(matches!(
        fetch_error(StatusCode::UNAUTHORIZED, "").await,
        GatewayError::Auth { .. }
    ));
    assert!(matches!(
        fetch_error(
            StatusCode::OK,
            r#"{"status": "failed", "err_msg": "paytr_token gecersiz"}"#
        )
        .await,
        GatewayError::Auth { .. }
    ));
}

#[tokio::test]
async fn refusals_and_garbage_are_not_retryable() {
    let refused = fetch_error(
        StatusCode::OK,
        r#"{"status": "failed", "err_msg": "tarih araligi hatali"}"#,
    )
    .await;
    assert!(matches!(refused, GatewayError::Rejected { .. }));
    assert!(!refused.class().is_retryable());

    assert!(matches!(
        fetch_error(StatusCode::BAD_REQUEST, "bad request").await,
        GatewayError::Rejected { .. }
    ));
    assert!(matches!(
        fetch_error(StatusCode::OK, "<html>maintenance</html>").await,
        GatewayError::Malformed { .. }
    ));
}

#[tokio::test]
async fn unreachable_endpoint_is_transient() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    drop(listener);
    let fetcher = PaytrReportFetcher::new(config(&format!("http://{address}"))).unwrap();

    let error = fetcher
        .fetch_settlement_report(DateRange::days(day(5), day(5)).unwrap())
        .await
        .unwrap_err();

    assert!(matches!(error, GatewayError::Unavailable { .. }));
    assert!(error.class().is_retryable());
}
