use chrono::{FixedOffset, TimeDelta};
use payrecon_types::{DateRange, GatewayError, GatewayTransactionRecord, SettlementReportFetcher};
use reqwest::StatusCode;
use tracing::{debug, info, instrument, warn};

use crate::config::{PaytrConfig, PaytrSetupError};
use crate::report::{format_local_time, parse_report};
use crate::token::report_token;

/// Path of the transaction statement endpoint.
pub const REPORT_PATH: &str = "/rapor/islem-dokumu";

/// Longest response excerpt carried in an error.
const EXCERPT_LEN: usize = 200;

/// Fetches settlement reports from the PayTR `islem-dokumu` API.
///
/// A range longer than [`PaytrConfig::max_window`] is requested window by
/// window and the pages are merged, deduplicated and sorted.
#[derive(Debug, Clone)]
pub struct PaytrReportFetcher {
    client: reqwest::Client,
    config: PaytrConfig,
    endpoint: String,
    offset: FixedOffset,
}

impl PaytrReportFetcher {
    pub fn new(config: PaytrConfig) -> Result<Self, PaytrSetupError> {
        config.validate()?;
        let offset = config.utc_offset()?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(PaytrSetupError::Client)?;
        let endpoint = format!("{}{REPORT_PATH}", config.base_url.trim_end_matches('/'));

        Ok(Self {
            client,
            config,
            endpoint,
            offset,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn fetch_window(
        &self,
        window: DateRange,
    ) -> Result<Vec<GatewayTransactionRecord>, GatewayError> {
        // The API takes an inclusive end second.
        let last_second = window.end() - TimeDelta::seconds(1);
        let start_date = format_local_time(window.start(), self.offset);
        let end_date = format_local_time(last_second.max(window.start()), self.offset);
        let token = report_token(
            &self.config.merchant_id,
            &self.config.merchant_key,
            &self.config.merchant_salt,
            &start_date,
            &end_date,
        )?;

        let response = self
            .client
            .post(&self.endpoint)
            .form(&[
                ("merchant_id", self.config.merchant_id.as_str()),
                ("start_date", start_date.as_str()),
                ("end_date", end_date.as_str()),
                ("paytr_token", token.as_str()),
            ])
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(GatewayError::Auth {
                detail: format!("HTTP {status}"),
            });
        }
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            warn!(status = %status, window = %window, "[paytr.window] report endpoint unavailable");
            return Err(GatewayError::Unavailable {
                detail: format!("HTTP {status}"),
            });
        }

        let body = response.text().await.map_err(transport)?;
        if !status.is_success() {
            return Err(GatewayError::Rejected {
                detail: format!("HTTP {status}: {}", excerpt(&body)),
            });
        }

        let records = parse_report(&body, self.offset)?;
        let fetched = records.len();
        let records: Vec<_> = records
            .into_iter()
            .filter(|record| window.contains(record.settled_at))
            .collect();
        debug!(
            window = %window,
            records = records.len(),
            dropped = fetched - records.len(),
            "[paytr.window] report window fetched"
        );
        Ok(records)
    }
}

fn transport(error: reqwest::Error) -> GatewayError {
    GatewayError::Unavailable {
        detail: error.to_string(),
    }
}

fn excerpt(body: &str) -> &str {
    match body.char_indices().nth(EXCERPT_LEN) {
        Some((index, _)) => &body[..index],
        None => body,
    }
}

/// Sort by report order and drop exact duplicates from overlapping pages.
pub fn assemble(mut records: Vec<GatewayTransactionRecord>) -> Vec<GatewayTransactionRecord> {
    records.sort_by(|a, b| {
        a.sort_key()
            .cmp(&b.sort_key())
            .then_with(|| a.status.cmp(&b.status))
            .then_with(|| a.currency.cmp(&b.currency))
    });
    records.dedup();
    records
}

impl SettlementReportFetcher for PaytrReportFetcher {
    #[instrument(name = "paytr.fetch_settlement_report", skip(self, range), fields(range = %range))]
    async fn fetch_settlement_report(
        &self,
        range: DateRange,
    ) -> Result<Vec<GatewayTransactionRecord>, GatewayError> {
        let windows = range.windows(self.config.max_window);
        let window_count = windows.len();

        let mut records = Vec::new();
        for window in windows {
            records.extend(self.fetch_window(window).await?);
        }
        let records = assemble(records);

        info!(
            windows = window_count,
            records = records.len(),
            "[paytr.report] settlement report fetched"
        );
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use payrecon_types::{
        Currency, ExternalRef, GatewayRecordKind, SettlementStatus,
    };
    use rust_decimal_macros::dec;

    fn record(reference: &str, minute: u32) -> GatewayTransactionRecord {
        GatewayTransactionRecord {
            external_ref: ExternalRef::try_new(reference).unwrap(),
            kind: GatewayRecordKind::Sale,
            amount: dec!(10),
            currency: Currency::try_new("TRY").unwrap(),
            status: SettlementStatus::Settled,
            settled_at: Utc.with_ymd_and_hms(2026, 1, 5, 10, minute, 0).unwrap(),
        }
    }

    #[test]
    fn assemble_sorts_and_removes_exact_duplicates() {
        let records = assemble(vec![
            record("B", 1),
            record("A", 5),
            record("A", 1),
            record("B", 1),
        ]);

        let keys: Vec<_> = records
            .iter()
            .map(|r| (r.external_ref.as_str().to_owned(), r.settled_at))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("A".to_owned(), record("A", 1).settled_at),
                ("A".to_owned(), record("A", 5).settled_at),
                ("B".to_owned(), record("B", 1).settled_at),
            ]
        );
    }

    #[test]
    fn records_differing_only_in_status_are_both_kept() {
        let mut failed = record("A", 1);
        failed.status = SettlementStatus::Failed;

        let records = assemble(vec![record("A", 1), failed, record("A", 1)]);

        assert_eq!(records.len(), 2);
    }

    #[test]
    fn endpoint_ignores_trailing_slash_in_base_url() {
        let config = PaytrConfig::new("1", "k", "s").with_base_url("http://127.0.0.1:9/");
        let fetcher = PaytrReportFetcher::new(config).unwrap();

        assert_eq!(fetcher.endpoint(), "http://127.0.0.1:9/rapor/islem-dokumu");
    }

    #[test]
    fn excerpt_respects_char_boundaries() {
        let body = "ş".repeat(EXCERPT_LEN + 10);

        assert_eq!(excerpt(&body).chars().count(), EXCERPT_LEN);
        assert_eq!(excerpt("short"), "short");
    }
}
