//! A settlement report fetcher that replays scripted responses.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use payrecon_types::{DateRange, GatewayError, GatewayTransactionRecord, SettlementReportFetcher};

type Response = Result<Vec<GatewayTransactionRecord>, GatewayError>;

/// Replays queued responses in order, then keeps returning the fallback.
///
/// ```ignore
/// let fetcher = ScriptedFetcher::new(report)
///     .then_respond(Err(GatewayError::Unavailable { detail: "503".into() }));
/// ```
///
/// Scripted responses are consumed before the fallback, so the example above
/// fails once and then serves `report`.
#[derive(Debug)]
pub struct ScriptedFetcher {
    script: Mutex<VecDeque<Response>>,
    fallback: Response,
    delay: Option<Duration>,
    requests: Mutex<Vec<DateRange>>,
}

impl ScriptedFetcher {
    pub fn new(report: Vec<GatewayTransactionRecord>) -> Self {
        Self::with_fallback(Ok(report))
    }

    pub fn failing(error: GatewayError) -> Self {
        Self::with_fallback(Err(error))
    }

    fn with_fallback(fallback: Response) -> Self {
        Self {
            script: Mutex::default(),
            fallback,
            delay: None,
            requests: Mutex::default(),
        }
    }

    #[must_use]
    pub fn then_respond(self, response: Response) -> Self {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(response);
        self
    }

    /// Hold every response back for `delay`.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn requested_ranges(&self) -> Vec<DateRange> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn next_response(&self, range: DateRange) -> Response {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(range);
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

impl SettlementReportFetcher for ScriptedFetcher {
    fn fetch_settlement_report(
        &self,
        range: DateRange,
    ) -> impl Future<Output = Result<Vec<GatewayTransactionRecord>, GatewayError>> + Send {
        let response = self.next_response(range);
        let delay = self.delay;

        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            response
        }
    }
}
