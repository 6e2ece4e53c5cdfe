use async_trait::async_trait;
use futures_util::StreamExt;
use gateway_core::*;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::protocol::*;

const PRACTICE_API: &str = "https://api-fxpractice.oanda.com";
const PRACTICE_STREAM: &str = "https://stream-fxpractice.oanda.com";
const LIVE_API: &str = "https://api-fxtrade.oanda.com";
const LIVE_STREAM: &str = "https://stream-fxtrade.oanda.com";

/// Configuration for the OANDA v20 API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OandaConfig {
    pub account_id: String,
    /// Personal access token. Usually supplied through `OANDA_API_TOKEN`.
    #[serde(skip_serializing)]
    pub api_token: Option<String>,
    /// Trade against fxTrade (live) instead of fxPractice.
    pub live: bool,
    pub request_timeout_secs: u64,
    /// The transaction stream heartbeats every 5s; silence longer than this
    /// fails the health check.
    pub stream_timeout_secs: u64,
}

impl Default for OandaConfig {
    fn default() -> Self {
        Self {
            account_id: String::new(),
            api_token: None,
            live: false,
            request_timeout_secs: 10,
            stream_timeout_secs: 20,
        }
    }
}

impl OandaConfig {
    pub fn rest_url(&self) -> &'static str {
        if self.live {
            LIVE_API
        } else {
            PRACTICE_API
        }
    }

    pub fn stream_url(&self) -> &'static str {
        if self.live {
            LIVE_STREAM
        } else {
            PRACTICE_STREAM
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs)
    }
}

struct Session {
    sink: VenueSink,
    transactions: JoinHandle<()>,
    pricing: Option<JoinHandle<()>>,
}

impl Session {
    fn stop(self) {
        self.transactions.abort();
        if let Some(pricing) = self.pricing {
            pricing.abort();
        }
    }
}

/// OANDA v20 venue adapter.
///
/// Commands and queries go over REST. Order lifecycle events come from the
/// account transaction stream, where the transaction id doubles as the
/// sequence number; quotes come from the pricing stream, which is reopened
/// whenever the subscribed instrument set changes.
pub struct OandaAdapter {
    config: OandaConfig,
    http: Client,
    session: Mutex<Option<Session>>,
    instruments: AsyncMutex<BTreeSet<String>>,
    /// Replaced order id -> replacing order id.
    aliases: Arc<Mutex<HashMap<String, String>>>,
    last_activity: Arc<Mutex<Instant>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn transport(e: reqwest::Error) -> VenueError {
    if e.is_timeout() {
        VenueError::Timeout
    } else {
        VenueError::Transport(e.to_string())
    }
}

impl OandaAdapter {
    pub fn new(config: OandaConfig) -> Self {
        Self {
            config,
            http: Client::new(),
            session: Mutex::new(None),
            instruments: AsyncMutex::new(BTreeSet::new()),
            aliases: Arc::new(Mutex::new(HashMap::new())),
            last_activity: Arc::new(Mutex::new(Instant::now())),
        }
    }

    fn account_path(&self, suffix: &str) -> String {
        format!(
            "{}/v3/accounts/{}{}",
            self.config.rest_url(),
            self.config.account_id,
            suffix
        )
    }

    fn authed(&self, builder: RequestBuilder) -> Result<RequestBuilder, VenueError> {
        let token = self
            .config
            .api_token
            .as_deref()
            .ok_or_else(|| VenueError::Auth("OANDA API token not configured".to_string()))?;
        Ok(builder
            .bearer_auth(token)
            .header("Accept-Datetime-Format", "RFC3339"))
    }

    /// Follow replacements to the order id OANDA currently knows.
    fn resolve(&self, venue_id: &str) -> String {
        let aliases = lock(&self.aliases);
        let mut current = venue_id;
        // Bounded walk; a cycle would be a bug in the stream mapping.
        for _ in 0..aliases.len() {
            match aliases.get(current) {
                Some(next) => current = next,
                None => break,
            }
        }
        current.to_string()
    }

    async fn execute(&self, builder: RequestBuilder) -> Result<Response, VenueError> {
        let response = self
            .authed(builder)?
            .timeout(self.config.request_timeout())
            .send()
            .await
            .map_err(transport)?;
        check(response).await
    }

    async fn get<T: DeserializeOwned>(&self, suffix: &str) -> Result<T, VenueError> {
        let response = self.execute(self.http.get(self.account_path(suffix))).await?;
        response
            .json()
            .await
            .map_err(|e| VenueError::Protocol(e.to_string()))
    }

    async fn open_stream(&self, path: &str, query: &[(&str, String)]) -> Result<Response, VenueError> {
        let url = format!(
            "{}/v3/accounts/{}{}",
            self.config.stream_url(),
            self.config.account_id,
            path
        );
        let response = self
            .authed(self.http.get(url).query(query))?
            .send()
            .await
            .map_err(transport)?;
        check(response).await
    }

    /// Reopen the pricing stream for the current instrument set.
    async fn restart_pricing(&self, instruments: &BTreeSet<String>) -> Result<(), VenueError> {
        let sink = lock(&self.session).as_ref().map(|s| s.sink.clone());
        let Some(sink) = sink else {
            return Err(VenueError::Transport("Not connected".to_string()));
        };

        let handle = if instruments.is_empty() {
            None
        } else {
            let list = instruments.iter().cloned().collect::<Vec<_>>().join(",");
            let response = self
                .open_stream("/pricing/stream", &[("instruments", list)])
                .await?;
            Some(tokio::spawn(pricing_stream(response, sink)))
        };

        let mut session = lock(&self.session);
        match session.as_mut() {
            Some(session) => {
                if let Some(old) = std::mem::replace(&mut session.pricing, handle) {
                    old.abort();
                }
                Ok(())
            }
            None => {
                if let Some(handle) = handle {
                    handle.abort();
                }
                Err(VenueError::Transport("Not connected".to_string()))
            }
        }
    }
}

/// Map an error status onto a venue error.
async fn check(response: Response) -> Result<Response, VenueError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body: ErrorBody = response.json().await.unwrap_or_default();
    let message = body
        .error_message
        .or(body.reject_reason)
        .unwrap_or_else(|| status.to_string());
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => VenueError::Auth(message),
        StatusCode::NOT_FOUND => VenueError::NotFound(message),
        s if s.is_client_error() => VenueError::Rejected(message),
        _ => VenueError::Transport(message),
    })
}

/// Feed newline-delimited JSON lines to `on_line` until the body ends, an
/// error occurs, or `on_line` asks to stop. Returns why the stream ended.
async fn read_lines<F>(response: Response, mut on_line: F) -> Option<String>
where
    F: FnMut(&str) -> bool,
{
    let mut body = response.bytes_stream();
    let mut buffer = LineBuffer::default();
    while let Some(chunk) = body.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => return Some(e.to_string()),
        };
        for line in buffer.push(&bytes) {
            if !on_line(&line) {
                return None;
            }
        }
    }
    Some("stream closed by server".to_string())
}

/// Drop every replacement chain that ends at a finished order.
fn prune_aliases(aliases: &mut HashMap<String, String>, finished: &str) {
    let mut gone = vec![finished.to_string()];
    while let Some(id) = gone.pop() {
        let stale: Vec<String> = aliases
            .iter()
            .filter(|(_, to)| **to == id)
            .map(|(from, _)| from.clone())
            .collect();
        for from in stale {
            aliases.remove(&from);
            gone.push(from);
        }
    }
}

async fn transaction_stream(
    response: Response,
    sink: VenueSink,
    aliases: Arc<Mutex<HashMap<String, String>>>,
    last_activity: Arc<Mutex<Instant>>,
) {
    let ended = read_lines(response, |line| {
        *lock(&last_activity) = Instant::now();
        let parsed: TransactionLine = match serde_json::from_str(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(error = %e, "Unparsed transaction line");
                return true;
            }
        };
        match parsed.into_transaction() {
            Transaction::Event(event) => sink.send(event).is_ok(),
            Transaction::Replaced {
                old_id,
                new_id,
                event,
            } => {
                lock(&aliases).insert(old_id, new_id);
                sink.send(event).is_ok()
            }
            Transaction::Closed { order_id, event } => {
                prune_aliases(&mut lock(&aliases), &order_id);
                sink.send(event).is_ok()
            }
            Transaction::Heartbeat | Transaction::Ignored => true,
        }
    })
    .await;

    if let Some(reason) = ended {
        warn!(reason = %reason, "OANDA transaction stream lost");
        let _ = sink.send(VenueEvent::TransportLost { reason });
    }
}

async fn pricing_stream(response: Response, sink: VenueSink) {
    let ended = read_lines(response, |line| {
        match serde_json::from_str::<PricingLine>(line).map(PricingLine::into_quote) {
            Ok(Some(quote)) => sink.send(VenueEvent::Quote(quote)).is_ok(),
            Ok(None) => true,
            Err(e) => {
                debug!(error = %e, "Unparsed pricing line");
                true
            }
        }
    })
    .await;

    if let Some(reason) = ended {
        warn!(reason = %reason, "OANDA pricing stream lost");
        let _ = sink.send(VenueEvent::TransportLost { reason });
    }
}

#[async_trait]
impl VenueAdapter for OandaAdapter {
    fn name(&self) -> &str {
        "OANDA"
    }

    async fn open(&self, sink: VenueSink) -> Result<(), VenueError> {
        info!(
            account_id = %self.config.account_id,
            live = self.config.live,
            "Connecting to OANDA"
        );
        // The summary call doubles as the credential check.
        let summary: AccountSummaryResponse = self.get("/summary").await?;
        let _ = sink.send(VenueEvent::Account(summary.account.into()));

        let response = self.open_stream("/transactions/stream", &[]).await?;
        *lock(&self.last_activity) = Instant::now();
        let transactions = tokio::spawn(transaction_stream(
            response,
            sink.clone(),
            self.aliases.clone(),
            self.last_activity.clone(),
        ));

        self.instruments.lock().await.clear();
        let previous = lock(&self.session).replace(Session {
            sink,
            transactions,
            pricing: None,
        });
        if let Some(previous) = previous {
            previous.stop();
        }
        info!(account_id = %self.config.account_id, "Connected to OANDA");
        Ok(())
    }

    async fn close(&self) {
        let session = lock(&self.session).take();
        if let Some(session) = session {
            session.stop();
            info!(account_id = %self.config.account_id, "Disconnected from OANDA");
        }
        self.instruments.lock().await.clear();
    }

    async fn heartbeat(&self) -> Result<(), VenueError> {
        if lock(&self.session).is_none() {
            return Err(VenueError::Transport("Not connected".to_string()));
        }
        let silent = lock(&self.last_activity).elapsed();
        if silent > self.config.stream_timeout() {
            return Err(VenueError::Transport(format!(
                "transaction stream silent for {}s",
                silent.as_secs()
            )));
        }
        Ok(())
    }

    async fn fetch_account(&self) -> Result<Account, VenueError> {
        let summary: AccountSummaryResponse = self.get("/summary").await?;
        Ok(summary.account.into())
    }

    async fn fetch_positions(&self) -> Result<Vec<Position>, VenueError> {
        let response: OpenPositionsResponse = self.get("/openPositions").await?;
        Ok(response
            .positions
            .into_iter()
            .map(Position::from)
            .filter(|p| !p.is_flat())
            .collect())
    }

    async fn fetch_open_orders(&self) -> Result<Vec<VenueOrder>, VenueError> {
        let response: OrdersResponse = self.get("/pendingOrders").await?;
        Ok(response
            .orders
            .into_iter()
            .filter_map(WireOrder::into_venue_order)
            .collect())
    }

    async fn fetch_order(&self, venue_id: &str) -> Result<Option<VenueOrder>, VenueError> {
        let id = self.resolve(venue_id);
        match self.get::<OrderResponse>(&format!("/orders/{id}")).await {
            Ok(response) => Ok(response.order.into_venue_order().map(|mut order| {
                order.venue_id = venue_id.to_string();
                order
            })),
            Err(VenueError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn submit_order(
        &self,
        correlation_id: CorrelationId,
        request: &OrderRequest,
    ) -> Result<(), VenueError> {
        let body = OrderEnvelope {
            order: OrderSpec::new(correlation_id, request),
        };
        self.execute(self.http.post(self.account_path("/orders")).json(&body))
            .await?;
        debug!(correlation_id = %correlation_id, "Order posted to OANDA");
        Ok(())
    }

    /// OANDA amends by replacing the order; the replacement keeps the
    /// client extensions so later fills still carry the correlation id.
    async fn amend_order(&self, venue_id: &str, amendment: &OrderAmendment) -> Result<(), VenueError> {
        let id = self.resolve(venue_id);
        let current: OrderResponse = self.get(&format!("/orders/{id}")).await?;
        let order = current.order;
        let units = order
            .units
            .ok_or_else(|| VenueError::Rejected(format!("order {id} cannot be amended")))?;
        let units = match amendment.quantity {
            Some(quantity) if units < Decimal::ZERO => -quantity,
            Some(quantity) => quantity,
            None => units,
        };
        let price = amendment.price.or(order.price);

        let body = serde_json::json!({
            "order": {
                "type": order.kind,
                "instrument": order.instrument,
                "units": units.normalize().to_string(),
                "price": price.map(|p| p.normalize().to_string()),
                "timeInForce": order.time_in_force.unwrap_or_else(|| "GTC".to_string()),
                "clientExtensions": order.client_extensions.unwrap_or_default(),
            }
        });
        self.execute(self.http.put(self.account_path(&format!("/orders/{id}"))).json(&body))
            .await?;
        Ok(())
    }

    async fn cancel_order(&self, venue_id: &str) -> Result<(), VenueError> {
        let id = self.resolve(venue_id);
        self.execute(self.http.put(self.account_path(&format!("/orders/{id}/cancel"))))
            .await?;
        Ok(())
    }

    async fn subscribe(&self, symbol: &str) -> Result<(), VenueError> {
        let mut instruments = self.instruments.lock().await;
        if !instruments.insert(symbol.to_string()) {
            return Ok(());
        }
        if let Err(e) = self.restart_pricing(&instruments).await {
            instruments.remove(symbol);
            return Err(e);
        }
        Ok(())
    }

    async fn unsubscribe(&self, symbol: &str) -> Result<(), VenueError> {
        let mut instruments = self.instruments.lock().await;
        if !instruments.remove(symbol) {
            return Ok(());
        }
        self.restart_pricing(&instruments).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_hosts_follow_live_flag() {
        let practice = OandaConfig::default();
        assert_eq!(practice.rest_url(), "https://api-fxpractice.oanda.com");
        assert_eq!(practice.stream_url(), "https://stream-fxpractice.oanda.com");

        let live = OandaConfig {
            live: true,
            ..OandaConfig::default()
        };
        assert_eq!(live.rest_url(), "https://api-fxtrade.oanda.com");
    }

    #[test]
    fn test_token_is_not_serialized() {
        let config = OandaConfig {
            account_id: "101-004-1".into(),
            api_token: Some("secret".into()),
            ..OandaConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret"));
    }

    #[test]
    fn test_resolve_follows_replacements() {
        let adapter = OandaAdapter::new(OandaConfig::default());
        {
            let mut aliases = lock(&adapter.aliases);
            aliases.insert("50".into(), "52".into());
            aliases.insert("52".into(), "60".into());
        }
        assert_eq!(adapter.resolve("50"), "60");
        assert_eq!(adapter.resolve("99"), "99");
    }

    #[test]
    fn test_finished_order_prunes_its_chain() {
        let mut aliases = HashMap::new();
        aliases.insert("50".to_string(), "52".to_string());
        aliases.insert("52".to_string(), "60".to_string());
        aliases.insert("70".to_string(), "71".to_string());

        prune_aliases(&mut aliases, "60");
        assert_eq!(aliases.len(), 1);
        assert_eq!(aliases.get("70").map(String::as_str), Some("71"));

        prune_aliases(&mut aliases, "99");
        assert_eq!(aliases.len(), 1);
    }

    #[tokio::test]
    async fn test_open_without_token_is_auth_error() {
        let adapter = OandaAdapter::new(OandaConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(adapter.open(tx).await, Err(VenueError::Auth(_))));
    }

    #[tokio::test]
    async fn test_heartbeat_requires_session() {
        let adapter = OandaAdapter::new(OandaConfig::default());
        assert!(matches!(
            adapter.heartbeat().await,
            Err(VenueError::Transport(_))
        ));
    }
}
