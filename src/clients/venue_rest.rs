use futures_util::future::BoxFuture;
use serde::Deserialize;

use crate::clients::venue::{
    BookTop, LimitOrderRequest, Outcome, VenueClient, VenueFill, VenueOrder, VenueOrderStatus,
    VenuePosition,
};
use crate::config::VenueConfig;
use crate::error::{BotError, BotResult};
use crate::state::orders::Side;

/// Thin REST adapter for the venue. Pure transport: it parses payloads and
/// classifies outcomes, nothing more. A timeout, connection failure or 5xx on
/// a mutating call is `Ambiguous`; only an authoritative 4xx is a definitive
/// absence.
#[derive(Debug, Clone)]
pub struct VenueRestClient {
    base_url: String,
    http: reqwest::Client,
}

impl VenueRestClient {
    pub fn new(cfg: &VenueConfig) -> BotResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(cfg.request_timeout_ms))
            .build()
            .map_err(BotError::Http)?;
        Ok(Self {
            base_url: cfg.rest_base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> BotResult<T> {
        let resp = self.http.get(self.url(path)).send().await?;
        if !resp.status().is_success() {
            return Err(BotError::Other(format!(
                "venue {path} returned status {}",
                resp.status()
            )));
        }
        Ok(resp.json::<T>().await?)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct WireOrder {
    #[serde(default)]
    id: String,
    #[serde(default)]
    client_order_id: String,
    #[serde(default)]
    market: String,
    #[serde(default)]
    side: String,
    #[serde(default)]
    price: f64,
    #[serde(default)]
    size_usd_cents: i64,
    #[serde(default)]
    filled_usd_cents: i64,
    #[serde(default)]
    status: String,
}

impl WireOrder {
    fn into_venue_order(self) -> BotResult<VenueOrder> {
        let side = Side::parse(&self.side)
            .ok_or_else(|| BotError::Other(format!("unknown side {:?}", self.side)))?;
        let status = match self.status.as_str() {
            "OPEN" | "LIVE" => VenueOrderStatus::Open,
            "PARTIALLY_FILLED" | "MATCHED_PARTIAL" => VenueOrderStatus::PartiallyFilled,
            "FILLED" | "MATCHED" => VenueOrderStatus::Filled,
            "CANCELLED" | "CANCELED" => VenueOrderStatus::Cancelled,
            other => {
                return Err(BotError::Other(format!("unknown order status {other:?}")));
            }
        };
        Ok(VenueOrder {
            exchange_order_id: self.id,
            client_order_id: self.client_order_id,
            market_id: self.market,
            side,
            price: self.price,
            size_usd_cents: self.size_usd_cents,
            filled_usd_cents: self.filled_usd_cents,
            status,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct WirePosition {
    market: String,
    side: String,
    notional_usd_cents: i64,
    #[serde(default)]
    avg_price: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct WireFill {
    order_id: String,
    #[serde(default)]
    client_order_id: String,
    market: String,
    price: f64,
    size_usd_cents: i64,
    ts_ms: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct WireBalance {
    available_usd: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct WireServerTime {
    server_time_ms: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct WireBook {
    #[serde(default)]
    best_bid: Option<f64>,
    #[serde(default)]
    best_ask: Option<f64>,
}

/// Ambiguity classification for mutating calls: transport errors and 5xx
/// leave the venue-side effect unknown.
fn classify_mutation_error(err: &reqwest::Error) -> Outcome<VenueOrder> {
    Outcome::Ambiguous(err.to_string())
}

impl VenueClient for VenueRestClient {
    fn list_open_orders(&self) -> BoxFuture<'static, BotResult<Vec<VenueOrder>>> {
        let client = self.clone();
        Box::pin(async move {
            let wire: Vec<WireOrder> = client.get_json("/orders/open").await?;
            wire.into_iter().map(WireOrder::into_venue_order).collect()
        })
    }

    fn list_fills(&self, since_ms: i64) -> BoxFuture<'static, BotResult<Vec<VenueFill>>> {
        let client = self.clone();
        Box::pin(async move {
            let wire: Vec<WireFill> = client
                .get_json(&format!("/fills?since_ms={since_ms}"))
                .await?;
            Ok(wire
                .into_iter()
                .map(|f| VenueFill {
                    exchange_order_id: f.order_id,
                    client_order_id: f.client_order_id,
                    market_id: f.market,
                    price: f.price,
                    size_usd_cents: f.size_usd_cents,
                    ts_ms: f.ts_ms,
                })
                .collect())
        })
    }

    fn list_positions(&self) -> BoxFuture<'static, BotResult<Vec<VenuePosition>>> {
        let client = self.clone();
        Box::pin(async move {
            let wire: Vec<WirePosition> = client.get_json("/positions").await?;
            wire.into_iter()
                .map(|p| {
                    let side = Side::parse(&p.side)
                        .ok_or_else(|| BotError::Other(format!("unknown side {:?}", p.side)))?;
                    Ok(VenuePosition {
                        market_id: p.market,
                        side,
                        notional_usd_cents: p.notional_usd_cents,
                        avg_price: p.avg_price,
                    })
                })
                .collect()
        })
    }

    fn balance_usd(&self) -> BoxFuture<'static, BotResult<f64>> {
        let client = self.clone();
        Box::pin(async move {
            let wire: WireBalance = client.get_json("/balance").await?;
            Ok(wire.available_usd)
        })
    }

    fn server_time_ms(&self) -> BoxFuture<'static, BotResult<i64>> {
        let client = self.clone();
        Box::pin(async move {
            let wire: WireServerTime = client.get_json("/time").await?;
            Ok(wire.server_time_ms)
        })
    }

    fn best_prices(&self, market_id: String) -> BoxFuture<'static, BotResult<BookTop>> {
        let client = self.clone();
        Box::pin(async move {
            let wire: WireBook = client.get_json(&format!("/book/{market_id}/top")).await?;
            Ok(BookTop {
                best_bid: wire.best_bid,
                best_ask: wire.best_ask,
            })
        })
    }

    fn submit_limit_order(
        &self,
        request: LimitOrderRequest,
    ) -> BoxFuture<'static, Outcome<VenueOrder>> {
        let client = self.clone();
        Box::pin(async move {
            let body = serde_json::json!({
                "client_order_id": request.client_order_id,
                "market": request.market_id,
                "side": request.side.as_str(),
                "price": request.price,
                "size_usd_cents": request.size_usd_cents,
                "post_only": request.post_only,
                "marketable": request.marketable,
            });
            let resp = match client
                .http
                .post(client.url("/orders"))
                .json(&body)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(err) => return classify_mutation_error(&err),
            };
            let status = resp.status();
            if status.is_server_error() {
                return Outcome::Ambiguous(format!("venue returned {status}"));
            }
            if status.is_client_error() {
                return Outcome::AbsentConfirmed;
            }
            match resp.json::<WireOrder>().await {
                Ok(wire) => match wire.into_venue_order() {
                    Ok(order) => Outcome::Success(order),
                    Err(err) => Outcome::Ambiguous(format!("unparseable ack: {err}")),
                },
                Err(err) => Outcome::Ambiguous(format!("unreadable ack: {err}")),
            }
        })
    }

    fn cancel_order(&self, exchange_order_id: String) -> BoxFuture<'static, Outcome<()>> {
        let client = self.clone();
        Box::pin(async move {
            let resp = match client
                .http
                .delete(client.url(&format!("/orders/{exchange_order_id}")))
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(err) => return Outcome::Ambiguous(err.to_string()),
            };
            let status = resp.status();
            if status.is_success() {
                Outcome::Success(())
            } else if status == reqwest::StatusCode::NOT_FOUND {
                Outcome::AbsentConfirmed
            } else if status.is_server_error() {
                Outcome::Ambiguous(format!("venue returned {status}"))
            } else {
                Outcome::Ambiguous(format!("unexpected cancel status {status}"))
            }
        })
    }

    fn lookup_order(&self, client_order_id: String) -> BoxFuture<'static, Outcome<VenueOrder>> {
        let client = self.clone();
        Box::pin(async move {
            let resp = match client
                .http
                .get(client.url(&format!("/orders/by-client-id/{client_order_id}")))
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(err) => return Outcome::Ambiguous(err.to_string()),
            };
            let status = resp.status();
            if status == reqwest::StatusCode::NOT_FOUND {
                return Outcome::AbsentConfirmed;
            }
            if !status.is_success() {
                return Outcome::Ambiguous(format!("venue returned {status}"));
            }
            match resp.json::<WireOrder>().await {
                Ok(wire) => match wire.into_venue_order() {
                    Ok(order) => Outcome::Success(order),
                    Err(err) => Outcome::Ambiguous(format!("unparseable order: {err}")),
                },
                Err(err) => Outcome::Ambiguous(format!("unreadable order: {err}")),
            }
        })
    }
}
