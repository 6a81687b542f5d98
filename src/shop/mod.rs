//! Livestream shop client.
//!
//! Walks the cursor-paginated `LivestreamShop` GraphQL query (tab `SOLD`)
//! and returns every sold item of a livestream in server order.
//!
//! Fails soft: a transport error, a non-2xx status, or an undecodable page
//! ends the walk and whatever was collected so far is returned. There is no
//! retry; the next scheduled check starts over from the first page.

use crate::config::ShopConfig;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const OPERATION_NAME: &str = "LivestreamShop";
const SOLD_TAB: &str = "SOLD";

const SHOP_QUERY: &str = r#"
query LivestreamShop($livestreamId: ID!, $tab: ShopTab, $first: Int, $after: String) {
  liveStream(id: $livestreamId) {
    id
    shop(tab: $tab, first: $first, after: $after) {
      pageInfo {
        hasNextPage
        endCursor
      }
      edges {
        node {
          price {
            amount
            currency
          }
        }
      }
    }
  }
}
"#;

/// One sold item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaleRecord {
    /// Price in minor units (cents).
    pub price_amount_minor_units: i64,
    pub currency: String,
}

impl SaleRecord {
    /// Price in major currency units.
    pub fn price(&self) -> Decimal {
        Decimal::new(self.price_amount_minor_units, 2)
    }
}

#[derive(Error, Debug)]
pub enum ShopError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("graphql errors: {0}")]
    GraphQl(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// A single decoded page of the sold tab.
#[derive(Debug, Clone)]
pub struct ShopPage {
    pub records: Vec<SaleRecord>,
    pub has_next_page: bool,
    pub end_cursor: Option<String>,
}

// ─── Wire types ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    data: Option<ShopData>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShopData {
    live_stream: Option<LiveStream>,
}

#[derive(Debug, Deserialize)]
struct LiveStream {
    shop: Option<ShopConnection>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShopConnection {
    page_info: PageInfo,
    #[serde(default)]
    edges: Vec<Edge>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Edge {
    node: Node,
}

#[derive(Debug, Deserialize)]
struct Node {
    price: Price,
}

#[derive(Debug, Deserialize)]
struct Price {
    amount: i64,
    #[serde(default)]
    currency: String,
}

fn decode_page(body: &str) -> Result<ShopPage, ShopError> {
    let resp: GraphQlResponse =
        serde_json::from_str(body).map_err(|e| ShopError::Malformed(e.to_string()))?;

    if !resp.errors.is_empty() {
        let messages: Vec<&str> = resp.errors.iter().map(|e| e.message.as_str()).collect();
        return Err(ShopError::GraphQl(messages.join("; ")));
    }

    let shop = resp
        .data
        .and_then(|d| d.live_stream)
        .and_then(|ls| ls.shop)
        .ok_or_else(|| ShopError::Malformed("missing data.liveStream.shop".to_string()))?;

    // A next page without a cursor would refetch page one forever.
    if shop.page_info.has_next_page && shop.page_info.end_cursor.is_none() {
        return Err(ShopError::Malformed(
            "hasNextPage without endCursor".to_string(),
        ));
    }

    let records = shop
        .edges
        .into_iter()
        .map(|e| SaleRecord {
            price_amount_minor_units: e.node.price.amount,
            currency: e.node.price.currency,
        })
        .collect();

    Ok(ShopPage {
        records,
        has_next_page: shop.page_info.has_next_page,
        end_cursor: shop.page_info.end_cursor,
    })
}

// ─── Client ─────────────────────────────────────────────────────────────────

pub struct ShopClient {
    endpoint: String,
    page_size: u32,
    page_delay: Duration,
    session_cookie: Option<String>,
    client: reqwest::Client,
}

impl ShopClient {
    pub fn new(cfg: &ShopConfig) -> Self {
        Self {
            endpoint: cfg.endpoint.clone(),
            page_size: cfg.page_size.max(1),
            page_delay: cfg.page_delay(),
            session_cookie: Some(cfg.session_cookie.clone()).filter(|c| !c.is_empty()),
            client: reqwest::Client::new(),
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Fetch one page of the sold tab, starting after `after` (None = first page).
    pub async fn fetch_page(
        &self,
        livestream_id: &str,
        after: Option<&str>,
    ) -> Result<ShopPage, ShopError> {
        let body = json!({
            "operationName": OPERATION_NAME,
            "variables": {
                "livestreamId": livestream_id,
                "tab": SOLD_TAB,
                "first": self.page_size,
                "after": after,
            },
            "query": SHOP_QUERY,
        });

        let mut req = self
            .client
            .post(&self.endpoint)
            .header("apollographql-client-name", "web")
            .json(&body);
        if let Some(ref cookie) = self.session_cookie {
            req = req.header(reqwest::header::COOKIE, cookie);
        }

        let resp = req.send().await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ShopError::Status { status, body });
        }

        let text = resp.text().await?;
        let page = decode_page(&text)?;

        debug!(
            livestream_id = livestream_id,
            after = ?after,
            items = page.records.len(),
            has_next = page.has_next_page,
            "fetched shop page"
        );

        Ok(page)
    }

    /// Fetch every sold item for a livestream, in server order.
    ///
    /// Sleeps `page_delay` between pages, never before the first or after
    /// the last. Any page error stops the walk and returns the partial list.
    pub async fn fetch_all_sales(&self, livestream_id: &str) -> Vec<SaleRecord> {
        let mut all_sales = Vec::new();
        let mut after: Option<String> = None;
        let mut pages = 0usize;

        loop {
            match self.fetch_page(livestream_id, after.as_deref()).await {
                Ok(page) => {
                    pages += 1;
                    all_sales.extend(page.records);
                    if !page.has_next_page {
                        break;
                    }
                    after = page.end_cursor;
                    if !self.page_delay.is_zero() {
                        tokio::time::sleep(self.page_delay).await;
                    }
                }
                Err(e) => {
                    warn!(
                        livestream_id = livestream_id,
                        page = pages + 1,
                        collected = all_sales.len(),
                        error = %e,
                        "shop page fetch failed, returning partial results"
                    );
                    break;
                }
            }
        }

        info!(
            livestream_id = livestream_id,
            pages = pages,
            sales = all_sales.len(),
            "shop walk complete"
        );

        all_sales
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::Value;
    use wiremock::matchers::{body_partial_json, header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// A `LivestreamShop` response body with `count` items priced at `cents`.
    pub(crate) fn shop_page_body(count: usize, cents: i64, next: Option<&str>) -> Value {
        let edges: Vec<Value> = (0..count)
            .map(|_| json!({"node": {"price": {"amount": cents, "currency": "USD"}}}))
            .collect();
        json!({
            "data": {
                "liveStream": {
                    "id": "ls-1",
                    "shop": {
                        "pageInfo": {"hasNextPage": next.is_some(), "endCursor": next},
                        "edges": edges,
                    }
                }
            }
        })
    }

    pub(crate) fn test_client(endpoint: String) -> ShopClient {
        ShopClient::new(&ShopConfig {
            endpoint,
            page_size: 50,
            page_delay_ms: 0,
            session_cookie: String::new(),
        })
    }

    fn endpoint(server: &MockServer) -> String {
        format!("{}/services/graphql/?operationName=LivestreamShop", server.uri())
    }

    #[tokio::test]
    async fn test_walks_pages_until_no_next() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(header("apollographql-client-name", "web"))
            .and(body_partial_json(json!({
                "operationName": "LivestreamShop",
                "variables": {"livestreamId": "ls-1", "tab": "SOLD", "first": 50, "after": null}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(shop_page_body(50, 1_000, Some("c1"))))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(body_partial_json(json!({"variables": {"after": "c1"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(shop_page_body(10, 500, None)))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(endpoint(&server));
        let sales = client.fetch_all_sales("ls-1").await;

        assert_eq!(sales.len(), 60);
        // Server order: first page's items come first.
        assert!(sales[..50].iter().all(|s| s.price_amount_minor_units == 1_000));
        assert!(sales[50..].iter().all(|s| s.price_amount_minor_units == 500));
        assert_eq!(sales[0].currency, "USD");
    }

    #[tokio::test]
    async fn test_failed_page_returns_partial() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(body_partial_json(json!({"variables": {"after": null}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(shop_page_body(50, 1_000, Some("c1"))))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(body_partial_json(json!({"variables": {"after": "c1"}})))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = test_client(endpoint(&server));
        let sales = client.fetch_all_sales("ls-1").await;
        assert_eq!(sales.len(), 50);

        let err = client.fetch_page("ls-1", Some("c1")).await.unwrap_err();
        assert!(matches!(err, ShopError::Status { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_malformed_first_page_yields_nothing() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>login</html>"))
            .mount(&server)
            .await;

        let client = test_client(endpoint(&server));
        assert!(client.fetch_all_sales("ls-1").await.is_empty());
        assert!(matches!(
            client.fetch_page("ls-1", None).await,
            Err(ShopError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_delay_only_between_pages() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(body_partial_json(json!({"variables": {"after": null}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(shop_page_body(2, 1_000, Some("c1"))))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(body_partial_json(json!({"variables": {"after": "c1"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(shop_page_body(1, 1_000, None)))
            .mount(&server)
            .await;

        let client = ShopClient::new(&ShopConfig {
            endpoint: endpoint(&server),
            page_size: 50,
            page_delay_ms: 300,
            session_cookie: String::new(),
        });

        let started = std::time::Instant::now();
        let sales = client.fetch_all_sales("ls-1").await;
        let elapsed = started.elapsed();

        assert_eq!(sales.len(), 3);
        // Two pages, one pause.
        assert!(elapsed >= Duration::from_millis(300), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(600), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_soft() {
        // Nothing listens on port 9 (discard) on a test host.
        let client = test_client("http://127.0.0.1:9/graphql".to_string());
        assert!(client.fetch_all_sales("ls-1").await.is_empty());
    }

    #[test]
    fn test_decode_graphql_errors() {
        let body = r#"{"data": null, "errors": [{"message": "not found"}]}"#;
        match decode_page(body) {
            Err(ShopError::GraphQl(msg)) => assert_eq!(msg, "not found"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_decode_next_page_without_cursor() {
        let body = json!({
            "data": {"liveStream": {"shop": {
                "pageInfo": {"hasNextPage": true, "endCursor": null},
                "edges": []
            }}}
        })
        .to_string();
        assert!(matches!(decode_page(&body), Err(ShopError::Malformed(_))));
    }

    #[test]
    fn test_sale_price_in_major_units() {
        let sale = SaleRecord {
            price_amount_minor_units: 1_234,
            currency: "USD".to_string(),
        };
        assert_eq!(sale.price(), Decimal::new(1234, 2));
    }
}
