use crate::client::ApiClient;
use crate::error::{ApiError, Result};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Link {
    pub rel: String,
    pub uri: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Pagination {
    #[serde(default)]
    pub offset: u64,
    pub max: u64,
    pub size: u64,
    #[serde(default)]
    pub links: Vec<Link>,
}

/// One page of a listing endpoint.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub pagination: Option<Pagination>,
}

impl<T: DeserializeOwned> Page<T> {
    pub fn from_value(mut value: Value) -> Result<Self> {
        let data = value
            .get_mut("data")
            .map(Value::take)
            .ok_or_else(|| ApiError::ParseError("response has no data field".to_string()))?;
        let items: Vec<T> = serde_json::from_value(data)?;

        let pagination = match value.get_mut("pagination").map(Value::take) {
            Some(Value::Null) | None => None,
            Some(raw) => Some(serde_json::from_value(raw)?),
        };

        Ok(Self { items, pagination })
    }
}

impl<T> Page<T> {
    /// A page is full when it holds as many items as the server allows.
    pub fn is_full(&self) -> bool {
        self.pagination.as_ref().is_some_and(|p| p.size == p.max)
    }

    pub fn next_link(&self) -> Option<&str> {
        self.pagination
            .as_ref()?
            .links
            .iter()
            .find(|link| link.rel == "next")
            .map(|link| link.uri.as_str())
    }
}

/// Collect every item of a paginated listing.
///
/// The next link is followed only while pages come back full, so a short
/// page ends the walk even if the server still advertises a next link.
/// A later page the server refuses (the offset cap on large run listings
/// answers 400) ends the walk with the items read so far; only a refused
/// first page is an error.
pub async fn fetch_all<T: DeserializeOwned>(client: &ApiClient, uri: &str) -> Result<Vec<T>> {
    let mut items = Vec::new();
    let mut next = Some(uri.to_string());
    let mut pages = 0usize;

    while let Some(current) = next.take() {
        let body = match client.request(&current).await {
            Ok(body) => body,
            Err(e) if pages > 0 && e.is_not_found() => {
                warn!(uri, page = %current, items = items.len(), "later page refused, keeping earlier pages");
                break;
            }
            Err(e) => return Err(e),
        };
        let page: Page<T> = Page::from_value(body)?;
        pages += 1;

        if page.is_full() {
            next = page.next_link().map(str::to_string);
        }
        items.extend(page.items);
    }

    debug!(uri, pages, items = items.len(), "listing complete");
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    #[derive(Debug, Deserialize)]
    struct Item {
        id: String,
    }

    fn page_body(ids: &[&str], max: u64, next: Option<String>) -> Value {
        let links: Vec<Value> = next
            .into_iter()
            .map(|uri| json!({"rel": "next", "uri": uri}))
            .collect();
        json!({
            "data": ids.iter().map(|id| json!({"id": id})).collect::<Vec<_>>(),
            "pagination": {"offset": 0, "max": max, "size": ids.len(), "links": links}
        })
    }

    #[test]
    fn test_page_without_pagination_block() {
        let page: Page<Item> = Page::from_value(json!({"data": [{"id": "a"}]})).unwrap();
        assert_eq!(page.items.len(), 1);
        assert!(!page.is_full());
        assert!(page.next_link().is_none());
    }

    #[test]
    fn test_next_link_ignores_prev() {
        let value = json!({
            "data": [{"id": "a"}],
            "pagination": {"max": 1, "size": 1, "links": [
                {"rel": "prev", "uri": "https://example.com/p0"},
                {"rel": "next", "uri": "https://example.com/p2"}
            ]}
        });
        let page: Page<Item> = Page::from_value(value).unwrap();
        assert!(page.is_full());
        assert_eq!(page.next_link(), Some("https://example.com/p2"));
    }

    #[tokio::test]
    async fn test_fetch_all_follows_full_pages() {
        let mock_server = MockServer::start().await;
        let base = mock_server.uri();

        Mock::given(method("GET"))
            .and(path("/items"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_body(
                &["a", "b"],
                2,
                Some(format!("{}/items/p2", base)),
            )))
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/items/p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_body(
                &["c", "d"],
                2,
                Some(format!("{}/items/p3", base)),
            )))
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/items/p3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_body(&["e"], 2, None)))
            .mount(&mock_server)
            .await;

        let client = ApiClient::new(&base).unwrap();
        let items: Vec<Item> = fetch_all(&client, "items").await.unwrap();

        let ids: Vec<_> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d", "e"]);
    }

    #[tokio::test]
    async fn test_short_page_stops_even_with_next_link() {
        let mock_server = MockServer::start().await;
        let base = mock_server.uri();

        Mock::given(method("GET"))
            .and(path("/items"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_body(
                &["a"],
                2,
                Some(format!("{}/items/p2", base)),
            )))
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/items/p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_body(&["b"], 2, None)))
            .expect(0)
            .mount(&mock_server)
            .await;

        let client = ApiClient::new(&base).unwrap();
        let items: Vec<Item> = fetch_all(&client, "items").await.unwrap();
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn test_refused_later_page_keeps_earlier_items() {
        let mock_server = MockServer::start().await;
        let base = mock_server.uri();

        Mock::given(method("GET"))
            .and(path("/items"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_body(
                &["a", "b"],
                2,
                Some(format!("{}/items/p2", base)),
            )))
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/items/p2"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({"status": 400})))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = ApiClient::new(&base).unwrap();
        let items: Vec<Item> = fetch_all(&client, "items").await.unwrap();
        let ids: Vec<_> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_refused_first_page_is_not_found() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/items"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"status": 404})))
            .mount(&mock_server)
            .await;

        let client = ApiClient::new(&mock_server.uri()).unwrap();
        let result: Result<Vec<Item>> = fetch_all(&client, "items").await;
        assert!(result.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_full_page_without_next_link_stops() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/items"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_body(&["a", "b"], 2, None)))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = ApiClient::new(&mock_server.uri()).unwrap();
        let items: Vec<Item> = fetch_all(&client, "items").await.unwrap();
        assert_eq!(items.len(), 2);
    }
}
