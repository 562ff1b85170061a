use reqwest::{Client, Method, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use thiserror::Error;
use url::Url;

/// Client for the Helix endpoints the notification engine needs.
#[derive(Clone)]
pub struct HelixClient {
    http: Client,
    base_url: Url,
    client_id: String,
}

impl HelixClient {
    /// Creates a new Helix client with the provided configuration.
    pub fn new(client_id: impl Into<String>, base_url: Url, http: Client) -> Self {
        Self {
            http,
            base_url,
            client_id: client_id.into(),
        }
    }

    /// Fetches the live stream for a broadcaster, if any.
    ///
    /// `None` means Helix reports no live stream, which the dispatcher
    /// treats as "already offline before the snapshot fetch completed".
    pub async fn get_stream(
        &self,
        access_token: &str,
        broadcaster_id: &str,
    ) -> Result<Option<HelixStream>, HelixError> {
        let mut url = self.base_url.join("streams")?;
        url.query_pairs_mut()
            .append_pair("user_id", broadcaster_id)
            .append_pair("first", "1");

        let response = self
            .authorized_request(Method::GET, url, access_token)
            .send()
            .await?;

        let page: HelixStreamListResponse = parse_json(response).await?;
        Ok(page.data.into_iter().next())
    }

    fn authorized_request(
        &self,
        method: Method,
        url: Url,
        access_token: &str,
    ) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("Client-Id", &self.client_id)
            .header("Authorization", format!("Bearer {access_token}"))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct HelixStreamListResponse {
    data: Vec<HelixStream>,
}

/// A live stream entry returned by `GET streams`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct HelixStream {
    pub id: String,
    pub user_id: String,
    pub user_login: String,
    pub user_name: String,
    pub game_name: String,
    pub title: String,
    pub viewer_count: u64,
    pub thumbnail_url: String,
}

/// Errors produced by the Helix client.
#[derive(Debug, Error)]
pub enum HelixError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

async fn parse_json<T>(response: Response) -> Result<T, HelixError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(HelixError::Status { status, body });
    }

    Ok(response.json().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn client(base_url: &Url) -> HelixClient {
        HelixClient::new(
            "client-id",
            base_url.clone(),
            Client::builder().build().expect("client"),
        )
    }

    #[tokio::test]
    async fn get_stream_parses_live_entry() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/helix/")).expect("url");
        let client = client(&base);

        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/helix/streams")
                    .query_param("user_id", "1337")
                    .query_param("first", "1")
                    .header("Authorization", "Bearer token")
                    .header("Client-Id", "client-id");
                then.status(200).json_body(json!({
                    "data": [
                        {
                            "id": "9001",
                            "user_id": "1337",
                            "user_login": "nova",
                            "user_name": "Nova",
                            "game_id": "42",
                            "game_name": "Celeste",
                            "type": "live",
                            "title": "Speedrun Sunday",
                            "viewer_count": 312,
                            "started_at": "2024-05-01T18:00:00Z",
                            "thumbnail_url": "https://cdn.example/nova-{width}x{height}.jpg"
                        }
                    ],
                    "pagination": {}
                }));
            })
            .await;

        let stream = client
            .get_stream("token", "1337")
            .await
            .expect("get stream")
            .expect("live");
        mock.assert_async().await;

        assert_eq!(stream.title, "Speedrun Sunday");
        assert_eq!(stream.viewer_count, 312);
        assert!(stream.thumbnail_url.contains("{width}x{height}"));
    }

    #[tokio::test]
    async fn get_stream_returns_none_when_offline() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/helix/")).expect("url");
        let client = client(&base);

        server
            .mock_async(|when, then| {
                when.method(GET).path("/helix/streams");
                then.status(200)
                    .json_body(json!({ "data": [], "pagination": {} }));
            })
            .await;

        let stream = client.get_stream("token", "1337").await.expect("request");
        assert!(stream.is_none());
    }

    #[tokio::test]
    async fn error_status_returns_message() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/helix/")).expect("url");
        let client = client(&base);

        server
            .mock_async(|when, then| {
                when.method(GET).path("/helix/streams");
                then.status(401).body("unauthorized");
            })
            .await;

        let err = client
            .get_stream("token", "1337")
            .await
            .expect_err("should error");
        match err {
            HelixError::Status { status, body } => {
                assert_eq!(status, StatusCode::UNAUTHORIZED);
                assert_eq!(body, "unauthorized");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
