// crates/progress-client/src/api.rs
//! Read side of the todo-list REST API.

use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use todo_progress_core::{ListId, TodoItem, TodoList};

use crate::error::ApiError;

/// Fetches list summaries and list items.
#[derive(Debug, Clone)]
pub struct TodoApi {
    http: Client,
    base_url: String,
}

impl TodoApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// `GET /todolists`
    pub async fn lists(&self) -> Result<Vec<TodoList>, ApiError> {
        let url = format!("{}/todolists", self.base_url);
        self.get_json(url, None).await
    }

    /// `GET /todolists/{id}/todos`
    pub async fn items(&self, list_id: ListId) -> Result<Vec<TodoItem>, ApiError> {
        let url = format!("{}/todolists/{list_id}/todos", self.base_url);
        self.get_json(url, Some(list_id)).await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: String,
        list_id: Option<ListId>,
    ) -> Result<T, ApiError> {
        debug!(%url, "GET");
        let response = match self.http.get(&url).send().await {
            Ok(response) => response,
            Err(source) => return Err(ApiError::Request { url, source }),
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            if let Some(list_id) = list_id {
                return Err(ApiError::ListNotFound(list_id));
            }
        }
        if !status.is_success() {
            return Err(ApiError::Status {
                url,
                status: status.as_u16(),
            });
        }

        match response.json().await {
            Ok(body) => Ok(body),
            Err(source) => Err(ApiError::Request { url, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_lists() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/todolists"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 1, "name": "Groceries", "incompleteItemCount": 3},
                {"id": 42, "name": "Chores", "incompleteItemCount": 0}
            ])))
            .mount(&server)
            .await;

        let api = TodoApi::new(format!("{}/api/", server.uri()));
        let lists = api.lists().await.unwrap();
        assert_eq!(
            lists,
            vec![
                TodoList {
                    id: 1,
                    name: "Groceries".into(),
                    incomplete_item_count: 3
                },
                TodoList {
                    id: 42,
                    name: "Chores".into(),
                    incomplete_item_count: 0
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_items_of_missing_list() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/todolists/7/todos"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let api = TodoApi::new(format!("{}/api", server.uri()));
        assert!(matches!(api.items(7).await, Err(ApiError::ListNotFound(7))));
    }

    #[tokio::test]
    async fn test_server_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/todolists"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let api = TodoApi::new(format!("{}/api", server.uri()));
        match api.lists().await {
            Err(ApiError::Status { status, .. }) => assert_eq!(status, 503),
            other => panic!("expected status error, got {other:?}"),
        }
    }
}
