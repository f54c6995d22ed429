//! GraphQL documents and wire types for the repository API
//!
//! Response types are deliberately loose (nearly every field optional) so a
//! partially populated node becomes a warning instead of a decode failure.

use crate::storage::Repository;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Search query used by the discover strategy
pub const SEARCH_QUERY: &str = r#"
query($q: String!, $first: Int!, $after: String) {
  rateLimit { limit cost remaining resetAt }
  search(query: $q, type: REPOSITORY, first: $first, after: $after) {
    pageInfo { hasNextPage endCursor }
    nodes {
      ... on Repository {
        id
        databaseId
        name
        owner { login }
        url
        description
        updatedAt
        stargazerCount
        primaryLanguage { name }
      }
    }
  }
}
"#;

/// Lookup by node id used by the refresh strategy
pub const NODES_QUERY: &str = r#"
query($ids: [ID!]!) {
  rateLimit { limit cost remaining resetAt }
  nodes(ids: $ids) {
    ... on Repository {
      id
      databaseId
      name
      owner { login }
      url
      description
      updatedAt
      stargazerCount
      primaryLanguage { name }
    }
  }
}
"#;

/// One logical page request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageRequest {
    /// A page of search results after `after`
    Search {
        query: String,
        first: u32,
        after: Option<String>,
    },

    /// A fixed set of repositories addressed by node id
    Nodes { ids: Vec<String> },
}

impl PageRequest {
    /// Builds the JSON body posted to the endpoint
    pub fn to_body(&self) -> GraphQlRequest {
        match self {
            PageRequest::Search {
                query,
                first,
                after,
            } => GraphQlRequest {
                query: SEARCH_QUERY,
                variables: json!({ "q": query, "first": first, "after": after }),
            },
            PageRequest::Nodes { ids } => GraphQlRequest {
                query: NODES_QUERY,
                variables: json!({ "ids": ids }),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphQlRequest {
    pub query: &'static str,
    pub variables: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct GraphQlResponse {
    pub data: Option<ResponseData>,
    #[serde(default)]
    pub errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseData {
    pub rate_limit: Option<RateLimitInfo>,
    pub search: Option<SearchConnection>,
    pub nodes: Option<Vec<Option<RepositoryNode>>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitInfo {
    pub limit: Option<u32>,
    pub cost: Option<u32>,
    pub remaining: u32,
    pub reset_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchConnection {
    pub page_info: PageInfo,
    #[serde(default)]
    pub nodes: Vec<Option<RepositoryNode>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub has_next_page: bool,
    pub end_cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphQlError {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

impl GraphQlError {
    pub fn is_rate_limited(&self) -> bool {
        self.kind.as_deref() == Some("RATE_LIMITED")
            || self.message.to_ascii_lowercase().contains("rate limit")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryNode {
    pub id: Option<String>,
    pub database_id: Option<i64>,
    pub name: Option<String>,
    pub owner: Option<OwnerNode>,
    pub url: Option<String>,
    pub description: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub stargazer_count: Option<u32>,
    pub primary_language: Option<LanguageNode>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OwnerNode {
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LanguageNode {
    pub name: String,
}

impl RepositoryNode {
    /// Converts the node into a repository
    ///
    /// Returns None when any identity field (node id, database id, owner,
    /// name) is absent.
    pub fn into_repository(self) -> Option<Repository> {
        Some(Repository {
            repo_id: self.database_id?,
            node_id: self.id?,
            owner: self.owner?.login,
            name: self.name?,
            url: self.url,
            description: self.description,
            language: self.primary_language.map(|l| l.name),
            stars: self.stargazer_count.unwrap_or(0),
            remote_updated_at: self.updated_at,
        })
    }
}
