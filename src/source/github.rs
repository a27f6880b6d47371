use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::SourceProvider;
use crate::config::GithubConfig;
use crate::models::{RepoMetadata, SourceRepo};

/// Media type that wraps each repository with the time it was starred.
const STAR_MEDIA_TYPE: &str = "application/vnd.github.star+json";

/// Safety stop for pagination; 1000 pages of 100 is far beyond any account.
const MAX_PAGES: usize = 1000;

/// Lists the authenticated user's stars through the GitHub REST API.
pub struct GithubStarSource {
    client: reqwest::Client,
    config: GithubConfig,
}

impl GithubStarSource {
    pub fn new(config: GithubConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    async fn fetch_page(&self, page: usize) -> Result<Vec<StarEntry>> {
        let url = format!(
            "{}/user/starred",
            self.config.api_url.trim_end_matches('/')
        );
        let mut req = self
            .client
            .get(&url)
            .query(&[("per_page", self.config.per_page), ("page", page)])
            .header("Accept", STAR_MEDIA_TYPE)
            .header("User-Agent", concat!("star-search/", env!("CARGO_PKG_VERSION")));
        if let Some(token) = &self.config.token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }

        let resp = req
            .send()
            .await
            .context("Failed to call GitHub starred API")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("GitHub starred API returned {status}: {body}");
        }

        resp.json()
            .await
            .with_context(|| format!("Failed to parse starred page {page}"))
    }
}

#[async_trait]
impl SourceProvider for GithubStarSource {
    async fn snapshot(&self) -> Result<Vec<SourceRepo>> {
        let per_page = self.config.per_page.max(1);
        let mut repos = Vec::new();

        for page in 1..=MAX_PAGES {
            let entries = self.fetch_page(page).await?;
            let count = entries.len();
            repos.extend(entries.into_iter().map(StarEntry::into_source_repo));
            tracing::debug!("Fetched starred page {page} ({count} repositories)");
            if count < per_page {
                return Ok(repos);
            }
        }

        anyhow::bail!("GitHub starred listing exceeded {MAX_PAGES} pages")
    }
}

/// One element of the starred listing, with or without the star wrapper.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StarEntry {
    Starred {
        starred_at: Option<DateTime<Utc>>,
        repo: GithubRepo,
    },
    Plain(GithubRepo),
}

impl StarEntry {
    fn into_source_repo(self) -> SourceRepo {
        match self {
            StarEntry::Starred { starred_at, repo } => repo.into_source_repo(starred_at),
            StarEntry::Plain(repo) => repo.into_source_repo(None),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GithubRepo {
    id: u64,
    full_name: String,
    html_url: String,
    description: Option<String>,
    homepage: Option<String>,
    language: Option<String>,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    stargazers_count: u64,
    updated_at: Option<String>,
}

impl GithubRepo {
    fn into_source_repo(self, starred_at: Option<DateTime<Utc>>) -> SourceRepo {
        SourceRepo {
            id: self.full_name,
            metadata: RepoMetadata {
                github_id: Some(self.id),
                html_url: self.html_url,
                homepage: self.homepage.filter(|h| !h.is_empty()),
                description: self.description,
                topics: self.topics,
                language: self.language,
                stargazers_count: self.stargazers_count,
                starred_at,
                updated_at: self.updated_at,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STARRED_PAGE: &str = r#"[
        {
            "starred_at": "2024-03-01T12:00:00Z",
            "repo": {
                "id": 1300192,
                "full_name": "tokio-rs/tokio",
                "name": "tokio",
                "owner": {"login": "tokio-rs"},
                "html_url": "https://github.com/tokio-rs/tokio",
                "description": "A runtime for writing reliable asynchronous applications with Rust.",
                "homepage": "https://tokio.rs",
                "language": "Rust",
                "topics": ["async", "rust"],
                "stargazers_count": 27000,
                "updated_at": "2024-03-02T00:00:00Z"
            }
        }
    ]"#;

    #[test]
    fn test_parse_star_wrapped_entry() {
        let entries: Vec<StarEntry> = serde_json::from_str(STARRED_PAGE).unwrap();
        let repo = entries.into_iter().next().unwrap().into_source_repo();

        assert_eq!(repo.id, "tokio-rs/tokio");
        assert_eq!(repo.metadata.github_id, Some(1300192));
        assert_eq!(repo.metadata.topics, vec!["async", "rust"]);
        assert_eq!(repo.metadata.language.as_deref(), Some("Rust"));
        assert_eq!(
            repo.metadata.starred_at.map(|t| t.to_rfc3339()),
            Some("2024-03-01T12:00:00+00:00".to_string())
        );
    }

    #[test]
    fn test_parse_plain_entry_with_missing_fields() {
        let json = r#"[{
            "id": 7,
            "full_name": "someone/tool",
            "html_url": "https://github.com/someone/tool",
            "description": null,
            "homepage": "",
            "language": null
        }]"#;
        let entries: Vec<StarEntry> = serde_json::from_str(json).unwrap();
        let repo = entries.into_iter().next().unwrap().into_source_repo();

        assert_eq!(repo.id, "someone/tool");
        assert!(repo.metadata.topics.is_empty());
        assert_eq!(repo.metadata.homepage, None);
        assert_eq!(repo.metadata.starred_at, None);
        assert_eq!(repo.search_text(), "someone/tool");
    }

    #[tokio::test]
    async fn test_unreachable_api_is_an_error() {
        let source = GithubStarSource::new(GithubConfig {
            api_url: "http://127.0.0.1:1".to_string(),
            token: None,
            per_page: 100,
        });
        assert!(source.snapshot().await.is_err());
    }
}
