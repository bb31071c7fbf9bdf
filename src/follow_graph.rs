use serde::Deserialize;
use tracing::{error, warn};

use crate::config::{FOLLOWS_MAX_PAGES, FOLLOWS_PAGE_LIMIT};

#[derive(Debug, Clone, Deserialize)]
pub struct FollowEntry {
    pub did: String,
    pub handle: String,
}

#[derive(Debug, Deserialize)]
struct GetFollowsResponse {
    follows: Vec<FollowEntry>,
    cursor: Option<String>,
}

/// Walk app.bsky.graph.getFollows for one actor, 100 entries per page,
/// capped at 100 pages. A mid-walk failure logs and returns the pages
/// fetched so far.
pub async fn fetch_all_follows(
    client: &reqwest::Client,
    appview_url: &str,
    actor: &str,
) -> Vec<FollowEntry> {
    let base = appview_url.trim_end_matches('/');
    let mut follows = Vec::new();
    let mut cursor: Option<String> = None;

    for _page in 0..FOLLOWS_MAX_PAGES {
        let mut url = match url::Url::parse(&format!("{base}/xrpc/app.bsky.graph.getFollows")) {
            Ok(url) => url,
            Err(e) => {
                error!("invalid appview url: {e}");
                return follows;
            }
        };
        url.query_pairs_mut()
            .append_pair("actor", actor)
            .append_pair("limit", &FOLLOWS_PAGE_LIMIT.to_string());
        if let Some(ref c) = cursor {
            url.query_pairs_mut().append_pair("cursor", c);
        }

        let response = match client.get(url.as_str()).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("getFollows fetch failed for {actor}: {e}");
                return follows;
            }
        };

        if !response.status().is_success() {
            warn!("getFollows returned {} for {actor}", response.status());
            return follows;
        }

        let page: GetFollowsResponse = match response.json().await {
            Ok(page) => page,
            Err(e) => {
                warn!("getFollows page decode failed for {actor}: {e}");
                return follows;
            }
        };

        follows.extend(page.follows);

        match page.cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    follows
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_parsing() {
        let data = "{\"follows\":[{\"did\":\"did:plc:a\",\"handle\":\"a.test\",\"displayName\":\"A\"},{\"did\":\"did:plc:b\",\"handle\":\"b.test\"}],\"cursor\":\"3kwrdj3olqr2t\"}";
        let response: GetFollowsResponse = serde_json::from_str(data).unwrap();
        assert_eq!(response.follows.len(), 2);
        assert_eq!(response.follows[0].did, "did:plc:a");
        assert_eq!(response.follows[1].handle, "b.test");
        assert_eq!(response.cursor, Some("3kwrdj3olqr2t".to_string()));
    }

    #[test]
    fn test_response_parsing_last_page() {
        let data = "{\"follows\":[]}";
        let response: GetFollowsResponse = serde_json::from_str(data).unwrap();
        assert!(response.follows.is_empty());
        assert_eq!(response.cursor, None);
    }
}
