//! Paginated backend query walker
//!
//! Walks a backend volume query page by page. Pages are requested strictly
//! in sequence since each request carries the cursor returned by the
//! previous one.

use crate::domain::ports::{Cursor, QueryFilter, QueryResult, VolumeQueryClient};
use crate::error::{Error, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Upper bound on the number of pages a walk may take, given the latest
/// reported total. One page of slack covers a final partial page.
fn max_pages(total_records: u64, limit: u64) -> u64 {
    total_records.div_ceil(limit.max(1)) + 1
}

/// Retrieve every query result page matching the given volume ids and
/// cluster scope. An empty `volume_ids` queries all volumes.
///
/// A failing query aborts the walk with no partial result. A missing result
/// ends the walk with whatever was accumulated. A backend whose cursor stops
/// advancing, runs backwards or overruns its reported total fails with
/// [`Error::ProtocolViolation`].
pub async fn query_all(
    client: &dyn VolumeQueryClient,
    volume_ids: &[String],
    cluster_id: Option<&str>,
    limit: u64,
    cancel: &CancellationToken,
) -> Result<Vec<QueryResult>> {
    let mut filter = QueryFilter {
        volume_ids: volume_ids.to_vec(),
        cluster_ids: cluster_id.map(|id| vec![id.to_string()]).unwrap_or_default(),
        cursor: Cursor::first_page(limit),
    };

    let mut pages = Vec::new();
    let mut iterations: u64 = 0;

    loop {
        iterations += 1;
        debug!(
            offset = filter.cursor.offset,
            limit = filter.cursor.limit,
            "Query volumes"
        );

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = client.query(&filter) => result,
        };

        let page = match result {
            Ok(Some(page)) => page,
            Ok(None) => {
                info!("Observed empty query result");
                break;
            }
            Err(e) => {
                error!(?filter, "Failed to query volumes: {}", e);
                return Err(e);
            }
        };

        let returned = page.cursor;
        if returned.offset > returned.total_records {
            return Err(Error::ProtocolViolation(format!(
                "cursor offset {} exceeds total records {}",
                returned.offset, returned.total_records
            )));
        }
        if returned.offset < filter.cursor.offset {
            return Err(Error::ProtocolViolation(format!(
                "cursor offset moved backwards from {} to {}",
                filter.cursor.offset, returned.offset
            )));
        }

        pages.push(page);
        info!(
            "{} more volumes to be queried",
            returned.total_records - returned.offset
        );

        if returned.is_exhausted() {
            info!("Metadata retrieved for all requested volumes");
            break;
        }
        if returned.offset == filter.cursor.offset {
            return Err(Error::ProtocolViolation(format!(
                "cursor did not advance past offset {}",
                returned.offset
            )));
        }
        if iterations >= max_pages(returned.total_records, limit) {
            return Err(Error::ProtocolViolation(format!(
                "walk exceeded {} pages for {} records",
                iterations, returned.total_records
            )));
        }

        filter.cursor = returned;
    }

    Ok(pages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::VolumeRecord;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replays scripted responses and records every request cursor
    struct ScriptedClient {
        responses: Mutex<VecDeque<Result<Option<QueryResult>>>>,
        requests: Mutex<Vec<QueryFilter>>,
    }

    impl ScriptedClient {
        fn new(responses: Vec<Result<Option<QueryResult>>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn cursors(&self) -> Vec<(u64, u64)> {
            self.requests
                .lock()
                .iter()
                .map(|f| (f.cursor.offset, f.cursor.limit))
                .collect()
        }
    }

    #[async_trait]
    impl VolumeQueryClient for ScriptedClient {
        async fn query(&self, filter: &QueryFilter) -> Result<Option<QueryResult>> {
            self.requests.lock().push(filter.clone());
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(Error::Query("script exhausted".into())))
        }
    }

    fn page(offset: u64, limit: u64, total: u64, volumes: usize) -> Result<Option<QueryResult>> {
        Ok(Some(QueryResult {
            volumes: (0..volumes)
                .map(|i| VolumeRecord {
                    volume_id: format!("vol-{}-{}", offset, i),
                    entity_references: Vec::new(),
                })
                .collect(),
            cursor: Cursor {
                offset,
                limit,
                total_records: total,
            },
        }))
    }

    #[tokio::test]
    async fn test_walks_all_pages() {
        let client = ScriptedClient::new(vec![
            page(100, 100, 250, 100),
            page(200, 100, 250, 100),
            page(250, 100, 250, 50),
        ]);

        let pages = query_all(&client, &[], None, 100, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(pages.len(), 3);
        assert_eq!(client.cursors(), vec![(0, 100), (100, 100), (200, 100)]);
        let last = pages.last().unwrap().cursor;
        assert_eq!(last.offset, 250);
        assert_eq!(last.total_records, 250);
        let volumes: usize = pages.iter().map(|p| p.volumes.len()).sum();
        assert_eq!(volumes, 250);
    }

    #[tokio::test]
    async fn test_missing_result_returns_empty() {
        let client = ScriptedClient::new(vec![Ok(None)]);

        let pages = query_all(&client, &[], None, 100, &CancellationToken::new())
            .await
            .unwrap();
        assert!(pages.is_empty());
    }

    #[tokio::test]
    async fn test_missing_result_keeps_accumulated_pages() {
        let client = ScriptedClient::new(vec![page(100, 100, 300, 100), Ok(None)]);

        let pages = query_all(&client, &[], None, 100, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(pages.len(), 1);
    }

    #[tokio::test]
    async fn test_query_failure_aborts_walk() {
        let client = ScriptedClient::new(vec![
            page(100, 100, 250, 100),
            Err(Error::Query("connection reset".into())),
        ]);

        let result = query_all(&client, &[], None, 100, &CancellationToken::new()).await;
        assert_matches!(result, Err(Error::Query(_)));
    }

    #[tokio::test]
    async fn test_filter_carries_scope() {
        let client = ScriptedClient::new(vec![page(0, 100, 0, 0)]);
        let ids = vec!["vol-a".to_string(), "vol-b".to_string()];

        let pages = query_all(&client, &ids, Some("gc-1"), 100, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(pages.len(), 1);

        let requests = client.requests.lock();
        assert_eq!(requests[0].volume_ids, ids);
        assert_eq!(requests[0].cluster_ids, vec!["gc-1".to_string()]);
    }

    #[tokio::test]
    async fn test_stalled_cursor_is_a_protocol_violation() {
        let client = ScriptedClient::new(vec![page(100, 100, 250, 100), page(100, 100, 250, 0)]);

        let result = query_all(&client, &[], None, 100, &CancellationToken::new()).await;
        assert_matches!(result, Err(Error::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_overrun_cursor_is_a_protocol_violation() {
        let client = ScriptedClient::new(vec![page(300, 100, 250, 100)]);

        let result = query_all(&client, &[], None, 100, &CancellationToken::new()).await;
        assert_matches!(result, Err(Error::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_page_cap_is_enforced() {
        // Advances by one record per page while claiming a page size of 100
        let responses = (1..=10).map(|offset| page(offset, 100, 250, 1)).collect();
        let client = ScriptedClient::new(responses);

        let result = query_all(&client, &[], None, 100, &CancellationToken::new()).await;
        assert_matches!(result, Err(Error::ProtocolViolation(_)));
        assert_eq!(client.cursors().len() as u64, max_pages(250, 100));
    }

    #[tokio::test]
    async fn test_cancellation_aborts_walk() {
        let client = ScriptedClient::new(vec![page(100, 100, 250, 100)]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = query_all(&client, &[], None, 100, &cancel).await;
        assert_matches!(result, Err(Error::Cancelled));
        assert!(client.cursors().is_empty());
    }
}
