//! Keyset pagination over query results.
//!
//! Pages are requested as `Id > cursor ORDER BY Id ASC LIMIT page_size` and
//! the scan ends at the first empty page. Offsets are never used, so rows
//! inserted mid-scan cannot shift page boundaries.

use crate::connection::Connection;
use crate::error::Result;
use crate::query::{Filter, Query};
use crate::record::{ID_FIELD, Record};
use futures::Stream;
use std::collections::VecDeque;
use tracing::{trace, warn};

/// Lazy, resumable scan over every row matching a query.
///
/// A paginator is single-use. To resume an interrupted scan, start a new one
/// with [`Paginator::resume_after`] and the last identity that was consumed.
pub struct Paginator<'a> {
    connection: &'a Connection,
    base: Query,
    page_size: usize,
    cursor: Option<String>,
    buffer: VecDeque<Record>,
    exhausted: bool,
    live: bool,
    pages: usize,
}

impl<'a> Paginator<'a> {
    /// Scan `query` from the beginning. Any order-by or limit on the query is
    /// replaced by the keyset ordering.
    pub fn new(connection: &'a Connection, query: Query, page_size: usize) -> Self {
        let mut fields = query.fields.clone();
        if !fields.iter().any(|f| f == ID_FIELD) {
            fields.insert(0, ID_FIELD.to_string());
        }
        Self {
            connection,
            base: Query {
                fields,
                order_by: None,
                limit: None,
                ..query
            },
            page_size: page_size.max(1),
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
            live: false,
            pages: 0,
        }
    }

    /// Start after `cursor` instead of at the beginning.
    pub fn resume_after(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    /// Bypass query memoization.
    pub fn live(mut self) -> Self {
        self.live = true;
        self
    }

    /// Identity of the last row handed out.
    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    /// Pages fetched so far.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Next row, fetching a page when the buffer runs dry.
    pub async fn next(&mut self) -> Result<Option<Record>> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                let Some(id) = record.id().map(str::to_string) else {
                    warn!(object = %self.base.object, "row without identity skipped");
                    continue;
                };
                if let Some(ref cursor) = self.cursor {
                    if id.as_str() <= cursor.as_str() {
                        warn!(object = %self.base.object, id, cursor, "out-of-order row skipped");
                        continue;
                    }
                }
                self.cursor = Some(id);
                return Ok(Some(record));
            }
            if self.exhausted {
                return Ok(None);
            }
            self.fetch_page().await?;
        }
    }

    async fn fetch_page(&mut self) -> Result<()> {
        let mut query = self.base.clone().order_by(ID_FIELD).limit(self.page_size);
        if let Some(ref cursor) = self.cursor {
            query = query.filter(Filter::GreaterThan(ID_FIELD.to_string(), cursor.clone()));
        }

        let result = if self.live {
            self.connection.query_live(&query).await?
        } else {
            self.connection.query(&query).await?
        };
        self.pages += 1;
        trace!(
            object = %self.base.object,
            page = self.pages,
            rows = result.records.len(),
            "page fetched"
        );

        if result.is_empty() {
            self.exhausted = true;
        } else {
            self.connection.metrics().record_read(result.records.len() as u64);
            self.buffer.extend(result.records);
        }
        Ok(())
    }

    /// Drain every remaining row.
    pub async fn collect_all(mut self) -> Result<Vec<Record>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Adapt into a `Stream` of rows.
    pub fn into_stream(self) -> impl Stream<Item = Result<Record>> + 'a {
        futures::stream::try_unfold(self, |mut pager| async move {
            let row = pager.next().await?;
            Ok::<_, crate::error::Error>(row.map(|row| (row, pager)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NoopCache;
    use crate::config::{ConcurrencyConfig, RetryConfig};
    use crate::governor::GovernorSet;
    use crate::metrics::Metrics;
    use crate::schema::{FieldDescriptor, FieldType, ObjectDescriptor};
    use crate::store::MemoryStore;
    use futures::TryStreamExt;
    use std::sync::Arc;

    async fn connection(ids: &[&str]) -> (Connection, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new("00DSRC"));
        store.add_object(ObjectDescriptor::new(
            "Contact",
            vec![
                FieldDescriptor::read_only("Id", FieldType::Id),
                FieldDescriptor::new("LastName", FieldType::String),
            ],
        ));
        for id in ids {
            store
                .insert("Contact", Record::from_pairs([("Id", *id), ("LastName", "x")]))
                .unwrap();
        }
        let metrics = Arc::new(Metrics::new());
        let governors = GovernorSet::new(
            &ConcurrencyConfig::default(),
            &RetryConfig::default(),
            metrics.clone(),
        );
        let conn = Connection::open("source", store.clone(), Arc::new(NoopCache), governors, metrics, false)
            .await
            .unwrap();
        (conn, store)
    }

    fn ids(rows: &[Record]) -> Vec<String> {
        rows.iter().filter_map(|r| r.id().map(str::to_string)).collect()
    }

    #[tokio::test]
    async fn test_pages_cover_every_row_in_order() {
        let (conn, store) = connection(&["005", "001", "004", "002", "003"]).await;
        let query = Query::select("Contact").fields(["LastName"]);
        let rows = Paginator::new(&conn, query, 2).collect_all().await.unwrap();

        assert_eq!(ids(&rows), ["001", "002", "003", "004", "005"]);
        // three full/partial pages plus the terminating empty one
        assert_eq!(store.query_calls(), 4);
    }

    #[tokio::test]
    async fn test_resume_after_cursor() {
        let (conn, _) = connection(&["001", "002", "003"]).await;
        let query = Query::select("Contact").fields(["LastName"]);
        let rows = Paginator::new(&conn, query, 10)
            .resume_after("001")
            .collect_all()
            .await
            .unwrap();
        assert_eq!(ids(&rows), ["002", "003"]);
    }

    #[tokio::test]
    async fn test_empty_object_terminates() {
        let (conn, _) = connection(&[]).await;
        let mut pager = Paginator::new(&conn, Query::select("Contact"), 10);
        assert!(pager.next().await.unwrap().is_none());
        assert!(pager.next().await.unwrap().is_none());
        assert_eq!(pager.pages(), 1);
    }

    #[tokio::test]
    async fn test_stream_adapter() {
        let (conn, _) = connection(&["001", "002", "003"]).await;
        let rows: Vec<Record> = Paginator::new(&conn, Query::select("Contact"), 2)
            .into_stream()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
    }
}
