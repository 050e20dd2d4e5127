use std::collections::VecDeque;

use tracing::debug;

use super::{DateRange, PageSource, RawRecord, SessionHandle};
use crate::error::FetchError;

#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Stop (exclusive) at the first row carrying this transaction id.
    pub stop_at: Option<String>,
    pub max_pages: Option<u32>,
}

/// Lazy, one-shot cursor over the portal listing.
///
/// Pages are requested only when the buffered rows run out. After an error the
/// cursor stays on the failed page, so calling [`RawRecords::next`] again
/// retries that page instead of skipping it.
pub struct RawRecords<'a, S: PageSource + ?Sized> {
    source: &'a S,
    session: &'a SessionHandle,
    range: DateRange,
    options: FetchOptions,
    next_page: u32,
    buffer: VecDeque<RawRecord>,
    finished: bool,
}

pub fn fetch<'a, S>(
    source: &'a S,
    session: &'a SessionHandle,
    range: DateRange,
    options: FetchOptions,
) -> RawRecords<'a, S>
where
    S: PageSource + ?Sized,
{
    RawRecords {
        source,
        session,
        range,
        options,
        next_page: 1,
        buffer: VecDeque::new(),
        finished: false,
    }
}

impl<'a, S: PageSource + ?Sized> RawRecords<'a, S> {
    pub async fn next(&mut self) -> Option<Result<RawRecord, FetchError>> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                if self.is_stop_marker(&record) {
                    debug!(transaction_id = ?record.transaction_id(), "reached already loaded transaction");
                    self.finish();
                    return None;
                }
                return Some(Ok(record));
            }
            if self.finished {
                return None;
            }
            if let Some(max_pages) = self.options.max_pages {
                if self.pages_read() >= max_pages {
                    debug!(max_pages, "page limit reached");
                    self.finish();
                    return None;
                }
            }

            let page = self.next_page;
            match self.source.fetch_page(self.session, &self.range, page).await {
                Ok(records) if records.is_empty() => {
                    debug!(page, "empty page, listing exhausted");
                    self.finish();
                }
                Ok(records) => {
                    debug!(page, rows = records.len(), "fetched listing page");
                    self.next_page += 1;
                    self.buffer.extend(records);
                }
                Err(FetchError::NoData) => {
                    debug!(page, "portal reports no data");
                    self.finish();
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }

    pub fn pages_read(&self) -> u32 {
        self.next_page - 1
    }

    fn is_stop_marker(&self, record: &RawRecord) -> bool {
        match (&self.options.stop_at, record.transaction_id()) {
            (Some(stop), Some(id)) => *stop == id,
            _ => false,
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portal::SessionState;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Serves scripted responses in order, then empty pages.
    struct ScriptedPages {
        responses: Mutex<VecDeque<Result<Vec<RawRecord>, FetchError>>>,
        requested: Mutex<Vec<u32>>,
    }

    impl ScriptedPages {
        fn new(responses: Vec<Result<Vec<RawRecord>, FetchError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                requested: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PageSource for ScriptedPages {
        async fn fetch_page(
            &self,
            _session: &SessionHandle,
            _range: &DateRange,
            page: u32,
        ) -> Result<Vec<RawRecord>, FetchError> {
            self.requested.lock().unwrap().push(page);
            self.responses.lock().unwrap().pop_front().unwrap_or(Ok(Vec::new()))
        }
    }

    fn row(id: &str) -> RawRecord {
        RawRecord::new(format!("row {id}")).with_transaction_id(id)
    }

    fn session() -> SessionHandle {
        SessionHandle::restored(SessionState::new(Vec::new()))
    }

    async fn drain<S: PageSource>(records: &mut RawRecords<'_, S>) -> Vec<String> {
        let mut ids = Vec::new();
        while let Some(item) = records.next().await {
            ids.push(item.unwrap().transaction_id().unwrap());
        }
        ids
    }

    #[tokio::test]
    async fn test_reads_pages_until_empty() {
        let source = ScriptedPages::new(vec![Ok(vec![row("1"), row("2")]), Ok(vec![row("3")])]);
        let session = session();
        let mut records = fetch(&source, &session, DateRange::all(), FetchOptions::default());
        assert_eq!(drain(&mut records).await, vec!["1", "2", "3"]);
        assert_eq!(records.pages_read(), 2);
        assert!(records.next().await.is_none());
        assert_eq!(*source.requested.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_is_lazy() {
        let source = ScriptedPages::new(vec![Ok(vec![row("1")]), Ok(vec![row("2")])]);
        let session = session();
        let mut records = fetch(&source, &session, DateRange::all(), FetchOptions::default());
        assert!(source.requested.lock().unwrap().is_empty());
        records.next().await.unwrap().unwrap();
        assert_eq!(*source.requested.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_error_retries_same_page() {
        let source = ScriptedPages::new(vec![
            Ok(vec![row("1")]),
            Err(FetchError::PortalUnavailable("503".into())),
            Ok(vec![row("2")]),
        ]);
        let session = session();
        let mut records = fetch(&source, &session, DateRange::all(), FetchOptions::default());
        assert!(records.next().await.unwrap().is_ok());
        assert_eq!(
            records.next().await,
            Some(Err(FetchError::PortalUnavailable("503".into())))
        );
        assert_eq!(records.next().await.unwrap().unwrap().transaction_id().unwrap(), "2");
        assert_eq!(source.requested.lock().unwrap()[..3], [1, 2, 2]);
    }

    #[tokio::test]
    async fn test_stops_at_known_transaction() {
        let source = ScriptedPages::new(vec![
            Ok(vec![row("9"), row("8")]),
            Ok(vec![row("7"), row("6")]),
            Ok(vec![row("5")]),
        ]);
        let session = session();
        let options = FetchOptions {
            stop_at: Some("7".into()),
            max_pages: None,
        };
        let mut records = fetch(&source, &session, DateRange::all(), options);
        assert_eq!(drain(&mut records).await, vec!["9", "8"]);
        assert_eq!(*source.requested.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_no_data_is_empty_listing() {
        let source = ScriptedPages::new(vec![Err(FetchError::NoData)]);
        let session = session();
        let mut records = fetch(&source, &session, DateRange::all(), FetchOptions::default());
        assert!(records.next().await.is_none());
    }

    #[tokio::test]
    async fn test_max_pages() {
        let source = ScriptedPages::new(vec![Ok(vec![row("1")]), Ok(vec![row("2")])]);
        let session = session();
        let options = FetchOptions {
            stop_at: None,
            max_pages: Some(1),
        };
        let mut records = fetch(&source, &session, DateRange::all(), options);
        assert_eq!(drain(&mut records).await, vec!["1"]);
    }
}
