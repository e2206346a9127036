use crate::automation::models::{Candidate, SourceCursor};
use crate::automation::traits::{CandidateStream, SourceAdapter, SourceContext};
use crate::{Error, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// In-memory source with scripted failures.
///
/// With positions enabled, candidate `i` carries cursor `i + 1` and a run
/// resumed from cursor `n` starts at candidate `n`.
#[derive(Clone)]
pub struct StaticSource {
    id: String,
    candidates: Arc<Vec<Candidate>>,
    fail_on_open: bool,
    fail_after: Option<usize>,
    item_delay: Option<Duration>,
    positions: bool,
    opened: Arc<AtomicUsize>,
    contexts: Arc<Mutex<Vec<SourceContext>>>,
}

impl StaticSource {
    pub fn new(candidates: Vec<Candidate>) -> Self {
        Self {
            id: "static".to_string(),
            candidates: Arc::new(candidates),
            fail_on_open: false,
            fail_after: None,
            item_delay: None,
            positions: false,
            opened: Arc::new(AtomicUsize::new(0)),
            contexts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// `open` fails before yielding anything.
    pub fn failing_on_open(mut self) -> Self {
        self.fail_on_open = true;
        self
    }

    /// Yield `n` candidates, then an error.
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Sleep before each candidate. Used to exercise cancellation and timeouts.
    pub fn with_item_delay(mut self, delay: Duration) -> Self {
        self.item_delay = Some(delay);
        self
    }

    pub fn with_positions(mut self) -> Self {
        self.positions = true;
        self
    }

    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Contexts passed to `open`, oldest first.
    pub async fn contexts(&self) -> Vec<SourceContext> {
        self.contexts.lock().await.clone()
    }

    fn resume_offset(&self, ctx: &SourceContext) -> usize {
        if !self.positions {
            return 0;
        }
        ctx.cursor
            .as_ref()
            .and_then(|c| c.value.as_u64())
            .map(|n| n as usize)
            .unwrap_or(0)
    }
}

#[async_trait]
impl SourceAdapter for StaticSource {
    fn id(&self) -> &str {
        &self.id
    }

    #[tracing::instrument(level = "debug", skip_all, fields(source = %self.id))]
    async fn open(&self, ctx: &SourceContext) -> Result<CandidateStream> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.contexts.lock().await.push(ctx.clone());
        if self.fail_on_open {
            return Err(Error::SourceUnavailable(format!(
                "source '{}' refused to open",
                self.id
            )));
        }

        let offset = self.resume_offset(ctx);
        let mut items: Vec<Result<Candidate>> = Vec::new();
        for (i, candidate) in self.candidates.iter().enumerate().skip(offset) {
            let mut candidate = candidate.clone();
            if self.positions {
                candidate.cursor = Some(SourceCursor::new(serde_json::json!(i + 1)));
            }
            items.push(Ok(candidate));
        }
        if let Some(n) = self.fail_after {
            items.truncate(n);
            items.push(Err(Error::Source(format!(
                "source '{}' failed after {} items",
                self.id,
                items.len()
            ))));
        }

        let stream = futures_util::stream::iter(items);
        match self.item_delay {
            Some(delay) => Ok(Box::pin(stream.then(move |item| async move {
                tokio::time::sleep(delay).await;
                item
            }))),
            None => Ok(Box::pin(stream)),
        }
    }

    async fn metadata(&self, _ctx: &SourceContext) -> Option<serde_json::Value> {
        Some(serde_json::json!({ "candidates": self.candidates.len() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::models::RunTrigger;
    use uuid::Uuid;

    fn ctx(cursor: Option<u64>) -> SourceContext {
        SourceContext {
            tenant_id: None,
            run_id: Uuid::new_v4(),
            trigger: RunTrigger::Manual,
            cursor: cursor.map(|c| SourceCursor::new(serde_json::json!(c))),
        }
    }

    fn candidates(n: usize) -> Vec<Candidate> {
        (0..n)
            .map(|i| Candidate::from_json(format!("k{i}"), serde_json::json!({ "n": i })))
            .collect()
    }

    #[tokio::test]
    async fn yields_then_fails_after_n() {
        let source = StaticSource::new(candidates(5)).failing_after(3);
        let items: Vec<Result<Candidate>> = source.open(&ctx(None)).await.unwrap().collect().await;
        assert_eq!(items.len(), 4);
        assert!(items[..3].iter().all(|i| i.is_ok()));
        assert!(matches!(items[3], Err(Error::Source(_))));
    }

    #[tokio::test]
    async fn resumes_from_position() {
        let source = StaticSource::new(candidates(5)).with_positions();
        let items: Vec<Result<Candidate>> =
            source.open(&ctx(Some(3))).await.unwrap().collect().await;
        let keys: Vec<String> = items.into_iter().map(|i| i.unwrap().key).collect();
        assert_eq!(keys, vec!["k3", "k4"]);
        assert_eq!(source.open_count(), 1);
    }
}
