use crate::automation::models::{Candidate, SourceCursor};
use crate::automation::traits::{CandidateStream, SourceAdapter, SourceContext};
use crate::models::scope_key;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader, Split};

#[derive(Debug, Deserialize)]
struct LineRecord {
    key: String,
    #[serde(default)]
    attributes: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
enum Location {
    File(PathBuf),
    /// `<dir>/<scope key>.jsonl`
    PerScope(PathBuf),
}

/// Reads candidates from newline-delimited JSON, one
/// `{"key": ..., "attributes": {...}}` object per line.
///
/// The cursor is the 1-based line number of the last consumed line. A line
/// that does not parse becomes a keyless candidate, which fails validation
/// without ending the stream.
#[derive(Debug, Clone)]
pub struct JsonLinesSource {
    location: Location,
}

impl JsonLinesSource {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            location: Location::File(path.into()),
        }
    }

    /// One file per tenant, named after the scope key (`system.jsonl` for system runs).
    pub fn per_scope_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            location: Location::PerScope(dir.into()),
        }
    }

    pub fn path_for(&self, ctx: &SourceContext) -> PathBuf {
        match &self.location {
            Location::File(p) => p.clone(),
            Location::PerScope(dir) => dir.join(format!("{}.jsonl", scope_key(ctx.tenant_id))),
        }
    }
}

struct LineState {
    lines: Split<BufReader<tokio::fs::File>>,
    line_no: u64,
    path: PathBuf,
    done: bool,
}

/// Lines are read as raw bytes so that invalid UTF-8 is just another malformed line.
fn parse_line(line: &[u8], line_no: u64) -> Candidate {
    let cursor = SourceCursor::new(serde_json::json!(line_no));
    match serde_json::from_slice::<LineRecord>(line) {
        Ok(rec) => Candidate::new(rec.key, rec.attributes).with_cursor(cursor),
        Err(e) => {
            tracing::debug!(line = line_no, error = %e, "malformed candidate line");
            Candidate::new(String::new(), serde_json::Map::new()).with_cursor(cursor)
        }
    }
}

async fn next_candidate(mut state: LineState) -> Option<(Result<Candidate>, LineState)> {
    if state.done {
        return None;
    }
    loop {
        match state.lines.next_segment().await {
            Ok(Some(line)) => {
                state.line_no += 1;
                if line.trim_ascii().is_empty() {
                    continue;
                }
                let candidate = parse_line(&line, state.line_no);
                return Some((Ok(candidate), state));
            }
            Ok(None) => return None,
            Err(e) => {
                state.done = true;
                let err = Error::Source(format!(
                    "read {} at line {}: {e}",
                    state.path.display(),
                    state.line_no + 1
                ));
                return Some((Err(err), state));
            }
        }
    }
}

async fn skip_lines(
    lines: &mut Split<BufReader<tokio::fs::File>>,
    n: u64,
    path: &Path,
) -> Result<u64> {
    let mut skipped = 0;
    while skipped < n {
        match lines.next_segment().await {
            Ok(Some(_)) => skipped += 1,
            Ok(None) => break,
            Err(e) => {
                return Err(Error::SourceUnavailable(format!(
                    "read {}: {e}",
                    path.display()
                )));
            }
        }
    }
    Ok(skipped)
}

#[async_trait]
impl SourceAdapter for JsonLinesSource {
    fn id(&self) -> &str {
        "json_lines"
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn open(&self, ctx: &SourceContext) -> Result<CandidateStream> {
        let path = self.path_for(ctx);
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| Error::SourceUnavailable(format!("open {}: {e}", path.display())))?;
        let mut lines = BufReader::new(file).split(b'\n');

        let resume_at = ctx
            .cursor
            .as_ref()
            .and_then(|c| c.value.as_u64())
            .unwrap_or(0);
        let line_no = skip_lines(&mut lines, resume_at, &path).await?;
        if line_no > 0 {
            tracing::debug!(path = %path.display(), skipped = line_no, "resuming json lines source");
        }

        let state = LineState {
            lines,
            line_no,
            path,
            done: false,
        };
        Ok(Box::pin(futures_util::stream::unfold(state, next_candidate)))
    }

    async fn metadata(&self, ctx: &SourceContext) -> Option<serde_json::Value> {
        Some(serde_json::json!({ "path": self.path_for(ctx).display().to_string() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::models::RunTrigger;
    use futures_util::StreamExt;
    use uuid::Uuid;

    fn ctx(cursor: Option<u64>) -> SourceContext {
        SourceContext {
            tenant_id: None,
            run_id: Uuid::new_v4(),
            trigger: RunTrigger::Manual,
            cursor: cursor.map(|c| SourceCursor::new(serde_json::json!(c))),
        }
    }

    async fn write_fixture(name: &str, body: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("assetops-jsonl-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join(name);
        tokio::fs::write(&path, body).await.unwrap();
        path
    }

    #[tokio::test]
    async fn reads_candidates_and_tolerates_bad_lines() {
        let path = write_fixture(
            "in.jsonl",
            "{\"key\":\"a\",\"attributes\":{\"x\":1}}\n\nnot json\n{\"key\":\"b\"}\n",
        )
        .await;
        let source = JsonLinesSource::file(&path);
        let items: Vec<Candidate> = source
            .open(&ctx(None))
            .await
            .unwrap()
            .map(|c| c.unwrap())
            .collect()
            .await;

        assert_eq!(items.len(), 3);
        assert_eq!(items[0].key, "a");
        assert_eq!(items[0].attributes["x"], 1);
        assert_eq!(items[1].key, "");
        assert_eq!(items[1].cursor.as_ref().unwrap().value, 3);
        assert_eq!(items[2].key, "b");
        assert_eq!(items[2].cursor.as_ref().unwrap().value, 4);
    }

    #[tokio::test]
    async fn invalid_utf8_line_does_not_end_the_stream() {
        let dir = std::env::temp_dir().join(format!("assetops-jsonl-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("in.jsonl");
        let mut body = b"{\"key\":\"a\"}\r\n{\"key\":\"b".to_vec();
        body.push(0xff);
        body.extend_from_slice(b"\"}\n{\"key\":\"c\"}");
        tokio::fs::write(&path, body).await.unwrap();

        let items: Vec<Candidate> = JsonLinesSource::file(&path)
            .open(&ctx(None))
            .await
            .unwrap()
            .map(|c| c.unwrap())
            .collect()
            .await;

        let keys: Vec<&str> = items.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "", "c"]);
        assert_eq!(items[1].cursor.as_ref().unwrap().value, 2);
    }

    #[tokio::test]
    async fn resumes_after_cursor_line() {
        let path = write_fixture(
            "in.jsonl",
            "{\"key\":\"a\"}\n{\"key\":\"b\"}\n{\"key\":\"c\"}\n",
        )
        .await;
        let source = JsonLinesSource::file(&path);
        let keys: Vec<String> = source
            .open(&ctx(Some(2)))
            .await
            .unwrap()
            .map(|c| c.unwrap().key)
            .collect()
            .await;
        assert_eq!(keys, vec!["c"]);
    }

    #[tokio::test]
    async fn missing_file_is_source_unavailable() {
        let source = JsonLinesSource::per_scope_dir(std::env::temp_dir().join("assetops-missing"));
        let err = match source.open(&ctx(None)).await {
            Ok(_) => panic!("expected open to fail"),
            Err(e) => e,
        };
        assert!(matches!(err, Error::SourceUnavailable(_)));
    }
}
