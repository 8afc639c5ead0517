use std::sync::Arc;

use serde_json::Value;

use crate::domain::run::RunContext;
use crate::error::StageError;
use crate::ingest::provider::{excerpt, SnapshotSource};
use crate::ingest::types::SourceQuery;
use crate::staging::{ArtifactKind, StagedArtifact, StagingArea};

/// Fetches one snapshot, validates its shape and stages it as the run's raw
/// artifact. Performs exactly one request; retries belong to the controller.
#[derive(Clone)]
pub struct Fetcher {
    source: Arc<dyn SnapshotSource>,
    query: SourceQuery,
    staging: StagingArea,
}

impl Fetcher {
    pub fn new(source: Arc<dyn SnapshotSource>, query: SourceQuery, staging: StagingArea) -> Self {
        Self {
            source,
            query,
            staging,
        }
    }

    pub async fn fetch(&self, ctx: &RunContext) -> Result<StagedArtifact, StageError> {
        let body = self.source.fetch_body(&self.query).await?;
        let doc = parse_snapshot(&body)?;
        let assets = doc.as_array().map(Vec::len).unwrap_or(0);

        // The body is staged byte for byte; `doc` only serves validation.
        let artifact = self
            .staging
            .write_atomic(ctx, ArtifactKind::Raw, &body)
            .await?;

        tracing::info!(
            pipeline = %ctx.pipeline,
            run_id = %ctx.run_id,
            source = self.source.source_name(),
            assets,
            path = %artifact.path.display(),
            "raw snapshot staged"
        );
        Ok(artifact)
    }
}

/// Accepts a JSON array of objects that each carry a string `id`.
pub fn parse_snapshot(body: &[u8]) -> Result<Value, StageError> {
    let doc: Value = serde_json::from_slice(body).map_err(|e| {
        StageError::malformed(format!("body is not JSON ({e}): {}", excerpt(body)))
    })?;

    let Some(items) = doc.as_array() else {
        return Err(StageError::malformed(format!(
            "expected a JSON array of assets, got {}",
            json_type(&doc)
        )));
    };

    for (idx, item) in items.iter().enumerate() {
        let Some(obj) = item.as_object() else {
            return Err(StageError::malformed(format!(
                "element {idx} is {}, expected an object",
                json_type(item)
            )));
        };
        match obj.get("id") {
            Some(Value::String(id)) if !id.trim().is_empty() => {}
            _ => {
                return Err(StageError::malformed(format!(
                    "element {idx} has no string id"
                )))
            }
        }
    }

    Ok(doc)
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    struct FixedSource(Result<Vec<u8>, fn() -> StageError>);

    #[async_trait::async_trait]
    impl SnapshotSource for FixedSource {
        fn source_name(&self) -> &'static str {
            "fixed"
        }

        async fn fetch_body(&self, _query: &SourceQuery) -> Result<Vec<u8>, StageError> {
            match &self.0 {
                Ok(body) => Ok(body.clone()),
                Err(make) => Err(make()),
            }
        }
    }

    fn ctx() -> RunContext {
        RunContext::new(
            "crypto_markets",
            Utc.with_ymd_and_hms(2024, 7, 5, 12, 10, 0).unwrap(),
        )
    }

    fn fetcher(dir: &std::path::Path, body: Result<Vec<u8>, fn() -> StageError>) -> Fetcher {
        Fetcher::new(
            Arc::new(FixedSource(body)),
            SourceQuery::default(),
            StagingArea::new(dir),
        )
    }

    #[tokio::test]
    async fn stages_raw_snapshot_with_the_same_ids() {
        let dir = tempfile::tempdir().unwrap();
        let body = json!([
            {"id": "bitcoin", "symbol": "btc"},
            {"id": "ethereum", "symbol": "eth"},
            {"id": "tether", "symbol": "usdt"}
        ]);
        let f = fetcher(dir.path(), Ok(serde_json::to_vec(&body).unwrap()));

        let artifact = f.fetch(&ctx()).await.unwrap();
        assert_eq!(artifact.kind, ArtifactKind::Raw);
        assert!(artifact.path.ends_with("crypto_markets/20240705T121000.json"));

        let staged: Value = serde_json::from_slice(&std::fs::read(&artifact.path).unwrap()).unwrap();
        let ids: Vec<&str> = staged
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["bitcoin", "ethereum", "tether"]);
    }

    #[tokio::test]
    async fn staged_bytes_are_the_response_body() {
        let dir = tempfile::tempdir().unwrap();
        let body = br#"[{"id":"pepe","symbol":"pepe","name":"Pepe","current_price":0.000012345678901234567,"market_cap":5012345678.10}]"#;
        let f = fetcher(dir.path(), Ok(body.to_vec()));

        let artifact = f.fetch(&ctx()).await.unwrap();
        let staged = std::fs::read(&artifact.path).unwrap();
        assert_eq!(staged, body.to_vec());
        assert_eq!(artifact.bytes, body.len() as u64);
    }

    #[tokio::test]
    async fn malformed_body_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let f = fetcher(dir.path(), Ok(b"<html>oops</html>".to_vec()));

        let err = f.fetch(&ctx()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedResponse);
        assert!(!dir.path().join("crypto_markets").exists());
    }

    #[tokio::test]
    async fn source_errors_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        let f = fetcher(dir.path(), Err(|| StageError::source_unavailable("down")));

        let err = f.fetch(&ctx()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SourceUnavailable);
    }

    #[test]
    fn rejects_non_array_documents_and_id_less_elements() {
        let err = parse_snapshot(br#"{"error": "rate limited"}"#).unwrap_err();
        assert!(err.to_string().contains("got an object"));

        let err = parse_snapshot(br#"[{"id": "bitcoin"}, 42]"#).unwrap_err();
        assert!(err.to_string().contains("element 1 is a number"));

        let err = parse_snapshot(br#"[{"name": "Bitcoin"}]"#).unwrap_err();
        assert!(err.to_string().contains("element 0 has no string id"));
    }

    #[test]
    fn empty_array_is_a_valid_snapshot() {
        let doc = parse_snapshot(b"[]").unwrap();
        assert_eq!(doc, json!([]));
    }
}
