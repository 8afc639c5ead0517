use std::collections::HashSet;
use std::io;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde_json::{Map, Value};

use crate::domain::run::RunContext;
use crate::domain::snapshot::{MarketSnapshotRecord, CSV_COLUMNS};
use crate::error::StageError;
use crate::staging::{ArtifactKind, StagedArtifact, StagingArea};

const DOCUMENT: &str = "<document>";

#[derive(Debug, Clone)]
pub struct TransformOutput {
    pub artifact: StagedArtifact,
    pub rows: usize,
    pub processed_at: DateTime<Utc>,
}

/// Projects the staged raw snapshot into the tabular artifact.
#[derive(Debug, Clone)]
pub struct Transformer {
    staging: StagingArea,
}

impl Transformer {
    pub fn new(staging: StagingArea) -> Self {
        Self { staging }
    }

    pub async fn transform(
        &self,
        ctx: &RunContext,
        raw: &StagedArtifact,
    ) -> Result<TransformOutput, StageError> {
        let bytes = self.staging.read(raw).await?;
        let doc: Value = serde_json::from_slice(&bytes)
            .map_err(|e| StageError::schema(DOCUMENT, "[]", format!("is not valid JSON: {e}")))?;

        // One timestamp for the whole output, at the precision it is written with.
        let processed_at = Utc::now().trunc_subsecs(3);
        let records = project_records(&doc, processed_at)?;
        let csv = render_csv(&records).map_err(|e| StageError::staging(&raw.path, e))?;

        let artifact = self
            .staging
            .write_atomic(ctx, ArtifactKind::Transformed, &csv)
            .await?;

        tracing::info!(
            pipeline = %ctx.pipeline,
            run_id = %ctx.run_id,
            rows = records.len(),
            %processed_at,
            path = %artifact.path.display(),
            "transformed snapshot staged"
        );

        Ok(TransformOutput {
            artifact,
            rows: records.len(),
            processed_at,
        })
    }
}

/// Validates every raw asset object and projects it, preserving order. The
/// first invalid record aborts the whole projection.
pub fn project_records(
    doc: &Value,
    processed_at: DateTime<Utc>,
) -> Result<Vec<MarketSnapshotRecord>, StageError> {
    let items = doc
        .as_array()
        .ok_or_else(|| StageError::schema(DOCUMENT, "[]", "must be a JSON array of assets"))?;

    let mut seen = HashSet::with_capacity(items.len());
    let mut out = Vec::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        let fallback = format!("#{idx}");
        let obj = item
            .as_object()
            .ok_or_else(|| StageError::schema(&fallback, "*", "record must be an object"))?;

        let record = project_record(obj, &fallback, processed_at)?;
        if !seen.insert(record.id.clone()) {
            return Err(StageError::schema(
                &record.id,
                "id",
                "duplicates an earlier record",
            ));
        }
        out.push(record);
    }
    Ok(out)
}

fn project_record(
    obj: &Map<String, Value>,
    fallback: &str,
    processed_at: DateTime<Utc>,
) -> Result<MarketSnapshotRecord, StageError> {
    let id = required_str(obj, fallback, "id")?;
    let label = id.as_str();

    let name = required_str(obj, label, "name")?;
    let symbol = required_str(obj, label, "symbol")?;
    let current_price = required_amount(obj, label, "current_price")?;
    let market_cap = required_amount(obj, label, "market_cap")?;
    let total_volume = required_amount(obj, label, "total_volume")?;
    let last_updated = required_timestamp(obj, label, "last_updated")?;

    Ok(MarketSnapshotRecord {
        id,
        name,
        symbol,
        current_price,
        market_cap,
        total_volume,
        last_updated,
        processed_at,
    })
}

fn required<'a>(
    obj: &'a Map<String, Value>,
    record: &str,
    field: &str,
) -> Result<&'a Value, StageError> {
    match obj.get(field) {
        None => Err(StageError::schema(record, field, "is missing")),
        Some(Value::Null) => Err(StageError::schema(record, field, "is null")),
        Some(v) => Ok(v),
    }
}

fn required_str(
    obj: &Map<String, Value>,
    record: &str,
    field: &str,
) -> Result<String, StageError> {
    let s = required(obj, record, field)?
        .as_str()
        .ok_or_else(|| StageError::schema(record, field, "must be a string"))?
        .trim();
    if s.is_empty() {
        return Err(StageError::schema(record, field, "must be non-empty"));
    }
    Ok(s.to_string())
}

fn required_amount(
    obj: &Map<String, Value>,
    record: &str,
    field: &str,
) -> Result<f64, StageError> {
    let n = required(obj, record, field)?
        .as_f64()
        .ok_or_else(|| StageError::schema(record, field, "must be a number"))?;
    if !n.is_finite() || n < 0.0 {
        return Err(StageError::schema(
            record,
            field,
            format!("must be a non-negative number (got {n})"),
        ));
    }
    Ok(n)
}

fn required_timestamp(
    obj: &Map<String, Value>,
    record: &str,
    field: &str,
) -> Result<DateTime<Utc>, StageError> {
    let raw = required(obj, record, field)?
        .as_str()
        .ok_or_else(|| StageError::schema(record, field, "must be a timestamp string"))?;
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StageError::schema(record, field, format!("is not RFC 3339 ({raw:?}): {e}")))
}

fn format_timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// CSV with a header row, even when there are no records.
pub fn render_csv(records: &[MarketSnapshotRecord]) -> io::Result<Vec<u8>> {
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());

    wtr.write_record(CSV_COLUMNS)?;
    for r in records {
        let current_price = r.current_price.to_string();
        let market_cap = r.market_cap.to_string();
        let total_volume = r.total_volume.to_string();
        let last_updated = format_timestamp(&r.last_updated);
        let processed_at = format_timestamp(&r.processed_at);
        wtr.write_record([
            r.id.as_str(),
            r.name.as_str(),
            r.symbol.as_str(),
            current_price.as_str(),
            market_cap.as_str(),
            total_volume.as_str(),
            last_updated.as_str(),
            processed_at.as_str(),
        ])?;
    }

    wtr.into_inner()
        .map_err(|e| io::Error::new(e.error().kind(), e.error().to_string()))
}

/// Loads a transformed artifact back into records.
pub fn read_records(bytes: &[u8]) -> anyhow::Result<Vec<MarketSnapshotRecord>> {
    let mut rdr = csv::Reader::from_reader(bytes);
    let headers = rdr.headers()?.clone();
    anyhow::ensure!(
        headers.iter().eq(CSV_COLUMNS.iter().copied()),
        "unexpected transformed header: {headers:?}"
    );

    let mut out = Vec::new();
    for row in rdr.deserialize() {
        out.push(row?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use chrono::TimeZone;
    use serde_json::json;

    fn asset(id: &str, price: f64) -> Value {
        json!({
            "id": id,
            "symbol": id.chars().take(3).collect::<String>(),
            "name": id.to_uppercase(),
            "image": "https://example.invalid/logo.png",
            "current_price": price,
            "market_cap": 1_000_000_000_u64,
            "market_cap_rank": 1,
            "total_volume": 12_345.5,
            "last_updated": "2024-07-05T12:09:31.120Z"
        })
    }

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 5, 12, 10, 3).unwrap()
    }

    #[test]
    fn projects_required_fields_in_input_order() {
        let doc = json!([asset("bitcoin", 57000.0), asset("ethereum", 3000.5), asset("solana", 140.0)]);
        let records = project_records(&doc, ts()).unwrap();

        assert_eq!(records.len(), 3);
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["bitcoin", "ethereum", "solana"]);
        assert_eq!(records[1].current_price, 3000.5);
        assert_eq!(records[0].market_cap, 1.0e9);
        assert_eq!(
            records[0].last_updated,
            Utc.with_ymd_and_hms(2024, 7, 5, 12, 9, 31).unwrap() + chrono::Duration::milliseconds(120)
        );
        assert!(records.iter().all(|r| r.processed_at == ts()));
    }

    #[test]
    fn missing_current_price_names_the_record() {
        let mut broken = asset("ethereum", 0.0);
        broken.as_object_mut().unwrap().remove("current_price");
        let doc = json!([asset("bitcoin", 1.0), broken]);

        let err = project_records(&doc, ts()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaViolation);
        match err {
            StageError::SchemaViolation { record, field, .. } => {
                assert_eq!(record, "ethereum");
                assert_eq!(field, "current_price");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn null_and_negative_values_are_violations() {
        let mut nulled = asset("bitcoin", 1.0);
        nulled["market_cap"] = Value::Null;
        let err = project_records(&json!([nulled]), ts()).unwrap_err();
        assert!(err.to_string().contains("`market_cap` is null"));

        let negative = asset("bitcoin", -1.0);
        let err = project_records(&json!([negative]), ts()).unwrap_err();
        assert!(err.to_string().contains("non-negative"));
    }

    #[test]
    fn record_without_id_is_named_by_position() {
        let mut no_id = asset("bitcoin", 1.0);
        no_id.as_object_mut().unwrap().remove("id");
        let err = project_records(&json!([asset("ethereum", 1.0), no_id]), ts()).unwrap_err();
        assert!(err.to_string().contains("record #1"));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let doc = json!([asset("bitcoin", 1.0), asset("bitcoin", 2.0)]);
        let err = project_records(&doc, ts()).unwrap_err();
        assert!(err.to_string().contains("duplicates"));
    }

    #[test]
    fn bad_timestamp_is_a_violation() {
        let mut bad = asset("bitcoin", 1.0);
        bad["last_updated"] = json!("yesterday");
        let err = project_records(&json!([bad]), ts()).unwrap_err();
        assert!(err.to_string().contains("`last_updated` is not RFC 3339"));
    }

    #[test]
    fn empty_snapshot_renders_header_only() {
        let records = project_records(&json!([]), ts()).unwrap();
        let csv = render_csv(&records).unwrap();
        assert_eq!(
            String::from_utf8(csv.clone()).unwrap(),
            "id,name,symbol,current_price,market_cap,total_volume,last_updated,processed_at\n"
        );
        assert!(read_records(&csv).unwrap().is_empty());
    }

    #[test]
    fn rendered_csv_reads_back() {
        let doc = json!([asset("bitcoin", 57000.25), asset("ethereum", 3000.5)]);
        let records = project_records(&doc, ts()).unwrap();
        let csv = render_csv(&records).unwrap();

        let text = String::from_utf8(csv.clone()).unwrap();
        assert!(text.contains("bitcoin,BITCOIN,bit,57000.25,1000000000,12345.5,2024-07-05T12:09:31.120Z,2024-07-05T12:10:03.000Z"));
        assert_eq!(read_records(&csv).unwrap(), records);
    }

    #[tokio::test]
    async fn transform_writes_run_scoped_csv_and_keeps_raw() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(dir.path());
        let ctx = RunContext::new("crypto_markets", ts());
        let raw_body = serde_json::to_vec_pretty(&json!([asset("bitcoin", 1.0), asset("tether", 1.0)])).unwrap();
        let raw = staging
            .write_atomic(&ctx, ArtifactKind::Raw, &raw_body)
            .await
            .unwrap();

        let out = Transformer::new(staging.clone())
            .transform(&ctx, &raw)
            .await
            .unwrap();

        assert_eq!(out.rows, 2);
        assert!(out.artifact.path.ends_with("crypto_markets/20240705T121003.csv"));
        let rows = read_records(&std::fs::read(&out.artifact.path).unwrap()).unwrap();
        assert!(rows.iter().all(|r| r.processed_at == rows[0].processed_at));
        assert_eq!(std::fs::read(&raw.path).unwrap(), raw_body);
    }

    #[tokio::test]
    async fn failing_transform_leaves_no_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(dir.path());
        let ctx = RunContext::new("crypto_markets", ts());
        let mut broken = asset("bitcoin", 1.0);
        broken.as_object_mut().unwrap().remove("current_price");
        let raw = staging
            .write_atomic(&ctx, ArtifactKind::Raw, &serde_json::to_vec(&json!([broken])).unwrap())
            .await
            .unwrap();

        let err = Transformer::new(staging.clone())
            .transform(&ctx, &raw)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaViolation);
        assert!(staging
            .existing(&ctx, ArtifactKind::Transformed)
            .await
            .unwrap()
            .is_none());
    }
}
