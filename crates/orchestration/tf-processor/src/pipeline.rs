//! Record filtering and output encoding.
//!
//! Both pipeline paths funnel kept records through the same output shape:
//! `{"Records":[` + comma-joined original record bytes + `]}`, gzip-encoded
//! as it is written. The batch path decodes the whole array up front and
//! filters in chunks for cache locality; the streaming path interleaves
//! extraction, evaluation and encoding so memory stays bounded by the
//! largest single record.

use crate::extract::RecordExtractor;
use crate::pool::{record_map_pool, ObjectPool};
use async_compression::tokio::write::GzipEncoder;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::value::RawValue;
use serde_json::{Map, Value};
use std::sync::Arc;
use tf_error::{DecodeError, FilterError, Result, SinkError};
use tf_metrics::MetricsSink;
use tf_rules::CompiledRuleSet;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Input size cap for the plain (single-shot) download path.
pub const MAX_PLAIN_BYTES: u64 = 100 * 1024 * 1024;

/// Input size cap for the multipart download path.
pub const MAX_MULTIPART_BYTES: u64 = 500 * 1024 * 1024;

/// Records evaluated per chunk on the batch path.
const CHUNK_SIZE: usize = 100;

/// Counts for one processed object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineReport {
    /// Records seen in the input
    pub records_in: usize,

    /// Records written to the output
    pub records_out: usize,
}

impl PipelineReport {
    /// Records removed by the rules.
    pub fn dropped(&self) -> usize {
        self.records_in - self.records_out
    }
}

#[derive(Deserialize)]
struct TrailDocument {
    #[serde(rename = "Records", default)]
    records: Vec<Box<RawValue>>,
}

/// Evaluator wiring shared by both pipeline paths.
pub struct FilterPipeline {
    rules: Arc<CompiledRuleSet>,
    metrics: Arc<dyn MetricsSink>,
    map_pool: ObjectPool<Map<String, Value>>,
}

impl FilterPipeline {
    /// Create a pipeline evaluating against one immutable rule snapshot.
    ///
    /// The snapshot is fixed for the life of the pipeline, so an object is
    /// never evaluated against two different rule sets mid-flight.
    pub fn new(rules: Arc<CompiledRuleSet>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            rules,
            metrics,
            map_pool: record_map_pool(),
        }
    }

    /// Batch path: decode a whole `{"Records":[...]}` document and filter it.
    ///
    /// Returns the kept records as their original bytes, in input order.
    /// Any record that fails to decode is fatal for the document.
    pub fn filter_document(&self, data: &[u8]) -> Result<(Vec<Bytes>, PipelineReport)> {
        let doc: TrailDocument = serde_json::from_slice(data)
            .map_err(|e| FilterError::Decode(DecodeError::Malformed(e.to_string())))?;

        let mut report = PipelineReport {
            records_in: doc.records.len(),
            records_out: 0,
        };
        let mut kept = Vec::with_capacity(doc.records.len());

        for chunk in doc.records.chunks(CHUNK_SIZE) {
            for raw in chunk {
                let record_bytes = raw.get().as_bytes();
                match self.evaluate(record_bytes)? {
                    Some(rule_name) => {
                        debug!(rule_name = %rule_name, "record dropped");
                        self.metrics.record_filtered(1, &rule_name);
                    }
                    None => {
                        kept.push(Bytes::copy_from_slice(record_bytes));
                        report.records_out += 1;
                    }
                }
            }
        }

        self.metrics.record_processed(report.records_in);
        Ok((kept, report))
    }

    /// Streaming path: extract records from `reader`, filter, and encode the
    /// survivors into `writer` as one gzip'd document.
    pub async fn filter_stream<R, W>(&self, reader: R, writer: W) -> Result<PipelineReport>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut extractor = RecordExtractor::new(reader);
        let mut encoder = GzipEncoder::new(writer);
        let mut report = PipelineReport::default();
        let mut first = true;

        write_output(&mut encoder, b"{\"Records\":[").await?;

        while let Some(record) = extractor.next_record().await? {
            report.records_in += 1;

            match self.evaluate(&record)? {
                Some(rule_name) => {
                    debug!(rule_name = %rule_name, "record dropped");
                    self.metrics.record_filtered(1, &rule_name);
                }
                None => {
                    if !first {
                        write_output(&mut encoder, b",").await?;
                    }
                    write_output(&mut encoder, &record).await?;
                    first = false;
                    report.records_out += 1;
                }
            }
        }

        write_output(&mut encoder, b"]}").await?;
        encoder
            .shutdown()
            .await
            .map_err(|e| FilterError::Sink(SinkError::Compression(e.to_string())))?;

        self.metrics.record_processed(report.records_in);
        Ok(report)
    }

    /// Encode already-filtered records into `writer` as one gzip'd document.
    /// The batch path runs this in the encoder task.
    pub async fn encode_records<W>(records: Vec<Bytes>, writer: W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut encoder = GzipEncoder::new(writer);

        write_output(&mut encoder, b"{\"Records\":[").await?;
        for (i, record) in records.iter().enumerate() {
            if i > 0 {
                write_output(&mut encoder, b",").await?;
            }
            write_output(&mut encoder, record).await?;
        }
        write_output(&mut encoder, b"]}").await?;

        encoder
            .shutdown()
            .await
            .map_err(|e| FilterError::Sink(SinkError::Compression(e.to_string())))
    }

    /// Decode one record into a pooled map and run the evaluator over it.
    ///
    /// The map always goes back to the pool, cleared, whether evaluation
    /// succeeds or the record fails to decode.
    fn evaluate(&self, record_bytes: &[u8]) -> Result<Option<String>> {
        let mut record = self.map_pool.get();

        let decoded: Value = match serde_json::from_slice(record_bytes) {
            Ok(value) => value,
            Err(e) => {
                self.map_pool.put(record);
                return Err(FilterError::Decode(DecodeError::Malformed(format!(
                    "record decode failed: {e}"
                ))));
            }
        };

        let Value::Object(mut fields) = decoded else {
            self.map_pool.put(record);
            return Err(FilterError::Decode(DecodeError::Malformed(
                "record is not a JSON object".to_string(),
            )));
        };

        record.append(&mut fields);
        let verdict = self.rules.evaluate(&record).map(str::to_string);
        self.map_pool.put(record);

        Ok(verdict)
    }
}

async fn write_output<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> Result<()> {
    writer
        .write_all(data)
        .await
        .map_err(|e| FilterError::Sink(SinkError::Pipe(e.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tf_metrics::NopSink;
    use tf_rules::RuleConfig;

    fn kms_pipeline() -> FilterPipeline {
        let cfg = RuleConfig::load(
            r#"
version: "1.0.0"
rules:
  - name: check_kms
    matches:
      - field_name: eventSource
        regex: "kms.*"
"#,
        )
        .unwrap();
        let rules = Arc::new(CompiledRuleSet::prepare(&cfg).unwrap());
        FilterPipeline::new(rules, Arc::new(NopSink))
    }

    const SAMPLE_DOC: &[u8] = br#"{"Records":[
        {"eventName":"Encrypt","eventSource":"kms.amazonaws.com"},
        {"eventName":"PutObject","eventSource":"s3.amazonaws.com"},
        {"eventName":"Decrypt","eventSource":"kms.amazonaws.com"},
        {"eventName":"RunInstances","eventSource":"ec2.amazonaws.com"}
    ]}"#;

    fn gunzip(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        flate2::read::GzDecoder::new(data).read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_filter_document_drops_matching() {
        let pipeline = kms_pipeline();
        let (kept, report) = pipeline.filter_document(SAMPLE_DOC).unwrap();

        assert_eq!(report.records_in, 4);
        assert_eq!(report.records_out, 2);
        assert_eq!(report.dropped(), 2);
        assert!(kept[0].windows(10).any(|w| w == b"\"PutObject".as_slice()));
        assert!(kept[1].windows(13).any(|w| w == b"\"RunInstances".as_slice()));
    }

    #[test]
    fn test_filter_document_keeps_original_bytes() {
        let pipeline = kms_pipeline();
        let doc = br#"{"Records":[{"eventSource":"s3.amazonaws.com","extra":  {"spacing":1}}]}"#;
        let (kept, _) = pipeline.filter_document(doc).unwrap();
        assert_eq!(
            &kept[0][..],
            br#"{"eventSource":"s3.amazonaws.com","extra":  {"spacing":1}}"#.as_slice()
        );
    }

    #[test]
    fn test_filter_document_malformed_record_is_fatal() {
        let pipeline = kms_pipeline();
        let err = pipeline.filter_document(b"{\"Records\": 17}").unwrap_err();
        assert!(matches!(err, FilterError::Decode(_)));
    }

    #[test]
    fn test_filter_document_non_object_record_is_fatal() {
        let pipeline = kms_pipeline();
        let err = pipeline
            .filter_document(br#"{"Records":[{"a":1}, 42]}"#)
            .unwrap_err();
        assert!(matches!(err, FilterError::Decode(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_filter_document_empty_records() {
        let pipeline = kms_pipeline();
        let (kept, report) = pipeline.filter_document(br#"{"Records":[]}"#).unwrap();
        assert!(kept.is_empty());
        assert_eq!(report, PipelineReport { records_in: 0, records_out: 0 });
    }

    #[tokio::test]
    async fn test_encode_records_shape() {
        let records = vec![
            Bytes::from_static(br#"{"a":1}"#),
            Bytes::from_static(br#"{"b":2}"#),
        ];

        let mut output = Vec::new();
        FilterPipeline::encode_records(records, &mut output)
            .await
            .unwrap();

        let decoded = gunzip(&output);
        assert_eq!(decoded, br#"{"Records":[{"a":1},{"b":2}]}"#);
    }

    #[tokio::test]
    async fn test_encode_records_empty() {
        let mut output = Vec::new();
        FilterPipeline::encode_records(Vec::new(), &mut output)
            .await
            .unwrap();
        assert_eq!(gunzip(&output), br#"{"Records":[]}"#);
    }

    #[tokio::test]
    async fn test_filter_stream_matches_batch() {
        let pipeline = kms_pipeline();

        let mut output = Vec::new();
        let report = pipeline
            .filter_stream(tokio::io::BufReader::new(SAMPLE_DOC), &mut output)
            .await
            .unwrap();

        assert_eq!(report.records_in, 4);
        assert_eq!(report.records_out, 2);

        let decoded = gunzip(&output);
        let parsed: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
        let records = parsed["Records"].as_array().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["eventName"], "PutObject");
        assert_eq!(records[1]["eventName"], "RunInstances");
    }

    #[tokio::test]
    async fn test_filter_stream_no_rules_match_is_identity() {
        let cfg = RuleConfig::load(
            r#"
version: "1.0.0"
rules:
  - name: never
    matches:
      - field_name: eventName
        regex: "^WillNotMatchAnything$"
"#,
        )
        .unwrap();
        let pipeline = FilterPipeline::new(
            Arc::new(CompiledRuleSet::prepare(&cfg).unwrap()),
            Arc::new(NopSink),
        );

        let doc = br#"{"Records":[{"eventName":"A"},{"eventName":"B"},{"eventName":"C"}]}"#;
        let mut output = Vec::new();
        let report = pipeline
            .filter_stream(tokio::io::BufReader::new(&doc[..]), &mut output)
            .await
            .unwrap();

        assert_eq!(report.records_in, 3);
        assert_eq!(report.records_out, 3);
        // Compact input passes through byte-identical
        assert_eq!(gunzip(&output), doc.as_slice());
    }

    #[tokio::test]
    async fn test_filter_stream_fixed_point() {
        let pipeline = kms_pipeline();

        let mut first_pass = Vec::new();
        pipeline
            .filter_stream(tokio::io::BufReader::new(SAMPLE_DOC), &mut first_pass)
            .await
            .unwrap();
        let first_decoded = gunzip(&first_pass);

        let mut second_pass = Vec::new();
        let report = pipeline
            .filter_stream(
                tokio::io::BufReader::new(&first_decoded[..]),
                &mut second_pass,
            )
            .await
            .unwrap();

        assert_eq!(report.records_in, report.records_out);
        assert_eq!(gunzip(&second_pass), first_decoded);
    }
}
