//! End-to-end copier tests over in-memory blob stores.

use bytes::Bytes;
use flate2::write::GzEncoder;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tf_error::FilterError;
use tf_metrics::{MetricsSink, NopSink};
use tf_processor::{BlobStore, BlobStoreConfig, Copier, CopierConfig, ObjectStoreBlobStore};
use tf_rules::{CompiledRuleSet, RuleConfig};
use tokio_util::sync::CancellationToken;

const KMS_RULES: &str = r#"
version: "1.0.0"
rules:
  - name: check_kms
    matches:
      - field_name: eventName
        regex: ".*crypt"
      - field_name: eventSource
        regex: "kms.*"
"#;

struct Fixture {
    copier: Copier,
    source: Arc<InMemory>,
    destination: Arc<InMemory>,
    rules: Arc<CompiledRuleSet>,
    cancel: CancellationToken,
}

fn fixture(multipart: bool) -> Fixture {
    let source = Arc::new(InMemory::new());
    let destination = Arc::new(InMemory::new());

    let store = ObjectStoreBlobStore::new(BlobStoreConfig::new("us-east-1"))
        .with_store("trail-source", source.clone() as Arc<dyn ObjectStore>)
        .with_store("trail-filtered", destination.clone() as Arc<dyn ObjectStore>);

    let copier = Copier::new(
        Arc::new(store),
        Arc::new(NopSink),
        CopierConfig::new("trail-filtered").with_multipart_download(multipart),
    );

    let cfg = RuleConfig::load(KMS_RULES).unwrap();
    let rules = Arc::new(CompiledRuleSet::prepare(&cfg).unwrap());

    Fixture {
        copier,
        source,
        destination,
        rules,
        cancel: CancellationToken::new(),
    }
}

fn sample_records() -> Vec<String> {
    vec![
        r#"{"eventName":"Encrypt","eventSource":"kms.amazonaws.com","eventID":"e-1"}"#.to_string(),
        r#"{"eventName":"PutObject","eventSource":"s3.amazonaws.com","eventID":"e-2"}"#.to_string(),
        r#"{"eventName":"Decrypt","eventSource":"kms.amazonaws.com","eventID":"e-3"}"#.to_string(),
        r#"{"eventName":"Encrypt","eventSource":"logs.amazonaws.com","eventID":"e-4"}"#.to_string(),
        r#"{"eventName":"RunInstances","eventSource":"ec2.amazonaws.com","eventID":"e-5"}"#
            .to_string(),
    ]
}

fn document(records: &[String]) -> Vec<u8> {
    format!(r#"{{"Records":[{}]}}"#, records.join(",")).into_bytes()
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn gunzip(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    flate2::read::GzDecoder::new(data)
        .read_to_end(&mut out)
        .unwrap();
    out
}

async fn seed(store: &InMemory, key: &str, data: Vec<u8>) {
    store
        .put(&ObjectPath::from(key), PutPayload::from(data))
        .await
        .unwrap();
}

async fn fetch(store: &InMemory, key: &str) -> Vec<u8> {
    store
        .get(&ObjectPath::from(key))
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap()
        .to_vec()
}

#[tokio::test]
async fn test_batch_copy_filters_and_preserves_order() {
    let f = fixture(false);
    let key = "AWSLogs/123456789012/CloudTrail/us-east-1/trail.json.gz";
    seed(&f.source, key, gzip(&document(&sample_records()))).await;

    let report = f
        .copier
        .copy("trail-source", key, &f.rules, &f.cancel)
        .await
        .unwrap();

    assert_eq!(report.records_in, 5);
    assert_eq!(report.records_out, 3);
    assert_eq!(report.dropped, 2);
    assert!(report.bytes_uploaded > 0);

    // Destination key preserves the source key path
    let output = gunzip(&fetch(&f.destination, key).await);
    let parsed: serde_json::Value = serde_json::from_slice(&output).unwrap();
    let records = parsed["Records"].as_array().unwrap();
    let ids: Vec<&str> = records
        .iter()
        .map(|r| r["eventID"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["e-2", "e-4", "e-5"]);
}

#[tokio::test]
async fn test_streaming_copy_matches_batch_output() {
    let key = "logs/trail.json.gz";
    let doc = gzip(&document(&sample_records()));

    let batch = fixture(false);
    seed(&batch.source, key, doc.clone()).await;
    batch
        .copier
        .copy("trail-source", key, &batch.rules, &batch.cancel)
        .await
        .unwrap();

    let streaming = fixture(true);
    seed(&streaming.source, key, doc).await;
    let report = streaming
        .copier
        .copy("trail-source", key, &streaming.rules, &streaming.cancel)
        .await
        .unwrap();

    assert_eq!(report.records_out, 3);
    assert_eq!(
        gunzip(&fetch(&batch.destination, key).await),
        gunzip(&fetch(&streaming.destination, key).await)
    );
}

#[tokio::test]
async fn test_uncompressed_input_accepted() {
    let f = fixture(false);
    let key = "logs/trail.json";
    seed(&f.source, key, document(&sample_records())).await;

    let report = f
        .copier
        .copy("trail-source", key, &f.rules, &f.cancel)
        .await
        .unwrap();
    assert_eq!(report.records_out, 3);

    // Output is always gzip regardless of input encoding
    let output = gunzip(&fetch(&f.destination, key).await);
    assert!(output.starts_with(b"{\"Records\":["));
}

#[tokio::test]
async fn test_kept_records_are_byte_equal_subsequence() {
    let f = fixture(true);
    let key = "logs/trail.json";
    let records = sample_records();
    seed(&f.source, key, document(&records)).await;

    f.copier
        .copy("trail-source", key, &f.rules, &f.cancel)
        .await
        .unwrap();

    let output = String::from_utf8(gunzip(&fetch(&f.destination, key).await)).unwrap();
    for kept in [&records[1], &records[3], &records[4]] {
        assert!(output.contains(kept.as_str()), "missing {kept}");
    }
    for dropped in [&records[0], &records[2]] {
        assert!(!output.contains(dropped.as_str()), "unexpected {dropped}");
    }
}

#[tokio::test]
async fn test_reprocessing_output_is_fixed_point() {
    let f = fixture(false);
    let key = "logs/trail.json.gz";
    seed(&f.source, key, gzip(&document(&sample_records()))).await;

    f.copier
        .copy("trail-source", key, &f.rules, &f.cancel)
        .await
        .unwrap();
    let first = fetch(&f.destination, key).await;

    // Feed the filtered output back through with the same rules
    let f2 = fixture(false);
    seed(&f2.source, key, first.clone()).await;
    let report = f2
        .copier
        .copy("trail-source", key, &f2.rules, &f2.cancel)
        .await
        .unwrap();

    assert_eq!(report.records_in, 3);
    assert_eq!(report.dropped, 0);
    assert_eq!(
        gunzip(&fetch(&f2.destination, key).await),
        gunzip(&first)
    );
}

#[tokio::test]
async fn test_large_sample_filter_counts() {
    // 1,679 records of which 1,044 are kms traffic; a single
    // eventSource rule keeps the remaining 635.
    let kms_rule = r#"
version: "1.0.0"
rules:
  - name: drop_kms
    matches:
      - field_name: eventSource
        regex: "kms.*"
"#;

    let records: Vec<String> = (0u64..1679)
        .map(|i| {
            // (i * 1044) mod 1679 permutes 0..1679, so exactly 1,044
            // indices land below 1,044, interleaved through the file
            let source = if (i * 1044) % 1679 < 1044 {
                "kms.amazonaws.com"
            } else {
                "s3.amazonaws.com"
            };
            format!(r#"{{"eventID":"id-{i}","eventName":"Op{i}","eventSource":"{source}"}}"#)
        })
        .collect();
    let kms_count = records
        .iter()
        .filter(|r| r.contains("kms.amazonaws.com"))
        .count();
    assert_eq!(kms_count, 1044, "fixture must contain 1,044 kms records");

    let f = fixture(true);
    let key = "logs/big-trail.json.gz";
    seed(&f.source, key, gzip(&document(&records))).await;

    let cfg = RuleConfig::load(kms_rule).unwrap();
    let rules = Arc::new(CompiledRuleSet::prepare(&cfg).unwrap());

    let report = f
        .copier
        .copy("trail-source", key, &rules, &f.cancel)
        .await
        .unwrap();

    assert_eq!(report.records_in, 1679);
    assert_eq!(report.dropped, 1044);
    assert_eq!(report.records_out, 635);

    // Kept records appear verbatim, in input order
    let output = String::from_utf8(gunzip(&fetch(&f.destination, key).await)).unwrap();
    let kept_inputs: Vec<&String> = records
        .iter()
        .filter(|r| !r.contains("kms.amazonaws.com"))
        .collect();
    let mut search_from = 0;
    for kept in kept_inputs {
        let at = output[search_from..]
            .find(kept.as_str())
            .unwrap_or_else(|| panic!("record missing or out of order: {kept}"));
        search_from += at + kept.len();
    }
}

#[tokio::test]
async fn test_missing_object_is_not_found() {
    let f = fixture(false);
    let err = f
        .copier
        .copy("trail-source", "missing.json.gz", &f.rules, &f.cancel)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        FilterError::Source(tf_error::SourceError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_malformed_record_aborts_object() {
    let f = fixture(false);
    let key = "logs/bad.json";
    seed(
        &f.source,
        key,
        br#"{"Records":[{"eventName":"A"}, "not-an-object"]}"#.to_vec(),
    )
    .await;

    let err = f
        .copier
        .copy("trail-source", key, &f.rules, &f.cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, FilterError::Decode(_)));
}

#[tokio::test]
async fn test_cancelled_copy_propagates() {
    let f = fixture(false);
    let key = "logs/trail.json";
    seed(&f.source, key, document(&sample_records())).await;

    f.cancel.cancel();
    let err = f
        .copier
        .copy_with_retry("trail-source", key, &f.rules, &f.cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, FilterError::Cancelled));
}

#[tokio::test]
async fn test_large_record_stream_round_trips_intact() {
    // One record close to the pipe capacity forces multiple pipe writes
    let f = fixture(true);
    let key = "logs/big.json";
    let big_value = "x".repeat(512 * 1024);
    let records = vec![
        format!(r#"{{"eventName":"PutObject","eventSource":"s3.amazonaws.com","blob":"{big_value}"}}"#),
        r#"{"eventName":"Encrypt","eventSource":"kms.amazonaws.com"}"#.to_string(),
    ];
    seed(&f.source, key, document(&records)).await;

    let report = f
        .copier
        .copy("trail-source", key, &f.rules, &f.cancel)
        .await
        .unwrap();

    assert_eq!(report.records_in, 2);
    assert_eq!(report.records_out, 1);
    let output = String::from_utf8(gunzip(&fetch(&f.destination, key).await)).unwrap();
    assert!(output.contains(&big_value));
}

/// A blob store whose uploads stop reading early, leaving the encoder task
/// blocked on a full pipe.
struct StallingStore {
    inner: ObjectStoreBlobStore,
}

#[async_trait::async_trait]
impl BlobStore for StallingStore {
    async fn get_stream(&self, bucket: &str, key: &str) -> tf_error::Result<tf_processor::BlobBody> {
        self.inner.get_stream(bucket, key).await
    }

    async fn get_buffered(
        &self,
        bucket: &str,
        key: &str,
        limit: u64,
    ) -> tf_error::Result<(Bytes, tf_processor::Compression)> {
        self.inner.get_buffered(bucket, key, limit).await
    }

    async fn put_stream(
        &self,
        _bucket: &str,
        _key: &str,
        mut body: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
    ) -> tf_error::Result<u64> {
        use tokio::io::AsyncReadExt;
        // Read a token amount, then return without draining the pipe.
        // The read half is dropped here, but the encoder is held open by
        // keeping the body alive in a detached task that never reads again.
        let mut chunk = vec![0u8; 16];
        let _ = body.read_exact(&mut chunk).await;
        tokio::spawn(async move {
            let _body = body;
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        Ok(16)
    }
}

#[tokio::test]
async fn test_encoder_join_deadline() {
    let source = Arc::new(InMemory::new());
    let inner = ObjectStoreBlobStore::new(BlobStoreConfig::new("us-east-1"))
        .with_store("trail-source", source.clone() as Arc<dyn ObjectStore>);

    let copier = Copier::new(
        Arc::new(StallingStore { inner }),
        Arc::new(NopSink),
        CopierConfig::new("trail-filtered")
            .with_encoder_join_deadline(Duration::from_millis(100)),
    );

    // A document big enough that the encoder cannot fit the whole output
    // into the pipe buffer and blocks once the uploader stops reading.
    // The filler must not compress away, so it is xorshift noise.
    fn noise(seed: u64, len: usize) -> String {
        let mut x = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
        let mut s = String::with_capacity(len + 16);
        while s.len() < len {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            s.push_str(&format!("{x:016x}"));
        }
        s.truncate(len);
        s
    }

    let records: Vec<String> = (0..512)
        .map(|i| {
            let filler = noise(i, 16 * 1024);
            format!(r#"{{"eventName":"E{i}","eventSource":"s3.amazonaws.com","fill":"{filler}"}}"#)
        })
        .collect();
    seed(&source, "logs/huge.json", document(&records)).await;

    let cfg = RuleConfig::load(KMS_RULES).unwrap();
    let rules = Arc::new(CompiledRuleSet::prepare(&cfg).unwrap());
    let cancel = CancellationToken::new();

    let err = copier
        .copy("trail-source", "logs/huge.json", &rules, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, FilterError::PipelineDeadline(_)));
}

/// Counting sink used to assert metrics wiring.
#[derive(Default)]
struct CountingSink {
    processed: std::sync::atomic::AtomicUsize,
    filtered: std::sync::atomic::AtomicUsize,
    errors: std::sync::atomic::AtomicUsize,
}

impl MetricsSink for CountingSink {
    fn record_processed(&self, count: usize) {
        self.processed
            .fetch_add(count, std::sync::atomic::Ordering::SeqCst);
    }
    fn record_filtered(&self, count: usize, _rule_name: &str) {
        self.filtered
            .fetch_add(count, std::sync::atomic::Ordering::SeqCst);
    }
    fn record_error(&self, _kind: &str) {
        self.errors.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
    fn record_processing_time(&self, _duration: Duration) {}
    fn record_file_size(&self, _bytes: u64) {}
    fn record_config_load_time(&self, _duration: Duration, _source: &str) {}
}

#[tokio::test]
async fn test_metrics_wiring() {
    let source = Arc::new(InMemory::new());
    let destination = Arc::new(InMemory::new());
    let store = ObjectStoreBlobStore::new(BlobStoreConfig::new("us-east-1"))
        .with_store("trail-source", source.clone() as Arc<dyn ObjectStore>)
        .with_store("trail-filtered", destination.clone() as Arc<dyn ObjectStore>);

    let sink = Arc::new(CountingSink::default());
    let copier = Copier::new(
        Arc::new(store),
        sink.clone(),
        CopierConfig::new("trail-filtered"),
    );

    seed(&source, "t.json", document(&sample_records())).await;

    let cfg = RuleConfig::load(KMS_RULES).unwrap();
    let rules = Arc::new(CompiledRuleSet::prepare(&cfg).unwrap());
    copier
        .copy("trail-source", "t.json", &rules, &CancellationToken::new())
        .await
        .unwrap();

    use std::sync::atomic::Ordering;
    assert_eq!(sink.processed.load(Ordering::SeqCst), 5);
    assert_eq!(sink.filtered.load(Ordering::SeqCst), 2);
    assert_eq!(sink.errors.load(Ordering::SeqCst), 0);
}
