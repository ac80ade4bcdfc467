use perfspan::export::{SpanSummary, SummaryExporter};
use perfspan::profiling::EventProcessor;
use perfspan::report::SpanHistograms;
use perfspan_common::record::{record_len, write_counter, MAX_RECORD_SIZE};
use perfspan_common::{EventKind, RecordHeader};

fn record(kind: EventKind, span_id: u64, ts: u64, cycles: u64) -> Vec<u8> {
    let mut buf = [0u8; MAX_RECORD_SIZE];
    RecordHeader { kind, name_id: 0, cpu: 1, span_id, process_id: (7 << 32) | 7, timestamp_ns: ts }
        .write_to(&mut buf);
    write_counter(&mut buf, 0, cycles);
    buf[..record_len(1)].to_vec()
}

fn processed_spans() -> Vec<SpanHistograms> {
    let spans = vec![
        SpanHistograms::new("parse".to_string(), ["cycles".parse().unwrap()]).unwrap(),
        SpanHistograms::new("idle".to_string(), ["cycles".parse().unwrap()]).unwrap(),
    ];
    let mut processor = EventProcessor::new(spans);
    for (span_id, latency, cycles) in [(1, 100, 1_000), (2, 200, 1_500), (3, 300, 2_000)] {
        processor.process_bytes(&record(EventKind::Enter, span_id, 10_000, 5_000));
        processor.process_bytes(&record(EventKind::Exit, span_id, 10_000 + latency, 5_000 + cycles));
    }
    assert_eq!(processor.stats.paired, 3);
    processor.into_spans()
}

#[test]
fn test_export_creates_valid_json() {
    let spans = processed_spans();
    let mut buffer = Vec::new();
    SummaryExporter::new(&spans).export(&mut buffer).expect("Failed to export summary");

    let json_str = String::from_utf8(buffer).expect("Invalid UTF-8");
    let parsed: serde_json::Value = serde_json::from_str(&json_str).expect("Invalid JSON");

    let spans = parsed.as_array().expect("summary should be an array");
    assert_eq!(spans.len(), 2);
    assert_eq!(spans[0]["span"], "parse");
    assert_eq!(spans[0]["metrics"][0]["metric"], "latency");
    assert_eq!(spans[0]["metrics"][0]["unit"], "ns");
    assert_eq!(spans[0]["metrics"][0]["samples"], 3);
    assert_eq!(spans[0]["metrics"][1]["metric"], "cycles");
}

#[test]
fn test_export_round_trips_through_serde() {
    let spans = processed_spans();
    let exporter = SummaryExporter::new(&spans);
    let mut buffer = Vec::new();
    exporter.export(&mut buffer).unwrap();

    let parsed: Vec<SpanSummary> = serde_json::from_slice(&buffer).unwrap();
    let latency = &parsed[0].metrics[0];
    assert_eq!(latency.min, 100);
    assert_eq!(latency.max, 300);
    assert!((latency.mean - 200.0).abs() < 1.0);

    let cycles = &parsed[0].metrics[1];
    assert_eq!((cycles.min, cycles.max), (1_000, 2_000));

    assert_eq!(parsed[1].span, "idle");
    assert_eq!(parsed[1].metrics[0].samples, 0);
}

#[test]
fn test_export_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("summary.json");
    let spans = processed_spans();
    let file = std::fs::File::create(&path).unwrap();
    SummaryExporter::new(&spans).export(std::io::BufWriter::new(file)).unwrap();

    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.trim_end().ends_with(']'));
    assert!(contents.contains("\"p95\""));
}
