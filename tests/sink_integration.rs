//! CSV sinks and S3 storage against a temp dir and a mock S3 endpoint.

use std::time::Duration;

use slack_harvest::config::StorageConfig;
use slack_harvest::error::ErrorKind;
use slack_harvest::models::{Message, ThreadRole};
use slack_harvest::retry::RetryPolicy;
use slack_harvest::sigv4::{hex_sha256, AwsCredentials};
use slack_harvest::sink::{self, Delivery, LocalFileSink, ObjectStoreSink, Sink};
use slack_harvest::storage::ObjectStore;
use wiremock::matchers::{header, header_exists, method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn messages() -> Vec<Message> {
    vec![
        Message {
            id: "1725955200.000100".into(),
            author: Some("U1".into()),
            body: "Deploy is done, see #ops".into(),
            thread_root_id: Some("1725955200.000100".into()),
            role: ThreadRole::TopLevel,
            sequence_position: 0,
            reply_count: 1,
        },
        Message {
            id: "1725955260.000200".into(),
            author: None,
            body: "multi\nline \"reply\"".into(),
            thread_root_id: Some("1725955200.000100".into()),
            role: ThreadRole::Reply,
            sequence_position: 1,
            reply_count: 0,
        },
        Message {
            id: "1725955300.000300".into(),
            author: Some("U2".into()),
            body: String::new(),
            thread_root_id: None,
            role: ThreadRole::TopLevel,
            sequence_position: 0,
            reply_count: 0,
        },
    ]
}

fn credentials() -> AwsCredentials {
    AwsCredentials {
        access_key_id: "AKIDEXAMPLE".into(),
        secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".into(),
        session_token: None,
    }
}

fn store(server: &MockServer) -> ObjectStore {
    let config = StorageConfig {
        bucket: Some("kb-team4u".into()),
        endpoint_url: Some(server.uri()),
        ..StorageConfig::default()
    };
    ObjectStore::from_config(&config, RetryPolicy::new(2, Duration::from_millis(1)))
        .unwrap()
        .with_credentials(credentials())
}

#[tokio::test]
async fn local_file_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("exports").join("general_2024-09-10.csv");
    let sink = LocalFileSink::new(&path);

    let location = sink.write(&messages()).await.unwrap();
    assert_eq!(location, path.display().to_string());

    let raw = std::fs::read_to_string(&path).unwrap();
    assert!(raw.starts_with("timestamp,user,text,is_thread,thread_ts\n"));

    let records = sink::read_csv(&path).unwrap();
    let input = messages();
    assert_eq!(records.len(), input.len());
    for (record, message) in records.iter().zip(&input) {
        assert_eq!(record.timestamp, message.id);
        assert_eq!(record.user, message.author.as_deref().unwrap_or("unknown"));
        assert_eq!(record.text, message.body);
        assert_eq!(record.thread_ts, message.thread_root_id.as_deref().unwrap_or(""));
        assert_eq!(record.role(), Some(message.role));
    }
}

#[tokio::test]
async fn thread_root_keeps_its_thread_ts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("roots.csv");
    LocalFileSink::new(&path).write(&messages()).await.unwrap();

    let records = sink::read_csv(&path).unwrap();
    assert_eq!(records[0].role(), Some(ThreadRole::TopLevel));
    assert_eq!(records[0].thread_ts, "1725955200.000100");
    assert_eq!(records[1].thread_ts, "1725955200.000100");
    assert_eq!(records[2].thread_ts, "");
    assert_eq!(records[1].user, "unknown");
}

#[tokio::test]
async fn local_file_is_truncated_on_rewrite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.csv");
    let sink = LocalFileSink::new(&path);
    sink.write(&messages()).await.unwrap();
    sink.write(&messages()[..1]).await.unwrap();
    assert_eq!(sink::read_csv(&path).unwrap().len(), 1);
}

#[tokio::test]
async fn put_object_is_signed_and_path_style() {
    let server = MockServer::start().await;
    let body = sink::render_csv(&messages()).unwrap();

    Mock::given(method("PUT"))
        .and(path("/kb-team4u/general-2024-09-10.csv"))
        .and(header_exists("authorization"))
        .and(header("x-amz-content-sha256", hex_sha256(&body).as_str()))
        .and(header("content-type", "text/csv"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let location = store(&server)
        .put_object("general-2024-09-10.csv", body, "text/csv")
        .await
        .unwrap();
    assert_eq!(location, "s3://kb-team4u/general-2024-09-10.csv");

    let requests = server.received_requests().await.unwrap();
    let auth = requests[0].headers.get("authorization").unwrap().to_str().unwrap();
    assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"));
    assert!(auth.contains("/eu-west-1/s3/aws4_request"));
}

#[tokio::test]
async fn list_objects_follows_continuation() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/kb-team4u"))
        .and(query_param("list-type", "2"))
        .and(query_param_is_missing("continuation-token"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "<ListBucketResult><IsTruncated>true</IsTruncated>\
             <Contents><Key>a.csv</Key><ETag>\"1\"</ETag><Size>3</Size></Contents>\
             <NextContinuationToken>tok-2</NextContinuationToken></ListBucketResult>",
        ))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/kb-team4u"))
        .and(query_param("continuation-token", "tok-2"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "<ListBucketResult><IsTruncated>false</IsTruncated>\
             <Contents><Key>b.csv</Key><ETag>\"2\"</ETag><Size>4</Size></Contents></ListBucketResult>",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let keys: Vec<String> = store(&server)
        .list_objects("")
        .await
        .unwrap()
        .into_iter()
        .map(|o| o.key)
        .collect();
    assert_eq!(keys, vec!["a.csv", "b.csv"]);
}

#[tokio::test]
async fn stalled_upload_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let config = StorageConfig {
        bucket: Some("kb-team4u".into()),
        endpoint_url: Some(server.uri()),
        timeout_secs: 1,
        ..StorageConfig::default()
    };
    let store = ObjectStore::from_config(&config, RetryPolicy::new(1, Duration::from_millis(1)))
        .unwrap()
        .with_credentials(credentials());

    let started = std::time::Instant::now();
    let err = store
        .put_object("slow.csv", b"a,b\n".to_vec(), "text/csv")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Storage);
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[tokio::test]
async fn failing_sink_does_not_block_others() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(403).set_body_string("<Error><Code>AccessDenied</Code></Error>"))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("general_2024-09-10.csv");
    let sinks: Vec<Box<dyn Sink>> = vec![
        Box::new(ObjectStoreSink::new(store(&server), "general-2024-09-10.csv")),
        Box::new(LocalFileSink::new(&path)),
    ];

    let delivery = sink::deliver(&messages(), &sinks).await;
    assert_eq!(delivery.failures(), 1);
    let Delivery::Written(reports) = delivery else {
        panic!("expected written delivery");
    };
    assert_eq!(reports.len(), 2);
    let err = reports[0].outcome.as_ref().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Storage);
    assert!(reports[1].outcome.is_ok());
    assert_eq!(sink::read_csv(&path).unwrap().len(), 3);
}

#[tokio::test]
async fn empty_fetch_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.csv");
    let sinks: Vec<Box<dyn Sink>> = vec![Box::new(LocalFileSink::new(&path))];

    let delivery = sink::deliver(&[], &sinks).await;
    assert!(matches!(delivery, Delivery::NoData));
    assert!(!path.exists());
}
