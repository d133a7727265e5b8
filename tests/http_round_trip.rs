mod common;

use std::time::{Duration, Instant};

use common::{fnv1a, init_logging, ok_response, pattern, serve};
use monoio_multi_http::{push_body, Error, FifoError, MultiClient};

#[monoio::test(enable_timer = true)]
async fn hello_world_fan_out() {
    init_logging();
    let addr = serve(|_req| async { ok_response(b"Hello World!\n") });
    let client = MultiClient::new();
    let url = format!("http://{addr}/hello");

    let futures: Vec<_> = (0..3).map(|_| client.get(&url)).collect();
    for fut in futures {
        let response = fut.await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.protocol_version(), "1.1");
        assert_eq!(response.body_bytes().unwrap().as_ref(), b"Hello World!\n");
        assert_eq!(response.length_hint(), Some(13));
        let conn = response.header_all("x-connection");
        assert_eq!(conn[0], format!("effective_url={url}"));
    }
    assert!(client.is_idle());

    // The connections went back to the pool and are reused.
    let response = client.get(&url).await.unwrap();
    assert!(response.header_all("x-connection").contains(&"connection;count=0"));
}

#[monoio::test(enable_timer = true)]
async fn timeout_fires_at_the_budget() {
    init_logging();
    let addr = serve(|_req| async {
        monoio::time::sleep(Duration::from_secs(5)).await;
        ok_response(b"too late")
    });
    let client = MultiClient::new().with_timeout(2.0);

    let started = Instant::now();
    let err = client
        .get(&format!("http://{addr}/sleep"))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();
    assert!(err.is_timeout(), "unexpected {err:?}");
    assert!(elapsed >= Duration::from_millis(1900), "fired early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(4), "fired late: {elapsed:?}");
    assert!(client.is_idle());
}

#[monoio::test(enable_timer = true)]
async fn request_headers_and_body_reach_the_server() {
    let addr = serve(|req| async move {
        let reply = format!(
            "{} {} {} {} {}",
            req.method,
            req.uri.path(),
            req.header("x-token").unwrap_or("-"),
            req.header("user-agent").unwrap_or("-"),
            String::from_utf8_lossy(&req.body)
        );
        ok_response(reply.as_bytes())
    });
    let client = MultiClient::new().with_header("User-Agent", "tester");
    let response = client
        .request(
            "post",
            &format!("http://{addr}/echo"),
            [("X-Token", "a"), ("x-token", "b")],
            "payload",
        )
        .await
        .unwrap();
    assert_eq!(
        response.body_bytes().unwrap().as_ref(),
        b"POST /echo a,b tester payload"
    );
}

#[monoio::test(enable_timer = true)]
async fn streamed_upload_arrives_intact() {
    const CHUNKS: usize = 2000;
    const CHUNK_LEN: usize = 1000;

    let addr = serve(|req| async move {
        let reply = format!("{} {:x}", req.body.len(), fnv1a(&req.body));
        ok_response(reply.as_bytes())
    });
    let mut config = monoio_multi_http::Config::default();
    config.upload_buffer_blocks = 20;
    let client = MultiClient::from_config(config);

    let (writer, body) = push_body();
    let producer = writer.clone();
    let produce = monoio::spawn(async move {
        let mut sent = Vec::with_capacity(CHUNKS * CHUNK_LEN);
        for i in 0..CHUNKS {
            producer.ready().await;
            let chunk = pattern(i, CHUNK_LEN);
            sent.extend_from_slice(&chunk);
            producer.write(chunk);
        }
        producer.close();
        sent
    });

    let length = (CHUNKS * CHUNK_LEN).to_string();
    let response = client
        .request(
            "PUT",
            &format!("http://{addr}/upload"),
            [("content-length", length.as_str())],
            body,
        )
        .await
        .unwrap();
    let sent = produce.await;
    assert!(writer.pause_count() > 0);
    let expected = format!("{} {:x}", sent.len(), fnv1a(&sent));
    assert_eq!(response.body_bytes().unwrap().as_ref(), expected.as_bytes());
}

#[monoio::test(enable_timer = true)]
async fn streamed_upload_without_length_is_chunked() {
    const CHUNKS: usize = 300;
    const CHUNK_LEN: usize = 1000;

    let addr = serve(|req| async move {
        let reply = format!(
            "{} {} {:x}",
            req.header("transfer-encoding").unwrap_or("-"),
            req.body.len(),
            fnv1a(&req.body)
        );
        ok_response(reply.as_bytes())
    });
    let client = MultiClient::new();

    let (writer, body) = push_body();
    let produce = monoio::spawn(async move {
        let mut sent = Vec::with_capacity(CHUNKS * CHUNK_LEN);
        for i in 0..CHUNKS {
            writer.ready().await;
            let chunk = pattern(i, CHUNK_LEN);
            sent.extend_from_slice(&chunk);
            writer.write(chunk);
        }
        writer.close();
        sent
    });

    let response = client
        .post(&format!("http://{addr}/upload"), body)
        .await
        .unwrap();
    let sent = produce.await;
    let expected = format!("chunked {} {:x}", sent.len(), fnv1a(&sent));
    assert_eq!(response.body_bytes().unwrap().as_ref(), expected.as_bytes());
    assert!(client.fifo_registry().is_empty());
}

#[monoio::test(enable_timer = true)]
async fn producer_overrunning_the_declared_length_is_reported() {
    let addr = serve(|req| async move { ok_response(&req.body) });
    let client = MultiClient::new();

    let (writer, body) = push_body();
    let fut = client.request(
        "PUT",
        &format!("http://{addr}/short"),
        [("content-length", "10")],
        body,
    );
    writer.write("0123456789abcdefghij");
    writer.close();

    match fut.await {
        Err(Error::Fifo(FifoError::ClosedWithData { pending, .. })) => assert_eq!(pending, 10),
        other => panic!("expected the unsent bytes to be reported, got {other:?}"),
    }
    assert!(client.is_idle());
    assert!(client.fifo_registry().is_empty());
}

#[monoio::test(enable_timer = true)]
async fn streaming_download_and_overflow() {
    let addr = serve(|_req| async { ok_response(&[b'x'; 64 * 1024]) });
    let url = format!("http://{addr}/big");

    let client = MultiClient::new();
    let response = client
        .request_streaming("GET", &url, [("accept", "*/*")], ())
        .await
        .unwrap();
    let body = response.into_body().bytes().await.unwrap();
    assert_eq!(body.len(), 64 * 1024);

    let err = client
        .with_response_buffer(1024)
        .get(&url)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Overflow { limit: 1024, .. }));
    assert!(client.is_idle());
}
