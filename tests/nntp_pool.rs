//! Session and pool behavior against an in-process mock NNTP server.

mod common;

use std::sync::Arc;

use common::{MockServerBuilder, single_part_article};
use gonzbee::nntp::{NntpError, Pool, PoolConfig};

fn payload(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(13).wrapping_add(seed)).collect()
}

#[tokio::test]
async fn fetches_article_body_verbatim() {
    let article = single_part_article(&payload(1, 2000), "file.bin");
    let server = MockServerBuilder::new()
        .article("msg1@test", article.clone())
        .start()
        .await;

    let pool = Pool::new(
        server.server_config(),
        PoolConfig {
            max_connections: 1,
            pipeline_depth: 2,
        },
    );

    let slot = pool.acquire().await.unwrap();
    let body = slot.fetch_body("alt.binaries.test", "msg1@test").await.unwrap();
    pool.release(slot);

    assert_eq!(body, article, "dot-unstuffed body must round-trip exactly");
}

#[tokio::test]
async fn missing_article_keeps_connection_alive() {
    let article = single_part_article(&payload(2, 500), "file.bin");
    let server = MockServerBuilder::new()
        .article("exists@test", article)
        .start()
        .await;

    let pool = Pool::new(
        server.server_config(),
        PoolConfig {
            max_connections: 1,
            pipeline_depth: 2,
        },
    );

    let slot = pool.acquire().await.unwrap();
    let err = slot.fetch_body("alt.binaries.test", "gone@test").await.unwrap_err();
    match &err {
        NntpError::Protocol { code, .. } => assert_eq!(*code, 430),
        other => panic!("expected 430 protocol error, got {other:?}"),
    }
    assert!(!err.is_transport(), "430 must not be classified as transport");
    pool.release(slot);

    // the same connection must serve the next fetch
    let slot = pool.acquire().await.unwrap();
    slot.fetch_body("alt.binaries.test", "exists@test").await.unwrap();
    pool.release(slot);

    assert_eq!(server.connections_opened(), 1);
}

#[tokio::test]
async fn transport_fault_retires_connection() {
    let article = single_part_article(&payload(3, 500), "file.bin");
    let server = MockServerBuilder::new()
        .article("good@test", article)
        .kill_article("killer@test")
        .start()
        .await;

    let pool = Pool::new(
        server.server_config(),
        PoolConfig {
            max_connections: 1,
            pipeline_depth: 2,
        },
    );

    let slot = pool.acquire().await.unwrap();
    let err = slot.fetch_body("alt.binaries.test", "killer@test").await.unwrap_err();
    assert!(err.is_transport(), "mid-body hangup must read as transport error");
    pool.retire(slot);

    // a fresh dial replaces the dead session
    let slot = pool.acquire().await.unwrap();
    let body = slot.fetch_body("alt.binaries.test", "good@test").await.unwrap();
    assert!(!body.is_empty());
    pool.release(slot);

    assert_eq!(server.connections_opened(), 2);
}

#[tokio::test]
async fn authentication_flow_succeeds() {
    let article = single_part_article(&payload(4, 100), "file.bin");
    let server = MockServerBuilder::new()
        .auth("alice", "hunter2")
        .article("m@test", article)
        .start()
        .await;

    let pool = Pool::new(
        server.server_config(),
        PoolConfig {
            max_connections: 1,
            pipeline_depth: 1,
        },
    );

    let slot = pool.acquire().await.unwrap();
    slot.fetch_body("alt.binaries.test", "m@test").await.unwrap();
    pool.release(slot);
}

#[tokio::test]
async fn rejected_credentials_latch_pool_fatal() {
    let server = MockServerBuilder::new().auth("alice", "hunter2").start().await;

    let config = server.server_config_with_creds("alice", "wrong");
    let pool = Pool::new(
        config,
        PoolConfig {
            max_connections: 2,
            pipeline_depth: 4,
        },
    );

    let err = pool.acquire().await.unwrap_err();
    let message = err.to_string();
    assert!(
        message.contains("authentication") || message.contains("482"),
        "fatal error should surface the auth rejection, got: {message}"
    );
}

#[tokio::test]
async fn group_switch_is_elided_for_same_group() {
    let a = single_part_article(&payload(5, 100), "a.bin");
    let b = single_part_article(&payload(6, 100), "b.bin");
    let server = MockServerBuilder::new()
        .article("a@test", a)
        .article("b@test", b)
        .start()
        .await;

    let pool = Pool::new(
        server.server_config(),
        PoolConfig {
            max_connections: 1,
            pipeline_depth: 1,
        },
    );

    for id in ["a@test", "b@test"] {
        let slot = pool.acquire().await.unwrap();
        slot.fetch_body("alt.binaries.same", id).await.unwrap();
        pool.release(slot);
    }
    assert_eq!(
        server.group_commands(),
        1,
        "second fetch in the same group must not resend GROUP"
    );

    let slot = pool.acquire().await.unwrap();
    slot.fetch_body("alt.binaries.other", "a@test").await.unwrap();
    pool.release(slot);
    assert_eq!(server.group_commands(), 2, "group change must resend GROUP");
}

#[tokio::test]
async fn failed_group_drops_segment_but_stays_in_sync() {
    let article = single_part_article(&payload(7, 100), "a.bin");
    let server = MockServerBuilder::new()
        .article("a@test", article)
        .start()
        .await;

    let pool = Pool::new(
        server.server_config(),
        PoolConfig {
            max_connections: 1,
            pipeline_depth: 2,
        },
    );

    let slot = pool.acquire().await.unwrap();
    let err = slot.fetch_body("no.such.group", "a@test").await.unwrap_err();
    match err {
        NntpError::Protocol { code, .. } => assert_eq!(code, 411),
        other => panic!("expected 411 protocol error, got {other:?}"),
    }
    pool.release(slot);

    // the pipeline must still be aligned: next fetch works
    let slot = pool.acquire().await.unwrap();
    slot.fetch_body("alt.binaries.test", "a@test").await.unwrap();
    pool.release(slot);
    assert_eq!(server.connections_opened(), 1);
}

#[tokio::test]
async fn rejected_group_is_resent_on_retry() {
    let article = single_part_article(&payload(8, 100), "a.bin");
    let server = MockServerBuilder::new()
        .article("a@test", article)
        .start()
        .await;

    let pool = Pool::new(
        server.server_config(),
        PoolConfig {
            max_connections: 1,
            pipeline_depth: 2,
        },
    );

    // two attempts against the same bad group: a rejected switch must not
    // be cached as the current group, so GROUP goes out both times
    for _ in 0..2 {
        let slot = pool.acquire().await.unwrap();
        let err = slot.fetch_body("no.such.group", "a@test").await.unwrap_err();
        assert!(
            matches!(err, NntpError::Protocol { code: 411, .. }),
            "expected 411 protocol error, got {err:?}"
        );
        pool.release(slot);
    }
    assert_eq!(
        server.group_commands(),
        2,
        "retrying an identical rejected group must resend GROUP"
    );

    // the session is still usable in a real group afterwards
    let slot = pool.acquire().await.unwrap();
    slot.fetch_body("alt.binaries.test", "a@test").await.unwrap();
    pool.release(slot);
    assert_eq!(server.group_commands(), 3);
    assert_eq!(server.connections_opened(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_saturation_respects_connection_cap() {
    let mut builder = MockServerBuilder::new();
    let mut expected = Vec::new();
    for i in 0..50u32 {
        let article = single_part_article(&payload(i as u8, 300), &format!("f{i}.bin"));
        builder = builder.article(&format!("m{i}@test"), article.clone());
        expected.push(article);
    }
    let server = builder.start().await;

    let pool = Arc::new(Pool::new(
        server.server_config(),
        PoolConfig {
            max_connections: 2,
            pipeline_depth: 5,
        },
    ));

    let mut handles = Vec::new();
    for i in 0..50u32 {
        let pool = Arc::clone(&pool);
        handles.push(tokio::spawn(async move {
            let slot = pool.acquire().await.unwrap();
            let body = slot
                .fetch_body("alt.binaries.test", &format!("m{i}@test"))
                .await
                .unwrap();
            pool.release(slot);
            (i, body)
        }));
    }

    for handle in handles {
        let (i, body) = handle.await.unwrap();
        assert_eq!(body, expected[i as usize], "article {i} corrupted in flight");
    }

    assert!(
        server.peak_connections() <= 2,
        "peak connections {} exceeded the cap",
        server.peak_connections()
    );
    assert_eq!(server.body_commands(), 50);
    assert_eq!(pool.stats().live_connections, server.peak_connections());
}

#[tokio::test]
async fn pipelined_fetches_on_one_session_stay_paired() {
    let mut builder = MockServerBuilder::new();
    let mut expected = Vec::new();
    for i in 0..10u32 {
        let article = single_part_article(&payload(i as u8 + 100, 200), &format!("p{i}.bin"));
        builder = builder.article(&format!("p{i}@test"), article.clone());
        expected.push(article);
    }
    let server = builder.start().await;

    let pool = Arc::new(Pool::new(
        server.server_config(),
        PoolConfig {
            max_connections: 1,
            pipeline_depth: 10,
        },
    ));

    // all ten requests ride the single session concurrently
    let mut handles = Vec::new();
    for i in 0..10u32 {
        let pool = Arc::clone(&pool);
        handles.push(tokio::spawn(async move {
            let slot = pool.acquire().await.unwrap();
            let body = pool_fetch(&pool, slot, &format!("p{i}@test")).await;
            (i, body)
        }));
    }
    for handle in handles {
        let (i, body) = handle.await.unwrap();
        assert_eq!(body, expected[i as usize], "response pairing broke for request {i}");
    }
    assert_eq!(server.connections_opened(), 1);
}

async fn pool_fetch(pool: &Pool, slot: gonzbee::nntp::Slot, id: &str) -> Vec<u8> {
    let body = slot.fetch_body("alt.binaries.test", id).await.unwrap();
    pool.release(slot);
    body
}
