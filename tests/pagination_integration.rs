use futures_util::StreamExt;
use serde::Deserialize;
use wiremock::matchers::{method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

use restflow::{Paginator, RestConfig, RestRuntime, Route};

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct Entry {
    id: u64,
}

fn build_runtime(server: &MockServer) -> RestRuntime {
    RestRuntime::new(
        RestConfig::new(server.uri(), "restflow-test (v0)")
            .unwrap()
            .token("Bot test-token"),
    )
    .unwrap()
}

fn build_paginator(runtime: &RestRuntime) -> Paginator<Entry> {
    let route = Route::get("channels/{channel_id}/messages")
        .unwrap()
        .compile(&["111"])
        .unwrap();
    Paginator::new(
        runtime,
        1,
        100,
        50,
        |entry: &Entry| entry.id,
        move |cursor, limit| {
            let mut page = route.with_query_params(&[("limit", &limit.to_string())])?;
            if cursor != 0 {
                page = page.with_query_params(&[("before", &cursor.to_string())])?;
            }
            Ok(page)
        },
    )
}

/// Pages [{id:3},{id:2}], then [{id:1}], then [].
async fn mount_three_pages(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/channels/111/messages"))
        .and(query_param_is_missing("before"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("via", "1.1 gateway")
                .set_body_json(serde_json::json!([{"id": 3}, {"id": 2}])),
        )
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/channels/111/messages"))
        .and(query_param("before", "2"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("via", "1.1 gateway")
                .set_body_json(serde_json::json!([{"id": 1}])),
        )
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/channels/111/messages"))
        .and(query_param("before", "1"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("via", "1.1 gateway")
                .set_body_json(serde_json::json!([])),
        )
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_take_remaining_walks_all_pages() {
    let server = MockServer::start().await;
    mount_three_pages(&server).await;

    let runtime = build_runtime(&server);
    let mut paginator = build_paginator(&runtime);

    let entries = paginator.take_remaining(10).await.unwrap();
    let ids: Vec<u64> = entries.iter().map(|entry| entry.id).collect();
    assert_eq!(ids, vec![3, 2, 1]);

    // every seen entity is cached, the cursor sits on the oldest entry
    let cached_ids: Vec<u64> = paginator.cached().iter().map(|entry| entry.id).collect();
    assert_eq!(cached_ids, vec![3, 2, 1]);
    assert_eq!(paginator.last_key(), 1);

    // the tail is empty, nothing is emitted twice
    let more = paginator.take_remaining(10).await.unwrap();
    assert!(more.is_empty());
}

#[tokio::test]
async fn test_cache_is_never_emitted_twice() {
    let server = MockServer::start().await;
    mount_three_pages(&server).await;

    let runtime = build_runtime(&server);
    let mut paginator = build_paginator(&runtime);

    let mut seen: Vec<u64> = Vec::new();
    paginator
        .for_each_remaining(|entry| {
            seen.push(entry.id);
            true
        })
        .await
        .unwrap();

    let mut unique = seen.clone();
    unique.dedup();
    assert_eq!(seen, unique, "cached iteration must not repeat keys");
    assert_eq!(seen, vec![3, 2, 1]);
}

#[tokio::test]
async fn test_early_stop_records_resume_cursor() {
    let server = MockServer::start().await;
    mount_three_pages(&server).await;

    let runtime = build_runtime(&server);
    let mut paginator = build_paginator(&runtime);

    let mut first_pass: Vec<u64> = Vec::new();
    paginator
        .for_each_remaining(|entry| {
            first_pass.push(entry.id);
            first_pass.len() < 2
        })
        .await
        .unwrap();
    assert_eq!(first_pass, vec![3, 2]);

    // the second pass resumes right after the stop position
    let rest = paginator.take_remaining(10).await.unwrap();
    let ids: Vec<u64> = rest.iter().map(|entry| entry.id).collect();
    assert_eq!(ids, vec![1]);
}

#[tokio::test]
async fn test_stream_yields_all_entities() {
    let server = MockServer::start().await;
    mount_three_pages(&server).await;

    let runtime = build_runtime(&server);
    let mut paginator = build_paginator(&runtime);

    let ids: Vec<u64> = paginator
        .stream()
        .map(|entry| entry.unwrap().id)
        .collect()
        .await;
    assert_eq!(ids, vec![3, 2, 1]);
}

#[tokio::test]
async fn test_disabled_cache_keeps_nothing() {
    let server = MockServer::start().await;
    mount_three_pages(&server).await;

    let runtime = build_runtime(&server);
    let mut paginator = build_paginator(&runtime);
    paginator.cache(false);

    let entries = paginator.take_remaining(10).await.unwrap();
    assert_eq!(entries.len(), 3);
    assert!(paginator.cached().is_empty());
    assert_eq!(paginator.last_key(), 1);
}

#[tokio::test]
async fn test_skip_to_fetches_from_cursor() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/channels/111/messages"))
        .and(query_param("before", "2"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("via", "1.1 gateway")
                .set_body_json(serde_json::json!([{"id": 1}])),
        )
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/channels/111/messages"))
        .and(query_param("before", "1"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("via", "1.1 gateway")
                .set_body_json(serde_json::json!([])),
        )
        .mount(&server)
        .await;

    let runtime = build_runtime(&server);
    let mut paginator = build_paginator(&runtime);

    paginator.skip_to(2).unwrap();
    let entries = paginator.take_remaining(10).await.unwrap();
    let ids: Vec<u64> = entries.iter().map(|entry| entry.id).collect();
    assert_eq!(ids, vec![1]);
}

#[tokio::test]
async fn test_limit_is_passed_to_the_route() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/channels/111/messages"))
        .and(query_param("limit", "25"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("via", "1.1 gateway")
                .set_body_json(serde_json::json!([])),
        )
        .expect(1)
        .mount(&server)
        .await;

    let runtime = build_runtime(&server);
    let mut paginator = build_paginator(&runtime);
    paginator.limit(25).unwrap();

    let entries = paginator.take_remaining(10).await.unwrap();
    assert!(entries.is_empty());
}
