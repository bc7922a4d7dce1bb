//! Schema Retriever Tests
//!
//! Request coalescing, negative caching, and failure fan-out, driven
//! against the in-memory catalog with its request counters.

use std::sync::Arc;
use std::time::Duration;

use thingtalk::ast::{ArgumentDef, ClassDef, Direction, FunctionDef, FunctionType};
use thingtalk::schema::{
    FunctionSelector, MemoryCatalog, RetrieverOptions, SchemaError, SchemaRetriever,
};
use thingtalk::types::Type;

fn example_class(kind: &str) -> ClassDef {
    let mut list = FunctionDef::new(
        kind,
        FunctionType::Query,
        "list",
        vec![ArgumentDef::new(Direction::Out, "item", Type::String)],
    );
    list.is_list = true;
    ClassDef::new(kind).with_query(list)
}

/// S5: two concurrent misses in one cooperative turn issue exactly one
/// outbound `getSchemas` covering both kinds.
#[tokio::test]
async fn concurrent_requests_coalesce_into_one_batch() {
    let catalog = Arc::new(
        MemoryCatalog::new()
            .with_class(example_class("com.a"))
            .with_class(example_class("com.b")),
    );
    let retriever = SchemaRetriever::new(catalog.clone());

    let (a, b) = tokio::join!(
        retriever.get_schema("com.a", FunctionSelector::Query, "list"),
        retriever.get_schema("com.b", FunctionSelector::Query, "list"),
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(catalog.schema_request_count(), 1);
    let requested = catalog.requested_kinds();
    let mut kinds = requested[0].clone();
    kinds.sort();
    assert_eq!(kinds, vec!["com.a".to_string(), "com.b".to_string()]);
}

/// Two waiters for the same kind observe the same resolved class.
#[tokio::test]
async fn same_kind_waiters_share_one_fetch() {
    let catalog = Arc::new(MemoryCatalog::new().with_class(example_class("com.a")));
    let retriever = SchemaRetriever::new(catalog.clone());

    let (a, b) = tokio::join!(
        retriever.get_class("com.a"),
        retriever.get_class("com.a"),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.kind, b.kind);
    assert_eq!(catalog.schema_request_count(), 1);
}

/// S6 / property 8: a missing class is cached negatively; within the TTL
/// no new fetch goes out, after it one does.
#[tokio::test]
async fn negative_cache_expires() {
    let catalog = Arc::new(MemoryCatalog::new());
    let retriever = SchemaRetriever::with_options(
        catalog.clone(),
        RetrieverOptions {
            cache_ttl: Duration::from_secs(3600),
            negative_ttl: Duration::from_millis(50),
        },
    );

    let err = retriever
        .get_schema("com.unknown", FunctionSelector::Query, "list")
        .await
        .unwrap_err();
    assert!(matches!(err, SchemaError::ClassNotFound(_)));
    assert_eq!(catalog.schema_request_count(), 1);

    // within the negative TTL: served from the cache, no new fetch
    let err = retriever
        .get_schema("com.unknown", FunctionSelector::Query, "list")
        .await
        .unwrap_err();
    assert!(matches!(err, SchemaError::ClassNotFound(_)));
    assert_eq!(catalog.schema_request_count(), 1);

    // after the TTL: the retriever asks again
    tokio::time::sleep(Duration::from_millis(80)).await;
    let _ = retriever
        .get_schema("com.unknown", FunctionSelector::Query, "list")
        .await
        .unwrap_err();
    assert_eq!(catalog.schema_request_count(), 2);
}

/// Transport failures fan out to every waiter of the batch and are not
/// cached, so the next request retries.
#[tokio::test]
async fn transport_errors_fail_all_waiters_uncached() {
    let catalog = Arc::new(MemoryCatalog::new().with_class(example_class("com.a")));
    catalog.fail_with("connection refused");
    let retriever = SchemaRetriever::new(catalog.clone());

    let (a, b) = tokio::join!(
        retriever.get_class("com.a"),
        retriever.get_class("com.b"),
    );
    assert!(matches!(a.unwrap_err(), SchemaError::Transport(_)));
    assert!(matches!(b.unwrap_err(), SchemaError::Transport(_)));
    assert_eq!(catalog.schema_request_count(), 1);

    // the failure was not cached; a healthy catalog serves the retry
    catalog.heal();
    retriever.get_class("com.a").await.unwrap();
    assert_eq!(catalog.schema_request_count(), 2);
}

/// A mixed batch: the known kind resolves, the unknown one is rejected,
/// in the same single fetch.
#[tokio::test]
async fn mixed_batch_splits_outcomes() {
    let catalog = Arc::new(MemoryCatalog::new().with_class(example_class("com.a")));
    let retriever = SchemaRetriever::new(catalog.clone());

    let (good, bad) = tokio::join!(
        retriever.get_class("com.a"),
        retriever.get_class("com.missing"),
    );
    assert!(good.is_ok());
    assert!(matches!(bad.unwrap_err(), SchemaError::ClassNotFound(_)));
    assert_eq!(catalog.schema_request_count(), 1);
}

/// Classes failing validation surface as per-class errors, while valid
/// classes from the same batch still resolve.
#[tokio::test]
async fn invalid_class_errors_are_per_kind() {
    let mut broken = FunctionDef::new(
        "com.broken",
        FunctionType::Query,
        "dup",
        vec![
            ArgumentDef::new(Direction::Out, "x", Type::Number),
            ArgumentDef::new(Direction::Out, "x", Type::Number),
        ],
    );
    broken.is_list = true;
    let catalog = Arc::new(
        MemoryCatalog::new()
            .with_class(example_class("com.a"))
            .with_class(ClassDef::new("com.broken").with_query(broken)),
    );
    let retriever = SchemaRetriever::new(catalog.clone());

    let (good, bad) = tokio::join!(
        retriever.get_class("com.a"),
        retriever.get_class("com.broken"),
    );
    assert!(good.is_ok());
    assert!(matches!(bad.unwrap_err(), SchemaError::Invalid { .. }));
    assert_eq!(catalog.schema_request_count(), 1);
}

/// A cache hit after a committed batch triggers no IO at all.
#[tokio::test]
async fn cache_hit_after_batch_commits() {
    let catalog = Arc::new(MemoryCatalog::new().with_class(example_class("com.a")));
    let retriever = SchemaRetriever::new(catalog.clone());

    retriever.get_class("com.a").await.unwrap();
    for _ in 0..5 {
        retriever.get_class("com.a").await.unwrap();
    }
    assert_eq!(catalog.schema_request_count(), 1);
}

/// `clear_cache` drops everything, `inject_class` survives nothing but
/// explicit removal.
#[tokio::test]
async fn cache_management() {
    let catalog = Arc::new(MemoryCatalog::new().with_class(example_class("com.a")));
    let retriever = SchemaRetriever::new(catalog.clone());

    retriever.inject_class(example_class("com.local")).unwrap();
    retriever.get_class("com.a").await.unwrap();
    retriever.clear_cache();

    // injected classes went with the cache wipe; the fetched one refetches
    assert!(retriever.get_class("com.local").await.is_err());
    retriever.get_class("com.a").await.unwrap();
    assert!(catalog.schema_request_count() >= 2);
}
