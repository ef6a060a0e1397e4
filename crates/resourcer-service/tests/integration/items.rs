use std::time::Duration;

use chrono::TimeDelta;

use resourcer_service::cancelable::Cancelable;
use resourcer_service::requests::{RefreshRef, RequestResult};
use resourcer_test::ApiServer;

use crate::utils::{ItemRef, item_handler};

#[tokio::test]
async fn test_requests_are_deduplicated() {
    resourcer_test::setup();
    let server = ApiServer::new();
    let handler = item_handler(&server);

    let short = ItemRef::new("one", "short", TimeDelta::minutes(1));
    let long = ItemRef::new("one", "long", TimeDelta::hours(1));
    let first = handler.request(Some(short), RefreshRef::never());
    let second = handler.request(Some(long), RefreshRef::never());

    let result = first.settled().await;
    let item = result.data().unwrap();
    assert_eq!(item.owner, "long");
    assert_eq!(item.served, 1);
    assert!(matches!(second.get(), RequestResult::Success { .. }));
    assert_eq!(server.accesses(), 1);

    first.release();
    second.release();
    assert_eq!(handler.stale_len(), 1);
}

#[tokio::test]
async fn test_expired_token_is_refreshed_before_fetching() {
    resourcer_test::setup();
    let server = ApiServer::new();
    let handler = item_handler(&server);

    let expired = ItemRef::new("one", "stale", -TimeDelta::minutes(1));
    let refresh = RefreshRef::new(|| {
        Cancelable::resolved(Ok(ItemRef::new("one", "fresh", TimeDelta::hours(1))))
    });
    let handle = handler.request(Some(expired), refresh);

    let result = handle.settled().await;
    assert_eq!(result.data().unwrap().owner, "fresh");
    assert_eq!(server.all_hits(), [("/items/one".to_owned(), 1)]);
    handle.release();
}

#[tokio::test]
async fn test_rejected_token_is_refreshed() {
    resourcer_test::setup();
    let server = ApiServer::new();
    let handler = item_handler(&server);

    // looks valid, but is signed with a secret the server does not know
    let forged = ItemRef {
        id: "one".into(),
        token: jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &serde_json::json!({"sub": "mallory", "exp": chrono::Utc::now().timestamp() + 3600}),
            &jsonwebtoken::EncodingKey::from_secret(b"wrong secret"),
        )
        .unwrap(),
    };
    let refresh = RefreshRef::new(|| {
        Cancelable::resolved(Ok(ItemRef::new("one", "fresh", TimeDelta::hours(1))))
    });
    let handle = handler.request(Some(forged), refresh);

    let result = handle
        .data()
        .wait_for(|result| result.data().is_some())
        .await;
    assert_eq!(result.data().unwrap().owner, "fresh");
    assert_eq!(result.data().unwrap().served, 1);
    assert_eq!(server.accesses(), 2);
    handle.release();
}

#[tokio::test]
async fn test_missing_item_is_not_retried() {
    resourcer_test::setup();
    let server = ApiServer::new();
    let handler = item_handler(&server);

    let reference = ItemRef::new("missing", "alice", TimeDelta::hours(1));
    let handle = handler.request(Some(reference), RefreshRef::never());

    let result = handle.settled().await;
    assert_eq!(
        result.error(),
        Some(&resourcer_service::requests::RequestError::NotFound)
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.accesses(), 1);
    handle.release();
}

#[tokio::test]
async fn test_cleanup_after_eviction() {
    resourcer_test::setup();
    let server = ApiServer::new();
    let handler = item_handler(&server);

    let handle = handler.request(
        Some(ItemRef::new("one", "alice", TimeDelta::hours(1))),
        RefreshRef::never(),
    );
    let item = handle.settled().await.data().cloned().unwrap();
    handle.release();
    assert!(handler.driver().cleanups.lock().unwrap().is_empty());

    handler.evict_all();
    assert_eq!(*handler.driver().cleanups.lock().unwrap(), [item]);
}
