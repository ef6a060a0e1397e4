use std::time::Duration;

use chrono::TimeDelta;
use reqwest::Client;

use resourcer_service::clock::ServerClock;
use resourcer_service::fetch::{HttpFetcher, HttpTimeProbe};
use resourcer_service::requests::RequestError;
use resourcer_test::{ApiServer, Item, make_jwt};

async fn fetch_item(server: &ApiServer, path: &str, token: Option<&str>) -> Result<Item, RequestError> {
    HttpFetcher::default().get_json(server.url(path), token).await
}

#[tokio::test]
async fn test_fetch_authorized_item() {
    resourcer_test::setup();
    let server = ApiServer::new();
    let token = make_jwt("alice", Some(chrono::Utc::now() + TimeDelta::minutes(5)));

    let item = fetch_item(&server, "items/one", Some(&token)).await.unwrap();
    assert_eq!(
        item,
        Item {
            id: "one".into(),
            owner: "alice".into(),
            served: 1,
        }
    );
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_status_mapping() {
    resourcer_test::setup();
    let server = ApiServer::new();

    let expired = make_jwt("alice", Some(chrono::Utc::now() - TimeDelta::minutes(5)));
    assert_eq!(
        fetch_item(&server, "items/one", Some(&expired)).await,
        Err(RequestError::Expired)
    );
    assert_eq!(
        fetch_item(&server, "items/one", None).await,
        Err(RequestError::Expired)
    );
    assert_eq!(
        fetch_item(&server, "items/missing", None).await,
        Err(RequestError::NotFound)
    );
    assert_eq!(
        fetch_item(&server, "respond_statuscode/403", None).await,
        Err(RequestError::PermissionDenied("403 Forbidden".into()))
    );
    assert_eq!(
        fetch_item(&server, "respond_statuscode/400", None).await,
        Err(RequestError::NotFound)
    );
    assert_eq!(
        fetch_item(&server, "respond_statuscode/429", None).await,
        Err(RequestError::RateLimited(Duration::from_secs(2)))
    );
    assert_eq!(
        fetch_item(&server, "respond_statuscode/503", None).await,
        Err(RequestError::FetchError("503 Service Unavailable".into()))
    );
    assert!(matches!(
        fetch_item(&server, "garbage", None).await,
        Err(RequestError::Malformed(_))
    ));
}

#[tokio::test]
async fn test_fetch_timeout() {
    resourcer_test::setup();
    let server = ApiServer::new();
    let fetcher = HttpFetcher::new(Client::new(), Duration::from_millis(100));

    let result = fetcher
        .get_json::<Item>(server.url("delay/2000"), None)
        .await;
    assert_eq!(result, Err(RequestError::Timeout(Duration::from_millis(100))));
}

#[tokio::test]
async fn test_canceled_fetch() {
    resourcer_test::setup();
    let server = ApiServer::new();

    let fetch = HttpFetcher::default().fetch_json::<Item>(server.url("delay/2000"), None);
    fetch.cancel();
    assert!(fetch.await.is_err());
}

#[tokio::test]
async fn test_server_clock_sync() {
    resourcer_test::setup();
    let server = ApiServer::with_clock_offset(TimeDelta::hours(1));
    let probe = HttpTimeProbe::new(HttpFetcher::default(), server.url("time"));
    let clock = ServerClock::new();

    let offset = clock.sync(&probe).await;
    assert!((offset - TimeDelta::hours(1)).abs() < TimeDelta::seconds(5));
    assert_eq!(clock.offset(), offset);
}

#[tokio::test]
async fn test_server_clock_sync_failure() {
    resourcer_test::setup();
    let server = ApiServer::new();
    let probe = HttpTimeProbe::new(HttpFetcher::default(), server.url("respond_statuscode/500"));
    let clock = ServerClock::new();

    assert_eq!(clock.sync(&probe).await, TimeDelta::zero());
}
