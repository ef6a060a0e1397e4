use std::cmp::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use url::Url;

use resourcer_service::cancelable::Cancelable;
use resourcer_service::config::HandlerConfig;
use resourcer_service::fetch::HttpFetcher;
use resourcer_service::jwt::{compare_jwt_lifetimes, is_jwt_expired};
use resourcer_service::requests::{RequestDriver, RequestError, RequestHandler};
use resourcer_test::{ApiServer, Item, make_jwt};

/// Points at an item of the [`ApiServer`], authorized with a bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemRef {
    pub id: String,
    pub token: String,
}

impl ItemRef {
    /// A reference with a token for `owner`, valid for `valid_for` from now.
    pub fn new(id: &str, owner: &str, valid_for: TimeDelta) -> Self {
        Self {
            id: id.to_owned(),
            token: make_jwt(owner, Some(Utc::now() + valid_for)),
        }
    }
}

/// Fetches [`Item`]s from an [`ApiServer`].
pub struct ItemDriver {
    base: Url,
    fetcher: HttpFetcher,
    pub cleanups: Arc<Mutex<Vec<Item>>>,
}

impl ItemDriver {
    pub fn new(server: &ApiServer) -> Self {
        Self {
            base: server.url("items/"),
            fetcher: HttpFetcher::default(),
            cleanups: Default::default(),
        }
    }
}

impl RequestDriver for ItemDriver {
    type Ref = ItemRef;
    type Data = Item;

    fn ref_uid(&self, reference: &ItemRef) -> String {
        reference.id.clone()
    }

    fn fetch(&self, reference: ItemRef) -> Cancelable<Result<Item, RequestError>> {
        match self.base.join(&reference.id) {
            Ok(url) => self.fetcher.fetch_json(url, Some(reference.token)),
            Err(err) => Cancelable::resolved(Err(RequestError::Malformed(err.to_string()))),
        }
    }

    fn compare_refs(&self, a: &ItemRef, b: &ItemRef) -> Ordering {
        compare_jwt_lifetimes(&a.token, &b.token)
    }

    fn is_expired(&self, reference: &ItemRef, now: DateTime<Utc>) -> bool {
        is_jwt_expired(&reference.token, now)
    }

    fn cleanup_data(&self, data: Item) {
        self.cleanups.lock().unwrap().push(data);
    }
}

/// A handler for items which retries quickly.
pub fn item_handler(server: &ApiServer) -> RequestHandler<ItemDriver> {
    let mut config = HandlerConfig::named("items");
    config.retry.initial_backoff = Duration::from_millis(10);
    config.retry.jitter = 0.0;
    RequestHandler::new(ItemDriver::new(server), config)
}
