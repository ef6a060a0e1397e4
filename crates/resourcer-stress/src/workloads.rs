use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use resourcer_service::config::HandlerConfig;
use resourcer_service::requests::{
    ChainedMapper, ChainedOptions, RefreshRef, RequestHandle, RequestHandler, RequestResult,
    create_chained_request,
};
use resourcer_service::test::{MockDriver, TestData, TestRef};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    #[serde(flatten)]
    pub payload: Payload,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Payload {
    /// Requests pick one of this many resources at random.
    pub uids: usize,
    #[serde(default, with = "humantime_serde")]
    pub fetch_latency: Duration,
    /// The chance of a single fetch to fail.
    #[serde(default)]
    pub failure_rate: f64,
    /// How long a request is held once its data is available.
    #[serde(default, with = "humantime_serde")]
    pub hold: Duration,
    /// Derives the requested resource from another one instead of requesting it directly.
    #[serde(default)]
    pub chained: bool,
}

pub struct ParsedPayload {
    uids: usize,
    hold: Duration,
    chained: bool,
    upstream: RequestHandler<MockDriver>,
    downstream: RequestHandler<MockDriver>,
}

impl ParsedPayload {
    /// The number of fetches all handlers of this workload started so far.
    pub fn fetch_count(&self) -> usize {
        let upstream = self.upstream.driver().fetch_count();
        if self.chained {
            upstream + self.downstream.driver().fetch_count()
        } else {
            upstream
        }
    }
}

pub fn prepare_payload(handler_config: HandlerConfig, payload: Payload) -> ParsedPayload {
    let driver = || {
        MockDriver::new()
            .with_latency(payload.fetch_latency)
            .with_failure_rate(payload.failure_rate)
    };

    let mut downstream_config = handler_config.clone();
    downstream_config.name = format!("{}.chained", handler_config.name);

    ParsedPayload {
        uids: payload.uids.max(1),
        hold: payload.hold,
        chained: payload.chained,
        upstream: RequestHandler::new(driver(), handler_config),
        downstream: RequestHandler::new(driver(), downstream_config),
    }
}

pub async fn process_payload(payload: &ParsedPayload) {
    let uid = format!("resource-{}", rand::rng().random_range(0..payload.uids));

    let handle = if payload.chained {
        chained_request(payload, uid)
    } else {
        let reference = TestRef::new(uid);
        payload
            .upstream
            .request(Some(reference.clone()), RefreshRef::constant(reference))
    };

    let result = handle
        .data()
        .wait_for(|result| match result {
            RequestResult::Loading => false,
            RequestResult::Error { retry_at, .. } => retry_at.is_none(),
            _ => true,
        })
        .await;

    if matches!(result, RequestResult::Success { .. }) && !payload.hold.is_zero() {
        tokio::time::sleep(payload.hold).await;
    }

    handle.release();
}

fn chained_request(payload: &ParsedPayload, uid: String) -> RequestHandle<TestData> {
    let upstream = payload.upstream.clone();
    let create_previous = move || {
        let reference = TestRef::new(uid.clone());
        upstream.request(Some(reference.clone()), RefreshRef::constant(reference))
    };
    let mapper = ChainedMapper::sync(|data: &TestData| {
        Ok(TestRef::new(format!("derived-{}", data.uid)).with_version(data.version))
    });

    create_chained_request(
        create_previous,
        &payload.downstream,
        mapper,
        ChainedOptions::default(),
    )
}
