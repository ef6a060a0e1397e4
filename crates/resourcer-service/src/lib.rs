#[macro_use]
pub mod metrics;

pub mod cancelable;
pub mod clock;
pub mod config;
pub mod fetch;
pub mod jwt;
pub mod logging;
pub mod observable;
pub mod requests;
pub mod utils;

#[cfg(any(feature = "test", test))]
#[allow(unused)]
pub mod test;
