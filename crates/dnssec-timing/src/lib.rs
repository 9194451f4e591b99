#![warn(clippy::pedantic)]
// Don't care enough to fix
#![allow(clippy::match_same_arms)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::wildcard_imports)]

pub mod aggregator;
pub mod axfr;
pub mod config;
pub mod discovery;
pub mod domains;
pub mod executor;
pub mod nameserver;
pub mod net;
pub mod normalise;
pub mod pipeline;
pub mod pool;
pub mod report;
pub mod selector;
pub mod store;

#[cfg(test)]
pub mod test_util;
