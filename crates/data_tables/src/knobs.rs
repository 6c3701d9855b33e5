//! Tunable parameters for the table client.
//!
//! Every knob can be overridden with an environment variable of the same
//! name.
#![deny(missing_docs)]

use std::sync::LazyLock;

use cmd_util::env::env_config;

/// DNS suffix appended to the account name to build the table service
/// endpoint. Override it to target sovereign clouds, eg
/// `table.core.chinacloudapi.cn`.
pub static TABLE_ENDPOINT_SUFFIX: LazyLock<String> = LazyLock::new(|| {
    env_config(
        "TABLE_ENDPOINT_SUFFIX",
        String::from("table.core.windows.net"),
    )
});

/// API version sent to the managed identity endpoint when requesting a token.
pub static MANAGED_IDENTITY_API_VERSION: LazyLock<String> = LazyLock::new(|| {
    env_config(
        "MANAGED_IDENTITY_API_VERSION",
        String::from("2019-08-01"),
    )
});

/// Sorted queries read the whole result set into memory before sorting. Log a
/// warning when a sorted query pulls more rows than this.
pub static QUERY_SORT_WARN_THRESHOLD: LazyLock<usize> =
    LazyLock::new(|| env_config("QUERY_SORT_WARN_THRESHOLD", 10_000));
