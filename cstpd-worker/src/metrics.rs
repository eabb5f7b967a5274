use std::sync::LazyLock;

use metrics::{Counter, counter};

static METRIC_CONNECTION_ACCEPTED: LazyLock<Counter> =
    LazyLock::new(|| counter!("connection_accepted"));
static METRIC_COOKIE_AUTH_FAILED: LazyLock<Counter> =
    LazyLock::new(|| counter!("cookie_auth_failed"));
static METRIC_HTTP_UNKNOWN_URL: LazyLock<Counter> = LazyLock::new(|| counter!("http_unknown_url"));
static METRIC_TUNNEL_ESTABLISHED: LazyLock<Counter> =
    LazyLock::new(|| counter!("tunnel_established"));
static METRIC_DTLS_ESTABLISHED: LazyLock<Counter> = LazyLock::new(|| counter!("dtls_established"));
static METRIC_DTLS_DISABLED: LazyLock<Counter> = LazyLock::new(|| counter!("dtls_disabled"));
static METRIC_MTU_SHRUNK: LazyLock<Counter> = LazyLock::new(|| counter!("mtu_shrunk"));
static METRIC_MTU_GROWN: LazyLock<Counter> = LazyLock::new(|| counter!("mtu_grown"));
static METRIC_DPD_TIMEOUT: LazyLock<Counter> = LazyLock::new(|| counter!("dpd_timeout"));
static METRIC_FRAME_REJECTED: LazyLock<Counter> = LazyLock::new(|| counter!("frame_rejected"));
static METRIC_UDP_INACTIVE: LazyLock<Counter> = LazyLock::new(|| counter!("udp_inactive"));
static METRIC_UDP_ACTIVE: LazyLock<Counter> = LazyLock::new(|| counter!("udp_active"));

/// A connection was handed to this worker.
pub(crate) fn connection_accepted() {
    METRIC_CONNECTION_ACCEPTED.increment(1);
}

/// The cookie oracle rejected a CONNECT.
pub(crate) fn cookie_auth_failed() {
    METRIC_COOKIE_AUTH_FAILED.increment(1);
}

/// A request named a URL outside the known table.
pub(crate) fn http_unknown_url() {
    METRIC_HTTP_UNKNOWN_URL.increment(1);
}

/// CONNECT negotiation completed; the data loop is starting.
pub(crate) fn tunnel_established() {
    METRIC_TUNNEL_ESTABLISHED.increment(1);
}

/// The resumed DTLS handshake completed.
pub(crate) fn dtls_established() {
    METRIC_DTLS_ESTABLISHED.increment(1);
}

/// DTLS was given up on for this connection.
pub(crate) fn dtls_disabled() {
    METRIC_DTLS_DISABLED.increment(1);
}

/// An oversized send halved the DTLS MTU estimate.
pub(crate) fn mtu_shrunk() {
    METRIC_MTU_SHRUNK.increment(1);
}

/// A full-sized send probed a larger DTLS MTU.
pub(crate) fn mtu_grown() {
    METRIC_MTU_GROWN.increment(1);
}

/// The peer stopped answering DPD.
pub(crate) fn dpd_timeout() {
    METRIC_DPD_TIMEOUT.increment(1);
}

/// A tunnel frame failed to parse.
pub(crate) fn frame_rejected() {
    METRIC_FRAME_REJECTED.increment(1);
}

/// Data moved to TLS while UDP was silent.
pub(crate) fn udp_inactive() {
    METRIC_UDP_INACTIVE.increment(1);
}

/// DTLS traffic resumed on an inactive channel.
pub(crate) fn udp_active() {
    METRIC_UDP_ACTIVE.increment(1);
}
