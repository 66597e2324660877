//! Metric name constants.
//!
//! Counters are emitted through the `metrics` facade; whether they go
//! anywhere is up to the embedding application's recorder.

/// Connections whose reader/writer tasks were started.
pub const CONNECTIONS_OPENED_TOTAL: &str = "nswire_connections_opened_total";

/// Connections whose close cascade completed.
pub const CONNECTIONS_CLOSED_TOTAL: &str = "nswire_connections_closed_total";

/// Broadcast frames dropped because a peer's send queue was full.
pub const BROADCAST_DROPS_TOTAL: &str = "nswire_broadcast_drops_total";

/// Peers disconnected for exhausting their broadcast-drop budget.
pub const SLOW_PEER_CLOSES_TOTAL: &str = "nswire_slow_peer_closes_total";

/// Handler errors surfaced during dispatch.
pub const DISPATCH_ERRORS_TOTAL: &str = "nswire_dispatch_errors_total";

/// Replies that arrived after their wait slot was already resolved.
pub const ORPHAN_REPLIES_TOTAL: &str = "nswire_orphan_replies_total";

/// Inbound frames that failed envelope decoding.
pub const DECODE_ERRORS_TOTAL: &str = "nswire_decode_errors_total";
