//! Observability for the rendezvous service.
//!
//! All instrumentation uses `#[instrument(skip_all)]` with explicit field
//! allow-listing. Usernames and message content are never logged or used as
//! labels.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `rv_connections_active` | Gauge | none | Registered client channels |
//! | `rv_queue_depth` | Gauge | none | Waiting search tickets |
//! | `rv_matches_total` | Counter | `result` | Pairing attempt outcomes |
//! | `rv_matching_head_blocked_total` | Counter | `reason` | Incompatible head pairs |
//! | `rv_rooms_ended_total` | Counter | `reason` | Room endings by path |
//! | `rv_calls_total` | Counter | `outcome` | Call terminations |
//! | `rv_call_duration_seconds` | Histogram | none | Accepted call length |
//! | `rv_signal_relay_total` | Counter | `kind`, `result` | Offer/answer/candidate relay |
//! | `rv_negotiations_total` | Counter | `outcome` | Continuation vote results |
//! | `rv_errors_total` | Counter | `error_type` | Errors returned to clients |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
