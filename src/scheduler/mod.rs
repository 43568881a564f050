//! Source scheduling: due-time computation, per-source exclusion, bounded
//! fetch dispatch and the daily maintenance trigger.

pub mod daily;
pub mod dispatch;
pub mod in_flight;
pub mod source;
pub mod source_scheduler;

pub use daily::DailyTrigger;
pub use dispatch::DispatchPool;
pub use in_flight::{InFlightGuard, InFlightTracker};
pub use source::{MAX_FETCH_INTERVAL_MINUTES, NewSource, Source, SourceId, is_due};
pub use source_scheduler::{SchedulerState, SourceScheduler};
