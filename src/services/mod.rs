//! Services - business logic and state management
//!
//! - `engine` - Central orchestrator for joins, updates, SOS and expiry
//! - `zone_index` - Current hazard zone snapshot
//! - `zone_source` - Zone loading and periodic refresh
//! - `session_registry` - Active tourist sessions
//! - `containment` - Zone entry/exit with hysteresis and dwell
//! - `proximity` - Nearby-traveler lookup
//! - `dispatcher` - Alert fan-out to sessions, admins and the audit log
//! - `route_optimizer` - Waypoint ordering (simulated annealing + 2-opt)
//! - `optimizer_pool` - Worker pool running optimizations off the runtime

pub mod containment;
pub mod dispatcher;
pub mod engine;
pub mod optimizer_pool;
pub mod proximity;
pub mod route_optimizer;
pub mod session_registry;
pub mod zone_index;
pub mod zone_source;

// Re-export commonly used types
pub use dispatcher::AlertDispatcher;
pub use engine::SafetyEngine;
pub use optimizer_pool::OptimizerPool;
pub use zone_index::ZoneIndex;
