pub mod backoff;
pub mod conflict;
pub mod error;
pub mod merge;
pub mod orchestrator;
pub mod platform;
pub mod policy;
pub mod pool;
pub mod queue;
pub mod realtime;
pub mod store;
pub mod telemetry;
pub mod transport;
pub mod types;

pub use backoff::BackoffConfig;
pub use conflict::{
	ConflictData, ConflictPrompt, ConflictResolver, ConflictResolverBuilder, ConflictRule, ConflictStrategy,
	ResolutionContext, ResolvedConflict, default_rules,
};
pub use error::{FailureKind, ResolverConfigError, StoreError, SyncError, TransportError, should_retry};
pub use merge::{detect_conflicts, merge_values};
pub use orchestrator::{
	PassOutcome, PassReport, SkipReason, SyncConfig, SyncEvent, SyncOrchestrator, SyncOrchestratorBuilder, SyncStats,
	SyncStatus,
};
pub use platform::{ActivitySignal, Clock, ManualClock, NetworkMonitor, NetworkStatus, ReadCache, TokioClock};
pub use policy::{AdaptiveConfig, AdaptivePolicy, FixedPolicy, PassObservation, SchedulePolicy};
pub use pool::TaskPool;
pub use queue::{EntryMeta, OperationQueue, QueueConfig, QueueStats};
pub use realtime::{ChangeEvent, ChangeNotification, ChannelEventSource, EventSource};
pub use store::{DurableStore, FileStore, MemoryStore};
pub use telemetry::{Metric, MetricCategory, TelemetrySink};
pub use transport::{HttpTransport, NetworkTransport, OperationResult, WireOperation};
pub use types::{NewOperation, OperationType, Priority, QueuedOperation, ResourceKind};
