pub mod cache;
pub mod codec;
pub mod executor;
pub mod fault;
pub mod invocation;
pub mod metrics;
pub mod partition;
pub mod pipeline;
pub mod results;
pub mod retry;
pub mod table;
pub mod task;
pub mod transform;
pub mod worker;

/* --------- Re-exports usados por master, worker y client --------- */

pub use cache::{CacheStore, MemoryCacheStore};
pub use executor::QueryExecutor;
pub use fault::Fault;
pub use invocation::{
    InvocationId, InvocationInfo, InvocationRequest, InvocationStatus, QueuedInvocation,
    TaskOutcome,
};
pub use metrics::{MetricCatalog, MetricQuery};
pub use partition::Partition;
pub use pipeline::{TaskFailure, TaskWorker, WorkerContext};
pub use results::{CacheBatchEntry, CacheBatchRequest, CacheBatchResponse};
pub use retry::RetryPolicy;
pub use table::{Column, ColumnType, ResultSet, Table, TableSchema, Value};
pub use task::{Acknowledgment, CacheKey, EntityId, TaskIdentity, TaskInvocation};
pub use worker::{
    TaskAssignmentRequest, TaskAssignmentResponse, TaskCompleteRequest, TaskCompleteResponse,
    WorkerHeartbeatRequest, WorkerHeartbeatResponse, WorkerId, WorkerMetrics,
    WorkerRegisterRequest, WorkerRegisterResponse,
};
