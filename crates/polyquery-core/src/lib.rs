pub mod query;
pub mod storage;
pub mod adapter;
pub mod cache;
pub mod executor;
pub mod pagination;

pub use query::{QueryBuilder, SqlEmitter, Statement};
pub use adapter::{create_adapter, transaction_fn, DatabaseAdapter, QueryResult};
pub use cache::CacheLayer;
pub use executor::CachedExecutor;
pub use pagination::{PageRequest, PaginatedResult, Paginator};
pub use polyquery_common::{DbError, DbResult, EngineKind, SortDirection};
