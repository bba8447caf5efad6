pub mod context;
pub mod index_info;
pub mod index_match;
pub mod intersector;
pub mod key;
pub mod node;
pub mod pool;

pub use context::StreamContext;
pub use index_info::{IndexInfo, UNBOUNDED};
pub use index_match::{Combinator, IndexMatch};
pub use intersector::{AncestorUidIntersector, DefaultUidIntersector, UidIntersector};
pub use node::{MarkerKind, QueryNode, TermOp};
pub use pool::WorkerPool;
