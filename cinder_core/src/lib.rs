pub mod cluster;
pub mod config;
pub mod corpus;
pub mod coverage;
pub mod input;
pub mod literals;
pub mod mutation;
pub mod mutator;
pub mod protocol;
pub mod runtime;
pub mod stats;
pub mod storage;
pub mod worker;

pub use cluster::{Cluster, ClusterError, ClusterOptions, ShutdownHandle};
pub use config::CinderConfig;
pub use corpus::{Corpus, PutOutcome};
pub use coverage::{CoverageMap, FlattenedCoverage};
pub use input::Input;
pub use mutation::Mutation;
pub use mutator::{MutationContext, Mutator};
pub use protocol::{Message, MessageKind, ProtocolError, WorkResult, WorkSummary};
pub use runtime::{Target, WorkerOptions, WorkerRuntime, run_worker};
pub use stats::{Stat, Stats};
pub use storage::{FileStorage, MemoryStorage, Storage, StorageError};
pub use worker::{EventSink, ProcessSpawner, Spawner, WorkerError, WorkerEvent, WorkerProcess};
