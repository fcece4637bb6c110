//! orca-services: the market, transfer and job engines behind the daemon.

pub mod chunk_store;
pub mod dht;
pub mod directory;
pub mod jobs;
pub mod kad_dht;
pub mod market;
pub mod payment;
pub mod runner;
pub mod transfer;
pub mod validator;

pub use chunk_store::{ChunkStore, FileManifest};
pub use dht::{Dht, DhtError, MemoryDht, RecordValidator};
pub use directory::{NetProber, PeerDirectory, PeerInfo, PeerProber};
pub use jobs::{Job, JobError, JobManager, JobStatus};
pub use kad_dht::KadDht;
pub use market::{LocalHolder, MarketError, MarketService};
pub use payment::{LedgerPayments, PaymentError, PaymentGateway};
pub use runner::{JobRunner, RunnerSettings};
pub use transfer::{run_listener, serve_stream, TransferClient, TransferError};
pub use validator::{MarketValidator, ValidationError};
