//! `meshfs`: a decentralized P2P file-service node.
//!
//! Files are segmented, Reed-Solomon coded, AES-GCM encrypted per segment,
//! and the master key split 2-of-3 via Shamir secret sharing; each segment
//! is wrapped in a self-describing container and handed to peers over
//! libp2p. See the module docs below for the component breakdown.

pub mod config;
pub mod container;
pub mod crypto;
pub mod dispatcher;
pub mod distribution;
pub mod download_engine;
pub mod error;
pub mod hashcodec;
pub mod keys;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod network;
pub mod network_actor;
pub mod pubsub;
pub mod quorum;
pub mod resilience;
pub mod store;
pub mod task_controller;
pub mod upload_engine;

pub use config::Config;
pub use download_engine::{DownloadEngine, DownloadEvent, DownloadOptions};
pub use error::{MeshError, MeshResult};
pub use keys::OwnerKey;
pub use network_actor::NetworkHandle;
pub use store::Store;
pub use task_controller::TaskController;
pub use upload_engine::{UploadEngine, UploadEvent, UploadOptions};
