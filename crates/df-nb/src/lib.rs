//! Northbound store access for the Dragonflow local controller.
//!
//! [`NbApi`] is the backend-agnostic contract. [`KvNbDriver`] implements it
//! over any [`KvBackend`] (etcd v2 or in-memory), and [`WatchLoop`] turns the
//! backend's change stream into ordered lifecycle callbacks on an
//! [`NbEventSink`].

pub mod api;
pub mod backend;
pub mod driver;
pub mod error;
pub mod etcd;
pub mod memory;
pub mod watch;

pub use api::{deliver_delete, deliver_upsert, NbApi, NbEventSink};
pub use backend::{KvBackend, KvEntry, KvListing, Mutation, MutationAction};
pub use driver::{DriverConfig, KvNbDriver, UpdatePolicy};
pub use error::{classify, BackendError, ErrorClass, NbError, Result};
pub use etcd::{EtcdBackend, EtcdConfig};
pub use memory::MemoryBackend;
pub use watch::{parse_key, WatchLoop};
