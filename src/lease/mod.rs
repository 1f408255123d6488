pub mod redis_store;
pub mod renewal;
pub mod store;

pub use redis_store::RedisLeaseStore;
pub use renewal::{LeaseFailure, LeaseRenewalRecord, LeaseRenewalService};
pub use store::{InMemoryLeaseStore, LeaseRenewalOutcome, LeaseStore};
