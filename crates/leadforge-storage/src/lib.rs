// Leadforge Storage - record, blob, and secret store adapters
//
// Everything the worker persists goes through the traits in this crate.
// The Postgres backend stores each record as a JSONB document keyed by id
// (last writer wins); the in-memory backends exist for tests and local dev.

pub mod blobs;
pub mod memory;
pub mod postgres;
pub mod records;
pub mod secrets;

pub use blobs::{BlobStore, MemoryBlobStore};
pub use memory::MemoryRecordStore;
pub use postgres::PostgresRecordStore;
pub use records::RecordStore;
pub use secrets::{EnvSecretProvider, SecretProvider, StaticSecretProvider};
