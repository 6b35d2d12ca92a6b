//! Persistence layer for signup records and the position counter
//!
//! This module provides:
//! - [`SignupStore`] trait: the transactional boundary every writer goes through
//! - [`InMemorySignupStore`] for dev mode and testing
//! - [`PostgresSignupStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemorySignupStore;
pub use postgres::PostgresSignupStore;
pub use store::{
    AllocationDecision, CounterDecision, NewSignup, Page, PositionAssignment, PositionCounter,
    PositionUpdate, SignupCursor, SignupFilter, SignupRecord, SignupRole, SignupStore, StoreError,
    TransactionRejection, MAX_BATCH_WRITES,
};
