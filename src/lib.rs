//! storefront-sync - Realtime synchronization engine for a storefront client
//!
//! Keeps product and order state consistent with a backend that pushes row
//! changes, while letting the client apply optimistic writes ahead of
//! server confirmation.

pub mod cli;
pub mod observability;
pub mod realtime;
