//! The store API: persists replicated merged segments.

mod api;

pub use api::StoreApi;
