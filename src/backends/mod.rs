//! The three concrete `SearchBackend` implementations (C5/C6/C7), each
//! gated behind its own Cargo feature since they pull in disjoint
//! third-party stacks.

#[cfg(feature = "embedded-backend")]
pub mod embedded;

#[cfg(feature = "server-backend")]
pub mod server;

#[cfg(feature = "columnar-backend")]
pub mod columnar;
