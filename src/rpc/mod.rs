//! The Engine-API JSON-RPC layer: authentication, the measured client, the
//! step executor and post-test calls.

pub(crate) mod client;
pub(crate) mod executor;
pub(crate) mod jwt;
pub(crate) mod post_test;
pub(crate) mod validate;
