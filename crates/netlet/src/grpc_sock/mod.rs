//! A client/server implementation using UNIX sockets for gRPC, meant for use
//! with tonic. Socket support is not built in to tonic, so this small module
//! owns the listener plumbing for the plugin sockets the driver serves, and
//! the connector the tests use to call them.

pub mod client;
pub mod server;
