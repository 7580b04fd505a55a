//! HTTP ingress: tower middleware and the demo server.

mod layer;
mod server;

pub use layer::{rejection_response, request_context, GateLayer, GateService};
pub use server::HttpServer;
