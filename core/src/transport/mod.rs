// Server transports: expose emitter subscriptions to remote clients
//
// - sse: long-lived HTTP response body in text/event-stream format
// - socket: framed duplex connections with ping/pong liveness

pub mod socket;
pub mod sse;
