//! Everything that speaks the native Mumble protocol to an upstream server:
//! the TLS control channel (§4.4), the UDP/tunnel voice path (§4.5), and the
//! session that ties the two together (§4.6).

pub mod control;
pub mod session;
pub mod voice_client;
