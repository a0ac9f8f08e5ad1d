//! File naming scheme of the rendezvous directory.
//!
//! Everything a port owns shares the decimal port number as prefix:
//!
//! ```text
//! 7777                      listener sentinel
//! 7777_<uuid>               connection marker; also the session name
//! 7777_<uuid>_out           connector-to-listener region
//! 7777_<uuid>_in            listener-to-connector region
//! 7777_<uuid>_client.lock   held by the connector while alive
//! 7777_<uuid>_server.lock   held by the listener side while alive
//! 7777_<uuid>_client_ack    connector's handshake acknowledgement
//! ```

use uuid::Uuid;

/// Listener sentinel file name for `port`.
pub fn sentinel(port: u16) -> String {
    port.to_string()
}

/// Name prefix shared by every session file of `port`. The trailing
/// underscore keeps port 7 from matching port 77's files.
pub fn port_prefix(port: u16) -> String {
    format!("{port}_")
}

/// Fresh marker (and session) name for `port`.
pub fn new_session(port: u16) -> String {
    format!("{port}_{}", Uuid::new_v4())
}

/// Whether `name` is a connection marker for `port`.
pub fn is_marker(name: &str, port: u16) -> bool {
    name.strip_prefix(&format!("{port}_"))
        .is_some_and(|rest| Uuid::parse_str(rest).is_ok())
}

/// Connector-to-listener region file name.
pub fn outbound(session: &str) -> String {
    format!("{session}_out")
}

/// Listener-to-connector region file name.
pub fn inbound(session: &str) -> String {
    format!("{session}_in")
}

/// Liveness lock held by the connector.
pub fn client_lock(session: &str) -> String {
    format!("{session}_client.lock")
}

/// Liveness lock held by the listener side.
pub fn server_lock(session: &str) -> String {
    format!("{session}_server.lock")
}

/// Handshake acknowledgement dropped by the connector.
pub fn client_ack(session: &str) -> String {
    format!("{session}_client_ack")
}
