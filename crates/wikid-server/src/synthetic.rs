//! Tiddlers the server generates per request instead of storing.

use std::net::SocketAddr;

use chrono::{DateTime, SecondsFormat, Utc};
use wikid_types::titles::{CLIENT_IP, SYNC_TIME};
use wikid_types::Tiddler;

/// `$:/sync-time`: the server clock at request time.
pub fn sync_time(now: DateTime<Utc>) -> Tiddler {
    Tiddler::synthetic(SYNC_TIME, now.to_rfc3339_opts(SecondsFormat::Nanos, true))
}

/// `$:/client-ip`: the peer address as seen by the server.
pub fn client_ip(addr: Option<SocketAddr>) -> Tiddler {
    let text = addr.map(|a| a.ip().to_string()).unwrap_or_default();
    Tiddler::synthetic(CLIENT_IP, text)
}

/// The generated tiddler called `title`, if there is one.
pub fn generate(title: &str, now: DateTime<Utc>, addr: Option<SocketAddr>) -> Option<Tiddler> {
    match title {
        SYNC_TIME => Some(sync_time(now)),
        CLIENT_IP => Some(client_ip(addr)),
        _ => None,
    }
}

/// Everything appended to a listing.
pub fn all(now: DateTime<Utc>, addr: Option<SocketAddr>) -> Vec<Tiddler> {
    vec![sync_time(now), client_ip(addr)]
}
