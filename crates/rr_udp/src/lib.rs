pub mod addr;
pub mod config;
pub mod dispatch;
pub mod packet;
pub mod peer;
pub mod queue;
pub mod server;
pub mod tlv;

pub use config::Config;
pub use queue::{ReplyQueue, Request};
pub use server::{put_udp, spawn_transport, ServerReply, Transport};

pub const REQUEST_RETRY_COUNT: u8 = 2;
pub const REQUEST_RETRY_INTERVAL: u8 = 5;
pub const DUPLICATE_INTERVAL: u8 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockType {
    Datagram,
}

/// The protocol record this transport exposes to the proxy core.
#[derive(Debug, Clone, Copy)]
pub struct ProtoDefs {
    pub name: &'static str,
    pub socktype: SockType,
    pub port_default: &'static str,
    pub retry_count_default: u8,
    pub retry_count_max: u8,
    pub retry_interval_default: u8,
    pub retry_interval_max: u8,
    pub duplicate_interval_default: u8,
}

pub const fn protodefs() -> ProtoDefs {
    ProtoDefs {
        name: "udp",
        socktype: SockType::Datagram,
        port_default: "1812",
        retry_count_default: REQUEST_RETRY_COUNT,
        retry_count_max: config::RETRY_COUNT_MAX,
        retry_interval_default: REQUEST_RETRY_INTERVAL,
        retry_interval_max: config::RETRY_INTERVAL_MAX,
        duplicate_interval_default: DUPLICATE_INTERVAL,
    }
}
