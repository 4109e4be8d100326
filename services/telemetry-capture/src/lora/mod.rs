//! LoRa mesh radio: HTTP client for the mesh daemon and the direct-mode gate

mod client;
mod direct;
mod types;

pub use client::{MeshClient, BROADCAST};
pub use direct::{check_gate, service_is_active, DirectRadio};
pub use types::{
    parse_messages, DaemonStatus, LinkState, LoraReading, MeshMessage, RadioLinkStatus, RadioParams,
    SUPPORTED_BANDWIDTHS,
};
