//! Edge transport for device-to-device offloading.
//!
//! An edge data unit is a set of string info fields plus an ordered list of
//! checksummed byte blobs. The transport seam is the `EdgeLink` trait; the
//! `tcp` module implements it with length-prefixed bincode frames.

pub mod data;
pub mod tcp;
pub mod transport;

pub use data::EdgeData;
pub use tcp::{TcpEdge, TcpEdgeFactory};
pub use transport::{ConnectType, EdgeCallback, EdgeEvent, EdgeFactory, EdgeLink, EdgeRole};
