pub mod auth;
pub mod client;
pub mod config;
pub mod errors;
pub mod hls;
pub mod manager;
pub mod metrics;
pub mod segment;
pub mod transport;
pub mod transport_stream;

mod codec;

pub use codec::aac;
pub use codec::h264;

type PathName = String;

pub use self::{
    manager::PathManager,
    transport::{frame_channel, request_channel, FramePacket, Track, TrackParams},
};
