use super::Timeline;
use crate::errors::HlsError;
use bytes::Bytes;
use rtp::codecs::h264::H264Packet;
use rtp::packet::Packet;
use rtp::packetizer::Depacketizer;
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use webrtc_util::marshal::Unmarshal;

pub const CLOCK_RATE: u32 = 90_000;

#[derive(Debug, Error)]
pub enum H264Error {
    #[error("invalid RTP packet: {0}")]
    InvalidRtpPacket(String),

    #[error("unable to depacketize: {0}")]
    Depacketize(String),

    #[error("empty NAL unit")]
    EmptyNalu,
}

impl From<H264Error> for HlsError {
    fn from(err: H264Error) -> Self {
        HlsError::CodecError {
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitType {
    NonIdrPicture,
    IdrPicture,
    SupplementaryEnhancementInformation,
    SequenceParameterSet,
    PictureParameterSet,
    AccessUnitDelimiter,
    Other(u8),
}

impl UnitType {
    pub fn of(nalu: &[u8]) -> Result<Self, H264Error> {
        let first = nalu.first().ok_or(H264Error::EmptyNalu)?;
        Ok(match first & 0x1F {
            1 => Self::NonIdrPicture,
            5 => Self::IdrPicture,
            6 => Self::SupplementaryEnhancementInformation,
            7 => Self::SequenceParameterSet,
            8 => Self::PictureParameterSet,
            9 => Self::AccessUnitDelimiter,
            t => Self::Other(t),
        })
    }
}

/// Splits an Annex B byte stream into raw NAL units (start codes removed).
pub fn split_annex_b(data: &[u8]) -> Vec<Bytes> {
    let mut units = Vec::new();
    let mut start = match next_start_code(data, 0) {
        Some((pos, len)) => pos + len,
        None => return units,
    };

    loop {
        match next_start_code(data, start) {
            Some((pos, len)) => {
                if pos > start {
                    units.push(Bytes::copy_from_slice(&data[start..pos]));
                }
                start = pos + len;
            }
            None => {
                if start < data.len() {
                    units.push(Bytes::copy_from_slice(&data[start..]));
                }
                return units;
            }
        }
    }
}

fn next_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut zeros = 0;
    for i in from..data.len() {
        match data[i] {
            0 => zeros += 1,
            1 if zeros >= 2 => return Some((i - zeros, zeros + 1)),
            _ => zeros = 0,
        }
    }
    None
}

/// RTP H.264 depacketizer: one full RTP packet in, zero or more NAL units
/// plus the access unit PTS out. `Ok(None)` means the packet was a fragment
/// and more packets are needed.
pub struct RtpH264Depacketizer {
    inner: H264Packet,
    timeline: Timeline,
}

impl RtpH264Depacketizer {
    pub fn new() -> Self {
        Self {
            inner: H264Packet::default(),
            timeline: Timeline::new(CLOCK_RATE),
        }
    }

    pub fn decode(&mut self, packet: &[u8]) -> Result<Option<(Vec<Bytes>, Duration)>, H264Error> {
        let mut buf = packet;
        let packet = Packet::unmarshal(&mut buf)
            .map_err(|e| H264Error::InvalidRtpPacket(e.to_string()))?;

        let annex_b = self
            .inner
            .depacketize(&packet.payload)
            .map_err(|e| H264Error::Depacketize(e.to_string()))?;
        let pts = self.timeline.elapsed(packet.header.timestamp);

        if annex_b.is_empty() {
            return Ok(None);
        }

        let nalus = split_annex_b(&annex_b);
        if nalus.is_empty() {
            return Ok(None);
        }
        Ok(Some((nalus, pts)))
    }
}

const DTS_WINDOW: usize = 4;

/// Derives a non-decreasing DTS stream from PTS values that arrive in decode
/// order, where B-frames make PTS non-monotonic. The DTS is the minimum of a
/// short sliding PTS window, held non-decreasing and capped at the current
/// PTS.
pub struct DtsEstimator {
    recent: VecDeque<Duration>,
    prev: Option<Duration>,
}

impl DtsEstimator {
    pub fn new() -> Self {
        Self {
            recent: VecDeque::with_capacity(DTS_WINDOW),
            prev: None,
        }
    }

    pub fn feed(&mut self, pts: Duration) -> Duration {
        if self.recent.len() == DTS_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(pts);

        let mut dts = *self.recent.iter().min().unwrap();
        if let Some(prev) = self.prev {
            if dts < prev {
                dts = prev;
            }
        }
        if dts > pts {
            dts = pts;
        }
        self.prev = Some(dts);
        dts
    }
}

impl Default for DtsEstimator {
    fn default() -> Self {
        Self::new()
    }
}
