use super::Timeline;
use crate::errors::HlsError;
use bytes::{BufMut, Bytes, BytesMut};
use rtp::packet::Packet;
use std::time::Duration;
use thiserror::Error;
use webrtc_util::marshal::Unmarshal;

#[derive(Debug, Error)]
pub enum AacError {
    #[error("invalid RTP packet: {0}")]
    InvalidRtpPacket(String),

    #[error("not enough data: {0}")]
    NotEnoughData(&'static str),

    #[error("unsupported audio object type {0}")]
    UnsupportedObjectType(u8),

    #[error("unsupported frequency index {0}")]
    UnsupportedFrequencyIndex(u8),

    #[error("unsupported channel configuration {0}")]
    UnsupportedChannelConfiguration(u8),
}

impl From<AacError> for HlsError {
    fn from(err: AacError) -> Self {
        HlsError::CodecError {
            message: err.to_string(),
        }
    }
}

const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// Decoded MPEG-4 AudioSpecificConfig.
#[derive(Debug, Clone, Copy)]
pub struct AacConfig {
    pub object_type: u8,
    pub sampling_frequency_index: u8,
    pub sample_rate: u32,
    pub channel_configuration: u8,
}

impl AacConfig {
    /// Parses the two config bytes: 5 bits object type, 4 bits frequency
    /// index, 4 bits channel configuration.
    pub fn decode(data: &[u8]) -> Result<Self, AacError> {
        if data.len() < 2 {
            return Err(AacError::NotEnoughData("AudioSpecificConfig"));
        }

        let object_type = data[0] >> 3;
        match object_type {
            1..=4 => {}
            t => return Err(AacError::UnsupportedObjectType(t)),
        }

        let sampling_frequency_index = ((data[0] & 0x07) << 1) | (data[1] >> 7);
        let sample_rate = match SAMPLE_RATES.get(sampling_frequency_index as usize) {
            Some(rate) => *rate,
            None => return Err(AacError::UnsupportedFrequencyIndex(sampling_frequency_index)),
        };

        let channel_configuration = (data[1] >> 3) & 0x0F;
        if channel_configuration == 0 || channel_configuration > 7 {
            return Err(AacError::UnsupportedChannelConfiguration(
                channel_configuration,
            ));
        }

        Ok(Self {
            object_type,
            sampling_frequency_index,
            sample_rate,
            channel_configuration,
        })
    }

    /// Wraps one raw access unit into an ADTS frame.
    ///
    /// Header layout (7 bytes, protection absent):
    /// syncword | version | layer | protection | profile | frequency index |
    /// channel configuration | frame length | buffer fullness | frame count.
    pub fn adts_frame(&self, au: &[u8]) -> Vec<u8> {
        const SYNCWORD: u16 = 0xFFF0;
        const PROTECTION_ABSENCE: u16 = 0x0001;

        let mut tmp = Vec::with_capacity(7 + au.len());
        tmp.put_u16(SYNCWORD | PROTECTION_ABSENCE);

        let profile = (self.object_type - 1) << 6;
        let sampling_frequency_index = self.sampling_frequency_index << 2;
        let channel_configuration1 = (self.channel_configuration & 0x07) >> 2;
        tmp.put_u8(profile | sampling_frequency_index | channel_configuration1);

        let channel_configuration2 = (self.channel_configuration & 0x03) << 6;
        let frame_length = (au.len() + 7) as u16;
        let frame_length1 = ((frame_length & 0x1FFF) >> 11) as u8;
        tmp.put_u8(channel_configuration2 | frame_length1);

        let frame_length2 = (frame_length & 0x7FF) << 5;
        tmp.put_u16(frame_length2 | 0b0000_0000_0001_1111);

        tmp.put_u8(0b1111_1100);

        tmp.extend_from_slice(au);
        tmp
    }
}

/// RTP AAC depacketizer for the RFC 3640 AU-header payload format.
///
/// One full RTP packet in, zero or more raw access units plus the PTS of the
/// first one out. An access unit fragmented across packets is buffered until
/// the packet carrying the RTP marker completes it; `Ok(None)` is returned
/// in the meantime.
pub struct RtpAacDepacketizer {
    timeline: Timeline,
    fragment: BytesMut,
}

impl RtpAacDepacketizer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            timeline: Timeline::new(sample_rate),
            fragment: BytesMut::new(),
        }
    }

    pub fn decode(&mut self, packet: &[u8]) -> Result<Option<(Vec<Bytes>, Duration)>, AacError> {
        let mut buf = packet;
        let packet =
            Packet::unmarshal(&mut buf).map_err(|e| AacError::InvalidRtpPacket(e.to_string()))?;
        let payload = &packet.payload;
        let pts = self.timeline.elapsed(packet.header.timestamp);

        if payload.len() < 2 {
            return Err(AacError::NotEnoughData("AU headers length"));
        }
        let headers_bits = u16::from_be_bytes([payload[0], payload[1]]) as usize;
        let headers_len = (headers_bits + 7) / 8;
        if headers_len == 0 || headers_len % 2 != 0 {
            return Err(AacError::NotEnoughData("AU headers"));
        }
        if payload.len() < 2 + headers_len {
            return Err(AacError::NotEnoughData("AU headers"));
        }

        let mut sizes = Vec::with_capacity(headers_len / 2);
        for chunk in payload[2..2 + headers_len].chunks_exact(2) {
            let header = u16::from_be_bytes([chunk[0], chunk[1]]);
            sizes.push((header >> 3) as usize);
        }

        let mut data = &payload[2 + headers_len..];

        // A single AU larger than its packet is a fragment; accumulate until
        // the marker closes it.
        if sizes.len() == 1 && (sizes[0] > data.len() || !self.fragment.is_empty()) {
            self.fragment.extend_from_slice(data);
            if !packet.header.marker {
                return Ok(None);
            }
            let au = self.fragment.split().freeze();
            return Ok(Some((vec![au], pts)));
        }

        let mut aus = Vec::with_capacity(sizes.len());
        for size in sizes {
            if data.len() < size {
                return Err(AacError::NotEnoughData("access unit"));
            }
            aus.push(Bytes::copy_from_slice(&data[..size]));
            data = &data[size..];
        }
        Ok(Some((aus, pts)))
    }
}
