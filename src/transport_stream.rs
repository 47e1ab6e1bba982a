use crate::errors::{HlsError, Result};
use bytes::Bytes;
use mpeg2ts::es::{StreamId, StreamType};
use mpeg2ts::pes::PesHeader;
use mpeg2ts::time::{ClockReference, Timestamp};
use mpeg2ts::ts::payload::{Bytes as TsBytes, Pat, Pes, Pmt};
use mpeg2ts::ts::{
    AdaptationField, ContinuityCounter, EsInfo, Pid, ProgramAssociation, TsHeader, TsPacket,
    TsPacketWriter, TsPayload, TransportScramblingControl, VersionNumber, WriteTsPacket,
};
use std::time::Duration;

const PAT_PID: u16 = 0;
const PMT_PID: u16 = 256;
const VIDEO_PID: u16 = 257;
const AUDIO_PID: u16 = 258;
const VIDEO_STREAM_ID: u8 = 224;
const AUDIO_STREAM_ID: u8 = 192;

/// First PES chunk size; the rest of the TS packet is taken up by the
/// adaptation field and PES header.
const PES_FIRST_CHUNK: usize = 153;

const ACCESS_UNIT_DELIMITER: [u8; 6] = [0x00, 0x00, 0x00, 0x01, 0x09, 0xF0];
const NALU_START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

fn mux_err<E: std::fmt::Display>(e: E) -> HlsError {
    HlsError::MuxError {
        message: e.to_string(),
    }
}

fn ts_ticks(d: Duration) -> u64 {
    d.as_nanos() as u64 * 9 / 100_000
}

/// Packetizes H.264 access units and ADTS audio frames into MPEG-TS for one
/// segment. Every call returns the raw 188-byte-aligned packet bytes so the
/// caller decides where they accumulate.
pub struct TsMuxer {
    has_video: bool,
    has_audio: bool,
    video_continuity_counter: ContinuityCounter,
    audio_continuity_counter: ContinuityCounter,
    pcr: Option<ClockReference>,
}

impl TsMuxer {
    pub fn new(has_video: bool, has_audio: bool) -> Self {
        Self {
            has_video,
            has_audio,
            video_continuity_counter: ContinuityCounter::new(),
            audio_continuity_counter: ContinuityCounter::new(),
            pcr: None,
        }
    }

    /// Program clock reference for subsequent packets, as elapsed stream time.
    pub fn set_pcr(&mut self, elapsed: Duration) -> Result<()> {
        self.pcr = Some(ClockReference::new(ts_ticks(elapsed)).map_err(mux_err)?);
        Ok(())
    }

    /// PAT and PMT packets; written once at the head of every segment.
    pub fn tables(&self) -> Result<Vec<u8>> {
        let pat = TsPacket {
            header: default_header(PAT_PID)?,
            adaptation_field: None,
            payload: Some(TsPayload::Pat(Pat {
                transport_stream_id: 1,
                version_number: VersionNumber::default(),
                table: vec![ProgramAssociation {
                    program_num: 1,
                    program_map_pid: Pid::new(PMT_PID).map_err(mux_err)?,
                }],
            })),
        };

        let mut table = Vec::new();
        if self.has_video {
            table.push(EsInfo {
                stream_type: StreamType::H264,
                elementary_pid: Pid::new(VIDEO_PID).map_err(mux_err)?,
                descriptors: vec![],
            });
        }
        if self.has_audio {
            table.push(EsInfo {
                stream_type: StreamType::AdtsAac,
                elementary_pid: Pid::new(AUDIO_PID).map_err(mux_err)?,
                descriptors: vec![],
            });
        }
        let pcr_pid = if self.has_video { VIDEO_PID } else { AUDIO_PID };
        let pmt = TsPacket {
            header: default_header(PMT_PID)?,
            adaptation_field: None,
            payload: Some(TsPayload::Pmt(Pmt {
                program_num: 1,
                pcr_pid: Some(Pid::new(pcr_pid).map_err(mux_err)?),
                version_number: VersionNumber::default(),
                program_info: vec![],
                es_info: table,
            })),
        };

        let mut out = Vec::new();
        let mut writer = TsPacketWriter::new(&mut out);
        writer.write_ts_packet(&pat).map_err(mux_err)?;
        writer.write_ts_packet(&pmt).map_err(mux_err)?;
        drop(writer);
        Ok(out)
    }

    /// One H.264 access unit. NAL units are framed in Annex B behind an
    /// access unit delimiter; the first packet carries PTS/DTS and, on the
    /// PCR PID, the last clock reference.
    pub fn mux_h264(
        &mut self,
        dts: Duration,
        pts: Duration,
        idr: bool,
        nalus: &[Bytes],
    ) -> Result<Vec<u8>> {
        let mut es = Vec::new();
        es.extend_from_slice(&ACCESS_UNIT_DELIMITER);
        for nalu in nalus {
            es.extend_from_slice(&NALU_START_CODE);
            es.extend_from_slice(nalu);
        }

        let adaptation_field = Some(AdaptationField {
            discontinuity_indicator: false,
            random_access_indicator: idr,
            es_priority_indicator: false,
            pcr: self.pcr,
            opcr: None,
            splice_countdown: None,
            transport_private_data: Vec::new(),
            extension: None,
        });

        let pes_header = PesHeader {
            stream_id: StreamId::new(VIDEO_STREAM_ID),
            priority: false,
            data_alignment_indicator: false,
            copyright: false,
            original_or_copy: false,
            pts: Some(Timestamp::new(ts_ticks(pts)).map_err(mux_err)?),
            dts: Some(Timestamp::new(ts_ticks(dts)).map_err(mux_err)?),
            escr: None,
        };

        let mut counter = self.video_continuity_counter;
        let out = write_pes(VIDEO_PID, &mut counter, adaptation_field, pes_header, &es)?;
        self.video_continuity_counter = counter;
        Ok(out)
    }

    /// One ADTS-framed AAC access unit.
    pub fn mux_aac(&mut self, pts: Duration, adts_frame: &[u8]) -> Result<Vec<u8>> {
        let adaptation_field = if self.has_video {
            None
        } else {
            // audio carries the clock when it is the only track
            Some(AdaptationField {
                discontinuity_indicator: false,
                random_access_indicator: false,
                es_priority_indicator: false,
                pcr: self.pcr,
                opcr: None,
                splice_countdown: None,
                transport_private_data: Vec::new(),
                extension: None,
            })
        };

        let pes_header = PesHeader {
            stream_id: StreamId::new(AUDIO_STREAM_ID),
            priority: false,
            data_alignment_indicator: false,
            copyright: false,
            original_or_copy: false,
            pts: Some(Timestamp::new(ts_ticks(pts)).map_err(mux_err)?),
            dts: None,
            escr: None,
        };

        let mut counter = self.audio_continuity_counter;
        let out = write_pes(
            AUDIO_PID,
            &mut counter,
            adaptation_field,
            pes_header,
            adts_frame,
        )?;
        self.audio_continuity_counter = counter;
        Ok(out)
    }
}

fn default_header(pid: u16) -> Result<TsHeader> {
    Ok(TsHeader {
        transport_error_indicator: false,
        transport_priority: false,
        pid: Pid::new(pid).map_err(mux_err)?,
        transport_scrambling_control: TransportScramblingControl::NotScrambled,
        continuity_counter: ContinuityCounter::new(),
    })
}

fn write_pes(
    pid: u16,
    counter: &mut ContinuityCounter,
    adaptation_field: Option<AdaptationField>,
    pes_header: PesHeader,
    mut es: &[u8],
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut writer = TsPacketWriter::new(&mut out);

    let mut header = default_header(pid)?;
    header.continuity_counter = *counter;

    let first_len = es.len().min(PES_FIRST_CHUNK);
    let packet = TsPacket {
        header: header.clone(),
        adaptation_field,
        payload: Some(TsPayload::Pes(Pes {
            header: pes_header,
            pes_packet_len: 0,
            data: TsBytes::new(&es[..first_len]).map_err(mux_err)?,
        })),
    };
    writer.write_ts_packet(&packet).map_err(mux_err)?;
    header.continuity_counter.increment();
    es = &es[first_len..];

    while !es.is_empty() {
        let len = es.len().min(TsBytes::MAX_SIZE);
        let packet = TsPacket {
            header: header.clone(),
            adaptation_field: None,
            payload: Some(TsPayload::Raw(TsBytes::new(&es[..len]).map_err(mux_err)?)),
        };
        writer.write_ts_packet(&packet).map_err(mux_err)?;
        header.continuity_counter.increment();
        es = &es[len..];
    }
    drop(writer);

    *counter = header.continuity_counter;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TS_PACKET_LEN: usize = 188;

    #[test]
    fn test_tables_are_packet_aligned() {
        let muxer = TsMuxer::new(true, true);
        let tables = muxer.tables().unwrap();
        assert_eq!(tables.len(), 2 * TS_PACKET_LEN);
        assert_eq!(tables[0], 0x47);
        assert_eq!(tables[TS_PACKET_LEN], 0x47);
    }

    #[test]
    fn test_mux_h264_alignment_and_continuity() {
        let mut muxer = TsMuxer::new(true, false);
        muxer.set_pcr(Duration::from_millis(40)).unwrap();

        let nalu = Bytes::from(vec![0x65; 1000]);
        let first = muxer
            .mux_h264(
                Duration::from_secs(2),
                Duration::from_secs(2),
                true,
                &[nalu.clone()],
            )
            .unwrap();
        assert_eq!(first.len() % TS_PACKET_LEN, 0);
        assert!(first.len() / TS_PACKET_LEN >= 2);
        for chunk in first.chunks(TS_PACKET_LEN) {
            assert_eq!(chunk[0], 0x47);
        }

        // the counter continues across access units
        let second = muxer
            .mux_h264(
                Duration::from_millis(2040),
                Duration::from_millis(2040),
                false,
                &[nalu],
            )
            .unwrap();
        let first_cc = first[3] & 0x0F;
        let second_cc = second[3] & 0x0F;
        let packets_in_first = (first.len() / TS_PACKET_LEN) as u8;
        assert_eq!((first_cc + packets_in_first) % 16, second_cc);
    }

    #[test]
    fn test_mux_aac_packet() {
        let mut muxer = TsMuxer::new(false, true);
        muxer.set_pcr(Duration::from_millis(10)).unwrap();
        let out = muxer
            .mux_aac(Duration::from_secs(2), &[0xFF, 0xF1, 0x00, 0x00, 0x00, 0x1F, 0xFC])
            .unwrap();
        assert_eq!(out.len(), TS_PACKET_LEN);
        assert_eq!(out[0], 0x47);
        // PID 258
        let pid = (((out[1] & 0x1F) as u16) << 8) | out[2] as u16;
        assert_eq!(pid, 258);
    }

    #[test]
    fn test_pcr_pid_follows_tracks() {
        // with video the PMT advertises the video PID as PCR carrier
        let muxer = TsMuxer::new(true, true);
        let with_video = muxer.tables().unwrap();
        let muxer = TsMuxer::new(false, true);
        let audio_only = muxer.tables().unwrap();
        assert_ne!(with_video, audio_only);
    }
}
