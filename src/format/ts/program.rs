//! Program composition: which streams are muxed, on which PIDs, and how they
//! are signalled.

use super::descriptors::stream_type;
use super::pid::{PidMap, PidUse};
use super::types::*;
use crate::av::{
    AacOpts, FramePacking, InputProgram, OutputStream, PassthroughOpts, StreamAction, StreamCategory,
    StreamFormat, StreamParams, Timebase,
};
use crate::config::{MuxConfig, TsType};
use crate::error::{MuxError, Result};
use std::collections::HashSet;

/// Fixed emission priority used to break decode-time ties
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StreamPriority {
    Video,
    PrimaryAudio,
    OtherAudio,
    Subtitle,
    Data,
}

/// One elementary stream of the program after setup
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub stream_id: u32,
    pub pid: u16,
    pub format: StreamFormat,
    pub action: StreamAction,
    /// Probed parameters, with the encoder's output format applied
    pub params: StreamParams,
    pub priority: StreamPriority,
    pub stream_type: u8,
    pub pes_stream_id: u8,
    pub lang_code: Option<String>,
    pub write_lang_code: bool,
    pub audio_type: u8,
    pub stream_identifier: Option<u8>,
    pub aac_latm: bool,
    pub frame_packing: Option<FramePacking>,
    /// Present only for passthrough streams
    pub passthrough: Option<PassthroughOpts>,
}

impl StreamEntry {
    pub fn timebase(&self) -> Timebase {
        self.params.timebase()
    }

    pub fn category(&self) -> StreamCategory {
        self.params.category()
    }

    pub fn is_passthrough(&self) -> bool {
        self.action == StreamAction::Passthrough
    }
}

/// Captions riding inside the video stream
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedCaption {
    pub stream_id: u32,
    pub format: StreamFormat,
    pub lang_code: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Program {
    pub ts_type: TsType,
    pub ts_id: u16,
    pub program_number: u16,
    pub original_network_id: u16,
    pub name: String,
    pub provider_name: String,
    pub pmt_pid: u16,
    pub pcr_pid: u16,
    pub streams: Vec<StreamEntry>,
    pub captions: Vec<EmbeddedCaption>,
    pids: PidMap,
}

impl Program {
    /// Resolves formats, assigns PIDs and checks the composition against the profile.
    pub fn build(input: &InputProgram, outputs: &[OutputStream], config: &MuxConfig) -> Result<Self> {
        config.validate()?;
        let ts_type = config.ts_type;

        let mut seen = HashSet::new();
        for output in outputs {
            if input.stream(output.stream_id).is_none() {
                return Err(MuxError::UnknownStream(output.stream_id));
            }
            if !seen.insert(output.stream_id) {
                return Err(MuxError::InvalidConfig(format!(
                    "stream {} listed twice",
                    output.stream_id
                )));
            }
        }

        let mut pids = PidMap::new(ts_type);
        let pmt_pid = config.pmt_pid.unwrap_or_else(|| PidMap::default_pmt_pid(ts_type));
        pids.claim(pmt_pid, PidUse::Pmt)?;

        // Explicit PIDs first so a later auto assignment cannot take them.
        for output in outputs {
            if let Some(pid) = output.ts.pid {
                let format = resolve_format(input, output)?;
                if format.is_embedded() {
                    continue;
                }
                pids.claim(pid, PidUse::Elementary(output.stream_id))?;
            }
        }

        let mut streams = Vec::new();
        let mut captions = Vec::new();
        let mut audio_seen = 0usize;

        for output in outputs {
            let source = input
                .stream(output.stream_id)
                .ok_or(MuxError::UnknownStream(output.stream_id))?;
            let format = resolve_format(input, output)?;

            if format.is_embedded() {
                if output.ts.pid.is_some() {
                    log::warn!(
                        "stream {}: {:?} is carried in the video stream, requested PID ignored",
                        output.stream_id,
                        format
                    );
                }
                captions.push(EmbeddedCaption {
                    stream_id: output.stream_id,
                    format,
                    lang_code: output.ts.lang_code.clone().or_else(|| source.lang_code.clone()),
                });
                continue;
            }

            let mut params = source.params.clone();
            set_format(&mut params, format);

            let aac_latm = match (&params, output.action) {
                (StreamParams::Audio(_), StreamAction::Encode) => output.aac.latm_output,
                (StreamParams::Audio(a), StreamAction::Passthrough) => a.aac_is_latm,
                _ => false,
            };
            let sample_rate = match &params {
                StreamParams::Audio(a) => a.sample_rate,
                _ => 0,
            };
            let stream_type = stream_type(ts_type, format, aac_latm, sample_rate)?;

            if output.action == StreamAction::Passthrough
                && (output.format.is_some() || output.bitrate.is_some() || output.aac != AacOpts::default())
            {
                log::debug!(
                    "stream {}: encode options have no effect on a passthrough stream",
                    output.stream_id
                );
            }
            if output.action == StreamAction::Encode
                && output.ts.passthrough != PassthroughOpts::default()
            {
                log::debug!(
                    "stream {}: passthrough options have no effect on an encoded stream",
                    output.stream_id
                );
            }

            let pid = match output.ts.pid {
                Some(pid) => pid,
                None => pids.allocate(PidUse::Elementary(output.stream_id))?,
            };

            let priority = match format.category() {
                StreamCategory::Video => StreamPriority::Video,
                StreamCategory::Audio => {
                    audio_seen += 1;
                    if audio_seen == 1 {
                        StreamPriority::PrimaryAudio
                    } else {
                        StreamPriority::OtherAudio
                    }
                }
                StreamCategory::Subtitle => StreamPriority::Subtitle,
                StreamCategory::Misc => StreamPriority::Data,
            };

            let frame_packing = match &params {
                StreamParams::Video(v) => output.frame_packing.or(v.frame_packing),
                _ => None,
            };

            streams.push(StreamEntry {
                stream_id: output.stream_id,
                pid,
                format,
                action: output.action,
                params,
                priority,
                stream_type,
                pes_stream_id: 0,
                lang_code: output.ts.lang_code.clone().or_else(|| source.lang_code.clone()),
                write_lang_code: output.ts.write_lang_code,
                audio_type: output.ts.audio_type,
                stream_identifier: output.ts.stream_identifier,
                aac_latm,
                frame_packing,
                passthrough: (output.action == StreamAction::Passthrough)
                    .then(|| output.ts.passthrough.clone()),
            });
        }

        assign_pes_stream_ids(&mut streams);
        if ts_type == TsType::Isdb {
            assign_component_tags(&mut streams);
        }
        check_3dtv(&streams, config.is_3dtv)?;

        let pcr_pid = select_pcr_pid(&mut pids, &streams, config, pmt_pid)?;

        log::info!(
            "program {} on PMT PID 0x{:04x}, PCR PID 0x{:04x}, {} elementary streams",
            config.program_num,
            pmt_pid,
            pcr_pid,
            streams.len()
        );

        Ok(Self {
            ts_type,
            ts_id: config.ts_id,
            program_number: config.program_num,
            original_network_id: config.original_network_id,
            name: input.name.clone(),
            provider_name: input.provider_name.clone(),
            pmt_pid,
            pcr_pid,
            streams,
            captions,
            pids,
        })
    }

    pub fn stream(&self, stream_id: u32) -> Option<&StreamEntry> {
        self.streams.iter().find(|s| s.stream_id == stream_id)
    }

    pub fn stream_by_pid(&self, pid: u16) -> Option<&StreamEntry> {
        self.streams.iter().find(|s| s.pid == pid)
    }

    pub fn has_video(&self) -> bool {
        self.streams.iter().any(|s| s.category() == StreamCategory::Video)
    }

    /// Whether the PCR travels on a PID with no elementary stream payload
    pub fn has_dedicated_pcr_pid(&self) -> bool {
        self.stream_by_pid(self.pcr_pid).is_none()
    }

    pub fn pids(&self) -> &PidMap {
        &self.pids
    }

    /// Moves a stream to another PID. The PCR follows the stream that carried it.
    pub fn reassign_pid(&mut self, stream_id: u32, new_pid: u16) -> Result<u16> {
        let index = self
            .streams
            .iter()
            .position(|s| s.stream_id == stream_id)
            .ok_or(MuxError::UnknownStream(stream_id))?;
        let old_pid = self.streams[index].pid;
        if old_pid == new_pid {
            return Ok(old_pid);
        }

        self.pids.claim(new_pid, PidUse::Elementary(stream_id))?;
        self.pids.release(old_pid);
        self.streams[index].pid = new_pid;
        if self.pcr_pid == old_pid {
            self.pcr_pid = new_pid;
        }
        log::info!(
            "stream {} moved from PID 0x{:04x} to 0x{:04x}",
            stream_id,
            old_pid,
            new_pid
        );
        Ok(old_pid)
    }
}

fn resolve_format(input: &InputProgram, output: &OutputStream) -> Result<StreamFormat> {
    let source = input
        .stream(output.stream_id)
        .ok_or(MuxError::UnknownStream(output.stream_id))?;
    let source_format = source.format();

    match output.action {
        StreamAction::Passthrough => {
            if source_format.is_uncompressed() {
                return Err(MuxError::Unsupported(format!(
                    "stream {}: uncompressed video must be encoded",
                    output.stream_id
                )));
            }
            Ok(source_format)
        }
        StreamAction::Encode => {
            let format = output.format.ok_or_else(|| {
                MuxError::InvalidConfig(format!(
                    "stream {}: encode action without an output format",
                    output.stream_id
                ))
            })?;
            if format.category() != source_format.category() || format.is_uncompressed() {
                return Err(MuxError::InvalidConfig(format!(
                    "stream {}: cannot encode {:?} into {:?}",
                    output.stream_id, source_format, format
                )));
            }
            Ok(format)
        }
    }
}

fn set_format(params: &mut StreamParams, format: StreamFormat) {
    match params {
        StreamParams::Video(v) => v.format = format,
        StreamParams::Audio(a) => a.format = format,
        StreamParams::Subtitle(s) => s.format = format,
        StreamParams::Misc(m) => m.format = format,
    }
}

fn assign_pes_stream_ids(streams: &mut [StreamEntry]) {
    let mut video = 0u8;
    let mut audio = 0u8;
    for stream in streams.iter_mut() {
        stream.pes_stream_id = match stream.format {
            StreamFormat::Avc | StreamFormat::Mpeg2Video | StreamFormat::VideoUncompressed => {
                let id = STREAM_ID_VIDEO + (video & 0x0f);
                video += 1;
                id
            }
            StreamFormat::Mp2 | StreamFormat::Aac => {
                let id = STREAM_ID_AUDIO + (audio & 0x1f);
                audio += 1;
                id
            }
            _ => STREAM_ID_PRIVATE_1,
        };
    }
}

/// ISDB receivers locate components by tag; every stream needs one.
fn assign_component_tags(streams: &mut [StreamEntry]) {
    let mut used: HashSet<u8> = streams.iter().filter_map(|s| s.stream_identifier).collect();
    for stream in streams.iter_mut() {
        if stream.stream_identifier.is_some() {
            continue;
        }
        let start = match stream.category() {
            StreamCategory::Video => 0x00,
            StreamCategory::Audio => 0x10,
            _ => 0x30,
        };
        if let Some(tag) = (start..=0xff).find(|tag| !used.contains(tag)) {
            used.insert(tag);
            stream.stream_identifier = Some(tag);
        }
    }
}

fn check_3dtv(streams: &[StreamEntry], is_3dtv: bool) -> Result<()> {
    for stream in streams.iter().filter(|s| s.category() == StreamCategory::Video) {
        match (is_3dtv, stream.frame_packing) {
            (true, None) => {
                return Err(MuxError::InvalidConfig(format!(
                    "stream {}: 3DTV output needs a frame packing arrangement",
                    stream.stream_id
                )))
            }
            (false, Some(packing)) => log::warn!(
                "stream {}: frame packing {:?} set but is_3dtv is off",
                stream.stream_id,
                packing
            ),
            _ => {}
        }
    }
    Ok(())
}

fn select_pcr_pid(
    pids: &mut PidMap,
    streams: &[StreamEntry],
    config: &MuxConfig,
    pmt_pid: u16,
) -> Result<u16> {
    match config.pcr_pid {
        Some(pid) => {
            if streams.iter().any(|s| s.pid == pid) {
                return Ok(pid);
            }
            if pid == pmt_pid {
                return Err(MuxError::PcrPidUnassignable(format!(
                    "0x{:04x} is the PMT PID",
                    pid
                )));
            }
            pids.claim(pid, PidUse::Pcr).map_err(|e| {
                MuxError::PcrPidUnassignable(format!("0x{:04x}: {}", pid, e))
            })?;
            Ok(pid)
        }
        None => streams
            .iter()
            .find(|s| s.category() == StreamCategory::Video)
            .or_else(|| streams.first())
            .map(|s| s.pid)
            .ok_or_else(|| {
                MuxError::PcrPidUnassignable("program has no elementary streams".into())
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::av::InputStream;

    fn input() -> InputProgram {
        InputProgram::new("Test", "Provider")
            .with_stream(InputStream::video(1, StreamFormat::VideoUncompressed, 1920, 1080, Timebase::new(1, 25)))
            .with_stream(InputStream::audio(2, StreamFormat::Pcm, 0x3, 48_000))
            .with_stream(InputStream::audio(3, StreamFormat::Ac3, 0x3f, 48_000).with_lang("fra"))
            .with_stream(InputStream::captions(4, StreamFormat::Cea708))
    }

    #[test]
    fn test_auto_assignment_and_priorities() {
        let outputs = vec![
            OutputStream::encode(1, StreamFormat::Avc),
            OutputStream::encode(2, StreamFormat::Aac),
            OutputStream::passthrough(3),
            OutputStream::passthrough(4),
        ];
        let program = Program::build(&input(), &outputs, &MuxConfig::default()).unwrap();

        assert_eq!(program.streams.len(), 3);
        assert_eq!(program.captions.len(), 1);
        assert_eq!(program.pmt_pid, DEFAULT_PMT_PID);
        assert_eq!(program.streams[0].pid, 0x100);
        assert_eq!(program.pcr_pid, 0x100);
        assert_eq!(program.streams[0].priority, StreamPriority::Video);
        assert_eq!(program.streams[1].priority, StreamPriority::PrimaryAudio);
        assert_eq!(program.streams[2].priority, StreamPriority::OtherAudio);
        assert_eq!(program.streams[1].pes_stream_id, STREAM_ID_AUDIO);
        assert_eq!(program.streams[2].pes_stream_id, STREAM_ID_PRIVATE_1);
        assert_eq!(program.streams[2].lang_code.as_deref(), Some("fra"));
    }

    #[test]
    fn test_duplicate_requested_pid() {
        let outputs = vec![
            OutputStream::encode(1, StreamFormat::Avc).with_pid(256),
            OutputStream::encode(2, StreamFormat::Aac).with_pid(256),
        ];
        let err = Program::build(&input(), &outputs, &MuxConfig::default()).unwrap_err();
        assert!(matches!(err, MuxError::PidConflict { pid: 256, .. }));
    }

    #[test]
    fn test_explicit_pid_kept_before_auto() {
        let outputs = vec![
            OutputStream::encode(1, StreamFormat::Avc),
            OutputStream::encode(2, StreamFormat::Aac).with_pid(0x100),
        ];
        let program = Program::build(&input(), &outputs, &MuxConfig::default()).unwrap();
        assert_eq!(program.stream(2).unwrap().pid, 0x100);
        assert_eq!(program.stream(1).unwrap().pid, 0x101);
    }

    #[test]
    fn test_uncompressed_passthrough_rejected() {
        let outputs = vec![OutputStream::passthrough(1)];
        assert!(matches!(
            Program::build(&input(), &outputs, &MuxConfig::default()),
            Err(MuxError::Unsupported(_))
        ));
    }

    #[test]
    fn test_pcr_pid_rules() {
        let outputs = vec![OutputStream::encode(2, StreamFormat::Aac)];
        let mut config = MuxConfig::default();
        config.pcr_pid = Some(DEFAULT_PMT_PID);
        assert!(matches!(
            Program::build(&input(), &outputs, &config),
            Err(MuxError::PcrPidUnassignable(_))
        ));

        config.pcr_pid = Some(0x1ffe);
        let program = Program::build(&input(), &outputs, &config).unwrap();
        assert!(program.has_dedicated_pcr_pid());

        config.pcr_pid = None;
        assert!(matches!(
            Program::build(&input(), &[], &config),
            Err(MuxError::PcrPidUnassignable(_))
        ));
    }

    #[test]
    fn test_isdb_component_tags() {
        let outputs = vec![
            OutputStream::encode(1, StreamFormat::Avc),
            OutputStream::encode(2, StreamFormat::Aac),
            OutputStream::encode(3, StreamFormat::Aac).with_stream_identifier(0x10),
        ];
        let config = MuxConfig::new(TsType::Isdb, 8_000_000);
        let program = Program::build(&input(), &outputs, &config).unwrap();
        assert_eq!(program.pmt_pid, 0x01f0);
        assert_eq!(program.stream(1).unwrap().stream_identifier, Some(0x00));
        assert_eq!(program.stream(2).unwrap().stream_identifier, Some(0x11));
        assert_eq!(program.stream(3).unwrap().stream_identifier, Some(0x10));
    }

    #[test]
    fn test_3dtv_requires_frame_packing() {
        let mut config = MuxConfig::default();
        config.is_3dtv = true;
        let outputs = vec![OutputStream::encode(1, StreamFormat::Avc)];
        assert!(Program::build(&input(), &outputs, &config).is_err());

        let outputs = vec![OutputStream::encode(1, StreamFormat::Avc)
            .with_frame_packing(FramePacking::SideBySide)];
        let program = Program::build(&input(), &outputs, &config).unwrap();
        assert_eq!(program.streams[0].frame_packing, Some(FramePacking::SideBySide));
    }

    #[test]
    fn test_reassign_pid_moves_pcr() {
        let outputs = vec![
            OutputStream::encode(1, StreamFormat::Avc).with_pid(0x200),
            OutputStream::encode(2, StreamFormat::Aac).with_pid(0x201),
        ];
        let mut program = Program::build(&input(), &outputs, &MuxConfig::default()).unwrap();
        assert!(program.reassign_pid(1, 0x201).is_err());
        assert_eq!(program.reassign_pid(1, 0x300).unwrap(), 0x200);
        assert_eq!(program.pcr_pid, 0x300);
        assert_eq!(program.pids().usage(0x200), None);
    }
}
