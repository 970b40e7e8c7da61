use std::time::Duration;

/// Rational timebase: one tick lasts `num / den` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timebase {
    pub num: u32,
    pub den: u32,
}

impl Timebase {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    /// 90 kHz, the PES timestamp clock
    pub const MPEG: Timebase = Timebase::new(1, 90_000);

    /// Converts a timestamp in this timebase to 27 MHz ticks.
    pub fn to_27mhz(&self, ts: i64) -> i128 {
        if self.den == 0 {
            return 0;
        }
        (ts as i128) * (self.num as i128) * 27_000_000 / (self.den as i128)
    }

    pub fn is_valid(&self) -> bool {
        self.num > 0 && self.den > 0
    }
}

impl Default for Timebase {
    fn default() -> Self {
        Timebase::MPEG
    }
}

/// Broad stream category, as reported by input probing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCategory {
    Video,
    Audio,
    Subtitle,
    Misc,
}

/// Elementary stream coding format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamFormat {
    VideoUncompressed,
    Avc,
    Mpeg2Video,

    Pcm,
    /// MPEG-1 Layer II
    Mp2,
    /// ATSC A/52 AC-3
    Ac3,
    /// ATSC A/52 Annex E, Enhanced AC-3
    Eac3,
    Aac,

    DvbSubtitles,
    Teletext,

    /// Captions carried inside the video elementary stream
    Cea608,
    Cea708,
}

impl StreamFormat {
    pub fn category(&self) -> StreamCategory {
        match self {
            StreamFormat::VideoUncompressed | StreamFormat::Avc | StreamFormat::Mpeg2Video => {
                StreamCategory::Video
            }
            StreamFormat::Pcm
            | StreamFormat::Mp2
            | StreamFormat::Ac3
            | StreamFormat::Eac3
            | StreamFormat::Aac => StreamCategory::Audio,
            StreamFormat::DvbSubtitles | StreamFormat::Cea608 | StreamFormat::Cea708 => {
                StreamCategory::Subtitle
            }
            StreamFormat::Teletext => StreamCategory::Misc,
        }
    }

    /// Per-frame data that rides inside the video stream and owns no PID.
    pub fn is_embedded(&self) -> bool {
        matches!(self, StreamFormat::Cea608 | StreamFormat::Cea708)
    }

    /// Raw formats that can only leave the appliance after encoding.
    pub fn is_uncompressed(&self) -> bool {
        matches!(self, StreamFormat::VideoUncompressed)
    }
}

/// Frame packing arrangement for frame-compatible 3DTV
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePacking {
    Checkerboard,
    Column,
    Row,
    SideBySide,
    TopBottom,
    Temporal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoParams {
    pub format: StreamFormat,
    pub width: u32,
    pub height: u32,
    pub sar: (u32, u32),
    pub interlaced: bool,
    pub timebase: Timebase,
    pub frame_packing: Option<FramePacking>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioParams {
    pub format: StreamFormat,
    /// Channel mask, one bit per speaker position
    pub channel_layout: u64,
    pub sample_rate: u32,
    /// Compressed audio only, bits per second
    pub bitrate: Option<u32>,
    /// AAC in LATM (MPEG-4 encapsulation) rather than ADTS
    pub aac_is_latm: bool,
    pub timebase: Timebase,
}

impl AudioParams {
    pub fn channels(&self) -> u32 {
        self.channel_layout.count_ones()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubtitleParams {
    pub format: StreamFormat,
    /// Has a display definition segment (HD subtitling)
    pub dvb_has_dds: bool,
    pub composition_page: u16,
    pub ancillary_page: u16,
    pub timebase: Timebase,
}

/// One teletext page announced in the teletext descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct TeletextPage {
    pub lang_code: String,
    /// 0x01 initial page, 0x02 subtitle page, ...
    pub page_type: u8,
    pub magazine: u8,
    pub page: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MiscParams {
    pub format: StreamFormat,
    pub teletext_pages: Vec<TeletextPage>,
    pub timebase: Timebase,
}

/// Type-specific description of a probed stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamParams {
    Video(VideoParams),
    Audio(AudioParams),
    Subtitle(SubtitleParams),
    Misc(MiscParams),
}

impl StreamParams {
    pub fn format(&self) -> StreamFormat {
        match self {
            StreamParams::Video(v) => v.format,
            StreamParams::Audio(a) => a.format,
            StreamParams::Subtitle(s) => s.format,
            StreamParams::Misc(m) => m.format,
        }
    }

    pub fn timebase(&self) -> Timebase {
        match self {
            StreamParams::Video(v) => v.timebase,
            StreamParams::Audio(a) => a.timebase,
            StreamParams::Subtitle(s) => s.timebase,
            StreamParams::Misc(m) => m.timebase,
        }
    }

    pub fn category(&self) -> StreamCategory {
        match self {
            StreamParams::Video(_) => StreamCategory::Video,
            StreamParams::Audio(_) => StreamCategory::Audio,
            StreamParams::Subtitle(_) => StreamCategory::Subtitle,
            StreamParams::Misc(_) => StreamCategory::Misc,
        }
    }
}

/// A stream discovered by input probing
#[derive(Debug, Clone, PartialEq)]
pub struct InputStream {
    pub stream_id: u32,
    pub lang_code: Option<String>,
    pub params: StreamParams,
}

impl InputStream {
    pub fn video(stream_id: u32, format: StreamFormat, width: u32, height: u32, timebase: Timebase) -> Self {
        Self {
            stream_id,
            lang_code: None,
            params: StreamParams::Video(VideoParams {
                format,
                width,
                height,
                sar: (1, 1),
                interlaced: false,
                timebase,
                frame_packing: None,
            }),
        }
    }

    pub fn audio(stream_id: u32, format: StreamFormat, channel_layout: u64, sample_rate: u32) -> Self {
        Self {
            stream_id,
            lang_code: None,
            params: StreamParams::Audio(AudioParams {
                format,
                channel_layout,
                sample_rate,
                bitrate: None,
                aac_is_latm: false,
                timebase: Timebase::new(1, sample_rate.max(1)),
            }),
        }
    }

    pub fn dvb_subtitles(stream_id: u32, lang_code: &str) -> Self {
        Self {
            stream_id,
            lang_code: Some(lang_code.to_string()),
            params: StreamParams::Subtitle(SubtitleParams {
                format: StreamFormat::DvbSubtitles,
                dvb_has_dds: false,
                composition_page: 1,
                ancillary_page: 1,
                timebase: Timebase::MPEG,
            }),
        }
    }

    pub fn captions(stream_id: u32, format: StreamFormat) -> Self {
        Self {
            stream_id,
            lang_code: None,
            params: StreamParams::Subtitle(SubtitleParams {
                format,
                dvb_has_dds: false,
                composition_page: 0,
                ancillary_page: 0,
                timebase: Timebase::MPEG,
            }),
        }
    }

    pub fn teletext(stream_id: u32, lang_code: &str) -> Self {
        Self {
            stream_id,
            lang_code: Some(lang_code.to_string()),
            params: StreamParams::Misc(MiscParams {
                format: StreamFormat::Teletext,
                teletext_pages: vec![TeletextPage {
                    lang_code: lang_code.to_string(),
                    page_type: 0x01,
                    magazine: 1,
                    page: 0x00,
                }],
                timebase: Timebase::MPEG,
            }),
        }
    }

    pub fn with_lang(mut self, lang_code: &str) -> Self {
        self.lang_code = Some(lang_code.to_string());
        self
    }

    pub fn with_timebase(mut self, timebase: Timebase) -> Self {
        match &mut self.params {
            StreamParams::Video(v) => v.timebase = timebase,
            StreamParams::Audio(a) => a.timebase = timebase,
            StreamParams::Subtitle(s) => s.timebase = timebase,
            StreamParams::Misc(m) => m.timebase = timebase,
        }
        self
    }

    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        if let StreamParams::Audio(a) = &mut self.params {
            a.bitrate = Some(bitrate);
        }
        self
    }

    pub fn with_frame_packing(mut self, packing: FramePacking) -> Self {
        if let StreamParams::Video(v) = &mut self.params {
            v.frame_packing = Some(packing);
        }
        self
    }

    pub fn format(&self) -> StreamFormat {
        self.params.format()
    }
}

/// The single program returned by input probing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputProgram {
    pub name: String,
    pub provider_name: String,
    pub streams: Vec<InputStream>,
}

impl InputProgram {
    pub fn new(name: &str, provider_name: &str) -> Self {
        Self {
            name: name.to_string(),
            provider_name: provider_name.to_string(),
            streams: Vec::new(),
        }
    }

    pub fn with_stream(mut self, stream: InputStream) -> Self {
        self.streams.push(stream);
        self
    }

    pub fn stream(&self, stream_id: u32) -> Option<&InputStream> {
        self.streams.iter().find(|s| s.stream_id == stream_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamAction {
    Passthrough,
    Encode,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AacOpts {
    pub he_aac: bool,
    pub capped_vbr: bool,
    pub latm_output: bool,
}

/// Options that only take effect when the stream is passed through.
#[derive(Debug, Clone, PartialEq)]
pub struct PassthroughOpts {
    /// A forward jump of the source timeline larger than this is treated as a discontinuity
    pub discontinuity_threshold: Duration,
}

impl Default for PassthroughOpts {
    fn default() -> Self {
        Self {
            discontinuity_threshold: Duration::from_secs(1),
        }
    }
}

/// Per-stream transport stream options
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TsStreamOpts {
    /// Requested PID, auto-assigned when `None`
    pub pid: Option<u16>,
    pub write_lang_code: bool,
    pub lang_code: Option<String>,
    /// ISO 639 audio_type (0 undefined, 1 clean effects, 2 hearing impaired, 3 visual impaired commentary)
    pub audio_type: u8,
    /// DVB/ISDB component tag
    pub stream_identifier: Option<u8>,
    pub passthrough: PassthroughOpts,
}

/// Requested handling of one probed input stream
#[derive(Debug, Clone, PartialEq)]
pub struct OutputStream {
    pub stream_id: u32,
    pub action: StreamAction,
    /// Encode only: format the encoder produces
    pub format: Option<StreamFormat>,
    /// Encode only: target bitrate in bits per second
    pub bitrate: Option<u32>,
    pub aac: AacOpts,
    /// Encode only: frame packing SEI for 3DTV video
    pub frame_packing: Option<FramePacking>,
    pub ts: TsStreamOpts,
}

impl OutputStream {
    pub fn passthrough(stream_id: u32) -> Self {
        Self {
            stream_id,
            action: StreamAction::Passthrough,
            format: None,
            bitrate: None,
            aac: AacOpts::default(),
            frame_packing: None,
            ts: TsStreamOpts::default(),
        }
    }

    pub fn encode(stream_id: u32, format: StreamFormat) -> Self {
        Self {
            action: StreamAction::Encode,
            format: Some(format),
            ..Self::passthrough(stream_id)
        }
    }

    pub fn with_pid(mut self, pid: u16) -> Self {
        self.ts.pid = Some(pid);
        self
    }

    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = Some(bitrate);
        self
    }

    pub fn with_lang_code(mut self, lang: &str) -> Self {
        self.ts.write_lang_code = true;
        self.ts.lang_code = Some(lang.to_string());
        self
    }

    pub fn with_audio_type(mut self, audio_type: u8) -> Self {
        self.ts.audio_type = audio_type;
        self
    }

    pub fn with_stream_identifier(mut self, tag: u8) -> Self {
        self.ts.stream_identifier = Some(tag);
        self
    }

    pub fn with_aac_opts(mut self, aac: AacOpts) -> Self {
        self.aac = aac;
        self
    }

    pub fn with_frame_packing(mut self, packing: FramePacking) -> Self {
        self.frame_packing = Some(packing);
        self
    }

    pub fn with_passthrough_opts(mut self, opts: PassthroughOpts) -> Self {
        self.ts.passthrough = opts;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timebase_conversion() {
        assert_eq!(Timebase::MPEG.to_27mhz(90_000), 27_000_000);
        assert_eq!(Timebase::new(1001, 30_000).to_27mhz(1), 900_900);
        assert_eq!(Timebase::new(1, 48_000).to_27mhz(1152), 648_000);
    }

    #[test]
    fn test_format_categories() {
        assert_eq!(StreamFormat::Ac3.category(), StreamCategory::Audio);
        assert_eq!(StreamFormat::Teletext.category(), StreamCategory::Misc);
        assert!(StreamFormat::Cea708.is_embedded());
        assert!(!StreamFormat::DvbSubtitles.is_embedded());
    }

    #[test]
    fn test_encode_builder() {
        let s = OutputStream::encode(3, StreamFormat::Aac)
            .with_pid(0x101)
            .with_lang_code("eng")
            .with_bitrate(128_000);
        assert_eq!(s.action, StreamAction::Encode);
        assert_eq!(s.ts.pid, Some(0x101));
        assert!(s.ts.write_lang_code);
        assert_eq!(s.bitrate, Some(128_000));
    }
}
