use super::program::{EmbeddedCaption, StreamEntry};
use super::types::*;
use crate::av::{StreamFormat, StreamParams};
use crate::config::TsType;
use crate::error::{MuxError, Result};
use crate::utils::BitWriter;
use bytes::{BufMut, BytesMut};

pub const TAG_REGISTRATION: u8 = 0x05;
pub const TAG_ISO_639_LANGUAGE: u8 = 0x0a;
pub const TAG_SERVICE: u8 = 0x48;
pub const TAG_STREAM_IDENTIFIER: u8 = 0x52;
pub const TAG_TELETEXT: u8 = 0x56;
pub const TAG_SUBTITLING: u8 = 0x59;
pub const TAG_DVB_AC3: u8 = 0x6a;
pub const TAG_DVB_EAC3: u8 = 0x7a;
pub const TAG_ATSC_AC3: u8 = 0x81;
pub const TAG_CAPTION_SERVICE: u8 = 0x86;
pub const TAG_ATSC_EAC3: u8 = 0xcc;

/// DVB service_type for digital television
pub const SERVICE_TYPE_DIGITAL_TV: u8 = 0x01;
/// DVB service_type for digital radio
pub const SERVICE_TYPE_DIGITAL_RADIO: u8 = 0x02;

/// A PSI descriptor: one tag, up to 255 bytes of body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub tag: u8,
    pub data: Vec<u8>,
}

impl Descriptor {
    pub fn new(tag: u8, data: Vec<u8>) -> Self {
        Self { tag, data }
    }

    /// Encoded size including the tag and length bytes
    pub fn len(&self) -> usize {
        2 + self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.tag);
        buf.put_u8(self.data.len().min(255) as u8);
        buf.put_slice(&self.data[..self.data.len().min(255)]);
    }
}

/// Total encoded size of a descriptor loop
pub fn loop_len(descriptors: &[Descriptor]) -> usize {
    descriptors.iter().map(Descriptor::len).sum()
}

fn lang_bytes(lang: &str) -> [u8; 3] {
    let mut out = *b"und";
    for (slot, b) in out.iter_mut().zip(lang.bytes()) {
        *slot = b.to_ascii_lowercase();
    }
    out
}

pub fn iso_639_language(lang: &str, audio_type: u8) -> Descriptor {
    let mut data = lang_bytes(lang).to_vec();
    data.push(audio_type);
    Descriptor::new(TAG_ISO_639_LANGUAGE, data)
}

pub fn stream_identifier(component_tag: u8) -> Descriptor {
    Descriptor::new(TAG_STREAM_IDENTIFIER, vec![component_tag])
}

pub fn registration(format_identifier: &[u8; 4]) -> Descriptor {
    Descriptor::new(TAG_REGISTRATION, format_identifier.to_vec())
}

/// DVB AC-3 descriptor with no optional fields
pub fn dvb_ac3() -> Descriptor {
    Descriptor::new(TAG_DVB_AC3, vec![0x00])
}

/// DVB enhanced AC-3 descriptor with no optional fields
pub fn dvb_eac3() -> Descriptor {
    Descriptor::new(TAG_DVB_EAC3, vec![0x00])
}

fn ac3_sample_rate_code(sample_rate: u32) -> u64 {
    match sample_rate {
        48_000 => 0,
        44_100 => 1,
        32_000 => 2,
        _ => 0b111,
    }
}

/// A/52 bit_rate_code, upper limit form
fn ac3_bit_rate_code(bitrate: Option<u32>) -> u64 {
    const RATES: [u32; 19] = [
        32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 448, 512, 576, 640,
    ];
    match bitrate {
        Some(bps) => RATES
            .iter()
            .position(|&kbps| kbps * 1000 == bps)
            .map(|code| code as u64)
            .unwrap_or(0x20 | 18),
        None => 0x20 | 18,
    }
}

/// A/52 acmod-style channel code
fn ac3_num_channels(channels: u32) -> u64 {
    match channels {
        1 => 0b0001,
        2 => 0b0010,
        3 => 0b0011,
        4 => 0b0110,
        5 => 0b0111,
        6..=u32::MAX => 0b1101,
        _ => 0b1000,
    }
}

/// ATSC AC-3 audio descriptor (A/52 Annex A)
pub fn atsc_ac3(sample_rate: u32, bitrate: Option<u32>, channels: u32) -> Descriptor {
    let mut w = BitWriter::new();
    w.write_bits(ac3_sample_rate_code(sample_rate), 3);
    w.write_bits(8, 5); // bsid
    w.write_bits(ac3_bit_rate_code(bitrate), 6);
    w.write_bits(0, 2); // surround_mode
    w.write_bits(0, 3); // bsmod: complete main
    w.write_bits(ac3_num_channels(channels), 4);
    w.write_bit(true); // full_svc
    w.write_bits(0xff, 8); // langcod
    Descriptor::new(TAG_ATSC_AC3, w.into_bytes())
}

/// ATSC E-AC-3 audio descriptor (A/52 Annex G), minimal form
pub fn atsc_eac3(channels: u32) -> Descriptor {
    let number_of_channels = match channels {
        1 => 0b000,
        2 => 0b010,
        3..=5 => 0b100,
        6..=u32::MAX => 0b101,
        _ => 0b000,
    };
    let mut w = BitWriter::new();
    w.write_bit(true); // reserved
    w.write_bits(0, 7); // bsid/mainid/asvc/mixinfo/substream flags
    w.write_bit(true); // reserved
    w.write_bit(true); // full_service_flag
    w.write_bits(0, 3); // audio_service_type: complete main
    w.write_bits(number_of_channels, 3);
    w.write_bit(false); // language_flag
    w.write_bit(false); // language_flag_2
    w.write_bit(true); // reserved
    w.write_bits(16, 5); // bsid
    Descriptor::new(TAG_ATSC_EAC3, w.into_bytes())
}

/// DVB subtitling descriptor with a single language entry
pub fn dvb_subtitling(lang: &str, has_dds: bool, composition_page: u16, ancillary_page: u16) -> Descriptor {
    let mut data = lang_bytes(lang).to_vec();
    data.push(if has_dds { 0x14 } else { 0x10 });
    data.extend_from_slice(&composition_page.to_be_bytes());
    data.extend_from_slice(&ancillary_page.to_be_bytes());
    Descriptor::new(TAG_SUBTITLING, data)
}

pub fn teletext(pages: &[crate::av::TeletextPage]) -> Descriptor {
    let mut data = Vec::with_capacity(pages.len() * 5);
    for page in pages {
        data.extend_from_slice(&lang_bytes(&page.lang_code));
        data.push((page.page_type << 3) | (page.magazine & 0x07));
        data.push(page.page);
    }
    Descriptor::new(TAG_TELETEXT, data)
}

/// DVB service descriptor for the SDT
pub fn service(service_type: u8, provider_name: &str, service_name: &str) -> Descriptor {
    let provider = &provider_name.as_bytes()[..provider_name.len().min(64)];
    let name = &service_name.as_bytes()[..service_name.len().min(64)];
    let mut data = Vec::with_capacity(3 + provider.len() + name.len());
    data.push(service_type);
    data.push(provider.len() as u8);
    data.extend_from_slice(provider);
    data.push(name.len() as u8);
    data.extend_from_slice(name);
    Descriptor::new(TAG_SERVICE, data)
}

/// ATSC caption service descriptor (A/65) announcing embedded captions
pub fn caption_service(captions: &[EmbeddedCaption]) -> Descriptor {
    let mut w = BitWriter::new();
    w.write_bits(0b111, 3);
    w.write_bits(captions.len().min(31) as u64, 5);
    let mut cc708_service = 1u64;
    for caption in captions.iter().take(31) {
        let lang = lang_bytes(caption.lang_code.as_deref().unwrap_or("eng"));
        w.write_bytes(&lang);
        match caption.format {
            StreamFormat::Cea708 => {
                w.write_bit(true); // digital_cc
                w.write_bit(true);
                w.write_bits(cc708_service, 6);
                cc708_service += 1;
            }
            _ => {
                w.write_bit(false);
                w.write_bit(true);
                w.write_bits(0x1f, 5);
                w.write_bit(false); // line21_field
            }
        }
        w.write_bit(false); // easy_reader
        w.write_bit(true); // wide_aspect_ratio
        w.write_bits(0x3fff, 14);
    }
    Descriptor::new(TAG_CAPTION_SERVICE, w.into_bytes())
}

/// PMT stream_type for a format under the given profile.
pub fn stream_type(ts_type: TsType, format: StreamFormat, aac_latm: bool, sample_rate: u32) -> Result<u8> {
    let dvb_like = matches!(ts_type, TsType::Dvb | TsType::Isdb);
    let stream_type = match format {
        StreamFormat::Avc => STREAM_TYPE_H264,
        StreamFormat::Mpeg2Video => STREAM_TYPE_MPEG2_VIDEO,
        StreamFormat::Mp2 if sample_rate != 0 && sample_rate < 32_000 => STREAM_TYPE_MPEG2_AUDIO,
        StreamFormat::Mp2 => STREAM_TYPE_MPEG1_AUDIO,
        StreamFormat::Aac if aac_latm => STREAM_TYPE_AAC_LATM,
        StreamFormat::Aac => STREAM_TYPE_AAC,
        StreamFormat::Ac3 if dvb_like => STREAM_TYPE_PRIVATE_DATA,
        StreamFormat::Ac3 => STREAM_TYPE_AC3_ATSC,
        StreamFormat::Eac3 if dvb_like => STREAM_TYPE_PRIVATE_DATA,
        StreamFormat::Eac3 => STREAM_TYPE_EAC3_ATSC,
        StreamFormat::Pcm => STREAM_TYPE_PRIVATE_DATA,
        StreamFormat::DvbSubtitles | StreamFormat::Teletext => {
            if !matches!(ts_type, TsType::Dvb | TsType::Generic) {
                return Err(MuxError::Unsupported(format!(
                    "{:?} cannot be carried in the {} profile",
                    format, ts_type
                )));
            }
            STREAM_TYPE_PRIVATE_DATA
        }
        StreamFormat::VideoUncompressed | StreamFormat::Cea608 | StreamFormat::Cea708 => {
            return Err(MuxError::Unsupported(format!(
                "{:?} has no transport stream type",
                format
            )))
        }
    };
    Ok(stream_type)
}

/// Elementary stream descriptor loop for one PMT entry.
pub fn es_descriptors(ts_type: TsType, stream: &StreamEntry, captions: &[EmbeddedCaption]) -> Vec<Descriptor> {
    let mut out = Vec::new();
    let dvb_like = matches!(ts_type, TsType::Dvb | TsType::Isdb);

    if let Some(tag) = stream.stream_identifier {
        if dvb_like {
            out.push(stream_identifier(tag));
        }
    }

    let lang = stream.lang_code.as_deref().unwrap_or("und");
    match &stream.params {
        StreamParams::Video(_) => {
            if ts_type.is_atsc_family() && !captions.is_empty() {
                out.push(caption_service(captions));
            }
        }
        StreamParams::Audio(audio) => {
            match stream.format {
                StreamFormat::Ac3 if dvb_like => out.push(dvb_ac3()),
                StreamFormat::Ac3 => {
                    out.push(registration(b"AC-3"));
                    out.push(atsc_ac3(audio.sample_rate, audio.bitrate, audio.channels()));
                }
                StreamFormat::Eac3 if dvb_like => out.push(dvb_eac3()),
                StreamFormat::Eac3 => out.push(atsc_eac3(audio.channels())),
                StreamFormat::Pcm => out.push(registration(b"BSSD")),
                _ => {}
            }
            if ts_type != TsType::Generic || stream.write_lang_code {
                out.push(iso_639_language(lang, stream.audio_type));
            }
        }
        StreamParams::Subtitle(sub) => {
            out.push(dvb_subtitling(
                lang,
                sub.dvb_has_dds,
                sub.composition_page,
                sub.ancillary_page,
            ));
        }
        StreamParams::Misc(misc) => {
            if misc.format == StreamFormat::Teletext {
                out.push(teletext(&misc.teletext_pages));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_language_descriptor() {
        let mut buf = BytesMut::new();
        iso_639_language("ENG", 3).write_to(&mut buf);
        assert_eq!(&buf[..], &[0x0a, 0x04, b'e', b'n', b'g', 0x03]);
        assert_eq!(lang_bytes("x"), *b"xnd");
    }

    #[test]
    fn test_atsc_ac3_layout() {
        let d = atsc_ac3(48_000, Some(384_000), 6);
        assert_eq!(d.tag, TAG_ATSC_AC3);
        // 000 01000 | 001110 00 | 000 1101 1 | ff
        assert_eq!(d.data, vec![0x08, 0x38, 0x1b, 0xff]);
    }

    #[test]
    fn test_stream_type_by_profile() {
        assert_eq!(stream_type(TsType::Atsc, StreamFormat::Ac3, false, 48_000).unwrap(), 0x81);
        assert_eq!(stream_type(TsType::Dvb, StreamFormat::Ac3, false, 48_000).unwrap(), 0x06);
        assert_eq!(stream_type(TsType::Generic, StreamFormat::Mp2, false, 24_000).unwrap(), 0x04);
        assert_eq!(stream_type(TsType::Dvb, StreamFormat::Aac, true, 48_000).unwrap(), 0x11);
        assert!(matches!(
            stream_type(TsType::Atsc, StreamFormat::DvbSubtitles, false, 0),
            Err(MuxError::Unsupported(_))
        ));
    }

    #[test]
    fn test_service_descriptor() {
        let d = service(SERVICE_TYPE_DIGITAL_TV, "OBE", "News");
        assert_eq!(d.data, b"\x01\x03OBE\x04News".to_vec());
    }

    #[test]
    fn test_caption_service_708() {
        let captions = vec![EmbeddedCaption {
            stream_id: 9,
            format: StreamFormat::Cea708,
            lang_code: Some("eng".into()),
        }];
        let d = caption_service(&captions);
        assert_eq!(d.data.len(), 1 + 6);
        assert_eq!(d.data[0], 0xe1);
        assert_eq!(&d.data[1..4], b"eng");
        assert_eq!(d.data[4], 0xc1);
    }
}
