//! Element registration.
//!
//! Probes every device once and records one decoder element per decodable
//! codec and one encoder element per encodable codec.  The first device to
//! offer a codec gets the plain name (`nvh264dec`); later devices get the
//! ordinal spliced in (`nvh264device1dec`) and rank one below primary so
//! auto-plugging prefers the default device.

use std::collections::HashSet;
use std::sync::Arc;

use nvpipe_core::codec_traits::{DecoderCapsQuery, GpuDevice};
use nvpipe_core::context::ContextGuard;
use nvpipe_core::error::Result;
use nvpipe_core::subsystem::CodecSubsystem;
use nvpipe_core::types::{ChromaFormat, CodecId, InterlaceMode, PixelFormat};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::caps::EncoderCapabilities;

pub const RANK_PRIMARY: u32 = 256;

const ENCODABLE: [CodecId; 2] = [CodecId::H264, CodecId::H265];
const BIT_DEPTHS_MINUS8: [u32; 3] = [0, 2, 4];
const CHROMAS: [ChromaFormat; 2] = [ChromaFormat::Yuv420, ChromaFormat::Yuv444];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    Decoder,
    Encoder,
}

impl ElementKind {
    fn suffix(self) -> &'static str {
        match self {
            Self::Decoder => "dec",
            Self::Encoder => "enc",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ElementEntry {
    pub name: String,
    pub kind: ElementKind,
    pub codec: CodecId,
    pub device: u32,
    pub rank: u32,
    pub is_default: bool,
    pub sink_caps: String,
    pub src_caps: String,
}

/// Supported (chroma, bit depth) combinations of one decoder, as flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FormatFlags(u32);

impl FormatFlags {
    pub const YUV420_8: Self = Self(1 << 1);
    pub const YUV420_10: Self = Self(1 << 2);
    pub const YUV420_12: Self = Self(1 << 3);
    pub const YUV444_8: Self = Self(1 << 4);
    pub const YUV444_10: Self = Self(1 << 5);
    pub const YUV444_12: Self = Self(1 << 6);

    /// Flag for `chroma` at `bit_depth_minus8` (0, 2 or 4).
    pub fn of(chroma: ChromaFormat, bit_depth_minus8: u32) -> Self {
        let base = match chroma {
            ChromaFormat::Yuv444 => Self::YUV444_8.0,
            _ => Self::YUV420_8.0,
        };
        Self(base << (bit_depth_minus8 / 2))
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

/// Decoder profile list advertised on the sink side.  `None` for codecs
/// that carry no profile field.
pub fn decoder_profiles(codec: CodecId, flags: FormatFlags) -> Option<Vec<&'static str>> {
    let mut profiles = Vec::new();
    match codec {
        CodecId::H264 => {
            if flags.contains(FormatFlags::YUV420_8) {
                profiles.extend(["constrained-baseline", "baseline", "main", "high"]);
            }
            if flags.contains(FormatFlags::YUV420_10) {
                profiles.push("high-10");
            }
            if [
                FormatFlags::YUV420_12,
                FormatFlags::YUV444_8,
                FormatFlags::YUV444_10,
                FormatFlags::YUV444_12,
            ]
            .into_iter()
            .any(|f| flags.contains(f))
            {
                profiles.push("high-4:4:4");
            }
        }
        CodecId::H265 => {
            let table = [
                (FormatFlags::YUV420_8, "main"),
                (FormatFlags::YUV420_10, "main-10"),
                (FormatFlags::YUV420_12, "main-12"),
                (FormatFlags::YUV444_8, "main-444"),
                (FormatFlags::YUV444_10, "main-444-10"),
                (FormatFlags::YUV444_12, "main-444-12"),
            ];
            profiles.extend(
                table
                    .into_iter()
                    .filter(|(flag, _)| flags.contains(*flag))
                    .map(|(_, name)| name),
            );
        }
        _ => return None,
    }
    Some(profiles)
}

/// Raw format a decoder produces for a probed combination.
fn probed_format(codec: CodecId, chroma: ChromaFormat, bit_depth_minus8: u32) -> Option<PixelFormat> {
    match (chroma, bit_depth_minus8) {
        (ChromaFormat::Yuv420, 0) => Some(PixelFormat::Nv12),
        (ChromaFormat::Yuv420, 2) => Some(PixelFormat::P010),
        (ChromaFormat::Yuv420, 4) => Some(PixelFormat::P016),
        // JPEG decodes 4:4:4 into a 4:2:0 frame.
        (ChromaFormat::Yuv444, _) if codec == CodecId::Jpeg => None,
        (ChromaFormat::Yuv444, 0) => Some(PixelFormat::Y444),
        (ChromaFormat::Yuv444, 2 | 4) => Some(PixelFormat::Y444_16),
        _ => None,
    }
}

/// Base sink caps of each decodable codec.
pub fn decoder_sink_caps(codec: CodecId) -> &'static str {
    match codec {
        CodecId::Mpeg1 => "video/mpeg, mpegversion=1, systemstream=false",
        CodecId::Mpeg2 => "video/mpeg, mpegversion=2, systemstream=false",
        CodecId::Mpeg4 => "video/mpeg, mpegversion=4, systemstream=false",
        CodecId::H264 => {
            "video/x-h264, stream-format=byte-stream, alignment=au, profile={ constrained-baseline, baseline, main, high }"
        }
        CodecId::Jpeg => "image/jpeg",
        CodecId::H265 => "video/x-h265, stream-format=byte-stream, alignment=au, profile={ main }",
        CodecId::Vp8 => "video/x-vp8",
        CodecId::Vp9 => "video/x-vp9",
    }
}

fn caps_list<S: AsRef<str>>(items: &[S]) -> String {
    let items: Vec<&str> = items.iter().map(AsRef::as_ref).collect();
    format!("{{ {} }}", items.join(", "))
}

/// Capability summary of one decoder on one device.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct DecoderProbe {
    flags: FormatFlags,
    formats: Vec<PixelFormat>,
    min_width: u32,
    min_height: u32,
    max_width: u32,
    max_height: u32,
}

impl DecoderProbe {
    fn sink_caps(&self, codec: CodecId) -> String {
        let media = codec.media_type();
        let base = decoder_sink_caps(codec);
        // Keep the fixed fields of the base caps but replace its profile list.
        let fixed: Vec<&str> = base
            .split(", ")
            .skip(1)
            .take_while(|field| !field.starts_with("profile="))
            .collect();
        let mut caps = String::from(media);
        for field in fixed {
            caps.push_str(", ");
            caps.push_str(field);
        }
        caps.push_str(&format!(
            ", width=[ {}, {} ], height=[ {}, {} ]",
            self.min_width, self.max_width, self.min_height, self.max_height
        ));
        if let Some(profiles) = decoder_profiles(codec, self.flags) {
            caps.push_str(&format!(", profile={}", caps_list(&profiles)));
        }
        caps
    }

    fn src_caps(&self) -> String {
        let formats: Vec<_> = self.formats.iter().map(|f| f.caps_name()).collect();
        format!(
            "video/x-raw, format={}, width=[ {}, {} ], height=[ {}, {} ], framerate=[ 0/1, 2147483647/1 ]",
            caps_list(&formats),
            self.min_width,
            self.max_width,
            self.min_height,
            self.max_height
        )
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    entries: Vec<ElementEntry>,
    names: HashSet<String>,
}

impl Registry {
    /// Probe every device of the installed platform.
    pub fn probe(subsystem: &Arc<CodecSubsystem>) -> Result<Self> {
        let platform = subsystem.platform();
        let mut registry = Self::default();

        let device_count = platform.device_count()?;
        if device_count == 0 {
            warn!("no devices detected");
            return Ok(registry);
        }

        if !registry.can_query_decoder_caps(subsystem) {
            info!("driver cannot query decoder capability, registering NV12 decoders only");
            registry.register_fallback_decoders();
        } else {
            for ordinal in 0..device_count {
                if let Err(err) = registry.probe_decoders(subsystem, ordinal) {
                    warn!(ordinal, %err, "decoder probing failed");
                }
            }
        }

        for ordinal in 0..device_count {
            if let Err(err) = registry.probe_encoders(subsystem, ordinal) {
                warn!(ordinal, %err, "encoder probing failed");
            }
        }

        info!(elements = registry.entries.len(), "element registry ready");
        Ok(registry)
    }

    pub fn entries(&self) -> &[ElementEntry] {
        &self.entries
    }

    pub fn find(&self, name: &str) -> Option<&ElementEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Entries of `kind` for `codec`, best rank first.
    pub fn candidates(&self, kind: ElementKind, codec: CodecId) -> Vec<&ElementEntry> {
        let mut found: Vec<_> = self
            .entries
            .iter()
            .filter(|e| e.kind == kind && e.codec == codec)
            .collect();
        found.sort_by(|a, b| b.rank.cmp(&a.rank).then(a.device.cmp(&b.device)));
        found
    }

    fn register(
        &mut self,
        kind: ElementKind,
        codec: CodecId,
        device: u32,
        rank: u32,
        sink_caps: String,
        src_caps: String,
    ) {
        let token = codec.element_token();
        let mut name = format!("nv{token}{}", kind.suffix());
        let is_default = !self.names.contains(&name);
        if !is_default {
            name = format!("nv{token}device{device}{}", kind.suffix());
        }
        if self.names.contains(&name) {
            warn!(%name, "element already registered");
            return;
        }
        let rank = if rank > 0 && !is_default { rank - 1 } else { rank };
        debug!(%name, rank, %sink_caps, %src_caps, "registering element");
        self.names.insert(name.clone());
        self.entries.push(ElementEntry {
            name,
            kind,
            codec,
            device,
            rank,
            is_default,
            sink_caps,
            src_caps,
        });
    }

    fn can_query_decoder_caps(&self, subsystem: &Arc<CodecSubsystem>) -> bool {
        let query = DecoderCapsQuery {
            codec: CodecId::H264,
            chroma: ChromaFormat::Yuv420,
            bit_depth_minus8: 0,
        };
        let probe = || -> Result<bool> {
            let device = subsystem.platform().open_device(0)?;
            let _guard = ContextGuard::push(&device)?;
            Ok(device.decoder_caps(&query)?.is_some())
        };
        // A failing device still has a capability query; its codecs are
        // skipped during per-device probing.
        probe().unwrap_or(true)
    }

    fn register_fallback_decoders(&mut self) {
        let src = format!("video/x-raw, format={}", PixelFormat::Nv12.caps_name());
        for codec in CodecId::DECODABLE {
            self.register(
                ElementKind::Decoder,
                codec,
                0,
                RANK_PRIMARY,
                decoder_sink_caps(codec).to_string(),
                src.clone(),
            );
        }
    }

    fn probe_decoders(&mut self, subsystem: &Arc<CodecSubsystem>, ordinal: u32) -> Result<()> {
        let device = subsystem.platform().open_device(ordinal)?;
        let _guard = ContextGuard::push(&device)?;
        for codec in CodecId::DECODABLE {
            let probe = probe_decoder(&device, codec);
            if probe.formats.is_empty() {
                info!(ordinal, codec = codec.element_token(), "device cannot decode codec");
                continue;
            }
            let sink = probe.sink_caps(codec);
            let src = probe.src_caps();
            self.register(ElementKind::Decoder, codec, ordinal, RANK_PRIMARY, sink, src);
        }
        Ok(())
    }

    fn probe_encoders(&mut self, subsystem: &Arc<CodecSubsystem>, ordinal: u32) -> Result<()> {
        let device = subsystem.platform().open_device(ordinal)?;
        let _guard = ContextGuard::push(&device)?;
        let session = {
            let _init = subsystem.init_lock();
            device.open_encode_session()?
        };
        for codec in ENCODABLE {
            let caps = match EncoderCapabilities::probe(session.as_ref(), codec) {
                Ok(caps) => caps,
                Err(err) => {
                    info!(ordinal, codec = codec.element_token(), %err, "device cannot encode codec");
                    continue;
                }
            };
            let src = encoder_src_caps(&caps);
            self.register(
                ElementKind::Encoder,
                codec,
                ordinal,
                RANK_PRIMARY,
                caps.sink_caps_string(),
                src,
            );
        }
        let _init = subsystem.init_lock();
        if let Err(err) = session.destroy() {
            warn!(ordinal, %err, "failed to destroy probing session");
        }
        Ok(())
    }
}

fn probe_decoder(device: &Arc<dyn GpuDevice>, codec: CodecId) -> DecoderProbe {
    let mut probe = DecoderProbe {
        min_width: u32::MAX,
        min_height: u32::MAX,
        ..Default::default()
    };
    for chroma in CHROMAS {
        for bd in BIT_DEPTHS_MINUS8 {
            let query = DecoderCapsQuery {
                codec,
                chroma,
                bit_depth_minus8: bd,
            };
            let caps = match device.decoder_caps(&query) {
                Ok(Some(caps)) => caps,
                Ok(None) => continue,
                Err(err) => {
                    info!(codec = codec.element_token(), %err, "could not query decoder capability");
                    continue;
                }
            };
            if !caps.supported {
                trace!(
                    codec = codec.element_token(),
                    bit_depth = bd + 8,
                    ?chroma,
                    "combination not supported"
                );
                continue;
            }
            probe.min_width = probe.min_width.min(caps.min_width);
            probe.min_height = probe.min_height.min(caps.min_height);
            probe.max_width = probe.max_width.max(caps.max_width);
            probe.max_height = probe.max_height.max(caps.max_height);
            probe.flags.insert(FormatFlags::of(chroma, bd));
            if let Some(format) = probed_format(codec, chroma, bd) {
                if !probe.formats.contains(&format) {
                    probe.formats.push(format);
                }
            }
        }
    }
    probe
}

fn encoder_src_caps(caps: &EncoderCapabilities) -> String {
    let mut profiles: Vec<&str> = Vec::new();
    for name in caps.profiles.iter().flat_map(|p| p.caps_names().iter().copied()) {
        if !profiles.contains(&name) {
            profiles.push(name);
        }
    }
    let mut src = format!(
        "{}, stream-format=byte-stream, alignment=au",
        caps.codec.media_type()
    );
    if !profiles.is_empty() {
        src.push_str(&format!(", profile={}", caps_list(&profiles)));
    }
    if caps.accepts_interlace(InterlaceMode::Mixed) {
        src.push_str(", interlace-mode={ progressive, interleaved, mixed }");
    }
    src
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn h264_profiles_follow_flags() {
        let mut flags = FormatFlags::of(ChromaFormat::Yuv420, 0);
        assert_eq!(
            decoder_profiles(CodecId::H264, flags),
            Some(vec!["constrained-baseline", "baseline", "main", "high"])
        );
        flags.insert(FormatFlags::of(ChromaFormat::Yuv444, 0));
        assert_eq!(
            decoder_profiles(CodecId::H264, flags).and_then(|p| p.last().copied()),
            Some("high-4:4:4")
        );
        assert_eq!(decoder_profiles(CodecId::Vp9, flags), None);
    }

    #[test]
    fn hevc_profiles_follow_flags() {
        let mut flags = FormatFlags::default();
        for bd in BIT_DEPTHS_MINUS8 {
            flags.insert(FormatFlags::of(ChromaFormat::Yuv420, bd));
        }
        flags.insert(FormatFlags::of(ChromaFormat::Yuv444, 2));
        assert_eq!(
            decoder_profiles(CodecId::H265, flags),
            Some(vec!["main", "main-10", "main-12", "main-444-10"])
        );
    }

    #[test]
    fn jpeg_skips_444_output() {
        assert_eq!(probed_format(CodecId::Jpeg, ChromaFormat::Yuv444, 0), None);
        assert_eq!(
            probed_format(CodecId::H265, ChromaFormat::Yuv444, 4),
            Some(PixelFormat::Y444_16)
        );
    }

    #[test]
    fn second_device_gets_ordinal_name_and_lower_rank() {
        let mut registry = Registry::default();
        for device in 0..2 {
            registry.register(
                ElementKind::Decoder,
                CodecId::H264,
                device,
                RANK_PRIMARY,
                String::new(),
                String::new(),
            );
        }
        let default = registry.find("nvh264dec").map(|e| (e.device, e.rank));
        let second = registry.find("nvh264device1dec").map(|e| (e.device, e.rank));
        assert_eq!(default, Some((0, RANK_PRIMARY)));
        assert_eq!(second, Some((1, RANK_PRIMARY - 1)));
        let order: Vec<_> = registry
            .candidates(ElementKind::Decoder, CodecId::H264)
            .iter()
            .map(|e| e.device)
            .collect();
        assert_eq!(order, vec![0, 1]);
    }

    #[test]
    fn sink_caps_replace_profile_list() {
        let probe = DecoderProbe {
            flags: FormatFlags::of(ChromaFormat::Yuv420, 0),
            formats: vec![PixelFormat::Nv12],
            min_width: 48,
            min_height: 16,
            max_width: 4096,
            max_height: 4096,
        };
        let caps = probe.sink_caps(CodecId::H265);
        assert_eq!(
            caps,
            "video/x-h265, stream-format=byte-stream, alignment=au, width=[ 48, 4096 ], height=[ 16, 4096 ], profile={ main }"
        );
        assert!(probe.src_caps().starts_with("video/x-raw, format={ NV12 }"));
    }
}
