//! USB Video Class descriptors (UVC 1.5, chapter 3)

use tracing::{trace, warn};

use super::{
    Descriptors, EndpointDescriptor, InterfaceDescriptor, TransferType, DESC_CS_INTERFACE,
    DESC_ENDPOINT, DESC_INTERFACE,
};
use crate::capture::frame::{Encoding, VideoFormat};
use crate::error::Result;

pub const CLASS_VIDEO: u8 = 0x0E;

pub mod subclass {
    pub const VIDEO_CONTROL: u8 = 0x01;
    pub const VIDEO_STREAMING: u8 = 0x02;
}

pub mod vc {
    pub const HEADER: u8 = 0x01;
}

pub mod vs {
    pub const INPUT_HEADER: u8 = 0x01;
    pub const FORMAT_UNCOMPRESSED: u8 = 0x04;
    pub const FRAME_UNCOMPRESSED: u8 = 0x05;
    pub const FORMAT_MJPEG: u8 = 0x06;
    pub const FRAME_MJPEG: u8 = 0x07;
    pub const FORMAT_FRAME_BASED: u8 = 0x10;
    pub const FRAME_FRAME_BASED: u8 = 0x11;
}

/// Frame intervals are expressed in 100 ns units
pub const INTERVAL_UNITS_PER_SECOND: f32 = 10_000_000.0;

/// Two frame rates closer than this are the same rate
const FPS_TOLERANCE: f32 = 0.01;

/// Frame rate for an interval, rounded to hundredths of a frame per second
pub fn interval_to_fps(interval: u32) -> f32 {
    if interval == 0 {
        return 0.0;
    }
    (INTERVAL_UNITS_PER_SECOND / interval as f32 * 100.0).round() / 100.0
}

pub fn fps_to_interval(fps: f32) -> u32 {
    if fps <= 0.0 {
        return 0;
    }
    (INTERVAL_UNITS_PER_SECOND / fps).round() as u32
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameIntervals {
    Continuous { min: u32, max: u32, step: u32 },
    Discrete(Vec<u32>),
}

impl FrameIntervals {
    /// Find the advertised interval that yields `fps`.
    pub fn find(&self, fps: f32) -> Option<u32> {
        match self {
            FrameIntervals::Discrete(intervals) => intervals
                .iter()
                .copied()
                .find(|&interval| (interval_to_fps(interval) - fps).abs() < FPS_TOLERANCE),
            FrameIntervals::Continuous { min, max, step } => {
                let wanted = fps_to_interval(fps);
                if wanted == 0 {
                    return None;
                }
                let candidate = if *step == 0 || wanted <= *min {
                    wanted.clamp(*min, *max)
                } else {
                    let steps = ((wanted - min) as f64 / *step as f64).round() as u32;
                    min.saturating_add(steps.saturating_mul(*step))
                };
                let in_range = (*min..=*max).contains(&candidate);
                let same_rate = (interval_to_fps(candidate) - fps).abs() < FPS_TOLERANCE;
                (in_range && same_rate).then_some(candidate)
            }
        }
    }

    /// Every frame rate a discrete list offers; the endpoints of a range
    pub fn rates(&self) -> Vec<f32> {
        match self {
            FrameIntervals::Discrete(intervals) => {
                intervals.iter().map(|&i| interval_to_fps(i)).collect()
            }
            FrameIntervals::Continuous { min, max, .. } => {
                vec![interval_to_fps(*min), interval_to_fps(*max)]
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameDescriptor {
    pub index: u8,
    pub width: u16,
    pub height: u16,
    /// dwMaxVideoFrameBufferSize; zero for frame-based formats
    pub max_frame_buffer_size: u32,
    pub default_interval: u32,
    pub intervals: FrameIntervals,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatDescriptor {
    pub index: u8,
    pub encoding: Encoding,
    /// Format GUID for uncompressed and frame-based formats
    pub guid: Option<[u8; 16]>,
    pub default_frame_index: u8,
    pub frames: Vec<FrameDescriptor>,
}

impl FormatDescriptor {
    /// Four-character code from the GUID, if printable
    pub fn fourcc(&self) -> Option<String> {
        let guid = self.guid?;
        let code = &guid[..4];
        code.iter()
            .all(|b| b.is_ascii_graphic())
            .then(|| String::from_utf8_lossy(code).into_owned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AltSetting {
    pub alt_setting: u8,
    pub endpoint: Option<EndpointDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingInterface {
    pub number: u8,
    /// bEndpointAddress from the input header
    pub endpoint_address: Option<u8>,
    pub alt_settings: Vec<AltSetting>,
    pub formats: Vec<FormatDescriptor>,
}

/// A format/frame pair selected for a request.
#[derive(Debug, Clone, Copy)]
pub struct FormatMatch<'a> {
    pub format: &'a FormatDescriptor,
    pub frame: &'a FrameDescriptor,
    pub interval: u32,
}

impl FormatMatch<'_> {
    /// The concrete format this match negotiates
    pub fn video_format(&self) -> VideoFormat {
        VideoFormat::new(
            self.frame.width,
            self.frame.height,
            interval_to_fps(self.interval),
            self.format.encoding,
        )
    }
}

impl StreamingInterface {
    /// Look up the descriptors matching `req`. Zero width, height or fps and
    /// [`Encoding::Any`] match anything; zero fps picks the default interval.
    pub fn find_format(&self, req: &VideoFormat) -> Option<FormatMatch<'_>> {
        self.formats
            .iter()
            .filter(|format| req.encoding == Encoding::Any || req.encoding == format.encoding)
            .flat_map(|format| format.frames.iter().map(move |frame| (format, frame)))
            .filter(|(_, frame)| {
                (req.width == 0 || req.width == frame.width)
                    && (req.height == 0 || req.height == frame.height)
            })
            .find_map(|(format, frame)| {
                let interval = if req.fps <= 0.0 {
                    frame.default_interval
                } else {
                    frame.intervals.find(req.fps)?
                };
                Some(FormatMatch {
                    format,
                    frame,
                    interval,
                })
            })
    }

    /// Every advertised (resolution, rate, encoding) combination
    pub fn formats(&self) -> Vec<VideoFormat> {
        self.formats
            .iter()
            .flat_map(|format| {
                format.frames.iter().flat_map(move |frame| {
                    frame.intervals.rates().into_iter().map(move |fps| {
                        VideoFormat::new(frame.width, frame.height, fps, format.encoding)
                    })
                })
            })
            .collect()
    }

    /// Bulk streaming interfaces keep their endpoint in alternate setting 0.
    pub fn bulk_endpoint(&self) -> Option<EndpointDescriptor> {
        self.alt_settings
            .iter()
            .find(|alt| alt.alt_setting == 0)
            .and_then(|alt| alt.endpoint)
            .filter(|ep| ep.transfer_type == TransferType::Bulk && ep.is_in())
    }

    /// Pick the isochronous alternate setting for a payload size: the
    /// smallest one that fits, or the biggest one there is.
    pub fn isoc_alt_setting(&self, payload_size: usize) -> Option<(u8, EndpointDescriptor)> {
        let mut isoc: Vec<(u8, EndpointDescriptor)> = self
            .alt_settings
            .iter()
            .filter_map(|alt| Some((alt.alt_setting, alt.endpoint?)))
            .filter(|(_, ep)| ep.transfer_type == TransferType::Isochronous && ep.is_in())
            .filter(|(_, ep)| ep.effective_packet_size() > 0)
            .collect();
        isoc.sort_by_key(|(_, ep)| ep.effective_packet_size());

        isoc.iter()
            .find(|(_, ep)| ep.effective_packet_size() >= payload_size)
            .or_else(|| isoc.last())
            .copied()
    }
}

/// Video function found in a configuration descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UvcConfig {
    /// bcdUVC from the VC header, e.g. 0x0110
    pub bcd_uvc: u16,
    pub control_interface: Option<u8>,
    pub streaming: Vec<StreamingInterface>,
}

impl UvcConfig {
    pub fn parse(config: &[u8]) -> Result<Self> {
        let mut out = UvcConfig::default();
        let mut current: Option<InterfaceDescriptor> = None;

        for desc in Descriptors::new(config) {
            let desc = desc?;
            match desc[1] {
                DESC_INTERFACE => {
                    current = InterfaceDescriptor::parse(desc).filter(|i| i.class == CLASS_VIDEO);
                    match current {
                        Some(iface) if iface.subclass == subclass::VIDEO_CONTROL => {
                            out.control_interface.get_or_insert(iface.number);
                        }
                        Some(iface) if iface.subclass == subclass::VIDEO_STREAMING => {
                            out.streaming_mut(iface.number).alt_settings.push(AltSetting {
                                alt_setting: iface.alt_setting,
                                endpoint: None,
                            });
                        }
                        _ => {}
                    }
                }
                DESC_ENDPOINT => {
                    let Some(iface) = current.filter(|i| i.subclass == subclass::VIDEO_STREAMING)
                    else {
                        continue;
                    };
                    let endpoint = EndpointDescriptor::parse(desc);
                    if let Some(alt) = out.streaming_mut(iface.number).alt_settings.last_mut() {
                        alt.endpoint = alt.endpoint.or(endpoint);
                    }
                }
                DESC_CS_INTERFACE if desc.len() >= 3 => match current {
                    Some(iface) if iface.subclass == subclass::VIDEO_CONTROL => {
                        if desc[2] == vc::HEADER && desc.len() >= 5 {
                            out.bcd_uvc = u16::from_le_bytes([desc[3], desc[4]]);
                        }
                    }
                    Some(iface) if iface.subclass == subclass::VIDEO_STREAMING => {
                        out.streaming_mut(iface.number).parse_class_descriptor(desc);
                    }
                    _ => {}
                },
                _ => {}
            }
        }

        Ok(out)
    }

    fn streaming_mut(&mut self, number: u8) -> &mut StreamingInterface {
        let pos = match self.streaming.iter().position(|s| s.number == number) {
            Some(pos) => pos,
            None => {
                self.streaming.push(StreamingInterface {
                    number,
                    endpoint_address: None,
                    alt_settings: Vec::new(),
                    formats: Vec::new(),
                });
                self.streaming.len() - 1
            }
        };
        &mut self.streaming[pos]
    }
}

impl StreamingInterface {
    fn parse_class_descriptor(&mut self, desc: &[u8]) {
        match desc[2] {
            vs::INPUT_HEADER if desc.len() >= 7 => {
                self.endpoint_address = Some(desc[6]);
            }
            vs::FORMAT_UNCOMPRESSED | vs::FORMAT_FRAME_BASED if desc.len() >= 23 => {
                let mut guid = [0u8; 16];
                guid.copy_from_slice(&desc[5..21]);
                let encoding = if desc[2] == vs::FORMAT_UNCOMPRESSED {
                    Encoding::Uncompressed
                } else {
                    frame_based_encoding(&guid)
                };
                self.formats.push(FormatDescriptor {
                    index: desc[3],
                    encoding,
                    guid: Some(guid),
                    default_frame_index: desc[22],
                    frames: Vec::new(),
                });
            }
            vs::FORMAT_MJPEG if desc.len() >= 7 => {
                self.formats.push(FormatDescriptor {
                    index: desc[3],
                    encoding: Encoding::Mjpeg,
                    guid: None,
                    default_frame_index: desc[6],
                    frames: Vec::new(),
                });
            }
            vs::FRAME_UNCOMPRESSED | vs::FRAME_MJPEG | vs::FRAME_FRAME_BASED => {
                let Some(frame) = parse_frame(desc) else {
                    warn!(subtype = desc[2], len = desc.len(), "Skipping malformed frame descriptor");
                    return;
                };
                match self.formats.last_mut() {
                    Some(format) => format.frames.push(frame),
                    None => warn!("Frame descriptor without a format descriptor"),
                }
            }
            other => trace!(subtype = other, "Ignoring VS descriptor"),
        }
    }
}

fn frame_based_encoding(guid: &[u8; 16]) -> Encoding {
    match &guid[..4] {
        b"H264" => Encoding::H264,
        b"H265" | b"HEVC" => Encoding::H265,
        _ => Encoding::FrameBased,
    }
}

fn le32(desc: &[u8], at: usize) -> Option<u32> {
    let bytes = desc.get(at..at + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn parse_frame(desc: &[u8]) -> Option<FrameDescriptor> {
    if desc.len() < 26 {
        return None;
    }
    let width = u16::from_le_bytes([desc[5], desc[6]]);
    let height = u16::from_le_bytes([desc[7], desc[8]]);

    // Frame-based frames drop dwMaxVideoFrameBufferSize and append
    // dwBytesPerLine after the interval type.
    let (max_frame_buffer_size, default_interval, interval_type) =
        if desc[2] == vs::FRAME_FRAME_BASED {
            (0, le32(desc, 17)?, desc[21])
        } else {
            (le32(desc, 17)?, le32(desc, 21)?, desc[25])
        };

    let intervals = if interval_type == 0 {
        FrameIntervals::Continuous {
            min: le32(desc, 26)?,
            max: le32(desc, 30)?,
            step: le32(desc, 34)?,
        }
    } else {
        let list = (0..interval_type as usize)
            .map(|i| le32(desc, 26 + 4 * i))
            .collect::<Option<Vec<_>>>()?;
        FrameIntervals::Discrete(list)
    };

    Some(FrameDescriptor {
        index: desc[3],
        width,
        height,
        max_frame_buffer_size,
        default_interval,
        intervals,
    })
}
