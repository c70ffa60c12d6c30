//! UVC descriptor inspection and payload replay tool
//!
//! ```text
//! uvc-host <config-descriptor.bin> [payload-dump.bin]
//! ```
//!
//! The payload dump is a sequence of `[u32 LE length][payload]` records, one
//! per isochronous packet, or one per bulk transfer when the streaming
//! interface uses a bulk endpoint.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use color_eyre::{
    eyre::{eyre, WrapErr},
    Result,
};
use tracing::{error, info, warn};

use uvc_host::capture::{Frame, FrameSink, Reassembler};
use uvc_host::descriptor::uvc::{interval_to_fps, FrameIntervals, StreamingInterface, UvcConfig};
use uvc_host::pipeline::FramePool;
use uvc_host::{frame_channel, FrameCallback, Settings};

fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter("uvc_host=debug")
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let mut args = std::env::args_os().skip(1).map(PathBuf::from);
    let descriptor_path = args
        .next()
        .ok_or_else(|| eyre!("usage: uvc-host <config-descriptor.bin> [payload-dump.bin]"))?;
    let dump_path = args.next();

    let settings = match std::env::var_os("UVC_CONFIG") {
        Some(path) => Settings::load(PathBuf::from(path)).wrap_err("Failed to load settings")?,
        None => Settings::default(),
    };

    let raw = std::fs::read(&descriptor_path)
        .wrap_err_with(|| format!("Failed to read {}", descriptor_path.display()))?;
    let uvc = UvcConfig::parse(&raw)?;
    info!(
        bcd_uvc = format_args!("{:#06x}", uvc.bcd_uvc),
        streaming_interfaces = uvc.streaming.len(),
        "Parsed configuration descriptor"
    );
    for vs in &uvc.streaming {
        print_interface(vs);
    }

    let Some(dump_path) = dump_path else {
        return Ok(());
    };
    let vs = uvc
        .streaming
        .get(settings.device.stream_index)
        .ok_or_else(|| eyre!("no streaming interface {}", settings.device.stream_index))?;
    let matched = vs
        .find_format(&settings.format)
        .ok_or_else(|| eyre!("no format matches {:?}", settings.format))?;
    let format = matched.video_format();
    let max_frame_size = match matched.frame.max_frame_buffer_size {
        0 => matched.frame.width as usize * matched.frame.height as usize * 2,
        size => size as usize,
    };
    let frame_size = settings.advanced.frame_size.unwrap_or(max_frame_size);

    let dump = std::fs::read(&dump_path)
        .wrap_err_with(|| format!("Failed to read {}", dump_path.display()))?;
    info!(?format, frame_size, "Replaying {}", dump_path.display());

    let pool = Arc::new(FramePool::allocate(
        settings.advanced.number_of_frame_buffers,
        frame_size,
        format,
    )?);
    let (frame_cb, rx) = frame_channel(settings.advanced.number_of_frame_buffers);

    // Consumer: report each frame and hand the buffer back
    let consumer_pool = Arc::clone(&pool);
    let consumer = thread::spawn(move || {
        let mut frames = 0usize;
        for frame in rx {
            info!(
                sequence = frame.sequence(),
                len = frame.len(),
                truncated = frame.is_truncated(),
                pts = ?frame.pts(),
                "Frame"
            );
            frames += 1;
            if let Err(e) = consumer_pool.return_frame(frame) {
                error!("Failed to return frame: {}", e);
            }
        }
        frames
    });

    let mut sink = ReplaySink {
        pool: Arc::clone(&pool),
        frame_cb,
        overflows: 0,
        underflows: 0,
    };
    let mut reassembler = Reassembler::new(max_frame_size, settings.advanced.deliver_truncated);
    let bulk_packet_size = vs.bulk_endpoint().map(|ep| ep.max_packet_size as usize);

    let mut records = dump.as_slice();
    while !records.is_empty() {
        if records.len() < 4 {
            warn!(trailing = records.len(), "Truncated record header at end of dump");
            break;
        }
        let (len, rest) = records.split_at(4);
        let len = u32::from_le_bytes([len[0], len[1], len[2], len[3]]) as usize;
        let Some(payload) = rest.get(..len) else {
            warn!(len, available = rest.len(), "Truncated record at end of dump");
            break;
        };
        match bulk_packet_size {
            Some(mps) => {
                let short = len == 0 || len % mps.max(1) != 0;
                reassembler.bulk_packet(payload, short, &mut sink);
            }
            None => reassembler.isoc_packet(payload, &mut sink),
        }
        records = &rest[len..];
    }
    if let Some(frame) = reassembler.reset(max_frame_size) {
        pool.return_frame(frame)?;
    }

    let (overflows, underflows) = (sink.overflows, sink.underflows);
    // Dropping the sink closes the channel and lets the consumer finish
    drop(sink);
    let frames = consumer
        .join()
        .map_err(|_| eyre!("consumer thread panicked"))?;
    let (_, exhausted) = pool.stats();
    info!(frames, overflows, underflows, exhausted, "Replay finished");
    Ok(())
}

fn print_interface(vs: &StreamingInterface) {
    let transport = match vs.bulk_endpoint() {
        Some(ep) => format!("bulk {:#04x}, {} bytes", ep.address, ep.max_packet_size),
        None => format!(
            "isochronous, {} alternate settings",
            vs.alt_settings.iter().filter(|a| a.endpoint.is_some()).count()
        ),
    };
    println!("Interface {} ({})", vs.number, transport);
    for format in &vs.formats {
        let fourcc = format.fourcc().unwrap_or_default();
        println!("  Format {} {:?} {}", format.index, format.encoding, fourcc);
        for frame in &format.frames {
            let rates = match &frame.intervals {
                FrameIntervals::Discrete(list) => list
                    .iter()
                    .map(|&i| format!("{:.2}", interval_to_fps(i)))
                    .collect::<Vec<_>>()
                    .join(", "),
                FrameIntervals::Continuous { min, max, step } => format!(
                    "{:.2}..{:.2} step {}",
                    interval_to_fps(*max),
                    interval_to_fps(*min),
                    step
                ),
            };
            println!(
                "    Frame {} {}x{} fps [{}]",
                frame.index, frame.width, frame.height, rates
            );
        }
    }
}

/// Frame sink for offline replay: pool plus channel, no stream
struct ReplaySink {
    pool: Arc<FramePool>,
    frame_cb: FrameCallback,
    overflows: usize,
    underflows: usize,
}

impl FrameSink for ReplaySink {
    fn take_empty(&mut self) -> Option<Frame> {
        self.pool.get_empty()
    }

    fn deliver(&mut self, frame: Frame) {
        if let Some(frame) = (self.frame_cb)(frame) {
            self.discard(frame);
        }
    }

    fn discard(&mut self, frame: Frame) {
        if let Err(e) = self.pool.return_frame(frame) {
            error!("Failed to recycle frame: {}", e);
        }
    }

    fn overflow(&mut self) {
        self.overflows += 1;
    }

    fn underflow(&mut self) {
        self.underflows += 1;
    }
}
