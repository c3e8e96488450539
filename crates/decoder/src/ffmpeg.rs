//! FFmpeg container and codec backend (`ffmpeg` feature).
//!
//! Wraps `ffmpeg-next` behind the [`MediaOpener`], [`Demuxer`] and
//! [`FrameDecoder`] contracts. Pixel formats the engine converters do not
//! know are turned into RGBA8 with swscale inside the backend, so the
//! format reported in [`StreamInfo`] is always the format frames arrive in.

use std::path::Path;

use ffmpeg_next as ffmpeg;
use ffmpeg::format::Pixel;
use ffmpeg::software::scaling;
use ffmpeg::util::frame::video::Video as VideoFrame;
use ffmpeg::Rescale;
use tracing::debug;

use se_common::{
    BackendError, DecodedFrame, FailureKind, FrameDecoder, MediaKind, OpenError, Packet,
    PixelFormat, Plane, Rational, Resolution, Stage, StreamInfo, VideoCodec,
};
use se_demux::{Demuxer, MediaOpener};

fn backend_error(stage: Stage, err: ffmpeg::Error) -> BackendError {
    use ffmpeg::util::error::ENOMEM;

    let kind = match err {
        ffmpeg::Error::InvalidData | ffmpeg::Error::BsfNotFound => FailureKind::InvalidData,
        ffmpeg::Error::DecoderNotFound
        | ffmpeg::Error::DemuxerNotFound
        | ffmpeg::Error::PatchWelcome => FailureKind::Unsupported,
        ffmpeg::Error::Other { errno } if errno == ENOMEM => FailureKind::OutOfMemory,
        _ => FailureKind::Other,
    };
    BackendError::new(stage, kind, err.to_string()).with_code(i32::from(err))
}

fn is_again(err: &ffmpeg::Error) -> bool {
    matches!(err, ffmpeg::Error::Other { errno } if *errno == ffmpeg::util::error::EAGAIN)
}

fn no_pts(value: i64) -> Option<i64> {
    (value != ffmpeg::ffi::AV_NOPTS_VALUE).then_some(value)
}

fn rational(r: ffmpeg::Rational) -> Rational {
    if r.numerator() <= 0 || r.denominator() <= 0 {
        return Rational { num: 0, den: 1 };
    }
    Rational {
        num: r.numerator() as u32,
        den: r.denominator() as u32,
    }
}

fn codec_of(id: ffmpeg::codec::Id) -> VideoCodec {
    use ffmpeg::codec::Id;
    match id {
        Id::H264 => VideoCodec::H264,
        Id::HEVC => VideoCodec::H265,
        Id::VP9 => VideoCodec::Vp9,
        Id::AV1 => VideoCodec::Av1,
        Id::PRORES => VideoCodec::ProRes,
        Id::MPEG2VIDEO => VideoCodec::Mpeg2,
        Id::MPEG4 => VideoCodec::Mpeg4,
        Id::MJPEG => VideoCodec::Mjpeg,
        Id::DNXHD => VideoCodec::DnxHd,
        Id::RAWVIDEO => VideoCodec::RawVideo,
        _ => VideoCodec::Unknown,
    }
}

/// Engine format of frames in `pixel`, `None` when the backend converts
/// them to RGBA8.
fn native_format(pixel: Pixel) -> Option<PixelFormat> {
    match pixel {
        Pixel::RGBA => Some(PixelFormat::Rgba8),
        Pixel::RGB24 => Some(PixelFormat::Rgb8),
        Pixel::GRAY8 => Some(PixelFormat::Gray8),
        Pixel::NV12 => Some(PixelFormat::Nv12),
        Pixel::YUV420P | Pixel::YUVJ420P => Some(PixelFormat::Yuv420p),
        _ => None,
    }
}

fn stream_info(stream: &ffmpeg::format::stream::Stream<'_>) -> StreamInfo {
    let params = stream.parameters();
    let kind = match params.medium() {
        ffmpeg::media::Type::Video => MediaKind::Video,
        ffmpeg::media::Type::Audio => MediaKind::Audio,
        ffmpeg::media::Type::Subtitle => MediaKind::Subtitle,
        _ => MediaKind::Data,
    };
    let codec = codec_of(params.id());
    // SAFETY: `params` wraps the stream's live codec parameters.
    let (width, height, video_delay, sar) = unsafe {
        let p = params.as_ptr();
        (
            (*p).width.max(0) as u32,
            (*p).height.max(0) as u32,
            (*p).video_delay.max(0) as u32,
            (*p).sample_aspect_ratio,
        )
    };

    let mut frame_rate = rational(stream.avg_frame_rate());
    if !frame_rate.is_valid() {
        frame_rate = rational(stream.rate());
    }

    let pixel_format = if kind == MediaKind::Video {
        ffmpeg::codec::context::Context::from_parameters(params)
            .and_then(|ctx| ctx.decoder().video())
            .ok()
            .and_then(|video| native_format(video.format()))
            .unwrap_or(PixelFormat::Rgba8)
    } else {
        PixelFormat::Rgba8
    };

    StreamInfo {
        index: stream.index(),
        kind,
        codec,
        time_base: rational(stream.time_base()),
        frame_rate,
        start_time: no_pts(stream.start_time()),
        duration: no_pts(stream.duration()).filter(|d| *d > 0),
        frame_count: (stream.frames() > 0).then(|| stream.frames() as u64),
        reorder_depth: video_delay,
        resolution: Resolution::new(width, height),
        pixel_format,
        sample_aspect: rational(ffmpeg::Rational::new(sar.num, sar.den)),
    }
}

// ---------------------------------------------------------------------------
// Opener
// ---------------------------------------------------------------------------

/// Opens files with libavformat.
#[derive(Clone, Debug)]
pub struct FfmpegOpener {
    /// Frame-threading decoder workers; 1 disables frame threading.
    threads: usize,
}

impl Default for FfmpegOpener {
    fn default() -> Self {
        Self { threads: 1 }
    }
}

impl FfmpegOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }
}

impl MediaOpener for FfmpegOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn Demuxer>, OpenError> {
        ffmpeg::init().map_err(|e| OpenError::Backend(backend_error(Stage::Open, e)))?;
        if !path.exists() {
            return Err(OpenError::NotFound {
                path: path.display().to_string(),
            });
        }
        let input = ffmpeg::format::input(&path).map_err(|e| OpenError::UnsupportedContainer {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let streams: Vec<StreamInfo> = input.streams().map(|s| stream_info(&s)).collect();
        debug!(path = %path.display(), streams = streams.len(), "Opened container");
        Ok(Box::new(FfmpegDemuxer {
            input,
            streams,
            threads: self.threads,
        }))
    }
}

// ---------------------------------------------------------------------------
// Demuxer
// ---------------------------------------------------------------------------

pub struct FfmpegDemuxer {
    input: ffmpeg::format::context::Input,
    streams: Vec<StreamInfo>,
    threads: usize,
}

impl std::fmt::Debug for FfmpegDemuxer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FfmpegDemuxer")
            .field("streams", &self.streams.len())
            .field("threads", &self.threads)
            .finish()
    }
}

impl Demuxer for FfmpegDemuxer {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn read_packet(&mut self) -> Result<Option<Packet>, BackendError> {
        let mut packet = ffmpeg::Packet::empty();
        match packet.read(&mut self.input) {
            Ok(()) => Ok(Some(Packet {
                stream_index: packet.stream(),
                pts: packet.pts(),
                dts: packet.dts(),
                is_keyframe: packet.is_key(),
                data: packet.data().map(<[u8]>::to_vec).unwrap_or_default(),
            })),
            Err(ffmpeg::Error::Eof) => Ok(None),
            Err(e) => Err(backend_error(Stage::ReadPacket, e)),
        }
    }

    fn seek(&mut self, stream_index: usize, timestamp: i64) -> Result<(), BackendError> {
        let time_base = self
            .stream(stream_index)
            .map(|s| s.time_base)
            .ok_or_else(|| {
                BackendError::new(
                    Stage::Seek,
                    FailureKind::Other,
                    format!("no stream with index {stream_index}"),
                )
            })?;
        let source = ffmpeg::Rational::new(time_base.num as i32, time_base.den as i32);
        let global = timestamp.rescale(source, ffmpeg::rescale::TIME_BASE);
        self.input
            .seek(global, ..=global)
            .map_err(|e| backend_error(Stage::Seek, e))
    }

    fn open_decoder(&mut self, stream_index: usize) -> Result<Box<dyn FrameDecoder>, OpenError> {
        let info = self
            .stream(stream_index)
            .cloned()
            .ok_or(OpenError::StreamNotFound {
                stream: stream_index,
            })?;
        let stream = self
            .input
            .stream(stream_index)
            .ok_or(OpenError::StreamNotFound {
                stream: stream_index,
            })?;

        let mut ctx = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| OpenError::Backend(backend_error(Stage::Open, e)))?;
        if self.threads > 1 {
            ctx.set_threading(ffmpeg::threading::Config {
                kind: ffmpeg::threading::Type::Frame,
                count: self.threads,
                ..Default::default()
            });
        }
        let decoder = ctx.decoder().video().map_err(|e| match e {
            ffmpeg::Error::DecoderNotFound => OpenError::UnsupportedCodec {
                stream: stream_index,
                codec: info.codec,
            },
            e => OpenError::Backend(backend_error(Stage::Open, e)),
        })?;

        // Frame threading holds one frame per extra worker.
        let delay = info.reorder_depth + (self.threads as u32).saturating_sub(1);
        Ok(Box::new(FfmpegDecoder {
            decoder,
            stream_index,
            delay,
        }))
    }
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

pub struct FfmpegDecoder {
    decoder: ffmpeg::decoder::Video,
    stream_index: usize,
    delay: u32,
}

impl FfmpegDecoder {
    fn to_decoded(frame: &VideoFrame) -> Result<DecodedFrame, BackendError> {
        // SAFETY: the frame holds a decoded picture; only a scalar field is read.
        let pkt_dts = no_pts(unsafe { (*frame.as_ptr()).pkt_dts });
        let pts = frame.pts().or(frame.timestamp());

        let converted;
        let (source, format) = match native_format(frame.format()) {
            Some(format) => (frame, format),
            None => {
                let mut scaler = scaling::Context::get(
                    frame.format(),
                    frame.width(),
                    frame.height(),
                    Pixel::RGBA,
                    frame.width(),
                    frame.height(),
                    scaling::Flags::BILINEAR,
                )
                .map_err(|e| backend_error(Stage::ReceiveFrame, e))?;
                let mut rgba = VideoFrame::empty();
                scaler
                    .run(frame, &mut rgba)
                    .map_err(|e| backend_error(Stage::ReceiveFrame, e))?;
                converted = rgba;
                (&converted, PixelFormat::Rgba8)
            }
        };

        let planes = (0..source.planes())
            .map(|i| Plane {
                data: source.data(i).to_vec(),
                stride: source.stride(i),
            })
            .collect();
        Ok(DecodedFrame {
            pts,
            pkt_dts,
            resolution: Resolution::new(source.width(), source.height()),
            format,
            planes,
        })
    }
}

impl FrameDecoder for FfmpegDecoder {
    fn send_packet(&mut self, packet: &Packet) -> Result<(), BackendError> {
        let mut av_packet = ffmpeg::Packet::copy(&packet.data);
        av_packet.set_stream(self.stream_index);
        av_packet.set_pts(packet.pts);
        av_packet.set_dts(packet.dts);
        if packet.is_keyframe {
            av_packet.set_flags(ffmpeg::packet::Flags::KEY);
        }
        self.decoder
            .send_packet(&av_packet)
            .map_err(|e| backend_error(Stage::SendPacket, e))
    }

    fn send_eof(&mut self) -> Result<(), BackendError> {
        match self.decoder.send_eof() {
            Ok(()) | Err(ffmpeg::Error::Eof) => Ok(()),
            Err(e) => Err(backend_error(Stage::SendPacket, e)),
        }
    }

    fn receive_frame(&mut self) -> Result<Option<DecodedFrame>, BackendError> {
        let mut frame = VideoFrame::empty();
        match self.decoder.receive_frame(&mut frame) {
            Ok(()) => Self::to_decoded(&frame).map(Some),
            Err(ffmpeg::Error::Eof) => Ok(None),
            Err(e) if is_again(&e) => Ok(None),
            Err(e) => Err(backend_error(Stage::ReceiveFrame, e)),
        }
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }

    fn delay_frames(&self) -> u32 {
        self.delay
    }
}
