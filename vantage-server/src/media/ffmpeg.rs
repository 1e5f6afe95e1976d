//! ffmpeg-backed demuxer and muxer.
//!
//! [`RtspSourceOpener`] opens an RTSP session over TCP with a 5 s socket
//! timeout and low-delay demuxing; [`Mp4ContainerOpener`] produces
//! single-video-track MP4 files by stream copy. Both sides treat the codec
//! payloads as opaque bytes; nothing is re-encoded.

use std::collections::VecDeque;
use std::path::Path;

use ffmpeg_next::{self as ffmpeg, ffi};
use vantage_core::{EncodedPacket, TimeBase};

use super::{
    ContainerOpener, ContainerWriter, MediaError, MediaSource, PreviewFrame, SourceEvent,
    SourceOpener, StreamInfo, WritePacket,
};

/// Global library setup; must run once before any open.
pub fn init() -> Result<(), MediaError> {
    ffmpeg::init().map_err(|e| MediaError::Demuxer(e.to_string()))
}

fn time_base_of(r: ffmpeg::Rational) -> TimeBase {
    TimeBase::new(r.numerator(), r.denominator())
}

fn parameters_extradata(par: &ffmpeg::codec::Parameters) -> Vec<u8> {
    unsafe {
        let p = par.as_ptr();
        if (*p).extradata.is_null() || (*p).extradata_size <= 0 {
            Vec::new()
        } else {
            std::slice::from_raw_parts((*p).extradata, (*p).extradata_size as usize).to_vec()
        }
    }
}

fn parameters_dimensions(par: &ffmpeg::codec::Parameters) -> (u32, u32) {
    unsafe {
        let p = par.as_ptr();
        ((*p).width.max(0) as u32, (*p).height.max(0) as u32)
    }
}

pub struct RtspSourceOpener;

impl SourceOpener for RtspSourceOpener {
    type Source = RtspSource;

    fn open(
        &self,
        stream_id: &str,
        url: &str,
        decode_preview: bool,
    ) -> Result<RtspSource, MediaError> {
        let mut opts = ffmpeg::Dictionary::new();
        opts.set("rtsp_transport", "tcp");
        opts.set("stimeout", "5000000"); // 5 s, in microseconds
        opts.set("fflags", "nobuffer");
        opts.set("flags", "low_delay");
        opts.set("reorder_queue_size", "1");
        // Help the demuxer find H.264 codec parameters over RTSP.
        opts.set("probesize", "5000000");
        opts.set("analyzeduration", "1000000");

        let owned_url = url.to_string();
        let input = ffmpeg::format::input_with_dictionary(&owned_url, opts).map_err(|e| {
            MediaError::OpenInput {
                url: owned_url.clone(),
                reason: e.to_string(),
            }
        })?;

        let (video_index, parameters, stream_time_base) = {
            let stream = input
                .streams()
                .best(ffmpeg::media::Type::Video)
                .ok_or_else(|| MediaError::NoVideoStream(owned_url.clone()))?;
            (stream.index(), stream.parameters(), stream.time_base())
        };

        // The decoder only exists to refine width/height/extradata from the
        // first frame, and to feed an attached preview sink. Failure to set
        // one up is not fatal to the packet path.
        let decoder = match ffmpeg::codec::context::Context::from_parameters(parameters.clone()) {
            Ok(context) => match context.decoder().video() {
                Ok(decoder) => Some(decoder),
                Err(e) => {
                    log::warn!("{}: no video decoder available: {}", stream_id, e);
                    None
                }
            },
            Err(e) => {
                log::warn!("{}: cannot create decoder context: {}", stream_id, e);
                None
            }
        };

        let (width, height) = parameters_dimensions(&parameters);
        if width == 0 || height == 0 {
            log::debug!(
                "{}: codec parameters carry no frame size yet, waiting for first decoded frame",
                stream_id
            );
        }

        let info = StreamInfo {
            stream_id: stream_id.to_string(),
            codec_id: parameters.id(),
            time_base: time_base_of(stream_time_base),
            width,
            height,
            extradata: parameters_extradata(&parameters),
        };

        Ok(RtspSource {
            stream_id: stream_id.to_string(),
            input,
            video_index,
            decoder,
            info,
            refined: false,
            decode_preview,
            pending: VecDeque::new(),
        })
    }
}

pub struct RtspSource {
    stream_id: String,
    input: ffmpeg::format::context::Input,
    video_index: usize,
    decoder: Option<ffmpeg::decoder::Video>,
    info: StreamInfo,
    refined: bool,
    decode_preview: bool,
    pending: VecDeque<SourceEvent>,
}

impl MediaSource for RtspSource {
    fn info(&self) -> StreamInfo {
        self.info.clone()
    }

    fn read(&mut self) -> Result<SourceEvent, MediaError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }

            let (is_video, packet_time_base, packet) = {
                match self.input.packets().next() {
                    Some((stream, packet)) => (
                        stream.index() == self.video_index,
                        time_base_of(stream.time_base()),
                        packet,
                    ),
                    // The packet iterator swallows read errors into end of
                    // iteration; either way the session is done.
                    None => return Err(MediaError::EndOfStream),
                }
            };

            if !is_video {
                continue;
            }

            let encoded = EncodedPacket {
                stream_id: self.stream_id.clone(),
                data: packet.data().map(|d| d.to_vec()).unwrap_or_default(),
                pts: packet.pts(),
                dts: packet.dts(),
                duration: packet.duration().max(0),
                key: packet.is_key(),
                time_base: packet_time_base,
            };
            self.pending.push_back(SourceEvent::Packet(encoded));

            self.decode(&packet);
        }
    }
}

impl RtspSource {
    /// Feed the side decoder. Produces an `InfoChanged` event on the first
    /// decoded frame and `Frame` events while a preview sink is attached.
    /// Decode problems are logged and skipped; the packet path is
    /// unaffected.
    fn decode(&mut self, packet: &ffmpeg::Packet) {
        let Some(decoder) = self.decoder.as_mut() else {
            return;
        };

        if let Err(e) = decoder.send_packet(packet) {
            log::warn!("{}: decoder rejected packet: {}", self.stream_id, e);
            return;
        }

        let mut frame = ffmpeg::frame::Video::empty();
        while decoder.receive_frame(&mut frame).is_ok() {
            if !self.refined {
                self.refined = true;
                self.info.width = decoder.width();
                self.info.height = decoder.height();

                // Prefer the decoder context's extradata; fall back to what
                // the demuxed stream parameters carried at open time.
                let ctx_extradata = unsafe {
                    let p = decoder.as_ptr();
                    if (*p).extradata.is_null() || (*p).extradata_size <= 0 {
                        Vec::new()
                    } else {
                        std::slice::from_raw_parts((*p).extradata, (*p).extradata_size as usize)
                            .to_vec()
                    }
                };
                if !ctx_extradata.is_empty() {
                    self.info.extradata = ctx_extradata;
                }

                log::debug!(
                    "{}: first decoded frame {}x{}",
                    self.stream_id,
                    self.info.width,
                    self.info.height
                );
                self.pending
                    .push_back(SourceEvent::InfoChanged(self.info.clone()));
            }

            if self.decode_preview {
                let mut data = Vec::new();
                for plane in 0..frame.planes() {
                    data.extend_from_slice(frame.data(plane));
                }
                self.pending.push_back(SourceEvent::Frame(PreviewFrame::Image {
                    stream_id: self.stream_id.clone(),
                    width: frame.width(),
                    height: frame.height(),
                    data,
                }));
            }
        }

        // Once the info is refined an unattached preview sink has no use
        // for decoded frames; drop the decoder to save CPU.
        if self.refined && !self.decode_preview {
            self.decoder = None;
        }
    }
}

pub struct Mp4ContainerOpener;

impl ContainerOpener for Mp4ContainerOpener {
    type Writer = Mp4Writer;

    fn open(&self, path: &Path, info: &StreamInfo) -> Result<Mp4Writer, MediaError> {
        let open_err = |reason: String| MediaError::OpenOutput {
            path: path.display().to_string(),
            reason,
        };

        let mut output =
            ffmpeg::format::output_as(&path, "mp4").map_err(|e| open_err(e.to_string()))?;

        {
            let mut stream = output
                .add_stream(ffmpeg::encoder::find(ffmpeg::codec::Id::None))
                .map_err(|e| open_err(e.to_string()))?;

            // Stream copy: build the codec parameters from the captured
            // stream info instead of an encoder.
            unsafe {
                let par = stream.parameters().as_mut_ptr();
                (*par).codec_type = ffi::AVMediaType::AVMEDIA_TYPE_VIDEO;
                (*par).codec_id = info.codec_id.into();
                (*par).codec_tag = 0; // let the muxer choose
                (*par).width = info.width as i32;
                (*par).height = info.height as i32;

                if !info.extradata.is_empty() {
                    let size = info.extradata.len();
                    let buf = ffi::av_mallocz(
                        (size + ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize) as _,
                    ) as *mut u8;
                    if buf.is_null() {
                        return Err(open_err("cannot allocate extradata".to_string()));
                    }
                    std::ptr::copy_nonoverlapping(info.extradata.as_ptr(), buf, size);
                    (*par).extradata = buf;
                    (*par).extradata_size = size as i32;
                }
            }

            stream.set_time_base(ffmpeg::Rational::new(
                info.time_base.num,
                info.time_base.den,
            ));
        }

        output
            .write_header()
            .map_err(|e| open_err(e.to_string()))?;

        // The muxer may have replaced the requested time base while writing
        // the header; rebased timestamps must use what it actually chose.
        let time_base = output
            .stream(0)
            .map(|s| time_base_of(s.time_base()))
            .ok_or_else(|| open_err("output stream disappeared".to_string()))?;

        Ok(Mp4Writer {
            output,
            time_base,
            finalized: false,
        })
    }
}

pub struct Mp4Writer {
    output: ffmpeg::format::context::Output,
    time_base: TimeBase,
    finalized: bool,
}

impl ContainerWriter for Mp4Writer {
    fn time_base(&self) -> TimeBase {
        self.time_base
    }

    fn write(&mut self, packet: WritePacket<'_>) -> Result<(), MediaError> {
        let mut out = ffmpeg::Packet::copy(packet.data);
        out.set_pts(packet.pts);
        out.set_dts(packet.dts);
        out.set_duration(packet.duration);
        if packet.key {
            out.set_flags(ffmpeg::packet::Flags::KEY);
        }
        out.set_stream(0);
        out.set_position(-1);
        out.write_interleaved(&mut self.output)
            .map_err(|e| MediaError::Muxer(e.to_string()))
    }

    fn finalize(&mut self) -> Result<(), MediaError> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;
        self.output
            .write_trailer()
            .map_err(|e| MediaError::Muxer(e.to_string()))
    }
}
