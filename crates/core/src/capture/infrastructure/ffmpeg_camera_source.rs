use std::time::Instant;

use crate::capture::domain::frame_source::{FrameSource, SourceInfo};
use crate::shared::frame::Frame;

/// Camera device parameters handed to libavdevice.
#[derive(Clone, Debug)]
pub struct CameraOptions {
    /// Device node (`/dev/video0`), DirectShow name, or a media file path.
    pub device: String,
    /// Input format such as `video4linux2`, `avfoundation` or `dshow`.
    /// `None` lets ffmpeg guess the format, which also makes plain video files work.
    pub input_format: Option<String>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

struct OpenedCamera {
    ictx: ffmpeg_next::format::context::Input,
    decoder: ffmpeg_next::decoder::Video,
    scaler: ffmpeg_next::software::scaling::Context,
    stream_index: usize,
    width: u32,
    height: u32,
}

/// Captures frames from a camera through ffmpeg-next (libavdevice).
///
/// Each decoded frame is converted to RGB24 and stamped with the instant it
/// left the decoder.
pub struct FfmpegCameraSource {
    options: CameraOptions,
    opened: Option<OpenedCamera>,
    next_index: usize,
}

// Safety: FfmpegCameraSource is only used from the capture thread.
// The raw pointers inside ffmpeg types are not shared across threads.
unsafe impl Send for FfmpegCameraSource {}

impl FfmpegCameraSource {
    pub fn new(options: CameraOptions) -> Self {
        Self {
            options,
            opened: None,
            next_index: 0,
        }
    }

    fn open_input(&self) -> Result<ffmpeg_next::format::context::Input, Box<dyn std::error::Error>> {
        let Some(format_name) = self.options.input_format.as_deref() else {
            return Ok(ffmpeg_next::format::input(&self.options.device)?);
        };

        ffmpeg_next::device::register_all();
        let format = ffmpeg_next::device::input::video()
            .find(|f| f.name() == format_name)
            .ok_or_else(|| format!("Input format '{format_name}' is not available"))?;

        let mut dict = ffmpeg_next::Dictionary::new();
        dict.set(
            "video_size",
            &format!("{}x{}", self.options.width, self.options.height),
        );
        dict.set("framerate", &self.options.fps.to_string());

        let ctx = ffmpeg_next::format::open_with(
            &self.options.device,
            &ffmpeg_next::format::Format::Input(format),
            dict,
        )?;
        Ok(ctx.input())
    }
}

impl FrameSource for FfmpegCameraSource {
    fn open(&mut self) -> Result<SourceInfo, Box<dyn std::error::Error>> {
        ffmpeg_next::init()?;

        let ictx = self.open_input()?;
        let stream = ictx
            .streams()
            .best(ffmpeg_next::media::Type::Video)
            .ok_or("No video stream found")?;

        let stream_index = stream.index();
        let codec_ctx = ffmpeg_next::codec::context::Context::from_parameters(stream.parameters())?;
        let decoder = codec_ctx.decoder().video()?;

        let rate = stream.rate();
        let fps = if rate.denominator() != 0 {
            rate.numerator() as f64 / rate.denominator() as f64
        } else {
            0.0
        };

        let width = decoder.width();
        let height = decoder.height();
        let scaler = ffmpeg_next::software::scaling::Context::get(
            decoder.format(),
            width,
            height,
            ffmpeg_next::format::Pixel::RGB24,
            width,
            height,
            ffmpeg_next::software::scaling::Flags::BILINEAR,
        )?;

        let info = SourceInfo {
            width,
            height,
            fps,
            description: self.options.device.clone(),
        };
        log::info!(
            "Opened camera {} at {}x{} ({:.1} fps)",
            info.description,
            width,
            height,
            fps
        );

        self.opened = Some(OpenedCamera {
            ictx,
            decoder,
            scaler,
            stream_index,
            width,
            height,
        });
        Ok(info)
    }

    fn frames(
        &mut self,
    ) -> Box<dyn Iterator<Item = Result<Frame, Box<dyn std::error::Error>>> + '_> {
        let Some(opened) = self.opened.as_mut() else {
            return Box::new(std::iter::once(Err("FfmpegCameraSource: not opened".into())));
        };
        Box::new(CameraFrameIter {
            camera: opened,
            next_index: &mut self.next_index,
            flushing: false,
            done: false,
        })
    }

    fn close(&mut self) {
        self.opened = None;
    }
}

/// Decodes one frame per `next()` call, never buffering the stream.
struct CameraFrameIter<'a> {
    camera: &'a mut OpenedCamera,
    next_index: &'a mut usize,
    flushing: bool,
    done: bool,
}

impl CameraFrameIter<'_> {
    fn try_receive(&mut self) -> Option<Result<Frame, Box<dyn std::error::Error>>> {
        let mut decoded = ffmpeg_next::util::frame::video::Video::empty();
        if self.camera.decoder.receive_frame(&mut decoded).is_err() {
            return None;
        }
        let captured_at = Instant::now();

        let mut rgb_frame = ffmpeg_next::util::frame::video::Video::empty();
        if let Err(e) = self.camera.scaler.run(&decoded, &mut rgb_frame) {
            return Some(Err(Box::new(e)));
        }

        let (w, h) = (self.camera.width, self.camera.height);
        let pixels = extract_rgb_pixels(&rgb_frame, w, h);
        let frame = Frame::captured(pixels, w, h, 3, *self.next_index, captured_at);
        *self.next_index += 1;
        Some(Ok(frame))
    }
}

impl Iterator for CameraFrameIter<'_> {
    type Item = Result<Frame, Box<dyn std::error::Error>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        if let Some(result) = self.try_receive() {
            return Some(result);
        }

        if self.flushing {
            self.done = true;
            return None;
        }

        loop {
            let Some((stream, packet)) = self.camera.ictx.packets().next() else {
                let _ = self.camera.decoder.send_eof();
                self.flushing = true;
                if let Some(result) = self.try_receive() {
                    return Some(result);
                }
                self.done = true;
                return None;
            };

            if stream.index() != self.camera.stream_index {
                continue;
            }

            if let Err(e) = self.camera.decoder.send_packet(&packet) {
                log::debug!("Dropping undecodable packet: {e}");
                continue;
            }

            if let Some(result) = self.try_receive() {
                return Some(result);
            }
        }
    }
}

/// Copies pixel data from an ffmpeg frame into a tightly packed RGB buffer,
/// stripping per-row stride padding.
fn extract_rgb_pixels(
    rgb_frame: &ffmpeg_next::util::frame::video::Video,
    width: u32,
    height: u32,
) -> Vec<u8> {
    let stride = rgb_frame.stride(0);
    let data = rgb_frame.data(0);
    let w = width as usize;
    let h = height as usize;

    let mut pixels = Vec::with_capacity(w * h * 3);
    for row in 0..h {
        let row_start = row * stride;
        pixels.extend_from_slice(&data[row_start..row_start + w * 3]);
    }
    pixels
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    /// Encodes a short MPEG-4 clip standing in for a camera feed.
    fn create_test_clip(path: &Path, num_frames: usize, width: u32, height: u32) {
        ffmpeg_next::init().unwrap();
        let fps = 30;

        let mut octx = ffmpeg_next::format::output(&path).unwrap();
        let global_header = octx
            .format()
            .flags()
            .contains(ffmpeg_next::format::Flags::GLOBAL_HEADER);

        let codec = ffmpeg_next::encoder::find(ffmpeg_next::codec::Id::MPEG4).unwrap();
        let mut ost = octx.add_stream(Some(codec)).unwrap();
        let mut encoder_ctx = ffmpeg_next::codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .unwrap();
        encoder_ctx.set_width(width);
        encoder_ctx.set_height(height);
        encoder_ctx.set_format(ffmpeg_next::format::Pixel::YUV420P);
        encoder_ctx.set_time_base(ffmpeg_next::Rational(1, fps));
        encoder_ctx.set_frame_rate(Some(ffmpeg_next::Rational(fps, 1)));
        if global_header {
            encoder_ctx.set_flags(ffmpeg_next::codec::Flags::GLOBAL_HEADER);
        }
        let mut encoder = encoder_ctx
            .open_with(ffmpeg_next::Dictionary::new())
            .unwrap();
        ost.set_parameters(&encoder);
        octx.write_header().unwrap();
        let ost_time_base = octx.stream(0).unwrap().time_base();

        let mut scaler = ffmpeg_next::software::scaling::Context::get(
            ffmpeg_next::format::Pixel::RGB24,
            width,
            height,
            ffmpeg_next::format::Pixel::YUV420P,
            width,
            height,
            ffmpeg_next::software::scaling::Flags::BILINEAR,
        )
        .unwrap();

        for i in 0..num_frames {
            let mut rgb = ffmpeg_next::util::frame::video::Video::new(
                ffmpeg_next::format::Pixel::RGB24,
                width,
                height,
            );
            let value = ((i * 40) % 256) as u8;
            rgb.data_mut(0).fill(value);

            let mut yuv = ffmpeg_next::util::frame::video::Video::empty();
            scaler.run(&rgb, &mut yuv).unwrap();
            yuv.set_pts(Some(i as i64));
            encoder.send_frame(&yuv).unwrap();

            let mut encoded = ffmpeg_next::Packet::empty();
            while encoder.receive_packet(&mut encoded).is_ok() {
                encoded.set_stream(0);
                encoded.rescale_ts(ffmpeg_next::Rational(1, fps), ost_time_base);
                encoded.write_interleaved(&mut octx).unwrap();
            }
        }

        encoder.send_eof().unwrap();
        let mut encoded = ffmpeg_next::Packet::empty();
        while encoder.receive_packet(&mut encoded).is_ok() {
            encoded.set_stream(0);
            encoded.rescale_ts(ffmpeg_next::Rational(1, fps), ost_time_base);
            encoded.write_interleaved(&mut octx).unwrap();
        }
        octx.write_trailer().unwrap();
    }

    fn file_options(path: &Path) -> CameraOptions {
        CameraOptions {
            device: path.to_string_lossy().into_owned(),
            input_format: None,
            width: 160,
            height: 120,
            fps: 30,
        }
    }

    #[test]
    fn test_open_reports_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.mp4");
        create_test_clip(&path, 3, 160, 120);

        let mut source = FfmpegCameraSource::new(file_options(&path));
        let info = source.open().unwrap();
        assert_eq!((info.width, info.height), (160, 120));
        assert!(info.fps > 0.0);
    }

    #[test]
    fn test_frames_are_sequential_rgb() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.mp4");
        create_test_clip(&path, 5, 160, 120);

        let mut source = FfmpegCameraSource::new(file_options(&path));
        source.open().unwrap();
        let frames: Vec<Frame> = source.frames().map(|f| f.unwrap()).collect();

        assert_eq!(frames.len(), 5);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.index(), i);
            assert_eq!(frame.channels(), 3);
            assert_eq!(frame.data().len(), 160 * 120 * 3);
        }
        assert!(frames
            .windows(2)
            .all(|w| w[0].captured_at() <= w[1].captured_at()));
    }

    #[test]
    fn test_missing_device_fails_to_open() {
        let mut source = FfmpegCameraSource::new(file_options(Path::new("/nonexistent/cam0")));
        assert!(source.open().is_err());
    }

    #[test]
    fn test_unknown_input_format_fails_to_open() {
        let mut options = file_options(Path::new("/dev/null"));
        options.input_format = Some("no-such-format".into());
        assert!(FfmpegCameraSource::new(options).open().is_err());
    }

    #[test]
    fn test_frames_without_open_returns_error() {
        let mut source = FfmpegCameraSource::new(file_options(Path::new("unused")));
        assert!(source.frames().next().unwrap().is_err());
    }
}
