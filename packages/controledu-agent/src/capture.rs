//! Frame source trait boundary (C11).
//!
//! Platform screen capture is an external collaborator (§1). The agent
//! depends on it only through [`FrameSource`]; this module's
//! [`SyntheticFrameSource`] is the in-process fake that stands in for
//! it, per §9's "platform-gated trait boundary" pattern.

use image::{ImageBuffer, Rgb};

/// One captured frame plus whatever window/process context the
/// platform layer could read alongside it.
#[derive(Debug, Clone, Default)]
pub struct CapturedFrame {
    pub jpeg_bytes: Vec<u8>,
    pub active_process_name: Option<String>,
    pub active_window_title: Option<String>,
    pub browser_hint_url: Option<String>,
}

/// Platform screen capture boundary. A real implementation grabs the
/// active display and encodes it at the requested JPEG quality; this
/// crate ships only the synthetic fake below.
pub trait FrameSource: Send {
    fn capture(&mut self, width: u32, height: u32, jpeg_quality: u8) -> CapturedFrame;
}

/// Emits a solid-color JPEG that slowly cycles hue, so consecutive
/// frames differ enough for the frame-change filter (§4.7 Stage A) to
/// exercise its "changed" path on some calls and its "unchanged" path
/// on others.
#[derive(Debug, Default)]
pub struct SyntheticFrameSource {
    tick: u8,
}

impl FrameSource for SyntheticFrameSource {
    fn capture(&mut self, width: u32, height: u32, jpeg_quality: u8) -> CapturedFrame {
        self.tick = self.tick.wrapping_add(7);
        let pixel = Rgb([self.tick, 128u8.wrapping_sub(self.tick), 200u8]);
        let image: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_pixel(width, height, pixel);

        let mut jpeg_bytes = Vec::new();
        let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg_bytes, jpeg_quality);
        let _ = encoder.encode(image.as_raw(), width, height, image::ExtendedColorType::Rgb8);

        CapturedFrame {
            jpeg_bytes,
            active_process_name: Some("synthetic".into()),
            active_window_title: Some("Synthetic Desktop".into()),
            browser_hint_url: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_frame_source_produces_nonempty_jpeg() {
        let mut source = SyntheticFrameSource::default();
        let frame = source.capture(32, 18, 70);
        assert!(!frame.jpeg_bytes.is_empty());
    }

    #[test]
    fn test_synthetic_frame_source_varies_across_calls() {
        let mut source = SyntheticFrameSource::default();
        let a = source.capture(16, 9, 70);
        let b = source.capture(16, 9, 70);
        assert_ne!(a.jpeg_bytes, b.jpeg_bytes);
    }
}
