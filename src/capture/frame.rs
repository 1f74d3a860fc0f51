//! Raw frame representation shared by sources and encoders

use std::time::SystemTime;

/// A single captured frame of pixel data.
#[derive(Debug, Clone)]
pub struct Frame {
    pub timestamp: SystemTime,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgba8888,
    Bgra8888,
}

impl Frame {
    /// Expected byte length of a packed 4-byte-per-pixel frame.
    pub fn expected_len(width: u32, height: u32) -> usize {
        (width as usize) * (height as usize) * 4
    }

    /// Whether the data buffer matches the declared dimensions.
    pub fn is_complete(&self) -> bool {
        self.data.len() == Self::expected_len(self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_len_counts_four_bytes_per_pixel() {
        assert_eq!(Frame::expected_len(2, 2), 16);
        assert_eq!(Frame::expected_len(1280, 720), 1280 * 720 * 4);
    }

    #[test]
    fn is_complete_checks_buffer_size() {
        let frame = Frame {
            timestamp: SystemTime::now(),
            width: 2,
            height: 2,
            pixel_format: PixelFormat::Bgra8888,
            data: vec![0; 16],
        };
        assert!(frame.is_complete());

        let short = Frame { data: vec![0; 8], ..frame };
        assert!(!short.is_complete());
    }
}
