//! Common types used throughout trackfeed

use serde::{Deserialize, Serialize};

/// Frame dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    // Common capture sizes
    pub const QVGA: Self = Self::new(320, 240);
    pub const VGA: Self = Self::new(640, 480);
    pub const HD_720P: Self = Self::new(1280, 720);
    pub const FHD_1080P: Self = Self::new(1920, 1080);

    /// Calculate total pixels
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Width over height; 0 for an empty size
    pub fn aspect_ratio(&self) -> f64 {
        if self.height == 0 {
            return 0.0;
        }
        self.width as f64 / self.height as f64
    }
}

impl std::fmt::Display for Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl std::str::FromStr for Size {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (w, h) = s
            .split_once('x')
            .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {s:?}"))?;
        let width = w.trim().parse().map_err(|_| format!("bad width in {s:?}"))?;
        let height = h.trim().parse().map_err(|_| format!("bad height in {s:?}"))?;
        Ok(Size::new(width, height))
    }
}

/// Axis-aligned rectangle in pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Rectangle at the origin covering `size`
    pub const fn from_size(size: Size) -> Self {
        Self::new(0, 0, size.width, size.height)
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    pub fn right(&self) -> u64 {
        self.x as u64 + self.width as u64
    }

    pub fn bottom(&self) -> u64 {
        self.y as u64 + self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// True when `other` lies entirely inside this rectangle
    pub fn contains(&self, other: &Rect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    /// True when this rectangle fits inside a buffer of `size`
    pub fn fits_within(&self, size: Size) -> bool {
        Rect::from_size(size).contains(self)
    }
}

impl std::fmt::Display for Rect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

/// Pixel format of a video frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Planar YUV 4:2:0, Y then U then V
    I420,
    /// Planar YUV 4:2:0, Y then V then U
    Yv12,
    /// Planar YUV 4:2:2
    Yv16,
    /// Planar YUV 4:4:4
    Yv24,
    /// Y plane + interleaved UV 4:2:0
    Nv12,
    /// 32-bit ARGB, single plane
    Argb,
    /// 16-bit single channel (depth cameras)
    Y16,
    /// Opaque GPU texture, no CPU planes
    NativeTexture,
}

/// Location of one plane inside a frame's backing memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    /// Byte offset from the start of the backing memory
    pub offset: usize,
    /// Bytes per row
    pub stride: usize,
    /// Number of rows
    pub rows: usize,
}

impl PlaneLayout {
    pub fn len(&self) -> usize {
        self.stride * self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PixelFormat {
    /// Number of CPU-addressable planes
    pub fn num_planes(&self) -> usize {
        match self {
            PixelFormat::I420 | PixelFormat::Yv12 | PixelFormat::Yv16 | PixelFormat::Yv24 => 3,
            PixelFormat::Nv12 => 2,
            PixelFormat::Argb | PixelFormat::Y16 => 1,
            PixelFormat::NativeTexture => 0,
        }
    }

    /// Tightly packed plane layout for a frame of `coded` size
    pub fn plane_layout(&self, coded: Size) -> Vec<PlaneLayout> {
        let w = coded.width as usize;
        let h = coded.height as usize;
        let half_w = w.div_ceil(2);
        let half_h = h.div_ceil(2);

        let dims: Vec<(usize, usize)> = match self {
            PixelFormat::I420 | PixelFormat::Yv12 => vec![(w, h), (half_w, half_h), (half_w, half_h)],
            PixelFormat::Yv16 => vec![(w, h), (half_w, h), (half_w, h)],
            PixelFormat::Yv24 => vec![(w, h), (w, h), (w, h)],
            PixelFormat::Nv12 => vec![(w, h), (half_w * 2, half_h)],
            PixelFormat::Argb => vec![(w * 4, h)],
            PixelFormat::Y16 => vec![(w * 2, h)],
            PixelFormat::NativeTexture => Vec::new(),
        };

        let mut offset = 0;
        dims.into_iter()
            .map(|(stride, rows)| {
                let plane = PlaneLayout {
                    offset,
                    stride,
                    rows,
                };
                offset += plane.len();
                plane
            })
            .collect()
    }

    /// Bytes needed to hold a frame of `coded` size
    pub fn allocation_size(&self, coded: Size) -> usize {
        self.plane_layout(coded).iter().map(PlaneLayout::len).sum()
    }

    /// Is this a YUV format?
    pub fn is_yuv(&self) -> bool {
        matches!(
            self,
            PixelFormat::I420
                | PixelFormat::Yv12
                | PixelFormat::Yv16
                | PixelFormat::Yv24
                | PixelFormat::Nv12
        )
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PixelFormat::I420 => "I420",
            PixelFormat::Yv12 => "YV12",
            PixelFormat::Yv16 => "YV16",
            PixelFormat::Yv24 => "YV24",
            PixelFormat::Nv12 => "NV12",
            PixelFormat::Argb => "ARGB",
            PixelFormat::Y16 => "Y16",
            PixelFormat::NativeTexture => "NATIVE_TEXTURE",
        };
        f.write_str(name)
    }
}

/// Where a frame's pixels live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum StorageType {
    /// Shared memory mapped from the capture device
    #[default]
    SharedMemory,
    /// Heap memory owned by the frame
    Owned,
    /// GPU texture
    Texture,
}

/// Framerate representation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Framerate {
    pub num: u32,
    pub den: u32,
}

impl Framerate {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    // Common framerates
    pub const FPS_15: Self = Self::new(15, 1);
    pub const FPS_30: Self = Self::new(30, 1);
    pub const FPS_60: Self = Self::new(60, 1);

    /// Get framerate as f64 (0 for an unknown rate)
    pub fn as_f64(&self) -> f64 {
        if self.den == 0 {
            return 0.0;
        }
        self.num as f64 / self.den as f64
    }

    /// Frame interval, `None` for a zero or unknown rate
    pub fn frame_interval(&self) -> Option<std::time::Duration> {
        let fps = self.as_f64();
        (fps > 0.0).then(|| std::time::Duration::from_secs_f64(1.0 / fps))
    }
}

impl Default for Framerate {
    fn default() -> Self {
        Self::FPS_30
    }
}

impl std::fmt::Display for Framerate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.den == 1 {
            write!(f, "{} fps", self.num)
        } else {
            write!(f, "{:.2} fps", self.as_f64())
        }
    }
}

/// A capture format offered by a device
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VideoCaptureFormat {
    pub frame_size: Size,
    /// Nominal rate; 0.0 means the device does not know
    pub frame_rate: f64,
    pub pixel_format: PixelFormat,
}

impl VideoCaptureFormat {
    pub fn new(frame_size: Size, frame_rate: f64, pixel_format: PixelFormat) -> Self {
        Self {
            frame_size,
            frame_rate,
            pixel_format,
        }
    }
}

impl std::fmt::Display for VideoCaptureFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} @ {:.2} fps ({})",
            self.frame_size, self.frame_rate, self.pixel_format
        )
    }
}

/// Opaque GPU fence a consumer hands back with a released buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SyncToken(pub u64);

impl SyncToken {
    pub const NULL: Self = Self(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

/// Statistics for monitoring a capture pipeline
#[derive(Debug, Clone, Default)]
pub struct Stats {
    /// Buffers turned into frames
    pub frames_captured: u64,
    /// Buffers handed back without building a frame
    pub buffers_rejected: u64,
    /// Release messages sent to the device
    pub buffers_released: u64,
    /// Frames handed to the adapter registry
    pub frames_delivered: u64,
    /// Frames dropped by frame-rate adaptation
    pub frames_dropped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn i420_layout_rounds_chroma_up() {
        let planes = PixelFormat::I420.plane_layout(Size::new(5, 3));
        assert_eq!(planes.len(), 3);
        assert_eq!(planes[0], PlaneLayout { offset: 0, stride: 5, rows: 3 });
        assert_eq!(planes[1], PlaneLayout { offset: 15, stride: 3, rows: 2 });
        assert_eq!(planes[2], PlaneLayout { offset: 21, stride: 3, rows: 2 });
        assert_eq!(PixelFormat::I420.allocation_size(Size::new(5, 3)), 27);
    }

    #[test]
    fn allocation_sizes() {
        let vga = Size::VGA;
        assert_eq!(PixelFormat::I420.allocation_size(vga), 640 * 480 * 3 / 2);
        assert_eq!(PixelFormat::Nv12.allocation_size(vga), 640 * 480 * 3 / 2);
        assert_eq!(PixelFormat::Yv24.allocation_size(vga), 640 * 480 * 3);
        assert_eq!(PixelFormat::Argb.allocation_size(vga), 640 * 480 * 4);
        assert_eq!(PixelFormat::NativeTexture.allocation_size(vga), 0);
    }

    #[test]
    fn rect_containment() {
        let outer = Rect::new(0, 0, 640, 480);
        assert!(outer.contains(&Rect::new(0, 60, 640, 360)));
        assert!(!outer.contains(&Rect::new(1, 0, 640, 480)));
        assert!(Rect::new(10, 10, 20, 20).fits_within(Size::new(30, 30)));
        assert!(!Rect::new(10, 10, 21, 20).fits_within(Size::new(30, 30)));
    }

    #[test]
    fn size_parses_from_str() {
        assert_eq!("1280x720".parse::<Size>().unwrap(), Size::HD_720P);
        assert!("1280".parse::<Size>().is_err());
    }

    #[test]
    fn zero_framerate_has_no_interval() {
        assert!(Framerate::new(0, 1).frame_interval().is_none());
        assert_eq!(
            Framerate::FPS_30.frame_interval().unwrap().as_micros(),
            33_333
        );
    }
}
