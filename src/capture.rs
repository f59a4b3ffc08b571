//! Frame sampling: grabbing a rectangle of the desktop as raw pixels.
//!
//! The sampler knows nothing about the character. It is handed an AABB,
//! pads it, clamps the result to the world and asks a [`CaptureProvider`]
//! for exactly that rectangle.

use bevy::math::{IRect, IVec2};

use crate::error::CaptureError;

/// Immutable snapshot of a captured region.
///
/// `data` is row-major, `channels` bytes per pixel in RGB(A) order.
/// `origin` is the world position of the top-left pixel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    pub channels: usize,
    pub origin: IVec2,
    pub data: Vec<u8>,
}

impl PixelBuffer {
    pub fn new(width: u32, height: u32, channels: usize, origin: IVec2, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            channels,
            origin,
            data,
        }
    }

    /// Buffer of `width * height` RGBA pixels, all set to `rgb`.
    pub fn filled(width: u32, height: u32, origin: IVec2, rgb: [u8; 3]) -> Self {
        let mut data = Vec::with_capacity(width as usize * height as usize * 4);
        for _ in 0..(width as usize * height as usize) {
            data.extend_from_slice(&[rgb[0], rgb[1], rgb[2], 255]);
        }
        Self::new(width, height, 4, origin, data)
    }

    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.channels
    }

    /// World rectangle covered by this buffer.
    pub fn region(&self) -> IRect {
        IRect::from_corners(
            self.origin,
            self.origin + IVec2::new(self.width as i32, self.height as i32),
        )
    }

    /// RGB of the pixel at local `(x, y)`. Caller guarantees the shape is valid.
    #[inline]
    pub fn rgb(&self, x: u32, y: u32) -> [u8; 3] {
        let i = (y as usize * self.width as usize + x as usize) * self.channels;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    pub fn set_rgb(&mut self, x: u32, y: u32, rgb: [u8; 3]) {
        let i = (y as usize * self.width as usize + x as usize) * self.channels;
        self.data[i..i + 3].copy_from_slice(&rgb);
    }
}

/// Source of desktop pixels.
pub trait CaptureProvider {
    /// Capture `region` (world coordinates, max exclusive).
    fn capture(&mut self, region: IRect) -> Result<PixelBuffer, CaptureError>;
}

impl<P: CaptureProvider + ?Sized> CaptureProvider for Box<P> {
    fn capture(&mut self, region: IRect) -> Result<PixelBuffer, CaptureError> {
        (**self).capture(region)
    }
}

/// Provider used when no capture backend is compiled in.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCapture;

impl CaptureProvider for NoCapture {
    fn capture(&mut self, _region: IRect) -> Result<PixelBuffer, CaptureError> {
        Err(CaptureError::Unavailable("no capture backend".into()))
    }
}

/// The desktop capture backend this build was compiled with.
pub fn desktop() -> Result<Box<dyn CaptureProvider>, CaptureError> {
    #[cfg(feature = "screen-capture")]
    {
        Ok(Box::new(screen::ScreenCapture::primary()?))
    }
    #[cfg(not(feature = "screen-capture"))]
    {
        Err(CaptureError::Unavailable(
            "built without the `screen-capture` feature".into(),
        ))
    }
}

pub struct FrameSampler {
    provider: Box<dyn CaptureProvider>,
    padding: i32,
    world: IRect,
}

impl FrameSampler {
    pub fn new(provider: Box<dyn CaptureProvider>, padding: i32, world: IRect) -> Self {
        Self {
            provider,
            padding,
            world,
        }
    }

    /// `aabb` grown by the padding and clamped to the world.
    pub fn region_around(&self, aabb: IRect) -> IRect {
        aabb.inflate(self.padding).intersect(self.world)
    }

    /// Capture the padded neighbourhood of `aabb`.
    pub fn sample(&mut self, aabb: IRect) -> Result<PixelBuffer, CaptureError> {
        let region = self.region_around(aabb);
        if region.is_empty() {
            return Err(CaptureError::Unavailable(format!(
                "region {aabb:?} lies outside the world"
            )));
        }
        self.provider.capture(region)
    }
}

/// Cut `region` out of a full-frame RGBA image whose top-left sits at `frame_origin`.
pub fn crop_rgba(
    frame: &[u8],
    frame_width: u32,
    frame_height: u32,
    frame_origin: IVec2,
    region: IRect,
) -> Result<PixelBuffer, CaptureError> {
    let frame_rect = IRect::from_corners(
        frame_origin,
        frame_origin + IVec2::new(frame_width as i32, frame_height as i32),
    );
    let clipped = region.intersect(frame_rect);
    if clipped != region {
        return Err(CaptureError::Unavailable(format!(
            "region {region:?} is not inside the captured frame {frame_rect:?}"
        )));
    }
    if frame.len() < frame_width as usize * frame_height as usize * 4 {
        return Err(CaptureError::Unavailable("short frame from capture device".into()));
    }

    let w = region.width() as usize;
    let h = region.height() as usize;
    let left = (region.min.x - frame_origin.x) as usize;
    let top = (region.min.y - frame_origin.y) as usize;
    let stride = frame_width as usize * 4;

    let mut data = Vec::with_capacity(w * h * 4);
    for row in top..top + h {
        let start = row * stride + left * 4;
        data.extend_from_slice(&frame[start..start + w * 4]);
    }
    Ok(PixelBuffer::new(w as u32, h as u32, 4, region.min, data))
}

/// `region` as the `(x, y, width, height)` a region-capture backend takes,
/// or `None` when it is empty or reaches left of or above the origin.
pub fn region_request(region: IRect) -> Option<(u32, u32, u32, u32)> {
    if region.is_empty() || region.min.x < 0 || region.min.y < 0 {
        return None;
    }
    Some((
        region.min.x as u32,
        region.min.y as u32,
        region.width() as u32,
        region.height() as u32,
    ))
}

/// Desktop capture through `xcap`, primary monitor only.
///
/// Only the requested region is grabbed. Backends without region support
/// fall back to a full frame cropped with [`crop_rgba`].
#[cfg(feature = "screen-capture")]
pub mod screen {
    use bevy::log::warn;
    use bevy::math::{IRect, IVec2};
    use xcap::Monitor;

    use super::{crop_rgba, region_request, CaptureProvider, PixelBuffer};
    use crate::error::CaptureError;

    pub struct ScreenCapture {
        monitor: Monitor,
        full_frame: bool,
    }

    impl ScreenCapture {
        pub fn primary() -> Result<Self, CaptureError> {
            let monitors =
                Monitor::all().map_err(|e| CaptureError::Unavailable(e.to_string()))?;
            let monitor = monitors
                .into_iter()
                .find(|m| m.is_primary().unwrap_or(false))
                .ok_or_else(|| CaptureError::Unavailable("no primary monitor".into()))?;
            Ok(Self {
                monitor,
                full_frame: false,
            })
        }

        fn capture_full(&self, region: IRect) -> Result<PixelBuffer, CaptureError> {
            let image = self
                .monitor
                .capture_image()
                .map_err(|e| CaptureError::Unavailable(e.to_string()))?;
            let (width, height) = image.dimensions();
            let frame = image.into_raw();
            // World coordinates are monitor-local.
            crop_rgba(&frame, width, height, IVec2::ZERO, region)
        }
    }

    impl CaptureProvider for ScreenCapture {
        fn capture(&mut self, region: IRect) -> Result<PixelBuffer, CaptureError> {
            let (x, y, width, height) = region_request(region).ok_or_else(|| {
                CaptureError::Unavailable(format!("region {region:?} is not on the monitor"))
            })?;
            if self.full_frame {
                return self.capture_full(region);
            }
            match self.monitor.capture_region(x, y, width, height) {
                Ok(image) => {
                    let (w, h) = image.dimensions();
                    Ok(PixelBuffer::new(w, h, 4, region.min, image.into_raw()))
                }
                Err(e) => {
                    warn!("region capture failed ({e}); using full frames from now on");
                    self.full_frame = true;
                    self.capture_full(region)
                }
            }
        }
    }
}
