//! Video frames and frame views
//!
//! A `Frame` is an immutable, cheaply cloned handle. Root frames own (a
//! reference to) their backing memory; wrapped frames are views that keep
//! their parent alive and carry their own visible rectangle and natural
//! size. Destruction observers on a frame run exactly once, when the last
//! handle to it goes away.

use crate::error::{Error, Result};
use crate::types::{PixelFormat, PlaneLayout, Rect, Size, StorageType, SyncToken};

use parking_lot::{MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Memory a root frame's planes live in
pub trait FrameBacking: Send + Sync + std::fmt::Debug {
    /// Usable length in bytes
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lock the bytes for reading
    fn bytes(&self) -> MappedRwLockReadGuard<'_, [u8]>;
}

/// Heap memory owned by a frame
#[derive(Debug)]
pub struct OwnedBacking {
    bytes: RwLock<Box<[u8]>>,
}

impl OwnedBacking {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: RwLock::new(bytes.into_boxed_slice()),
        }
    }
}

impl FrameBacking for OwnedBacking {
    fn len(&self) -> usize {
        self.bytes.read().len()
    }

    fn bytes(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        RwLockReadGuard::map(self.bytes.read(), |b| &b[..])
    }
}

/// Values a consumer hands back when it is done with a frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReleaseInfo {
    pub sync_token: SyncToken,
    /// Consumer-reported utilization; negative means unknown
    pub resource_utilization: f64,
}

impl Default for ReleaseInfo {
    fn default() -> Self {
        Self {
            sync_token: SyncToken::NULL,
            resource_utilization: -1.0,
        }
    }
}

/// Per-frame capture metadata
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameMetadata {
    /// Capture time on the producer's clock
    pub reference_time: Option<Duration>,
    /// Nominal frame rate reported by the producer
    pub frame_rate: Option<f64>,
    /// Arbitrary producer key/value pairs
    pub extra: BTreeMap<String, String>,
}

/// Everything needed to build a root frame
#[derive(Debug, Clone)]
pub struct FrameDescriptor {
    pub format: PixelFormat,
    pub storage: StorageType,
    pub coded_size: Size,
    pub visible_rect: Rect,
    pub natural_size: Size,
    pub timestamp: Duration,
    pub metadata: FrameMetadata,
}

impl FrameDescriptor {
    /// Descriptor for an owned frame whose visible area is the whole buffer
    pub fn new(format: PixelFormat, coded_size: Size, timestamp: Duration) -> Self {
        Self {
            format,
            storage: StorageType::Owned,
            coded_size,
            visible_rect: Rect::from_size(coded_size),
            natural_size: coded_size,
            timestamp,
            metadata: FrameMetadata::default(),
        }
    }
}

type DestructionObserver = Box<dyn FnOnce(ReleaseInfo) + Send + 'static>;

struct FrameInner {
    format: PixelFormat,
    storage: StorageType,
    coded_size: Size,
    visible_rect: Rect,
    natural_size: Size,
    timestamp: Duration,
    metadata: FrameMetadata,
    end_of_stream: bool,
    layout: Vec<PlaneLayout>,
    backing: Option<Arc<dyn FrameBacking>>,
    parent: Option<Frame>,
    release: Mutex<ReleaseInfo>,
    observers: Mutex<Vec<DestructionObserver>>,
}

impl Drop for FrameInner {
    fn drop(&mut self) {
        // Backing goes first so observers see it released
        drop(self.backing.take());
        let info = *self.release.get_mut();
        for observer in self.observers.get_mut().drain(..) {
            observer(info);
        }
    }
}

/// A decoded video image plus its capture metadata
#[derive(Clone)]
pub struct Frame {
    inner: Arc<FrameInner>,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.inner.end_of_stream {
            return f.write_str("Frame(EOS)");
        }
        f.debug_struct("Frame")
            .field("format", &self.inner.format)
            .field("coded_size", &self.inner.coded_size)
            .field("visible_rect", &self.inner.visible_rect)
            .field("natural_size", &self.inner.natural_size)
            .field("timestamp", &self.inner.timestamp)
            .field("wrapped", &self.inner.parent.is_some())
            .finish()
    }
}

impl Frame {
    /// Build a root frame over `backing`
    pub fn new(desc: FrameDescriptor, backing: Option<Arc<dyn FrameBacking>>) -> Result<Self> {
        if !desc.visible_rect.fits_within(desc.coded_size) {
            return Err(Error::InvalidFrame(format!(
                "visible rect {} outside coded size {}",
                desc.visible_rect, desc.coded_size
            )));
        }

        let layout = desc.format.plane_layout(desc.coded_size);
        let needed: usize = layout.iter().map(PlaneLayout::len).sum();
        if let Some(backing) = &backing {
            if backing.len() < needed {
                return Err(Error::InvalidFrame(format!(
                    "{} bytes cannot hold {} {} ({} needed)",
                    backing.len(),
                    desc.format,
                    desc.coded_size,
                    needed
                )));
            }
        }

        Ok(Self::from_parts(desc, layout, backing, None, false))
    }

    /// Build a root frame that owns `bytes`
    pub fn from_bytes(desc: FrameDescriptor, bytes: Vec<u8>) -> Result<Self> {
        let desc = FrameDescriptor {
            storage: StorageType::Owned,
            ..desc
        };
        Self::new(desc, Some(Arc::new(OwnedBacking::new(bytes))))
    }

    /// A black I420 frame of `size`
    pub fn black(size: Size, timestamp: Duration) -> Self {
        let layout = PixelFormat::I420.plane_layout(size);
        let mut bytes = vec![0x80u8; layout.iter().map(PlaneLayout::len).sum()];
        if let Some(luma) = layout.first() {
            bytes[..luma.len()].fill(0x10);
        }
        let desc = FrameDescriptor {
            storage: StorageType::Owned,
            ..FrameDescriptor::new(PixelFormat::I420, size, timestamp)
        };
        let backing: Arc<dyn FrameBacking> = Arc::new(OwnedBacking::new(bytes));
        Self::from_parts(desc, layout, Some(backing), None, false)
    }

    /// The end-of-stream marker
    pub fn end_of_stream() -> Self {
        let desc = FrameDescriptor::new(PixelFormat::NativeTexture, Size::default(), Duration::ZERO);
        Self::from_parts(desc, Vec::new(), None, None, true)
    }

    fn from_parts(
        desc: FrameDescriptor,
        layout: Vec<PlaneLayout>,
        backing: Option<Arc<dyn FrameBacking>>,
        parent: Option<Frame>,
        end_of_stream: bool,
    ) -> Self {
        Self {
            inner: Arc::new(FrameInner {
                format: desc.format,
                storage: desc.storage,
                coded_size: desc.coded_size,
                visible_rect: desc.visible_rect,
                natural_size: desc.natural_size,
                timestamp: desc.timestamp,
                metadata: desc.metadata,
                end_of_stream,
                layout,
                backing,
                parent,
                release: Mutex::new(ReleaseInfo::default()),
                observers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A view over this frame's memory with its own geometry
    pub fn wrap(&self, visible_rect: Rect, natural_size: Size) -> Result<Self> {
        if self.inner.end_of_stream {
            return Err(Error::InvalidFrame("cannot wrap end of stream".into()));
        }
        if !self.inner.visible_rect.contains(&visible_rect) {
            return Err(Error::InvalidFrame(format!(
                "view {} outside parent visible rect {}",
                visible_rect, self.inner.visible_rect
            )));
        }

        let desc = FrameDescriptor {
            visible_rect,
            natural_size,
            ..self.descriptor()
        };
        Ok(Self::from_parts(desc, Vec::new(), None, Some(self.clone()), false))
    }

    /// A view with this frame's geometry, stamped `timestamp`
    pub fn with_timestamp(&self, timestamp: Duration) -> Result<Self> {
        if self.inner.end_of_stream {
            return Err(Error::InvalidFrame("cannot restamp end of stream".into()));
        }
        let desc = FrameDescriptor {
            timestamp,
            ..self.descriptor()
        };
        Ok(Self::from_parts(desc, Vec::new(), None, Some(self.clone()), false))
    }

    fn descriptor(&self) -> FrameDescriptor {
        FrameDescriptor {
            format: self.inner.format,
            storage: self.inner.storage,
            coded_size: self.inner.coded_size,
            visible_rect: self.inner.visible_rect,
            natural_size: self.inner.natural_size,
            timestamp: self.inner.timestamp,
            metadata: self.inner.metadata.clone(),
        }
    }

    pub fn format(&self) -> PixelFormat {
        self.inner.format
    }

    pub fn storage_type(&self) -> StorageType {
        self.inner.storage
    }

    pub fn coded_size(&self) -> Size {
        self.inner.coded_size
    }

    pub fn visible_rect(&self) -> Rect {
        self.inner.visible_rect
    }

    pub fn natural_size(&self) -> Size {
        self.inner.natural_size
    }

    pub fn timestamp(&self) -> Duration {
        self.inner.timestamp
    }

    pub fn metadata(&self) -> &FrameMetadata {
        &self.inner.metadata
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.inner.end_of_stream
    }

    /// True for views created with [`Frame::wrap`]
    pub fn is_wrapped(&self) -> bool {
        self.inner.parent.is_some()
    }

    /// True when both handles refer to the same frame object
    pub fn ptr_eq(a: &Frame, b: &Frame) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    fn root(&self) -> &Frame {
        match &self.inner.parent {
            Some(parent) => parent.root(),
            None => self,
        }
    }

    /// Bytes of plane `index`, locked for reading
    pub fn plane(&self, index: usize) -> Option<MappedRwLockReadGuard<'_, [u8]>> {
        let root = self.root();
        let plane = *root.inner.layout.get(index)?;
        let backing = root.inner.backing.as_ref()?;
        MappedRwLockReadGuard::try_map(backing.bytes(), |b| {
            b.get(plane.offset..plane.offset + plane.len())
        })
        .ok()
    }

    /// Row stride of plane `index`
    pub fn stride(&self, index: usize) -> Option<usize> {
        self.root().inner.layout.get(index).map(|p| p.stride)
    }

    /// Run `observer` once, after the last handle to this frame is dropped
    pub fn add_destruction_observer(&self, observer: impl FnOnce(ReleaseInfo) + Send + 'static) {
        self.inner.observers.lock().push(Box::new(observer));
    }

    /// Fence the consumer wants the producer to wait on before reuse
    pub fn set_release_sync_token(&self, token: SyncToken) {
        self.root().inner.release.lock().sync_token = token;
    }

    pub fn set_resource_utilization(&self, utilization: f64) {
        self.root().inner.release.lock().resource_utilization = utilization;
    }

    pub fn release_info(&self) -> ReleaseInfo {
        *self.root().inner.release.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn vga_frame() -> Frame {
        let desc = FrameDescriptor::new(PixelFormat::I420, Size::VGA, Duration::from_millis(33));
        Frame::from_bytes(desc, vec![0; PixelFormat::I420.allocation_size(Size::VGA)]).unwrap()
    }

    #[test]
    fn rejects_visible_rect_outside_coded_size() {
        let mut desc = FrameDescriptor::new(PixelFormat::I420, Size::VGA, Duration::ZERO);
        desc.visible_rect = Rect::new(1, 0, 640, 480);
        let err = Frame::from_bytes(desc, vec![0; 640 * 480 * 2]).unwrap_err();
        assert!(matches!(err, Error::InvalidFrame(_)));
    }

    #[test]
    fn rejects_short_backing() {
        let desc = FrameDescriptor::new(PixelFormat::Argb, Size::VGA, Duration::ZERO);
        assert!(Frame::from_bytes(desc, vec![0; 640 * 480]).is_err());
    }

    #[test]
    fn view_must_lie_inside_parent() {
        let frame = vga_frame();
        let view = frame.wrap(Rect::new(0, 60, 640, 360), Size::new(640, 360)).unwrap();
        assert!(view.is_wrapped());
        assert!(view.wrap(Rect::new(0, 0, 640, 480), Size::VGA).is_err());
        assert!(view.wrap(Rect::new(0, 100, 320, 200), Size::new(320, 200)).is_ok());
    }

    #[test]
    fn observers_run_once_after_last_view() {
        let frame = vga_frame();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        frame.add_destruction_observer(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        let view = frame.wrap(Rect::new(0, 0, 320, 240), Size::QVGA).unwrap();
        let view_clone = view.clone();
        drop(frame);
        drop(view);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        drop(view_clone);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn release_info_set_on_view_reaches_root() {
        let frame = vga_frame();
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        frame.add_destruction_observer(move |info| *s.lock() = Some(info));

        let view = frame.wrap(Rect::new(0, 0, 320, 240), Size::QVGA).unwrap();
        drop(frame);
        view.set_release_sync_token(SyncToken(7));
        view.set_resource_utilization(0.5);
        drop(view);

        let info = (*seen.lock()).expect("observer ran");
        assert_eq!(info.sync_token, SyncToken(7));
        assert_eq!(info.resource_utilization, 0.5);
    }

    #[test]
    fn black_frame_planes() {
        let frame = Frame::black(Size::new(4, 4), Duration::ZERO);
        assert!(frame.plane(0).unwrap().iter().all(|&b| b == 0x10));
        assert!(frame.plane(1).unwrap().iter().all(|&b| b == 0x80));
        assert_eq!(frame.plane(2).unwrap().len(), 4);
        assert!(frame.plane(3).is_none());
    }

    #[test]
    fn views_read_root_planes() {
        let frame = Frame::black(Size::new(8, 8), Duration::ZERO);
        let view = frame.wrap(Rect::new(2, 2, 4, 4), Size::new(4, 4)).unwrap();
        assert_eq!(view.stride(0), Some(8));
        assert_eq!(view.plane(0).unwrap().len(), 64);
    }
}
