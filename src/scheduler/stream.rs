//! Frame sources feeding the scheduler

use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::track::{ReadyState, VideoSink};

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Wakes the scheduler when a frame may be readable
pub type ReadyNotifier = Arc<dyn Fn() + Send + Sync>;

/// Outcome of a non-blocking read
#[derive(Debug)]
pub enum ReadResult {
    Frame(Frame),
    EndOfStream,
    /// Nothing yet; the ready notifier fires when that changes
    Pending,
    Error(Error),
}

/// Upstream of the scheduler
pub trait FrameStream: Send {
    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    fn read(&mut self) -> ReadResult;

    /// False when a read would have to wait on more input than exists
    fn can_read_without_stalling(&self) -> bool;

    /// Drop everything buffered, after a flush
    fn reset(&mut self);

    fn set_ready_notifier(&mut self, notifier: ReadyNotifier);
}

#[derive(Default)]
struct StreamState {
    ended: AtomicBool,
    overflowed: AtomicU64,
    notifier: Mutex<Option<ReadyNotifier>>,
}

impl StreamState {
    fn notify(&self) {
        let notifier = self.notifier.lock().clone();
        if let Some(notifier) = notifier {
            notifier();
        }
    }
}

/// Track sink half of a [`TrackFrameStream`]
pub struct TrackStreamSink {
    tx: Sender<Frame>,
    /// Used to evict the oldest frame when full
    rx: Receiver<Frame>,
    state: Arc<StreamState>,
}

impl VideoSink for TrackStreamSink {
    fn on_frame(&self, frame: Frame, _reference_time: Duration) {
        if self.state.ended.load(Ordering::Acquire) {
            return;
        }
        let mut frame = frame;
        loop {
            match self.tx.try_send(frame) {
                Ok(()) => break,
                Err(TrySendError::Full(rejected)) => {
                    self.state.overflowed.fetch_add(1, Ordering::Relaxed);
                    let _ = self.rx.try_recv();
                    frame = rejected;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
        self.state.notify();
    }

    fn on_ready_state_changed(&self, state: ReadyState) {
        if state == ReadyState::Ended {
            self.state.ended.store(true, Ordering::Release);
            self.state.notify();
        }
    }
}

/// Frames from a video track, buffered in a bounded channel.
///
/// A live track never stalls; once it ends the buffered frames are read
/// out and then end of stream is reported.
pub struct TrackFrameStream {
    rx: Receiver<Frame>,
    state: Arc<StreamState>,
}

impl TrackFrameStream {
    /// Returns the stream and the sink to attach to a track
    pub fn new(capacity: usize) -> (Self, Arc<TrackStreamSink>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        let state = Arc::new(StreamState::default());
        let sink = Arc::new(TrackStreamSink {
            tx,
            rx: rx.clone(),
            state: state.clone(),
        });
        (Self { rx, state }, sink)
    }

    /// Frames evicted because the reader fell behind
    pub fn frames_overflowed(&self) -> u64 {
        self.state.overflowed.load(Ordering::Relaxed)
    }
}

impl FrameStream for TrackFrameStream {
    fn read(&mut self) -> ReadResult {
        match self.rx.try_recv() {
            Ok(frame) if frame.is_end_of_stream() => ReadResult::EndOfStream,
            Ok(frame) => ReadResult::Frame(frame),
            Err(TryRecvError::Empty) if self.state.ended.load(Ordering::Acquire) => {
                ReadResult::EndOfStream
            }
            Err(TryRecvError::Empty) => ReadResult::Pending,
            Err(TryRecvError::Disconnected) => ReadResult::EndOfStream,
        }
    }

    fn can_read_without_stalling(&self) -> bool {
        !self.state.ended.load(Ordering::Acquire) || !self.rx.is_empty()
    }

    fn reset(&mut self) {
        let dropped = self.rx.try_iter().count();
        if dropped > 0 {
            tracing::debug!("Discarded {} buffered frames", dropped);
        }
    }

    fn set_ready_notifier(&mut self, notifier: ReadyNotifier) {
        *self.state.notifier.lock() = Some(notifier);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Size;

    fn frame(ms: u64) -> Frame {
        Frame::black(Size::new(4, 4), Duration::from_millis(ms))
    }

    #[test]
    fn reads_in_order_then_pending() {
        let (mut stream, sink) = TrackFrameStream::new(4);
        sink.on_frame(frame(0), Duration::ZERO);
        sink.on_frame(frame(33), Duration::ZERO);

        assert!(matches!(stream.read(), ReadResult::Frame(f) if f.timestamp() == Duration::ZERO));
        assert!(matches!(stream.read(), ReadResult::Frame(f) if f.timestamp() == Duration::from_millis(33)));
        assert!(matches!(stream.read(), ReadResult::Pending));
        assert!(stream.can_read_without_stalling());
    }

    #[test]
    fn full_channel_evicts_oldest() {
        let (mut stream, sink) = TrackFrameStream::new(2);
        for ms in [0, 10, 20] {
            sink.on_frame(frame(ms), Duration::ZERO);
        }
        assert_eq!(stream.frames_overflowed(), 1);
        assert!(matches!(stream.read(), ReadResult::Frame(f) if f.timestamp() == Duration::from_millis(10)));
    }

    #[test]
    fn ended_track_drains_then_reports_end() {
        let (mut stream, sink) = TrackFrameStream::new(4);
        let woken = Arc::new(AtomicU64::new(0));
        let w = woken.clone();
        stream.set_ready_notifier(Arc::new(move || {
            w.fetch_add(1, Ordering::Relaxed);
        }));

        sink.on_frame(frame(0), Duration::ZERO);
        sink.on_ready_state_changed(ReadyState::Ended);
        sink.on_frame(frame(33), Duration::ZERO);

        assert_eq!(woken.load(Ordering::Relaxed), 2);
        assert!(stream.can_read_without_stalling());
        assert!(matches!(stream.read(), ReadResult::Frame(_)));
        assert!(!stream.can_read_without_stalling());
        assert!(matches!(stream.read(), ReadResult::EndOfStream));
    }

    #[test]
    fn reset_discards_buffered_frames() {
        let (mut stream, sink) = TrackFrameStream::new(4);
        sink.on_frame(frame(0), Duration::ZERO);
        sink.on_frame(Frame::end_of_stream(), Duration::ZERO);
        stream.reset();
        assert!(matches!(stream.read(), ReadResult::Pending));
    }
}
