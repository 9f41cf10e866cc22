//! Frame pacer: slices a segment into fixed-size frames and emits them at
//! the wire format's real-time playback rate.
//!
//! Pacing is what keeps the two logical audio streams, delivered-so-far and
//! wall-clock elapsed, in sync: without the per-frame delay the far end's
//! receive buffer would be overrun and interruption timing would drift.

use crate::segment::Segment;
use crate::session::SessionEvent;
use crate::transport::{TransportSink, FRAME_BYTES, FRAME_DURATION};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

/// Shared flush generation. An interruption bumps the generation; a playout
/// that observes the bump abandons its remaining frames and emits no mark.
#[derive(Clone, Debug, Default)]
pub struct FlushHandle(Arc<AtomicU64>);

impl FlushHandle {
    /// Invalidate all in-flight playouts.
    pub fn flush(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Emits one segment's audio as paced fixed-size frames followed by a mark.
#[derive(Clone)]
pub struct FramePacer {
    sink: TransportSink,
    flush: FlushHandle,
}

impl FramePacer {
    pub fn new(sink: TransportSink, flush: FlushHandle) -> Self {
        Self { sink, flush }
    }

    /// Send the segment over the transport as `ceil(len / FRAME_BYTES)`
    /// frames in slice order, each gated by its real-time playback duration,
    /// then one fresh mark naming the utterance's end.
    ///
    /// Returns the mark name, or `None` when nothing was delivered to
    /// completion: no active stream sid (a no-op by contract) or a flush
    /// raised mid-segment (the tail is abandoned, no mark is emitted).
    pub async fn play(&self, segment: &Segment) -> Option<String> {
        if !self.sink.is_ready() {
            return None;
        }
        let generation = self.flush.current();

        for frame in segment.payload.chunks(FRAME_BYTES) {
            if self.flush.current() != generation {
                debug!(label = %segment.label, "flush raised, abandoning segment tail");
                return None;
            }
            self.sink.send_media(BASE64.encode(frame));
            tokio::time::sleep(FRAME_DURATION).await;
        }

        // Audio flushed during the final frame's gate gets no mark either.
        if self.flush.current() != generation {
            return None;
        }

        let mark = Uuid::new_v4().to_string();
        self.sink.send_mark(&mark);
        trace!(mark = %mark, label = %segment.label, "utterance fully handed to transport");
        Some(mark)
    }
}

/// Spawn the playout task: consumes released segments one at a time, so
/// frames of different segments never interleave, and reports each completed
/// mark back to the session loop.
pub fn spawn_playout(
    pacer: FramePacer,
    events: mpsc::UnboundedSender<SessionEvent>,
) -> mpsc::UnboundedSender<Segment> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Segment>();
    tokio::spawn(async move {
        while let Some(segment) = rx.recv().await {
            if let Some(mark) = pacer.play(&segment).await {
                let sent = events.send(SessionEvent::AudioSent {
                    mark,
                    label: segment.label,
                });
                if sent.is_err() {
                    break;
                }
            }
        }
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::OutboundMessage;

    fn segment(len: usize) -> Segment {
        Segment::ordered(0, vec![0x7f; len], "test audio", 0)
    }

    async fn play_and_collect(len: usize) -> Vec<OutboundMessage> {
        let (sink, mut rx) = TransportSink::new();
        sink.set_stream_sid("MZ1");
        let pacer = FramePacer::new(sink, FlushHandle::default());
        pacer.play(&segment(len)).await.unwrap();

        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn emits_ceil_len_over_frame_bytes_frames_then_one_mark() {
        for (len, frames) in [(160, 1), (161, 2), (480, 3), (1, 1)] {
            let out = play_and_collect(len).await;
            assert_eq!(out.len(), frames + 1, "payload of {len} bytes");
            for msg in &out[..frames] {
                let OutboundMessage::Media { media, .. } = msg else {
                    panic!("expected media frame, got {msg:?}");
                };
                let decoded = BASE64.decode(&media.payload).unwrap();
                assert!(decoded.len() <= FRAME_BYTES);
            }
            assert!(matches!(out[frames], OutboundMessage::Mark { .. }));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn last_frame_may_be_short() {
        let out = play_and_collect(161).await;
        let OutboundMessage::Media { media, .. } = &out[1] else {
            panic!("expected second frame");
        };
        assert_eq!(BASE64.decode(&media.payload).unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pacing_tracks_real_time_playback_rate() {
        let (sink, _rx) = TransportSink::new();
        sink.set_stream_sid("MZ1");
        let pacer = FramePacer::new(sink, FlushHandle::default());

        let started = tokio::time::Instant::now();
        pacer.play(&segment(480)).await.unwrap();
        // Three frames, 20 ms gate each.
        assert_eq!(started.elapsed(), FRAME_DURATION * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn no_stream_sid_means_no_op() {
        let (sink, mut rx) = TransportSink::new();
        let pacer = FramePacer::new(sink, FlushHandle::default());
        assert!(pacer.play(&segment(320)).await.is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn flush_abandons_the_tail_and_suppresses_the_mark() {
        let (sink, mut rx) = TransportSink::new();
        sink.set_stream_sid("MZ1");
        let flush = FlushHandle::default();
        let pacer = FramePacer::new(sink, flush.clone());

        let play = tokio::spawn(async move { pacer.play(&segment(1600)).await });
        // Let a few frames out, then interrupt.
        tokio::time::sleep(FRAME_DURATION * 3).await;
        flush.flush();

        assert!(play.await.unwrap().is_none());
        let mut media_frames = 0;
        while let Ok(msg) = rx.try_recv() {
            match msg {
                OutboundMessage::Media { .. } => media_frames += 1,
                other => panic!("no mark expected after a flush, got {other:?}"),
            }
        }
        assert!(media_frames < 10, "tail should have been abandoned");
    }
}
