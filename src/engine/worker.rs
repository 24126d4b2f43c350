//! Decode thread
//!
//! Long-running worker: waits on the decoder semaphore with a short
//! timeout, honors pending seeks (mute, reposition, reset the ring after
//! the render callback has acknowledged the mute), pulls source frames in
//! chunks, converts them to canonical form, and writes them into the ring.
//! When the current decoder hits EOF it claims the next queued decoder so
//! successive sources join back-to-back on the ring timeline.
//!
//! A per-decoder fatal error finishes that slot only; playback proceeds
//! with the next queued decoder and the failure is reported through the
//! event channel.

use crate::engine::decoder_state::{DecoderFlags, DecoderState, TIMESTAMP_UNSET};
use crate::engine::state::{EngineFlags, EngineShared};
use crate::error::{Error, Result};
use crate::events::EngineEvent;
use ringbuf::traits::Consumer;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Log another underrun report only after this many more padded frames
const UNDERRUN_LOG_FRAMES: u64 = 44_100;

pub(crate) fn run(shared: Arc<EngineShared>, events_tx: mpsc::Sender<EngineEvent>) {
    debug!("Decode thread started");
    let mut underruns = UnderrunLog::new();

    while shared.keep_decoding.load(Ordering::Acquire) {
        shared.decoder_sem.wait(shared.config.decoder_wait);
        if !shared.keep_decoding.load(Ordering::Acquire) {
            break;
        }

        forward_render_events(&shared, &events_tx);
        underruns.observe(&shared);

        if let Err(e) = decode_pass(&shared, &events_tx) {
            // Only synchronization-layer failures land here; per-decoder
            // errors are absorbed inside the pass.
            error!("Decode pass aborted: {e}");
            break;
        }
    }

    debug!("Decode thread exiting");
}

/// Rate-limited reporting of render-side underruns.
///
/// The render callback only bumps the counter; this runs on the decode
/// thread. Reports are classified so expected silence does not alarm:
/// trace while the device is paused/idle or inside the startup grace
/// period after decoding begins, warn during active playback.
struct UnderrunLog {
    reported: u64,
    decoding_started: Option<Instant>,
}

impl UnderrunLog {
    fn new() -> Self {
        Self {
            reported: 0,
            decoding_started: None,
        }
    }

    fn observe(&mut self, shared: &EngineShared) {
        let decoded = shared.stats.frames_decoded_total.load(Ordering::Relaxed);
        if self.decoding_started.is_none() && decoded > 0 {
            self.decoding_started = Some(Instant::now());
        }

        let total = shared.stats.underrun_frames.load(Ordering::Relaxed);
        if total < self.reported {
            // Counters were zeroed by a stop; start a fresh epoch.
            self.reported = 0;
            self.decoding_started = None;
            return;
        }
        if total - self.reported < UNDERRUN_LOG_FRAMES {
            return;
        }
        self.reported = total;

        let in_grace = self
            .decoding_started
            .map_or(true, |t| t.elapsed() < shared.config.underrun_grace);

        if !shared.stats.device_running.load(Ordering::Acquire) {
            trace!("Ring buffer underrun while paused/idle (total: {total} frames)");
        } else if in_grace {
            trace!("Ring buffer underrun during startup (total: {total} frames)");
        } else {
            warn!(
                "Ring buffer underrun during active playback (total: {total} frames) - \
                 decoding is not keeping up with the render callback"
            );
        }
    }
}

/// Drain the renderer's lock-free event queue onto the engine channel.
fn forward_render_events(shared: &EngineShared, events_tx: &mpsc::Sender<EngineEvent>) {
    let Ok(mut guard) = shared.render_events.lock() else {
        return;
    };
    if let Some(cons) = guard.as_mut() {
        while let Some(ev) = cons.try_pop() {
            let _ = events_tx.send(ev.into());
        }
    }
}

/// One pass of the decode loop, under the controller mutex.
fn decode_pass(shared: &EngineShared, events_tx: &mpsc::Sender<EngineEvent>) -> Result<()> {
    let mut guarded = shared
        .guarded
        .lock()
        .map_err(|_| Error::poisoned("controller state"))?;

    // Cancellation sweep: finish every cancelled slot promptly so a stop
    // needs only one pass regardless of read-ahead depth.
    for idx in 0..shared.active.slot_count() {
        if let Some(state) = shared.active.get(idx) {
            if state.flags().is_set(DecoderFlags::CANCEL_DECODING) {
                finish_decoding(shared, state, "cancelled");
            }
        }
    }

    // Seek sweep: a pending seek may target a decoder that already
    // finished decoding (fully buffered but still rendering); applying
    // the seek reopens its decoding axis.
    for idx in 0..shared.active.slot_count() {
        if let Some(state) = shared.active.get(idx) {
            if let Some(target) = state.take_seek_request() {
                perform_seek(shared, state, target);
            }
        }
    }

    if let Some(state) = shared.active.current_decoding() {
        decode_into_ring(shared, state, events_tx)?;
    }

    // Selection: when nothing is left to decode, move the next queued
    // decoder into a slot and give it a first chunk immediately.
    if shared.active.current_decoding().is_none()
        && !guarded.queue.is_empty()
        && shared.active.len() < shared.active.slot_count()
    {
        let ring_configured = shared
            .ring_writer
            .lock()
            .map_err(|_| Error::poisoned("ring writer"))?
            .is_some();
        let canonical = *shared
            .canonical
            .lock()
            .map_err(|_| Error::poisoned("canonical format"))?;

        if let (true, Some(canonical)) = (ring_configured, canonical) {
            let queued = guarded.queue.pop_front().expect("queue checked non-empty");
            let sequence = guarded.next_sequence;
            guarded.next_sequence += 1;

            let state = Box::new(DecoderState::new(
                queued.id,
                sequence,
                queued.decoder,
                canonical.channels,
                shared.config.decode_chunk_frames,
            ));
            state.flags().test_and_set(DecoderFlags::DECODING_STARTED);

            info!(
                "Decoder {} claimed slot (sequence {}, {} frames)",
                state.id,
                sequence,
                state.total_frames()
            );

            if shared.active.claim(state).is_err() {
                return Err(Error::FatalInternal(
                    "slot claim failed with free capacity".to_string(),
                ));
            }

            if let Some(state) = shared.active.current_decoding() {
                decode_into_ring(shared, state, events_tx)?;
            }
        }
    }

    Ok(())
}

/// Decode chunks for one state until the ring is full, EOF, cancellation,
/// or shutdown.
fn decode_into_ring(
    shared: &EngineShared,
    state: &DecoderState,
    events_tx: &mpsc::Sender<EngineEvent>,
) -> Result<()> {
    let chunk_frames = shared.config.decode_chunk_frames;

    loop {
        if !shared.keep_decoding.load(Ordering::Acquire) {
            return Ok(());
        }

        if state.flags().is_set(DecoderFlags::CANCEL_DECODING) {
            finish_decoding(shared, state, "cancelled");
            return Ok(());
        }

        if let Some(target) = state.take_seek_request() {
            perform_seek(shared, state, target);
        }

        if state.flags().is_set(DecoderFlags::DECODING_FINISHED) {
            return Ok(());
        }

        let mut writer_guard = shared
            .ring_writer
            .lock()
            .map_err(|_| Error::poisoned("ring writer"))?;
        let Some(writer) = writer_guard.as_mut() else {
            return Ok(());
        };

        if writer.frames_writable() < chunk_frames {
            return Ok(());
        }

        let decoded_before = state.frames_decoded();
        match state.decode_chunk(chunk_frames) {
            Ok(0) => {
                drop(writer_guard);
                state.clamp_total_to_decoded();
                finish_decoding(shared, state, "end of source");
                shared.flags.clear(EngineFlags::IS_SEEKING);
                return Ok(());
            }
            Ok(frames) => {
                if state.timestamp() == TIMESTAMP_UNSET {
                    state.set_timestamp(writer.write_position() as i64 - decoded_before as i64);
                }

                let written = state.with_chunk(|chunk| writer.write(chunk, 0, frames))?;
                drop(writer_guard);
                debug_assert_eq!(written, frames);

                shared
                    .stats
                    .frames_decoded_total
                    .fetch_add(written as u64, Ordering::Relaxed);

                // The seek is complete once fresh frames are buffered past
                // the target and no newer request is pending.
                if shared.flags.is_set(EngineFlags::IS_SEEKING)
                    && !shared.flags.is_set(EngineFlags::MUTE_OUTPUT)
                    && !state.has_seek_request()
                {
                    shared.flags.clear(EngineFlags::IS_SEEKING);
                }
            }
            Err(e) => {
                drop(writer_guard);
                warn!("Decoder {} failed: {e}", state.id);
                let _ = events_tx.send(EngineEvent::DecoderError {
                    decoder_id: state.id,
                    message: e.to_string(),
                });
                state.clamp_total_to_decoded();
                finish_decoding(shared, state, "decoder error");
                shared.flags.clear(EngineFlags::IS_SEEKING);
                return Ok(());
            }
        }
    }
}

/// Set `DECODING_FINISHED`, and when nothing remains to render, complete
/// the rendering axis too so the collector can reap.
fn finish_decoding(shared: &EngineShared, state: &DecoderState, reason: &str) {
    if state.flags().is_set(DecoderFlags::CANCEL_DECODING) {
        state.clamp_total_to_decoded();
    }
    if state.flags().test_and_set(DecoderFlags::DECODING_FINISHED) {
        debug!(
            "Decoder {} finished decoding ({reason}): {} frames",
            state.id,
            state.frames_decoded()
        );
    }
    if state.frames_rendered() >= state.total_frames()
        && state.flags().test_and_set(DecoderFlags::RENDERING_FINISHED)
    {
        shared.collector_sem.notify();
    }
}

/// Seek protocol: mute, wait for the renderer to observe the mute, reset
/// the ring, reposition the source, rebase the timeline, then unmute.
/// `IS_SEEKING` stays set until the decode loop refills past the target.
fn perform_seek(shared: &EngineShared, state: &DecoderState, target: u64) {
    let target = target.min(state.total_frames().saturating_sub(1));
    debug!("Decoder {} seeking to frame {target}", state.id);

    shared.flags.clear(EngineFlags::MUTE_ACK);
    shared.flags.set(EngineFlags::MUTE_OUTPUT);

    // The callback acknowledges the mute at its next pass; when the device
    // is stopped no pass will come, and the quiescence check below already
    // proves the ring is untouched.
    if shared.stats.device_running.load(Ordering::Acquire) {
        let deadline = Instant::now() + shared.config.mute_ack_timeout;
        while !shared.flags.is_set(EngineFlags::MUTE_ACK) && Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }
    if !shared.stats.wait_render_quiescent(shared.config.mute_ack_timeout) {
        warn!("Render callback did not quiesce before seek; resetting anyway after timeout");
    }

    if let Ok(mut writer_guard) = shared.ring_writer.lock() {
        if let Some(writer) = writer_guard.as_mut() {
            writer.reset();
        }
    }
    shared.src_reset.store(true, Ordering::Release);

    match state.apply_seek(target) {
        Ok(reached) => {
            // The seek reopens decoding: frames beyond the target must be
            // produced again even if this decoder had hit EOF before.
            state.flags().clear(DecoderFlags::DECODING_FINISHED);
            info!("Decoder {} repositioned to frame {reached}", state.id);
        }
        Err(e) => {
            warn!("Seek on decoder {} failed: {e}", state.id);
            shared.seek_failed.store(true, Ordering::Release);
            // The ring was already cleared; rendering resumes from the
            // decoder's unchanged position. Nothing further to wait for.
            state.resync_after_reset();
            shared.flags.clear(EngineFlags::IS_SEEKING);
        }
    }

    // Read-ahead decoders lost their buffered frames with the reset; they
    // restart from the beginning of their sources.
    for idx in 0..shared.active.slot_count() {
        if let Some(other) = shared.active.get(idx) {
            if other.sequence > state.sequence {
                if let Err(e) = other.rewind_for_restart() {
                    warn!("Rewinding read-ahead decoder {} failed: {e}", other.id);
                }
            }
        }
    }

    shared.flags.clear(EngineFlags::MUTE_OUTPUT);
}
