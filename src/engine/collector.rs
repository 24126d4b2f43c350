//! Collector thread
//!
//! Background reaper for retired decoder states. Waits on its semaphore,
//! unlinks slots whose decoding and rendering are both finished, then
//! waits for render quiescence before closing the decoder and freeing the
//! state. Exists solely to keep teardown off the decode and render
//! threads; it never touches the ring buffer.

use crate::engine::decoder_state::DecoderState;
use crate::engine::state::EngineShared;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

pub(crate) fn run(shared: Arc<EngineShared>) {
    debug!("Collector thread started");

    while shared.keep_collecting.load(Ordering::Acquire) {
        shared.collector_sem.wait(shared.config.collector_wait);
        collect(&shared);
    }

    // Final sweep so shutdown closes everything that already finished.
    collect(&shared);
    debug!("Collector thread exiting");
}

fn collect(shared: &EngineShared) {
    loop {
        // Unlink under the controller mutex so no controller or decode
        // thread dereference can race the removal.
        let unlinked: Option<Box<DecoderState>> = match shared.guarded.lock() {
            Ok(_guard) => shared.active.unlink_finished(),
            Err(_) => {
                warn!("Controller state mutex poisoned; collector idling");
                return;
            }
        };

        let Some(state) = unlinked else {
            return;
        };

        // The render callback may still hold this state from a pass that
        // began before the unlink; free only after that pass completes.
        if !shared
            .stats
            .wait_render_quiescent(shared.config.collector_wait)
        {
            warn!(
                "Render callback did not quiesce; deferring close of decoder {}",
                state.id
            );
            // Re-queue by leaking into a fresh slot is not worth the
            // machinery; the bounded wait above makes this path mean the
            // device callback is stuck, so waiting again is correct.
            while !shared
                .stats
                .wait_render_quiescent(shared.config.collector_wait)
            {
                if !shared.keep_collecting.load(Ordering::Acquire) {
                    break;
                }
            }
        }

        let frames = state.frames_rendered();
        if let Some(decoder) = state.detach_decoder() {
            drop(decoder);
        }
        debug!(
            "Collected decoder {} after {} rendered frames",
            state.id, frames
        );
        drop(state);
    }
}
