//! Hub-side bookkeeping shared by every [`NativeHub`](super::NativeHub):
//! which devices have paired, who listens, and how long to keep pumping.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::{NativeDevice, NativeEvent, NativeListener, NativePayload};

/// Pump slice used while waiting without a deadline.
pub(crate) const UNBOUNDED_SLICE_MS: u32 = 1000;

/// Delivers decoded events to listeners and tracks paired devices.
#[derive(Default)]
pub(crate) struct EventRouter {
    listeners: Mutex<Vec<Arc<dyn NativeListener>>>,
    /// Devices seen pairing, in pairing order.
    paired: Mutex<Vec<NativeDevice>>,
}

impl EventRouter {
    pub(crate) fn new() -> Self {
        EventRouter::default()
    }

    pub(crate) fn add_listener(&self, listener: Arc<dyn NativeListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub(crate) fn remove_listener(&self, listener: &Arc<dyn NativeListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub(crate) fn paired_count(&self) -> usize {
        self.paired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub(crate) fn last_paired(&self) -> Option<NativeDevice> {
        self.paired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .copied()
    }

    /// Whether `event` may be delivered. A pairing from a new device makes it known.
    fn admit(&self, event: &NativeEvent) -> bool {
        let mut paired = self.paired.lock().unwrap_or_else(PoisonError::into_inner);
        if paired.contains(&event.device) {
            return true;
        }
        if let NativePayload::Paired { .. } = event.payload {
            paired.push(event.device);
            return true;
        }
        tracing::trace!("Dropping event from unpaired device {:?}", event.device);
        false
    }

    /// Routes the events decoded from one SDK event. Each listener receives
    /// the whole batch before the next listener sees any of it.
    pub(crate) fn route(&self, events: &[NativeEvent]) {
        let admitted: Vec<&NativeEvent> = events.iter().filter(|e| self.admit(e)).collect();
        if admitted.is_empty() {
            return;
        }
        // Snapshot so listeners may be added or removed from within a callback.
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in &listeners {
            for event in &admitted {
                listener.on_event(event);
            }
        }
    }
}

/// Splits a wait of `duration_ms` into pump slices. Zero means no deadline.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WaitBudget {
    deadline: Option<Instant>,
}

impl WaitBudget {
    pub(crate) fn new(duration_ms: u32, start: Instant) -> Self {
        WaitBudget {
            deadline: (duration_ms != 0).then(|| start + Duration::from_millis(duration_ms.into())),
        }
    }

    /// How long to pump next, or `None` once the deadline has passed.
    pub(crate) fn next_slice(&self, now: Instant) -> Option<u32> {
        let Some(deadline) = self.deadline else {
            return Some(UNBOUNDED_SLICE_MS);
        };
        let left = deadline.saturating_duration_since(now);
        if left.is_zero() {
            return None;
        }
        Some(u32::try_from(left.as_millis()).unwrap_or(u32::MAX).max(1))
    }
}

/// Pumps with `run_once` until a device pairs that `router` has not seen before.
pub(crate) fn wait_for_new_device(
    router: &EventRouter,
    duration_ms: u32,
    mut run_once: impl FnMut(u32),
) -> Option<NativeDevice> {
    let seen = router.paired_count();
    let budget = WaitBudget::new(duration_ms, Instant::now());
    while router.paired_count() <= seen {
        let slice = budget.next_slice(Instant::now())?;
        run_once(slice);
    }
    router.last_paired()
}
