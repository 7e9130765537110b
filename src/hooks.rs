//! Introspection waypoints (spec.md §2 item 8, §4.6).
//!
//! The teacher crate has no equivalent (it never got past raw-pointer
//! scaffolding), so this is grounded on spec.md §9's instruction directly:
//! "represent as enums of typed events and a `HookSet` struct on the
//! operation context" in place of the upstream macro/varargs tracing calls.
//! The `tracing` crate (already pulled in for §2.2 ambient logging) backs
//! the default `HookSet`, so a waypoint with no listener costs one disabled
//! `tracing::trace!` check and no argument formatting.

use std::fmt;

/// One typed waypoint fired from the chunk codec or super-chunk manager.
#[derive(Debug, Clone)]
pub enum HookEvent {
    CodecEncodeStart { nbytes: usize, codec: &'static str },
    CodecEncodeEnd { cbytes: usize },
    CodecDecodeStart { cbytes: usize },
    CodecDecodeEnd { nbytes: usize },
    ChunkAppend { nchunk: i64, nbytes: usize },
    ChunkDelete { nchunk: i64 },
    FrameSerialize { nchunks: i64, frame_len: i64 },
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A listener for hook events. The default `TracingHooks` forwards to
/// `tracing`; tests or embedders can install their own to assert on the
/// sequence of waypoints fired.
pub trait HookListener: Send + Sync {
    fn on_event(&self, event: &HookEvent);
}

/// Forwards every event to `tracing::trace!`. This is what `HookSet`
/// defaults to, matching spec.md §4.6 "no-op if no hooks installed": with no
/// `tracing` subscriber registered the event is still skipped before any
/// argument formatting, since `tracing`'s macros check interest first.
pub struct TracingHooks;

impl HookListener for TracingHooks {
    fn on_event(&self, event: &HookEvent) {
        tracing::trace!(target: "blusc::hooks", "{event}");
    }
}

/// Owns the (possibly absent) set of installed listeners for one context.
#[derive(Default)]
pub struct HookSet {
    listeners: Vec<Box<dyn HookListener>>,
}

impl HookSet {
    pub fn new() -> Self {
        HookSet { listeners: vec![Box::new(TracingHooks)] }
    }

    pub fn empty() -> Self {
        HookSet { listeners: Vec::new() }
    }

    pub fn install(&mut self, listener: Box<dyn HookListener>) {
        self.listeners.push(listener);
    }

    pub fn fire(&self, event: HookEvent) {
        for listener in &self.listeners {
            listener.on_event(&event);
        }
    }
}

impl fmt::Debug for HookSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookSet")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
