use std::collections::HashSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::engine::{EngineAdapter, RenderTarget};

/// Tracks the process-wide audio context and which render targets already
/// carry a level tap.  The context only exists after the first user
/// interaction; every channel tap hangs off it.
#[derive(Debug, Default)]
pub struct AudioHub {
    /// When the context was created.
    context: Option<Instant>,
    attached: HashSet<(u32, u64)>,
}

impl AudioHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the context on first call.  Returns `true` only when it was
    /// created just now.
    pub fn resume(&mut self) -> bool {
        if self.context.is_some() {
            return false;
        }
        info!("Audio context created");
        self.context = Some(Instant::now());
        true
    }

    /// Attach a level tap to `target`.  A target is tapped at most once,
    /// however often this is called; nothing happens before the context
    /// exists.
    pub async fn attach(&mut self, target: &RenderTarget, adapter: &EngineAdapter) {
        if self.context.is_none() || self.attached.contains(&target.key()) {
            return;
        }
        match adapter.engine().attach_audio_tap().await {
            Ok(()) => {
                let age = self.context.map(|t| t.elapsed().as_secs_f64()).unwrap_or_default();
                debug!("Audio tap attached to {} (context age {:.1}s)", target.media_id(), age);
                self.attached.insert(target.key());
            }
            Err(e) => warn!("Failed to attach audio tap to {}: {}", target.media_id(), e),
        }
    }

    /// Forget a target's tap once its surface is gone.
    pub fn release(&mut self, target: &RenderTarget) {
        self.attached.remove(&target.key());
    }

    pub fn is_attached(&self, target: &RenderTarget) -> bool {
        self.attached.contains(&target.key())
    }
}
