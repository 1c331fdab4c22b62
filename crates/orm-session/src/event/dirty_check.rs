//! Dirty check: would a flush write anything?

use crate::Session;
use orm_core::Result;

impl Session {
    /// Does the session hold changes a flush would write?
    ///
    /// Runs the flush's action generation without cascades and throws the
    /// generated updates away again, so asking twice gives the same answer.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn is_dirty(&mut self) -> Result<bool> {
        self.check_open()?;
        if self.action_queue.are_insertions_or_deletions_queued() {
            tracing::debug!("Session dirty: insertions or deletions queued");
            return Ok(true);
        }
        let previous = self.action_queue.counts();
        let generated = self.flush_everything_to_executions(false);
        let dirty = self.action_queue.has_any_queued_actions();
        self.action_queue.clear_from_flush_needed_check(previous);
        generated?;
        tracing::debug!(dirty, "Dirty check complete");
        Ok(dirty)
    }
}
