//! Whole-state snapshot transfer for a follower whose log start has been
//! trimmed away on the leader.
//!
//! Walks the leader's checkpoint file-by-file under a single event id,
//! cancelling with a reason string on any I/O error. This is the sending
//! side, run by the leader's replica tracker; the receiving side's
//! begin/continue/finalize handling lives in the dispatcher instead.

use std::sync::Arc;
use std::time::Duration;

use crate::journal::Journal;
use crate::network::{RaftTalker, ResilverChunk, ResilverStart};
use crate::types::{LogIndex, NodeId};

use super::next_event_id;

/// Stream a whole-state checkpoint to `target`. On success, returns the
/// last log index covered by the checkpoint (the follower's new
/// `next_index` baseline).
pub async fn run(
    target: &NodeId,
    talker: &Arc<dyn RaftTalker>,
    journal: &Arc<dyn Journal>,
    timeout: Duration,
) -> anyhow::Result<LogIndex> {
    let event_id = next_event_id();
    talker.start_resilvering(target, ResilverStart { event_id }, timeout).await?;

    let (last_index, _) = journal.last_index_and_term().await;
    let files = match journal.checkpoint_files().await {
        Ok(files) => files,
        Err(err) => {
            let _ = talker.cancel_resilvering(target, event_id, &err.to_string(), timeout).await;
            return Err(err.into());
        }
    };

    for (path, contents) in files {
        let chunk = ResilverChunk { event_id, relative_path: path, contents };
        if let Err(err) = talker.send_resilver_chunk(target, chunk, timeout).await {
            let _ = talker.cancel_resilvering(target, event_id, &err.to_string(), timeout).await;
            return Err(err);
        }
    }

    talker.finish_resilvering(target, event_id, timeout).await?;
    Ok(last_index)
}
