//! Pre-vote + vote election rounds, including the commit-safety VETO.
//!
//! Requests go out to every peer in the single membership group
//! concurrently and are tallied as replies arrive. VETO is a distinct
//! refusal a voter returns when the candidate's log is behind its own,
//! letting the candidate learn it has no chance this round rather than
//! waiting out a full timeout.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};

use crate::network::{RaftTalker, VotePhase, VoteRequest};
use crate::types::{ElectionOutcome, LogIndex, Membership, NodeId, Term, VoteOutcome};

/// Run one round (pre-vote or real vote) against every other full member
/// and tally the result.
pub async fn run_round(
    talker: &Arc<dyn RaftTalker>,
    phase: VotePhase,
    term: Term,
    candidate: NodeId,
    last_index: LogIndex,
    last_term: Term,
    membership: &Membership,
    rpc_timeout: Duration,
) -> ElectionOutcome {
    let quorum = membership.quorum_size();
    // Self always counts as a grant.
    let mut granted = 1usize;
    let mut vetoed = false;

    if granted >= quorum {
        return ElectionOutcome::Elected;
    }

    let mut pending = FuturesUnordered::new();
    for peer in membership.members.iter().filter(|m| **m != candidate) {
        let talker = talker.clone();
        let req = VoteRequest {
            phase,
            term,
            candidate: candidate.clone(),
            last_index,
            last_term,
        };
        let peer = peer.clone();
        pending.push(async move {
            let result = talker.send_vote_request(&peer, req, rpc_timeout).await;
            (peer, result)
        });
    }

    while let Some((peer, result)) = pending.next().await {
        match result {
            Ok(response) => match response.outcome {
                VoteOutcome::Granted => granted += 1,
                VoteOutcome::Veto => {
                    vetoed = true;
                    break;
                }
                VoteOutcome::Refused => {}
            },
            Err(err) => {
                // Pre-vote treats unreachable peers as an implicit "yes" so a
                // healthy majority partition isn't paralysed by a minority
                // it can't reach; a real vote treats the same failure as a
                // "no", since it would actually persist state on a stale
                // peer otherwise.
                tracing::debug!(%peer, error = %err, ?phase, "vote RPC failed");
                if matches!(phase, VotePhase::PreVote) {
                    granted += 1;
                }
            }
        }
        if vetoed {
            break;
        }
        if granted >= quorum {
            return ElectionOutcome::Elected;
        }
    }

    if vetoed {
        ElectionOutcome::Vetoed
    } else if granted >= quorum {
        ElectionOutcome::Elected
    } else {
        ElectionOutcome::NotElected
    }
}

/// The recipient-side vote-granting rule, applied identically for pre-vote
/// and real vote (the only difference is whether the outcome is persisted).
///
/// `voter_commit_term` is the term of the entry at the voter's own commit
/// index; used to detect an election that would orphan committed data.
/// `voter_log_start`/`voter_trim_guard_term` let the voter veto a candidate
/// whose log ends at an index the voter has already trimmed away, if the
/// voter knows that trimmed index carried a term higher than the candidate
/// claims — the candidate is behind in a way its own `req_last_term` can't
/// reveal, since it has no entry left to compare against.
#[allow(clippy::too_many_arguments)]
pub fn grant_rule(
    req_term: Term,
    voter_term: Term,
    already_voted_for: Option<&NodeId>,
    candidate: &NodeId,
    req_last_index: LogIndex,
    req_last_term: Term,
    voter_last_index: LogIndex,
    voter_last_term: Term,
    voter_commit_index: LogIndex,
    voter_commit_term: Term,
    voter_log_start: LogIndex,
    voter_trim_guard_term: Term,
) -> VoteOutcome {
    if req_term < voter_term {
        return VoteOutcome::Refused;
    }
    if req_term == voter_term {
        if let Some(existing) = already_voted_for {
            if existing != candidate {
                return VoteOutcome::Refused;
            }
        }
    }

    let candidate_more_up_to_date = req_last_term > voter_last_term
        || (req_last_term == voter_last_term && req_last_index >= voter_last_index);
    if !candidate_more_up_to_date {
        return VoteOutcome::Refused;
    }

    let would_orphan_committed_entry = req_last_term < voter_commit_term || req_last_index < voter_commit_index;
    if would_orphan_committed_entry {
        return VoteOutcome::Veto;
    }

    let candidate_missing_trimmed_higher_term = req_last_index < voter_log_start && voter_trim_guard_term > req_last_term;
    if candidate_missing_trimmed_higher_term {
        return VoteOutcome::Veto;
    }

    VoteOutcome::Granted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grant(req_term: Term, req_last_index: LogIndex, req_last_term: Term) -> VoteOutcome {
        grant_rule(req_term, 3, None, &"cand:1".into(), req_last_index, req_last_term, 10, 3, 8, 3, 0, 0)
    }

    #[test]
    fn refuses_stale_term() {
        assert_eq!(grant(2, 10, 3), VoteOutcome::Refused);
    }

    #[test]
    fn refuses_less_up_to_date_log() {
        assert_eq!(grant(3, 5, 3), VoteOutcome::Refused);
    }

    #[test]
    fn grants_when_log_is_at_least_as_up_to_date() {
        assert_eq!(grant(3, 10, 3), VoteOutcome::Granted);
    }

    #[test]
    fn vetoes_when_granting_would_orphan_a_committed_entry() {
        // Voter has committed index 8 at term 3; candidate's last entry is
        // at index 6, term 3 — shorter than what's already committed.
        assert_eq!(grant_rule(4, 3, None, &"cand:1".into(), 6, 3, 10, 3, 8, 3, 0, 0), VoteOutcome::Veto);
    }

    #[test]
    fn idempotent_for_same_candidate_same_term() {
        let candidate: NodeId = "cand:1".into();
        let first = grant_rule(3, 3, None, &candidate, 10, 3, 10, 3, 8, 3, 0, 0);
        let second = grant_rule(3, 3, Some(&candidate), &candidate, 10, 3, 10, 3, 8, 3, 0, 0);
        assert_eq!(first, VoteOutcome::Granted);
        assert_eq!(second, VoteOutcome::Granted);
    }

    #[test]
    fn vetoes_a_candidate_whose_log_ends_before_a_trimmed_higher_term() {
        // Candidate's claimed term (6) beats the voter's own log tip (4), so
        // it clears the ordinary up-to-date check outright. But the voter
        // trimmed everything below index 12, and the entry that used to sit
        // at that boundary was from term 7 — higher than what the candidate
        // claims — so the candidate can't actually be caught up.
        assert_eq!(grant_rule(8, 3, None, &"cand:1".into(), 10, 6, 20, 4, 8, 3, 12, 7), VoteOutcome::Veto);
    }

    #[test]
    fn does_not_veto_when_the_trim_floor_guard_term_is_not_higher_than_the_candidates() {
        // Same trim floor, but the guard term no longer exceeds what the
        // candidate claims: no veto from this rule.
        assert_eq!(grant_rule(8, 3, None, &"cand:1".into(), 10, 6, 20, 4, 8, 3, 12, 6), VoteOutcome::Granted);
    }
}
