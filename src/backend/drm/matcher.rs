//! Connector to CRTC assignment
//!
//! A connector can only be driven by a subset of the device's CRTCs, encoded
//! as a per-connector bitmask. Re-assigning a live CRTC means a full modeset
//! with visible flicker, so the matcher searches for the assignment that
//! maximizes the number of satisfied connectors while making the fewest
//! changes compared to the previous assignment.

/// State threaded through the backtracking search
struct MatchState<'a> {
    /// Per-connector bitmask of acceptable CRTCs (bit j set iff CRTC j is acceptable)
    conns: &'a [u32],
    /// Previous assignment, connector index per CRTC slot
    orig: &'a [Option<usize>],
    /// Number of matched connectors of the best solution so far
    score: usize,
    /// Number of changes from the previous assignment of the best solution
    replaced: usize,
    /// Current candidate solution
    res: Vec<Option<usize>>,
    /// Best solution so far
    best: Vec<Option<usize>>,
    /// The best solution cannot be improved upon, stop searching
    exit_early: bool,
}

fn is_taken(res: &[Option<usize>], upto: usize, conn: usize) -> bool {
    res[..upto].iter().any(|slot| *slot == Some(conn))
}

/// One step of the search, processing CRTC `crtc_index`.
///
/// A naive exhaustive maximum bipartite matching that tries to stay as close
/// to `st.orig` as it can: the previous occupant of the slot is tried first,
/// then every other compatible connector, then leaving the slot unmatched.
fn match_step(st: &mut MatchState<'_>, score: usize, replaced: usize, crtc_index: usize) -> bool {
    // Finished
    if crtc_index >= st.res.len() {
        if score > st.score || (score == st.score && replaced < st.replaced) {
            st.score = score;
            st.replaced = replaced;
            st.best.copy_from_slice(&st.res);

            st.exit_early = (st.score == st.res.len() || st.score == st.conns.len()) && st.replaced == 0;

            return true;
        }
        return false;
    }

    let mut has_best = false;

    // Attempt to use the previous solution first, to try and avoid
    // recalculating everything
    if let Some(orig) = st.orig[crtc_index] {
        if !is_taken(&st.res, crtc_index, orig) {
            st.res[crtc_index] = Some(orig);
            let crtc_score = usize::from(st.conns[orig] != 0);
            if match_step(st, score + crtc_score, replaced, crtc_index + 1) {
                has_best = true;
            }
        }
    }
    if st.exit_early {
        return true;
    }

    let replaced = replaced + usize::from(st.orig[crtc_index].is_some());

    for candidate in 0..st.conns.len() {
        // We tried this earlier
        if Some(candidate) == st.orig[crtc_index] {
            continue;
        }

        // Not compatible
        if st.conns[candidate] & (1 << crtc_index) == 0 {
            continue;
        }

        // Already taken
        if is_taken(&st.res, crtc_index, candidate) {
            continue;
        }

        st.res[crtc_index] = Some(candidate);
        let crtc_score = usize::from(st.conns[candidate] != 0);
        if match_step(st, score + crtc_score, replaced, crtc_index + 1) {
            has_best = true;
        }

        if st.exit_early {
            return true;
        }
    }

    // Maybe this CRTC can't be matched
    st.res[crtc_index] = None;
    if match_step(st, score, replaced, crtc_index + 1) {
        has_best = true;
    }

    has_best
}

/// Compute a new connector↔CRTC assignment.
///
/// `conns` holds one compatibility bitmask per connector (a connector that
/// must not be matched passes a mask of 0). `prev` holds the previous
/// assignment as connector index per CRTC slot. The returned assignment has
/// the same shape as `prev`, maximizes the number of matched connectors and,
/// among equally good solutions, minimizes the changes from `prev`.
pub fn match_connectors_with_crtcs(conns: &[u32], prev: &[Option<usize>]) -> Vec<Option<usize>> {
    let num_crtcs = prev.len();
    let mut st = MatchState {
        conns,
        orig: prev,
        score: 0,
        replaced: usize::MAX,
        res: vec![None; num_crtcs],
        best: vec![None; num_crtcs],
        exit_early: false,
    };

    match_step(&mut st, 0, 0, 0);

    st.best
}

#[cfg(test)]
mod tests {
    use super::match_connectors_with_crtcs;

    #[test]
    fn keeps_previous_assignment_when_possible() {
        // three connectors, masks {0b011, 0b011, 0b100}, previous {0, unmatched, 2}
        let conns = [0b011, 0b011, 0b100];
        let prev = [Some(0), None, Some(2)];
        let new = match_connectors_with_crtcs(&conns, &prev);
        assert_eq!(new, vec![Some(0), Some(1), Some(2)]);
    }

    #[test]
    fn never_reduces_match_count() {
        let conns = [0b01, 0b11];
        let prev = [Some(0), Some(1)];
        let new = match_connectors_with_crtcs(&conns, &prev);
        let matched = new.iter().flatten().count();
        assert_eq!(matched, 2);
        assert_eq!(new, vec![Some(0), Some(1)]);
    }

    #[test]
    fn moves_connector_to_free_slot_for_new_one() {
        // connector 1 can only use CRTC 0, connector 0 can use both;
        // connector 0 previously held CRTC 0
        let conns = [0b11, 0b01];
        let prev = [Some(0), None];
        let new = match_connectors_with_crtcs(&conns, &prev);
        assert_eq!(new, vec![Some(1), Some(0)]);
    }

    #[test]
    fn unmatchable_connector_stays_unmatched() {
        let conns = [0b0, 0b10];
        let prev = [None, None];
        let new = match_connectors_with_crtcs(&conns, &prev);
        assert_eq!(new[0], None);
        assert_eq!(new[1], Some(1));
    }

    #[test]
    fn empty_inputs() {
        assert!(match_connectors_with_crtcs(&[], &[]).is_empty());
        let new = match_connectors_with_crtcs(&[], &[None, None]);
        assert_eq!(new, vec![None, None]);
    }
}
