//! Tracking of in-flight page-flips
//!
//! Every commit requesting a page-flip event inserts one record into the
//! backend list. The kernel reports completion per CRTC; the matching
//! connector is popped from its record. A non-blocking flip followed by a
//! blocking modeset may coexist, in which case the earlier record has its
//! connector entry nulled to mark it superseded.

use std::cell::RefCell;
use std::rc::Rc;

use drm::control::crtc;

#[derive(Debug)]
struct PageFlipConnector {
    /// Index of the connector in the backend list, `None` once superseded
    connector: Option<usize>,
    crtc: crtc::Handle,
}

/// One in-flight page-flip, possibly spanning several connectors
#[derive(Debug)]
pub(crate) struct PageFlip {
    connectors: RefCell<Vec<PageFlipConnector>>,
    /// The flip was submitted async (tearing)
    pub async_flip: bool,
}

impl PageFlip {
    pub fn new(connectors: impl IntoIterator<Item = (usize, crtc::Handle)>, async_flip: bool) -> Rc<Self> {
        Rc::new(PageFlip {
            connectors: RefCell::new(
                connectors
                    .into_iter()
                    .map(|(connector, crtc)| PageFlipConnector {
                        connector: Some(connector),
                        crtc,
                    })
                    .collect(),
            ),
            async_flip,
        })
    }

    /// Pop the connector entry matching a completion event for `crtc`
    ///
    /// Returns the connector index, or `None` if the entry was superseded or
    /// the event belongs to a different record.
    pub fn pop(&self, crtc: crtc::Handle) -> Option<usize> {
        let mut connectors = self.connectors.borrow_mut();
        let pos = connectors.iter().position(|entry| entry.crtc == crtc)?;
        connectors.remove(pos).connector
    }

    /// Whether a completion for `crtc` would match this record
    pub fn covers(&self, crtc: crtc::Handle) -> bool {
        self.connectors.borrow().iter().any(|entry| entry.crtc == crtc)
    }

    /// Mark the entry of `connector` as superseded by a newer commit
    ///
    /// The completion event still arrives and pops the entry, but no
    /// connector state is rotated for it.
    pub fn supersede(&self, connector: usize) {
        for entry in self.connectors.borrow_mut().iter_mut() {
            if entry.connector == Some(connector) {
                entry.connector = None;
            }
        }
    }

    /// Whether all connector entries have been popped
    pub fn is_complete(&self) -> bool {
        self.connectors.borrow().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drm::control::from_u32;

    fn crtc(id: u32) -> crtc::Handle {
        from_u32(id).unwrap()
    }

    #[test]
    fn pop_matches_by_crtc() {
        let flip = PageFlip::new([(0, crtc(10)), (1, crtc(11))], false);
        assert_eq!(flip.pop(crtc(11)), Some(1));
        assert!(!flip.is_complete());
        assert_eq!(flip.pop(crtc(10)), Some(0));
        assert!(flip.is_complete());
        assert_eq!(flip.pop(crtc(10)), None);
    }

    #[test]
    fn superseded_entry_pops_as_none() {
        let flip = PageFlip::new([(3, crtc(7))], false);
        flip.supersede(3);
        assert!(flip.covers(crtc(7)));
        assert_eq!(flip.pop(crtc(7)), None);
        assert!(flip.is_complete());
    }
}
