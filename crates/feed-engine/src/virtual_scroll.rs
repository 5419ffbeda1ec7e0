/// Number of rows the host must render for a sequence of `len` items.
pub fn rendered_len(len: usize) -> usize {
    len * 3
}

/// Row under the viewport for a raw scroll offset.
pub fn virtual_index(offset: f64, item_height: f64) -> i64 {
    (offset / item_height).round() as i64
}

/// Position in the real sequence for any virtual row, including negative ones.
pub fn real_index(virtual_index: i64, len: usize) -> usize {
    debug_assert!(len > 0);
    virtual_index.rem_euclid(len as i64) as usize
}

/// True when `virtual_index` has left the middle third far enough to snap back.
pub fn needs_recenter(virtual_index: i64, len: usize) -> bool {
    let v = virtual_index as f64;
    let n = len as f64;
    v < 0.5 * n || v > 2.5 * n
}

/// Offset of `real_index` inside the middle copy.
pub fn centered_offset(real_index: usize, len: usize, item_height: f64) -> f64 {
    item_height * (len + real_index) as f64
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScrollDirection {
    Next,
    Prev,
}

/// Shorter way around the loop from `from` to `to`. Ties go forward.
fn wrapped_direction(from: usize, to: usize, len: usize) -> Option<ScrollDirection> {
    match (to + len - from) % len {
        0 => None,
        forward if forward * 2 <= len => Some(ScrollDirection::Next),
        _ => Some(ScrollDirection::Prev),
    }
}

/// Result of mapping one scroll offset.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScrollFrame {
    pub virtual_index: i64,
    pub real_index: usize,
    /// Direction of travel since the previous observed frame.
    pub direction: Option<ScrollDirection>,
    /// Offset the host must jump to, if this frame drifted out of the middle copy.
    pub recenter_to: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ScrollObservation {
    /// Nothing to scroll through.
    Empty,
    /// Echo of a rewrite we requested; carries no user intent.
    Suppressed,
    Frame(ScrollFrame),
}

/// Loops a finite sequence by rendering it three times and keeping the
/// viewport inside the middle copy. Frames that drift into an outer copy ask
/// the host to jump to the same row of the middle copy, and the echo of that
/// jump is swallowed.
#[derive(Clone, Debug)]
pub struct VirtualScroll {
    item_height: f64,
    /// Virtual row we asked the host to jump to and have not seen yet.
    snap_target: Option<i64>,
    last_virtual: Option<i64>,
}

impl VirtualScroll {
    pub fn new(item_height: f64) -> Self {
        Self {
            item_height,
            snap_target: None,
            last_virtual: None,
        }
    }

    pub fn item_height(&self) -> f64 {
        self.item_height
    }

    pub fn is_snap_pending(&self) -> bool {
        self.snap_target.is_some()
    }

    /// Request a jump to `real_index` in the middle copy. Returns the offset
    /// to apply, or `None` when there is nothing to show.
    pub fn recenter(&mut self, real_index: usize, len: usize) -> Option<f64> {
        if len == 0 {
            self.snap_target = None;
            self.last_virtual = None;
            return None;
        }
        let target = (len + real_index) as i64;
        self.snap_target = Some(target);
        self.last_virtual = Some(target);
        Some(centered_offset(real_index, len, self.item_height))
    }

    /// Ask for a jump while leaving the direction baseline on the row the
    /// user is actually on.
    fn request_snap(&mut self, real_index: usize, len: usize) -> f64 {
        self.snap_target = Some((len + real_index) as i64);
        centered_offset(real_index, len, self.item_height)
    }

    /// Map a scroll offset reported by the host.
    pub fn observe(&mut self, offset: f64, len: usize) -> ScrollObservation {
        if len == 0 {
            return ScrollObservation::Empty;
        }
        let v = virtual_index(offset, self.item_height);

        // One-shot: the first frame after a rewrite is consumed either way.
        let missed_snap = self.snap_target.take();
        if missed_snap == Some(v) {
            self.last_virtual = Some(v);
            return ScrollObservation::Suppressed;
        }

        let real = real_index(v, len);
        let direction = match (self.last_virtual, missed_snap) {
            // The jump may or may not have landed, so raw rows are not comparable.
            (Some(last), Some(_)) => wrapped_direction(real_index(last, len), real, len),
            (Some(last), None) if v > last => Some(ScrollDirection::Next),
            (Some(last), None) if v < last => Some(ScrollDirection::Prev),
            _ => None,
        };

        self.last_virtual = Some(v);
        let recenter_to = needs_recenter(v, len).then(|| self.request_snap(real, len));

        ScrollObservation::Frame(ScrollFrame {
            virtual_index: v,
            real_index: real,
            direction,
            recenter_to,
        })
    }
}
