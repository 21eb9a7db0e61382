//! Sliding-window patch enumeration over 2D slices.

use serde::{Deserialize, Serialize};

/// What to do with windows that would run past the slice boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryPolicy {
    /// Drop windows that extend past the slice.
    #[default]
    CompleteOnly,
    /// Anchor the final window in each dimension to the trailing edge so every
    /// pixel is covered at least once.
    AnchorTrailing,
}

impl BoundaryPolicy {
    pub fn from_complete_patches_only(complete_only: bool) -> Self {
        if complete_only {
            Self::CompleteOnly
        } else {
            Self::AnchorTrailing
        }
    }
}

/// Top-left corner of a patch within its slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PatchLocation {
    pub row: u32,
    pub col: u32,
}

/// Start offsets of windows of `patch` pixels stepping by `stride` along a dimension of `len`.
///
/// Under [`BoundaryPolicy::AnchorTrailing`] a dimension shorter than the patch yields a
/// single window at 0; the window is cropped to the slice and padded downstream.
pub fn window_offsets(len: u32, patch: u32, stride: u32, policy: BoundaryPolicy) -> Vec<u32> {
    if patch == 0 || stride == 0 || len == 0 {
        return Vec::new();
    }
    if len < patch {
        return match policy {
            BoundaryPolicy::CompleteOnly => Vec::new(),
            BoundaryPolicy::AnchorTrailing => vec![0],
        };
    }

    let last_start = len - patch;
    let mut offsets: Vec<u32> = (0..=last_start).step_by(stride as usize).collect();
    if policy == BoundaryPolicy::AnchorTrailing && offsets.last() != Some(&last_start) {
        offsets.push(last_start);
    }
    offsets
}

/// All patch locations for a `height` x `width` slice, row-major and stable.
pub fn enumerate_patches(
    height: u32,
    width: u32,
    patch: u32,
    stride: u32,
    policy: BoundaryPolicy,
) -> Vec<PatchLocation> {
    let rows = window_offsets(height, patch, stride, policy);
    let cols = window_offsets(width, patch, stride, policy);
    rows.iter()
        .flat_map(|&row| cols.iter().map(move |&col| PatchLocation { row, col }))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_only_drops_partial_windows() {
        assert_eq!(
            window_offsets(10, 4, 3, BoundaryPolicy::CompleteOnly),
            vec![0, 3, 6]
        );
        assert_eq!(
            window_offsets(11, 4, 3, BoundaryPolicy::CompleteOnly),
            vec![0, 3, 6]
        );
    }

    #[test]
    fn test_anchor_trailing_adds_edge_window() {
        assert_eq!(
            window_offsets(11, 4, 3, BoundaryPolicy::AnchorTrailing),
            vec![0, 3, 6, 7]
        );
        // already aligned, no duplicate
        assert_eq!(
            window_offsets(10, 4, 3, BoundaryPolicy::AnchorTrailing),
            vec![0, 3, 6]
        );
    }

    #[test]
    fn test_short_dimension() {
        assert!(window_offsets(3, 4, 2, BoundaryPolicy::CompleteOnly).is_empty());
        assert_eq!(
            window_offsets(3, 4, 2, BoundaryPolicy::AnchorTrailing),
            vec![0]
        );
    }

    #[test]
    fn test_four_by_four_into_two_by_two() {
        let patches = enumerate_patches(4, 4, 2, 2, BoundaryPolicy::CompleteOnly);
        assert_eq!(
            patches,
            vec![
                PatchLocation { row: 0, col: 0 },
                PatchLocation { row: 0, col: 2 },
                PatchLocation { row: 2, col: 0 },
                PatchLocation { row: 2, col: 2 },
            ]
        );
    }

    #[test]
    fn test_zero_sizes_yield_nothing() {
        assert!(enumerate_patches(4, 4, 0, 2, BoundaryPolicy::AnchorTrailing).is_empty());
        assert!(enumerate_patches(4, 4, 2, 0, BoundaryPolicy::AnchorTrailing).is_empty());
    }
}
