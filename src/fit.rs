//! Placement policy shared by both engines.

use core::fmt;

/// Which free block satisfies a request when several qualify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FitMode {
    /// First qualifying block in scan order.
    #[default]
    FirstFit,
    /// Smallest qualifying block; ties go to the first one scanned.
    BestFit,
    /// Largest qualifying block; ties go to the first one scanned.
    WorstFit,
}

impl FitMode {
    /// Pick a candidate out of `(handle, size)` pairs given in scan order.
    ///
    /// Returns the handle of the chosen candidate, or `None` if no candidate
    /// is at least `min_size` bytes.
    pub fn select<I>(self, candidates: I, min_size: usize) -> Option<usize>
    where
        I: IntoIterator<Item = (usize, usize)>,
    {
        let mut fitting = candidates
            .into_iter()
            .filter(|&(_, size)| size >= min_size);

        match self {
            FitMode::FirstFit => fitting.next().map(|(handle, _)| handle),
            FitMode::BestFit => {
                let mut best: Option<(usize, usize)> = None;
                for (handle, size) in fitting {
                    if size == min_size {
                        return Some(handle);
                    }
                    if best.map_or(true, |(_, best_size)| size < best_size) {
                        best = Some((handle, size));
                    }
                }
                best.map(|(handle, _)| handle)
            }
            FitMode::WorstFit => {
                let mut worst: Option<(usize, usize)> = None;
                for (handle, size) in fitting {
                    if worst.map_or(true, |(_, worst_size)| size > worst_size) {
                        worst = Some((handle, size));
                    }
                }
                worst.map(|(handle, _)| handle)
            }
        }
    }

    /// Encoding used in the in-band arena header.
    pub(crate) const fn to_word(self) -> usize {
        match self {
            FitMode::FirstFit => 0,
            FitMode::BestFit => 1,
            FitMode::WorstFit => 2,
        }
    }

    pub(crate) const fn from_word(word: usize) -> Option<Self> {
        match word {
            0 => Some(FitMode::FirstFit),
            1 => Some(FitMode::BestFit),
            2 => Some(FitMode::WorstFit),
            _ => None,
        }
    }
}

impl fmt::Display for FitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FitMode::FirstFit => f.write_str("first fit"),
            FitMode::BestFit => f.write_str("best fit"),
            FitMode::WorstFit => f.write_str("worst fit"),
        }
    }
}
