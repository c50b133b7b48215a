//! Runtime tuning, read once from `RECLAIM_*` environment variables.

use std::str::FromStr;

/// Which `madvise` advice [`release_pages`](crate::util::memory::release_pages)
/// hands to the OS.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MadviseMode {
    /// `MADV_DONTNEED`: pages are dropped immediately.
    DontNeed,
    /// `MADV_FREE`: pages are reclaimed lazily under memory pressure.
    Free,
}

impl FromStr for MadviseMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dontneed" => Ok(MadviseMode::DontNeed),
            "free" => Ok(MadviseMode::Free),
            _ => Err(format!("unknown madvise mode: {}", s)),
        }
    }
}

pub struct Options {
    pub madvise_mode: MadviseMode,
}

impl Options {
    fn from_env() -> Self {
        let mut options = Options {
            madvise_mode: MadviseMode::DontNeed,
        };
        if let Ok(val) = std::env::var("RECLAIM_MADVISE") {
            match val.parse() {
                Ok(mode) => options.madvise_mode = mode,
                Err(e) => warn!("Ignoring RECLAIM_MADVISE: {}", e),
            }
        }
        options
    }
}

lazy_static! {
    /// Process-wide options, parsed from the environment on first use.
    pub static ref OPTIONS: Options = Options::from_env();
}
