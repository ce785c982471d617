//! Operations across map versions: diff summaries and the multi-root
//! difference walk

mod diff;
mod interesting;

pub use diff::{diff_maps, Diff, DiffEntry};
pub use interesting::{iter_interesting_nodes, Interesting, InterestingNodes};
