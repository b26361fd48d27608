/*! Analyze control flow, memory contents and value uses of lifted functions.
 *
 * Every devirtualization pass needs to know which blocks reach which, which memory locations hold
 * a known literal at a block boundary, and which accesses can possibly overlap. These analyses
 * provide CFG construction, dominance, reaching literal definitions over precise locations and
 * alias classes, cached per function and invalidated by the passes that change the IR.
 */

pub mod alias;
pub mod cache;
pub mod cfg;
pub mod def_use;
pub mod dominator;
pub mod manager;
pub mod memory;

pub use alias::{AffinePointer, AliasClass, AliasResult, Location, PointerRoot, PointerTracker, Region};
pub use cache::{AnalysisCache, CacheKey, CacheStatistics};
pub use cfg::ControlFlowGraph;
pub use def_use::{DefUseChains, Definition, Use, UseKind};
pub use dominator::DominatorTree;
pub use manager::{AnalysisId, AnalysisManager};
pub use memory::{Facts, MemoryFacts};
