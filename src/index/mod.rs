//! Index structures: vocabulary, R-Tree, textual augmentation, inverted file

mod augment;
mod inverted_file;
mod rtree;
mod vocabulary;

pub use augment::Augmenter;
pub use inverted_file::{InvertedFile, Posting, PostingStream, TREE_LEVEL_NODE};
pub use rtree::{Entry, Node, RTree, TreeMeta, LEAF_LEVEL, NO_NODE};
pub use vocabulary::{DocStats, NodeStats, TermStats, Vocabulary};
