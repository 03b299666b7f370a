//! Block-oriented storage substrate
//!
//! Three layers: fixed-size block files (`block_file`), an LRU write-back
//! buffer over them (`buffered_file`), and a variable-length record list
//! store on top (`list_store`). Everything above (vectors, postings, tree
//! nodes) performs its I/O through these.

mod block_file;
mod buffered_file;
mod list_store;

pub use block_file::BlockFile;
pub use buffered_file::BufferedBlockFile;
pub use list_store::{ListCursor, ListStore, NO_BLOCK};
