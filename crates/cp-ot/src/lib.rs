//! Operational transform engine: operations, pairwise transform,
//! document history with checkpoints, and cursor/selection transform.

pub mod cursor;
pub mod document;
pub mod error;
pub mod operation;
pub mod transform;

pub use cursor::{transform_all_cursors, transform_cursor, transform_cursor_batch, Bias, Cursor};
pub use document::Document;
pub use error::{OtError, Result};
pub use operation::{BatchSource, Operation, OperationBatch};
pub use transform::{transform_batch, transform_pair, Priority};
