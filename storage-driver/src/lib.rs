//! # Storage driver contract
//!
//! The capability set every layer storage medium implements, the
//! [`Persister`] contract callers use to produce content, and the error
//! type shared by all backends.

mod driver;
mod error;
mod persist;

pub use driver::Backend;
pub use driver::{redirect_response, stream_response};
pub use driver::FetchReader;
pub use driver::ServeBody;
pub use driver::Writer;
pub use driver::{layer_path, LAYERS_PREFIX};
pub use error::{StorageError, StorageErrorBuilder, StorageErrorKind};
pub use persist::{
    pipe_upload, BoxError, BytesPersister, PersistError, Persisted, Persister, UploadStream,
    PIPE_CAPACITY,
};
