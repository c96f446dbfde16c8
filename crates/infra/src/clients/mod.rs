//! HTTP collaborators: the object store holding asset bytes and the stateless
//! transform endpoint. Both are black boxes; only status codes and bodies matter.

mod object_store;
mod transform;

pub use object_store::{Asset, HttpObjectStore, ObjectMeta, ObjectStore, ObjectStoreError};
pub use transform::{HttpTransformClient, TransformClient, TransformError};
