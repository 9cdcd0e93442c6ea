mod backend;
mod http_client;
mod mem_backend;

pub use backend::{ObjectRef, RemoteBackend, RemoteDirEntry};
pub use http_client::HttpBackend;
pub use mem_backend::MemBackend;
