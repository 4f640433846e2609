pub mod local;
pub mod memory;
pub mod pki;
pub mod traits;

pub use local::LocalStorage;
pub use memory::InMemoryStorage;
pub use pki::PkiStorage;
pub use traits::Storage;
