pub mod artifact;
pub mod backend;
pub mod error;
pub mod tensor;

pub use artifact::*;
pub use backend::*;
pub use error::*;
pub use tensor::*;
