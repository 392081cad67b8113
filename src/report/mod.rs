pub mod address;
pub mod model;

pub use address::Address;
pub use model::{
    hash_unchanged, Category, Counter, DerivedIndices, EnvStatus, FullNode, NodeFields, NodeHash,
    RuntimeStatus, ShallowNode, WireNode,
};
