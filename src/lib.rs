pub mod camera;
pub mod composite;
pub mod hierarchy;
pub mod layer;
pub mod loader;
pub mod octree;
pub mod point;
pub mod prelude;
pub mod resource;
pub mod settings;
pub mod source;
pub mod sse;
pub mod traversal;

#[cfg(test)]
mod fixtures;
