//! Ray-traversal data model.
//!
//! The scene itself is produced by external collaborators (BVH builders and
//! treelet compressors) and handed to the simulator as flat byte arrays; the
//! core reads them by physical address only. This module provides:
//! 1. **Geometry:** rays, hits, boxes, triangles, and the reference
//!    intersection routines the pipelines call as a black box (`geom`).
//! 2. **Wide BVH views:** fixed-endian byte encode/decode for wide nodes
//!    (`bvh`).
//! 3. **Treelets and buckets:** treelet headers, ray work items, the 2 KiB
//!    ray bucket, and the stream scheduler request type (`treelet`).

/// Wide BVH node byte views.
pub mod bvh;
/// Rays, hits, boxes, triangles, and intersection.
pub mod geom;
/// Treelet layout, ray buckets, and work items.
pub mod treelet;

pub use bvh::{ChildData, WideBvhLayout, WideNode, MAX_NODE_WIDTH};
pub use geom::{intersect_aabb, intersect_triangle, Aabb, Hit, Ray, Triangle, Vec3};
pub use treelet::{
    BucketRay, RayBucket, StreamRequest, TreeletHeader, TreeletLayout, WorkItem, INVALID_SEGMENT,
};
