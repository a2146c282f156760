//! Tracing setup and scene-image builders.

use raysim_core::rt::bvh::{ChildData, WideBvhLayout, WideNode};
use raysim_core::rt::geom::{Aabb, Triangle, Vec3};
use raysim_core::rt::treelet::{TreeletHeader, TreeletLayout, TreeletTriangle, TREELET_PAGES};

/// Installs a test subscriber once; respects `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Axis-aligned box helper.
pub fn aabb(min: (f32, f32, f32), max: (f32, f32, f32)) -> Aabb {
    Aabb {
        min: Vec3::new(min.0, min.1, min.2),
        max: Vec3::new(max.0, max.1, max.2),
    }
}

/// A triangle in the z = `z` plane large enough to catch an axis ray
/// through the origin.
pub fn facing_triangle(z: f32) -> Triangle {
    Triangle {
        vrts: [
            Vec3::new(-1.0, -1.0, z),
            Vec3::new(1.0, -1.0, z),
            Vec3::new(0.0, 1.0, z),
        ],
    }
}

/// Encodes `nodes` into a flat byte image under `layout`.
pub fn encode_nodes(layout: &WideBvhLayout, nodes: &[WideNode]) -> Vec<u8> {
    let mut image = vec![0u8; layout.node_bytes() * nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        layout.write_node(node, &mut image[i * layout.node_bytes()..]);
    }
    image
}

/// Encodes `tris` into a flat triangle-array image.
pub fn encode_triangles(tris: &[Triangle]) -> Vec<u8> {
    let mut image = vec![0u8; Triangle::BYTES * tris.len()];
    for (i, tri) in tris.iter().enumerate() {
        tri.write_to(&mut image[i * Triangle::BYTES..]);
    }
    image
}

/// A treelet header with uniform per-page SAH.
pub fn header(first_child: u32, num_children: u32, depth: u32, sah: f32) -> TreeletHeader {
    TreeletHeader {
        first_child,
        num_children,
        subtree_size: 1,
        depth,
        page_sah: [sah; TREELET_PAGES],
    }
}

/// Builds a single-treelet image: a root node whose first slot points at a
/// leaf node, whose own first slot names one triangle record.
pub fn encode_leaf_treelet(layout: &TreeletLayout, head: &TreeletHeader, tri: TreeletTriangle) -> Vec<u8> {
    let node_bytes = layout.node_layout.node_bytes();
    let tri_offset = (TreeletHeader::BYTES + 2 * node_bytes) as u32;

    let mut root = WideNode::empty();
    root.aabb[0] = aabb((-2.0, -2.0, 0.0), (2.0, 2.0, 10.0));
    root.data[0] = ChildData::Node { index: 1 };

    let mut leaf = WideNode::empty();
    leaf.aabb[0] = aabb((-2.0, -2.0, 0.0), (2.0, 2.0, 10.0));
    leaf.data[0] = ChildData::Leaf {
        first: tri_offset,
        count: 1,
    };

    let mut image = vec![0u8; layout.treelet_bytes as usize];
    head.write_to(&mut image);
    layout
        .node_layout
        .write_node(&root, &mut image[TreeletHeader::BYTES..]);
    layout
        .node_layout
        .write_node(&leaf, &mut image[TreeletHeader::BYTES + node_bytes..]);
    tri.write_to(&mut image[tri_offset as usize..]);
    image
}
