//! Two-level acceleration structure construction.

pub mod builder;
pub mod types;

pub use builder::AccelBuilder;
pub use types::{
    identity_transform_rows, transform_rows, Aabb, InstanceId, InstanceRecord, MotionTransformKey,
    PrimitiveClass, TraversableHandle, INSTANCE_FLAG_TRANSFORM_DISABLED, NON_INSTANCED_BIT,
    VISIBILITY_DEFAULT, VISIBILITY_VOLUME,
};
