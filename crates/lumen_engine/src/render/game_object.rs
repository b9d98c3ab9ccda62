//! Scene objects consumed by the render systems

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::foundation::math::{Mat3, Mat4, Vec3};

use super::model::Model;

/// Identifier handed out by [`GameObjectMap`]
pub type GameObjectId = u32;

/// Translation, scale and Y-X-Z Tait-Bryan rotation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformComponent {
    /// World-space position
    pub translation: Vec3,
    /// Per-axis scale
    pub scale: Vec3,
    /// Radians about X, Y and Z, applied Y first
    pub rotation: Vec3,
}

impl Default for TransformComponent {
    fn default() -> Self {
        Self {
            translation: Vec3::zeros(),
            scale: Vec3::new(1.0, 1.0, 1.0),
            rotation: Vec3::zeros(),
        }
    }
}

impl TransformComponent {
    /// Rotation matrix `Ry * Rx * Rz`
    fn rotation_matrix(&self) -> Mat3 {
        let (s1, c1) = self.rotation.y.sin_cos();
        let (s2, c2) = self.rotation.x.sin_cos();
        let (s3, c3) = self.rotation.z.sin_cos();
        Mat3::new(
            c1 * c3 + s1 * s2 * s3,
            c3 * s1 * s2 - c1 * s3,
            c2 * s1,
            c2 * s3,
            c2 * c3,
            -s2,
            c1 * s2 * s3 - c3 * s1,
            c1 * c3 * s2 + s1 * s3,
            c1 * c2,
        )
    }

    /// `translate * Ry * Rx * Rz * scale`
    pub fn mat4(&self) -> Mat4 {
        let mut m = Mat4::identity();
        let scaled = self.rotation_matrix() * Mat3::from_diagonal(&self.scale);
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&scaled);
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    /// Inverse transpose of the upper 3x3 of [`Self::mat4`]
    pub fn normal_matrix(&self) -> Mat3 {
        let inverse_scale = self.scale.map(|s| 1.0 / s);
        self.rotation_matrix() * Mat3::from_diagonal(&inverse_scale)
    }
}

/// Makes an object a point light
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointLightComponent {
    /// Scales the object's color
    pub light_intensity: f32,
}

impl Default for PointLightComponent {
    fn default() -> Self {
        Self { light_intensity: 1.0 }
    }
}

/// Renderable or light-emitting object
#[derive(Clone)]
pub struct GameObject {
    id: GameObjectId,
    /// Placement in the world
    pub transform: TransformComponent,
    /// Base color; light color for point lights
    pub color: Vec3,
    /// Mesh, if the object is drawn by the mesh system
    pub model: Option<Arc<Model>>,
    /// Present on point lights
    pub point_light: Option<PointLightComponent>,
}

impl std::fmt::Debug for GameObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameObject")
            .field("id", &self.id)
            .field("transform", &self.transform)
            .field("color", &self.color)
            .field("has_model", &self.model.is_some())
            .field("point_light", &self.point_light)
            .finish()
    }
}

impl GameObject {
    /// Id assigned at creation
    pub fn id(&self) -> GameObjectId {
        self.id
    }
}

/// Owns the scene's objects, iterated in id order
#[derive(Debug, Default)]
pub struct GameObjectMap {
    objects: BTreeMap<GameObjectId, GameObject>,
    next_id: GameObjectId,
}

impl GameObjectMap {
    /// Empty scene
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a plain object and return its id
    pub fn create(&mut self) -> GameObjectId {
        let id = self.next_id;
        self.next_id += 1;
        self.objects.insert(
            id,
            GameObject {
                id,
                transform: TransformComponent::default(),
                color: Vec3::zeros(),
                model: None,
                point_light: None,
            },
        );
        id
    }

    /// Add a point light; `radius` becomes the billboard scale
    pub fn create_point_light(&mut self, intensity: f32, radius: f32, color: Vec3) -> GameObjectId {
        let id = self.create();
        if let Some(object) = self.objects.get_mut(&id) {
            object.color = color;
            object.transform.scale.x = radius;
            object.point_light = Some(PointLightComponent {
                light_intensity: intensity,
            });
        }
        id
    }

    /// Look up an object
    pub fn get(&self, id: GameObjectId) -> Option<&GameObject> {
        self.objects.get(&id)
    }

    /// Look up an object mutably
    pub fn get_mut(&mut self, id: GameObjectId) -> Option<&mut GameObject> {
        self.objects.get_mut(&id)
    }

    /// Remove an object
    pub fn remove(&mut self, id: GameObjectId) -> Option<GameObject> {
        self.objects.remove(&id)
    }

    /// Objects in id order
    pub fn iter(&self) -> impl Iterator<Item = &GameObject> {
        self.objects.values()
    }

    /// Mutable objects in id order
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut GameObject> {
        self.objects.values_mut()
    }

    /// Number of objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// No objects
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Vec4;
    use approx::assert_relative_eq;

    #[test]
    fn test_mat4_applies_scale_rotation_translation() {
        let transform = TransformComponent {
            translation: Vec3::new(1.0, 2.0, 3.0),
            scale: Vec3::new(2.0, 2.0, 2.0),
            rotation: Vec3::new(0.0, std::f32::consts::FRAC_PI_2, 0.0),
        };
        // +X scaled to 2 and rotated a quarter turn about Y lands on -Z
        let p = transform.mat4() * Vec4::new(1.0, 0.0, 0.0, 1.0);
        assert_relative_eq!(p, Vec4::new(1.0, 2.0, 1.0, 1.0), epsilon = 1e-5);
    }

    #[test]
    fn test_normal_matrix_is_inverse_transpose() {
        let transform = TransformComponent {
            translation: Vec3::new(5.0, 0.0, 0.0),
            scale: Vec3::new(1.0, 3.0, 0.5),
            rotation: Vec3::new(0.4, -0.7, 1.2),
        };
        let linear: Mat3 = transform.mat4().fixed_view::<3, 3>(0, 0).clone_owned();
        let expected = linear.try_inverse().unwrap().transpose();
        assert_relative_eq!(transform.normal_matrix(), expected, epsilon = 1e-4);
    }

    #[test]
    fn test_map_ids_and_lights() {
        let mut objects = GameObjectMap::new();
        let a = objects.create();
        let light = objects.create_point_light(0.5, 0.1, Vec3::new(1.0, 0.0, 0.0));
        assert_ne!(a, light);
        assert_eq!(objects.len(), 2);

        let stored = objects.get(light).unwrap();
        assert_eq!(stored.id(), light);
        assert_eq!(stored.point_light.unwrap().light_intensity, 0.5);
        assert_eq!(stored.transform.scale.x, 0.1);

        objects.remove(a);
        let ids: Vec<_> = objects.iter().map(GameObject::id).collect();
        assert_eq!(ids, vec![light]);
        // ids are never reused
        assert!(objects.create() > light);
    }
}
