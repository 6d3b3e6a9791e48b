use glam::Vec3;

/// Shadow parameters of a light.
///
/// The camera extents are used by directional lights (orthographic box around
/// the light's view axis); spot and point lights derive their frusta from the
/// light itself and only read `near`/`far`.
#[derive(Debug, Clone, PartialEq)]
pub struct LightShadow {
    pub map_size: u32,
    pub bias: f32,
    pub normal_bias: f32,
    /// PCF kernel radius in texels.
    pub radius: f32,
    pub camera_left: f32,
    pub camera_right: f32,
    pub camera_top: f32,
    pub camera_bottom: f32,
    pub near: f32,
    pub far: f32,
    /// Re-render the map even when shadow auto-update is off.
    pub needs_update: bool,
}

impl Default for LightShadow {
    fn default() -> Self {
        Self {
            map_size: 512,
            bias: 0.005,
            normal_bias: 0.0,
            radius: 1.0,
            camera_left: -5.0,
            camera_right: 5.0,
            camera_top: 5.0,
            camera_bottom: -5.0,
            near: 0.5,
            far: 500.0,
            needs_update: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirectionalLight {
    /// World-space point the light aims at.
    pub target: Vec3,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PointLight {
    /// Cut-off distance, 0 for infinite.
    pub distance: f32,
    pub decay: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpotLight {
    pub target: Vec3,
    pub distance: f32,
    /// Half-angle of the cone in radians.
    pub angle: f32,
    /// Fraction of the cone that fades, in `[0, 1]`.
    pub penumbra: f32,
    pub decay: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HemisphereLight {
    pub ground_color: Vec3,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LightKind {
    Ambient,
    Hemisphere(HemisphereLight),
    Directional(DirectionalLight),
    Point(PointLight),
    Spot(SpotLight),
}

/// Light component, placed by its node's world matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct Light {
    pub color: Vec3,
    pub intensity: f32,
    pub kind: LightKind,
    pub cast_shadow: bool,
    pub shadow: LightShadow,
}

impl Light {
    fn with_kind(color: Vec3, intensity: f32, kind: LightKind) -> Self {
        Self {
            color,
            intensity,
            kind,
            cast_shadow: false,
            shadow: LightShadow::default(),
        }
    }

    #[must_use]
    pub fn new_ambient(color: Vec3, intensity: f32) -> Self {
        Self::with_kind(color, intensity, LightKind::Ambient)
    }

    #[must_use]
    pub fn new_hemisphere(sky: Vec3, ground: Vec3, intensity: f32) -> Self {
        Self::with_kind(
            sky,
            intensity,
            LightKind::Hemisphere(HemisphereLight { ground_color: ground }),
        )
    }

    #[must_use]
    pub fn new_directional(color: Vec3, intensity: f32) -> Self {
        Self::with_kind(
            color,
            intensity,
            LightKind::Directional(DirectionalLight { target: Vec3::ZERO }),
        )
    }

    #[must_use]
    pub fn new_point(color: Vec3, intensity: f32, distance: f32) -> Self {
        Self::with_kind(
            color,
            intensity,
            LightKind::Point(PointLight { distance, decay: 2.0 }),
        )
    }

    #[must_use]
    pub fn new_spot(color: Vec3, intensity: f32, distance: f32, angle: f32, penumbra: f32) -> Self {
        Self::with_kind(
            color,
            intensity,
            LightKind::Spot(SpotLight {
                target: Vec3::ZERO,
                distance,
                angle,
                penumbra,
                decay: 2.0,
            }),
        )
    }

    /// Only directional, spot and point lights render shadow maps.
    #[must_use]
    pub fn casts_shadow_map(&self) -> bool {
        self.cast_shadow
            && matches!(
                self.kind,
                LightKind::Directional(_) | LightKind::Point(_) | LightKind::Spot(_)
            )
    }

    #[must_use]
    pub fn target(&self) -> Option<Vec3> {
        match &self.kind {
            LightKind::Directional(d) => Some(d.target),
            LightKind::Spot(s) => Some(s.target),
            _ => None,
        }
    }
}
