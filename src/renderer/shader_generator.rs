//! Shader Template Generator
//!
//! Renders WGSL from the templates under `src/renderer/shaders` with
//! minijinja. Templates use `{$ ... $}` blocks, `{{ ... }}` expressions and
//! `$$`-prefixed line statements so they stay close to plain WGSL:
//!
//! ```text
//! $$ if defines.USE_MAP
//!     color = color * textureSample(t_map, s_map, in.uv);
//! $$ endif
//! ```
//!
//! `{$ include "fog" $}` resolves to `chunks/fog.wgsl`. Each renderer owns its
//! own [`ShaderGenerator`]; there is no process-wide template environment.

use std::borrow::Cow;
use std::collections::BTreeMap;

use minijinja::{Environment, Error, ErrorKind, UndefinedBehavior, syntax::SyntaxConfig};
use rust_embed::RustEmbed;
use serde::Serialize;
use xxhash_rust::xxh3::xxh3_128;

use crate::errors::{Result, TrellisError};

#[derive(RustEmbed)]
#[folder = "src/renderer/shaders"]
struct ShaderAssets;

/// Built-in template names.
pub mod templates {
    pub const MESH: &str = "mesh";
    pub const DEPTH: &str = "depth";
    pub const FULLSCREEN: &str = "fullscreen";
}

fn shader_loader(name: &str) -> std::result::Result<Option<String>, Error> {
    let filename = if std::path::Path::new(name)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("wgsl"))
    {
        Cow::Borrowed(name)
    } else {
        Cow::Owned(format!("{name}.wgsl"))
    };

    #[cfg(debug_assertions)]
    {
        let path = std::path::Path::new("src/renderer/shaders").join(filename.as_ref());
        if path.exists() {
            return std::fs::read_to_string(&path)
                .map(Some)
                .map_err(|e| Error::new(ErrorKind::TemplateNotFound, format!("Failed to read file: {e}")));
        }
    }

    if let Some(file) = ShaderAssets::get(&filename)
        && let Ok(source) = std::str::from_utf8(file.data.as_ref())
    {
        return Ok(Some(source.to_string()));
    }

    Ok(None)
}

// ─── Template context ────────────────────────────────────────────────────────

/// A member of the generated `Uniforms` struct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct UniformDecl {
    pub name: String,
    pub ty: String,
}

/// Light counts baked into a program. Shadowed lights come first within
/// each kind, so `*_shadows <= *` always holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct LightCounts {
    pub hemisphere: u32,
    pub directional: u32,
    pub point: u32,
    pub spot: u32,
    pub directional_shadows: u32,
    pub point_shadows: u32,
    pub spot_shadows: u32,
}

impl LightCounts {
    #[must_use]
    pub fn shadow_count(&self) -> u32 {
        self.directional_shadows + self.point_shadows + self.spot_shadows
    }

    /// Names of the depth samplers a receiver binds, in binding order.
    #[must_use]
    pub fn shadow_sampler_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.shadow_count() as usize);
        names.extend((0..self.directional_shadows).map(|i| format!("directionalShadowMap{i}")));
        names.extend((0..self.point_shadows).map(|i| format!("pointShadowMap{i}")));
        names.extend((0..self.spot_shadows).map(|i| format!("spotShadowMap{i}")));
        names
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct ClippingContext {
    pub planes: u32,
    pub intersection: bool,
}

/// Everything a template can reference.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShaderContext {
    pub label: String,
    pub precision: &'static str,
    pub defines: BTreeMap<String, String>,
    pub uniforms: Vec<UniformDecl>,
    pub samplers: Vec<String>,
    pub shadow_samplers: Vec<String>,
    pub lights: LightCounts,
    pub clipping: ClippingContext,
}

// ─── Generator ───────────────────────────────────────────────────────────────

pub struct ShaderGenerator {
    env: Environment<'static>,
}

impl Default for ShaderGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShaderGenerator {
    #[must_use]
    pub fn new() -> Self {
        let mut env = Environment::new();

        match SyntaxConfig::builder()
            .block_delimiters("{$", "$}")
            .variable_delimiters("{{", "}}")
            .line_statement_prefix("$$")
            .build()
        {
            Ok(syntax) => env.set_syntax(syntax),
            Err(e) => log::error!("Failed to configure shader template syntax: {e}"),
        }

        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.set_undefined_behavior(UndefinedBehavior::SemiStrict);
        env.set_loader(shader_loader);
        env.set_path_join_callback(|name, _parent| format!("chunks/{name}").into());

        Self { env }
    }

    /// Renders a built-in template.
    pub fn generate(&self, template: &str, context: &ShaderContext) -> Result<String> {
        let to_error = |e: Error| TrellisError::ShaderTemplate {
            template: template.to_owned(),
            message: format!("{e:#}"),
        };
        let tmpl = self.env.get_template(template).map_err(to_error)?;
        tmpl.render(context).map_err(to_error)
    }

    /// Renders user-authored WGSL through the same pipeline, so it can
    /// include chunks and test defines.
    pub fn generate_custom(&self, name: &str, source: &str, context: &ShaderContext) -> Result<String> {
        self.env
            .render_str(source, context)
            .map_err(|e| TrellisError::ShaderTemplate {
                template: name.to_owned(),
                message: format!("{e:#}"),
            })
    }

    /// Identity of a generated program. Equal sources share one program.
    #[must_use]
    pub fn source_hash(source: &str) -> u128 {
        xxh3_128(source.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ShaderContext {
        ShaderContext {
            label: "test".into(),
            precision: "high",
            uniforms: vec![
                UniformDecl {
                    name: "modelMatrix".into(),
                    ty: "mat4x4<f32>".into(),
                },
                UniformDecl {
                    name: "diffuse".into(),
                    ty: "vec3<f32>".into(),
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_defines_toggle_code() {
        let generator = ShaderGenerator::new();
        let mut ctx = context();
        ctx.uniforms.push(UniformDecl {
            name: "opacity".into(),
            ty: "f32".into(),
        });
        let plain = generator.generate(templates::MESH, &ctx).unwrap();
        assert!(!plain.contains("t_map"));

        ctx.defines.insert("USE_MAP".into(), "1".into());
        ctx.samplers.push("map".into());
        let mapped = generator.generate(templates::MESH, &ctx).unwrap();
        assert!(mapped.contains("textureSample(t_map, s_map"));
        assert!(mapped.contains("@group(1) @binding(0) var t_map"));
        assert!(!mapped.contains("{$") && !mapped.contains("$$"));
    }

    #[test]
    fn test_light_arrays_are_sized() {
        let generator = ShaderGenerator::new();
        let mut ctx = context();
        ctx.defines.insert("USE_LIGHTS".into(), "1".into());
        ctx.lights = LightCounts {
            directional: 2,
            directional_shadows: 1,
            ..Default::default()
        };
        ctx.shadow_samplers = ctx.lights.shadow_sampler_names();
        let source = generator.generate(templates::MESH, &ctx).unwrap();
        assert!(source.contains("array<DirectionalLight, 2>"));
        assert!(source.contains("t_directionalShadowMap0"));
        assert!(!source.contains("array<PointLight"));
    }

    #[test]
    fn test_custom_source_can_include_chunks() {
        let generator = ShaderGenerator::new();
        let source = "{$ include \"common\" $}\nfn vs_main() {}\nfn fs_main() {}\n";
        let out = generator.generate_custom("custom", source, &context()).unwrap();
        assert!(out.contains("const PI"));
    }

    #[test]
    fn test_template_errors_are_reported() {
        let generator = ShaderGenerator::new();
        let err = generator
            .generate_custom("broken", "{$ if $}", &context())
            .unwrap_err();
        assert!(matches!(err, TrellisError::ShaderTemplate { .. }));
        assert!(generator.generate("missing", &context()).is_err());
    }

    #[test]
    fn test_generators_are_independent() {
        let a = ShaderGenerator::new();
        let b = ShaderGenerator::new();
        let ctx = context();
        assert_eq!(
            ShaderGenerator::source_hash(&a.generate(templates::FULLSCREEN, &ctx).unwrap()),
            ShaderGenerator::source_hash(&b.generate(templates::FULLSCREEN, &ctx).unwrap()),
        );
    }
}
