// SPDX-License-Identifier: CEPL-1.0
use std::collections::HashMap;
use std::ffi::CStr;
use std::io::Cursor;

use ash::util::read_spv;
use ash::vk;

use crate::error::{CreateContext, VkError, VkResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl ShaderStage {
    pub fn flags(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
        }
    }
}

pub(crate) const ENTRY_POINT: &CStr = c"main";

/// SPIR-V compiled by build.rs, looked up by `(name, stage)`.
pub struct ShaderLibrary {
    code: HashMap<(&'static str, ShaderStage), Vec<u32>>,
}

impl ShaderLibrary {
    /// Every shader baked into this crate.
    pub fn builtin() -> VkResult<Self> {
        let mut lib = Self {
            code: HashMap::new(),
        };
        lib.insert(
            "mesh",
            ShaderStage::Vertex,
            include_bytes!(concat!(env!("OUT_DIR"), "/mesh.vert.spv")),
        )?;
        lib.insert(
            "mesh",
            ShaderStage::Fragment,
            include_bytes!(concat!(env!("OUT_DIR"), "/mesh.frag.spv")),
        )?;
        Ok(lib)
    }

    fn insert(&mut self, name: &'static str, stage: ShaderStage, bytes: &[u8]) -> VkResult<()> {
        let words = read_spv(&mut Cursor::new(bytes))
            .map_err(|e| VkError::Shader(format!("{name} ({stage:?}): {e}")))?;
        self.code.insert((name, stage), words);
        Ok(())
    }

    pub fn get(&self, name: &'static str, stage: ShaderStage) -> Option<&[u32]> {
        self.code.get(&(name, stage)).map(Vec::as_slice)
    }

    /// Creates a module for the requested shader. Destroyed when the guard drops.
    pub(crate) fn module(
        &self,
        device: &ash::Device,
        name: &'static str,
        stage: ShaderStage,
    ) -> VkResult<ShaderModule> {
        let code = self
            .get(name, stage)
            .ok_or_else(|| VkError::Shader(format!("no {stage:?} shader named {name:?}")))?;
        let ci = vk::ShaderModuleCreateInfo {
            s_type: vk::StructureType::SHADER_MODULE_CREATE_INFO,
            p_code: code.as_ptr(),
            code_size: code.len() * 4,
            ..Default::default()
        };
        let raw = unsafe { device.create_shader_module(&ci, None) }.creating("shader module")?;
        Ok(ShaderModule {
            device: device.clone(),
            raw,
            stage,
        })
    }
}

/// Only needed until the pipeline that uses it has been created.
pub(crate) struct ShaderModule {
    device: ash::Device,
    raw: vk::ShaderModule,
    stage: ShaderStage,
}

impl ShaderModule {
    pub(crate) fn stage_info(&self) -> vk::PipelineShaderStageCreateInfo<'static> {
        vk::PipelineShaderStageCreateInfo {
            s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
            stage: self.stage.flags(),
            module: self.raw,
            p_name: ENTRY_POINT.as_ptr(),
            ..Default::default()
        }
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_shader_module(self.raw, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_mesh_shaders_are_valid_spirv() {
        let lib = ShaderLibrary::builtin().unwrap();
        for stage in [ShaderStage::Vertex, ShaderStage::Fragment] {
            let words = lib.get("mesh", stage).unwrap();
            assert_eq!(words[0], 0x0723_0203, "SPIR-V magic for {stage:?}");
        }
        assert!(lib.get("mesh", ShaderStage::Vertex) != lib.get("mesh", ShaderStage::Fragment));
        assert!(lib.get("sky", ShaderStage::Vertex).is_none());
    }

    #[test]
    fn lookup_is_keyed_by_name_and_stage() {
        let mut lib = ShaderLibrary::builtin().unwrap();
        let mesh_vs = lib.get("mesh", ShaderStage::Vertex).unwrap().to_vec();
        let bytes: Vec<u8> = mesh_vs.iter().flat_map(|w| w.to_le_bytes()).collect();
        lib.insert("outline", ShaderStage::Vertex, &bytes).unwrap();

        assert_eq!(lib.get("outline", ShaderStage::Vertex), Some(mesh_vs.as_slice()));
        assert!(lib.get("outline", ShaderStage::Fragment).is_none());
        assert!(lib.insert("broken", ShaderStage::Fragment, &[1, 2, 3]).is_err());
        assert!(lib.get("broken", ShaderStage::Fragment).is_none());
    }
}
