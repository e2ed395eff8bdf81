// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VkError {
    /// The driver rejected a create/allocate/bind call. Fatal.
    #[error("failed to create {what}: {result:?}")]
    ResourceCreation {
        what: &'static str,
        result: vk::Result,
    },

    /// No memory type satisfies the request. Fatal; memory topology never changes.
    #[error("no memory type in mask {type_bits:#b} has properties {required:?}")]
    MemoryTypeNotFound {
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    },

    /// Acquire reported out-of-date, or the surface has zero area so no
    /// swapchain fits it. Handled by recreation, never returned from `render`.
    #[error("swapchain is stale")]
    SwapchainStale,

    #[error("no physical device with graphics and present support")]
    NoSuitableDevice,

    #[error("surface: {0}")]
    Surface(String),

    #[error("shader {0}")]
    Shader(String),

    #[error("failed to load the Vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("{what}: {result:?}")]
    Device {
        what: &'static str,
        result: vk::Result,
    },

    /// Frame bookkeeping went out of step with the GPU. A bug, not a driver error.
    #[error(transparent)]
    Frame(#[from] crate::frame::SlotError),
}

pub type VkResult<T> = std::result::Result<T, VkError>;

/// Tags a raw `vk::Result` with the kind of object that failed to be created.
pub(crate) trait CreateContext<T> {
    fn creating(self, what: &'static str) -> VkResult<T>;
    fn during(self, what: &'static str) -> VkResult<T>;
}

impl<T> CreateContext<T> for Result<T, vk::Result> {
    fn creating(self, what: &'static str) -> VkResult<T> {
        self.map_err(|result| VkError::ResourceCreation { what, result })
    }

    fn during(self, what: &'static str) -> VkResult<T> {
        self.map_err(|result| VkError::Device { what, result })
    }
}
