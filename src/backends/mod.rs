mod fake;
mod vulkan;

pub use fake::{FakeBackend, FaultSpec};
pub use vulkan::VulkanBackend;
