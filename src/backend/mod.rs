// Backend module - Vulkan abstraction layer
//
// Thin RAII wrappers around ash. Each wrapper holds an `Arc` to its parent
// so destruction always runs child first.

pub mod command;
pub mod device;
pub mod instance;
pub mod probe;
pub mod render_pass;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use device::VulkanDevice;
pub use instance::VulkanInstance;
pub use surface::Surface;
pub use swapchain::Swapchain;
