pub mod echo;
pub mod executor;
pub mod registry;

pub use echo::EchoTool;
pub use executor::ToolExecutor;
pub use registry::{Tool, ToolCatalog, ToolError, ToolOutput, ToolRegistry, ToolSpec};
