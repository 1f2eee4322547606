mod tool;

pub use tool::{FunctionDescriptor, ToolDeclaration, ToolDescriptor, ToolRegistry};
