//! 解析器端到端测试: 用合成码流驱动完整的访问单元解析流程.

mod helpers;

mod access_unit;
mod decode;
mod parallel;
