//! 四个智能体：Manager（规划）、Executor（决策）、Reflector（结果判定）、Notetaker（记笔记）
//!
//! 每个智能体只持有推理能力，本身不保存运行状态：输入是信息池（只读）与截图，输出是解析后的结构。

pub mod events;
pub mod executor;
pub mod manager;
pub mod notetaker;
pub mod reflector;
pub mod sections;

pub use events::AgentEvent;
pub use executor::{Executor, ExecutorOutput};
pub use manager::{Manager, ManagerOutput};
pub use notetaker::Notetaker;
pub use reflector::{Reflector, ReflectorOutput};
