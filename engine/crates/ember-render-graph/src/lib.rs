//! Render graph
//!
//! - [`graph::Graph`] 持有 [`ember_render_interface::render_context::RenderContext`]，
//!   以及所有注册的 pass、资源 handle 与 graph object
//! - 每一帧按注册顺序执行 pass，执行前根据 attachment 插入状态转换
//! - 全局配置变化时，只销毁并重建依赖该配置的部分（[`state_dep::StateDep`]）
//! - [`builtin`]：交换链、场景 render target、深度、纹理、mesh 以及后处理 / present pass

pub mod builtin;
pub mod graph;
pub mod graph_object;
pub mod pass;
pub mod registry;
pub mod resource_handle;
pub mod resource_states;
pub mod state_dep;
