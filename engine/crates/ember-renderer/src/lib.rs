//! render 线程与其外围
//!
//! - [`render_config::RenderConfig`]：`[render]` 配置段
//! - [`render_service::RenderService`]：持有 render 线程，其它线程通过请求队列修改 graph
//! - [`demo`]：内置的演示 graph，供 `ember-headless` 与窗口程序使用

pub mod demo;
pub mod render_config;
pub mod render_service;
