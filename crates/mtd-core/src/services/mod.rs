pub mod cloud;
pub mod config_loader;
pub mod controller;
pub mod memory_cloud;
pub mod migration;
pub mod proxy;
pub mod reconciler;
pub mod registry;
pub mod selection;
pub mod state;
