pub mod analysis;
pub mod config;
pub mod conversation;
pub mod guard;
pub mod llm_client;
pub mod locks;
pub mod persona;
pub mod pipeline;
pub mod planner;
pub mod prompt;
pub mod relationship;
pub mod runtime;
pub mod safety;
pub mod store;
pub mod topic;
