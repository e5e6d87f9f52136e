pub mod alignment;
pub mod capability;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod invoker;
pub mod journal;
pub mod logging;
pub mod retry;
pub mod run;
pub mod specdoc;
pub mod stage;
pub mod store;
