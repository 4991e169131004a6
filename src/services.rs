pub mod expander;
pub mod poller;
pub mod reconciler;
pub mod seed;
pub mod supervisor;
pub mod upstream;
