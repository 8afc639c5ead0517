pub mod run;
pub mod snapshot;
