pub mod analyzer;
pub mod detect;
pub mod issue;
pub mod workflow;
