//! CLI command implementations
//!
//! Every command runs against a [`Stack`](crate::stack::Stack) built from
//! the stack file. Commands that change data flush the partitions and save
//! the flash image before returning.

pub mod info;
pub mod partition;
pub mod swap;
