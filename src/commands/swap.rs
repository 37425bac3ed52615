//! Internal flash control commands

use nvstack_core::{IoctlCmd, IoctlResponse, Medium, Partition, SwapCommand};
use std::sync::Arc;

use crate::stack::Stack;

/// Pick the named partition, or the first one on internal flash
fn internal_partition(
    stack: &Stack,
    name: Option<&str>,
) -> Result<Arc<Partition>, Box<dyn std::error::Error>> {
    match name {
        Some(name) => Ok(stack.table().open(name)?),
        None => stack
            .table()
            .partitions()
            .iter()
            .find(|p| p.medium == Medium::Internal)
            .cloned()
            .ok_or_else(|| "no internal flash partition in the stack".into()),
    }
}

/// Run one swap step and print the resulting state
pub fn run_swap(
    stack: &Stack,
    cmd: SwapCommand,
    partition: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let part = internal_partition(stack, partition)?;
    let status = match stack.table().ioctl(&part, &IoctlCmd::FlashSwap(cmd))? {
        IoctlResponse::SwapStatus(status) => status,
        other => return Err(format!("unexpected response {:?}", other).into()),
    };

    println!("Swap state:    {:?}", status.mode);
    println!("Current block: {:?}", status.current_block);
    println!("Next block:    {:?}", status.next_block);
    stack.save()?;
    Ok(())
}

/// Print a program-once record
pub fn run_read_once(
    stack: &Stack,
    index: u8,
    partition: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let part = internal_partition(stack, partition)?;
    let record = match stack.table().ioctl(&part, &IoctlCmd::ReadOnce(index))? {
        IoctlResponse::OnceRecord(record) => record,
        other => return Err(format!("unexpected response {:?}", other).into()),
    };

    let hex: Vec<String> = record.iter().map(|b| format!("{:02X}", b)).collect();
    println!("Record {}: {}", index, hex.join(" "));
    Ok(())
}
