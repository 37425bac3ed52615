//! Partition data commands: read, write, erase, restore, flush

use indicatif::{ProgressBar, ProgressStyle};
use nvstack_core::Partition;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use crate::stack::Stack;

/// Chunk size for partition transfers (4 KiB)
const CHUNK_SIZE: usize = 4096;

/// Create a progress bar with a phase message
fn create_progress_bar(total: u64, phase: &str) -> Result<ProgressBar, Box<dyn std::error::Error>> {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(&format!(
                "{{spinner:.green}} [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, {{eta}}) {}",
                phase
            ))?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

/// Resolve `offset` and an optional length against the partition's data size
fn resolve_range(
    part: &Partition,
    offset: u32,
    length: Option<u32>,
) -> Result<u32, Box<dyn std::error::Error>> {
    if offset > part.data_size {
        return Err(format!(
            "offset 0x{:X} is past the end of '{}' ({} bytes)",
            offset, part.name, part.data_size
        )
        .into());
    }
    Ok(length.unwrap_or(part.data_size - offset))
}

/// Read `length` bytes of a partition in chunks
pub fn read_partition(
    stack: &Stack,
    part: &Partition,
    offset: u32,
    length: u32,
) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let mut data = vec![0u8; length as usize];
    let pb = create_progress_bar(length as u64, "Reading")?;

    let mut done = 0usize;
    while done < data.len() {
        let chunk_size = std::cmp::min(CHUNK_SIZE, data.len() - done);
        stack
            .table()
            .read(part, &mut data[done..done + chunk_size], offset + done as u32)?;
        done += chunk_size;
        pb.set_position(done as u64);
    }

    pb.finish_with_message("Read complete");
    Ok(data)
}

/// Run the read command
pub fn run_read(
    stack: &Stack,
    name: &str,
    output: &Path,
    offset: u32,
    length: Option<u32>,
) -> Result<(), Box<dyn std::error::Error>> {
    let part = stack.table().open(name)?;
    let length = resolve_range(&part, offset, length)?;

    let data = read_partition(stack, &part, offset, length)?;

    let mut file = File::create(output)?;
    file.write_all(&data)?;

    println!("Wrote {} bytes from '{}' to {:?}", data.len(), part.name, output);
    Ok(())
}

/// Run the write command
pub fn run_write(
    stack: &Stack,
    name: &str,
    input: &Path,
    offset: u32,
    verify: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let part = stack.table().open(name)?;

    let mut data = Vec::new();
    File::open(input)?.read_to_end(&mut data)?;
    println!("Read {} bytes from {:?}", data.len(), input);

    if offset as u64 + data.len() as u64 > part.data_size as u64 {
        return Err(format!(
            "{} bytes at 0x{:X} do not fit in '{}' ({} bytes)",
            data.len(),
            offset,
            part.name,
            part.data_size
        )
        .into());
    }

    let pb = create_progress_bar(data.len() as u64, "Writing")?;
    let mut done = 0usize;
    while done < data.len() {
        let chunk_size = std::cmp::min(CHUNK_SIZE, data.len() - done);
        stack
            .table()
            .write(&part, &data[done..done + chunk_size], offset + done as u32)?;
        done += chunk_size;
        pb.set_position(done as u64);
    }
    pb.finish_with_message("Write complete");

    if verify {
        let readback = read_partition(stack, &part, offset, data.len() as u32)?;
        if let Some(pos) = readback.iter().zip(&data).position(|(a, b)| a != b) {
            return Err(format!("verification failed at offset 0x{:X}", offset as usize + pos).into());
        }
        println!("Verified {} bytes", data.len());
    }

    stack.close()?;
    println!("Wrote {} bytes to '{}' at offset 0x{:X}", data.len(), part.name, offset);
    Ok(())
}

/// Run the erase command
pub fn run_erase(
    stack: &Stack,
    name: &str,
    offset: u32,
    length: Option<u32>,
) -> Result<(), Box<dyn std::error::Error>> {
    let part = stack.table().open(name)?;
    let length = resolve_range(&part, offset, length)?;

    stack.table().erase(&part, offset, length)?;
    stack.close()?;

    println!("Erased {} bytes of '{}' at offset 0x{:X}", length, part.name, offset);
    Ok(())
}

/// Run the restore command
pub fn run_restore(stack: &Stack, name: &str) -> Result<(), Box<dyn std::error::Error>> {
    let part = stack.table().open(name)?;
    stack.table().restore(&part, 0, part.data_size)?;
    println!("Restored '{}'", part.name);
    Ok(())
}

/// Run the flush command
pub fn run_flush(stack: &Stack) -> Result<(), Box<dyn std::error::Error>> {
    stack.table().flush_all()?;
    stack.save()?;
    println!("Flushed {} partitions", stack.table().partitions().len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nvstack_core::StackConfig;
    use nvstack_intflash::FStat;

    const STACK: &str = r#"
[device]
size = "64 KiB"
code_bank_end = 0x8000

[[partition]]
name = "config"
start = 0xC000
size = "4 KiB"
drivers = ["cache", "intflash"]
"#;

    fn open() -> Stack {
        let config = StackConfig::from_toml_str(STACK).unwrap();
        Stack::open(&config).unwrap()
    }

    #[test]
    fn test_flush_writes_back() {
        let stack = open();
        let part = stack.table().open("config").unwrap();
        stack.table().write(&part, b"cfg", 0).unwrap();

        run_flush(&stack).unwrap();

        let mut raw = [0u8; 3];
        stack.flash().read_at(0xC000, &mut raw).unwrap();
        assert_eq!(&raw, b"cfg");
    }

    #[test]
    fn test_flush_reports_write_back_failure() {
        let stack = open();
        let part = stack.table().open("config").unwrap();
        stack.table().write(&part, b"cfg", 0).unwrap();

        stack.sim().inject_fault(FStat::ACCERR);
        assert!(run_flush(&stack).is_err());
    }

    #[test]
    fn test_resolve_range() {
        let stack = open();
        let part = stack.table().open("config").unwrap();
        assert_eq!(resolve_range(&part, 0x10, None).unwrap(), part.data_size - 0x10);
        assert_eq!(resolve_range(&part, 0, Some(8)).unwrap(), 8);
        assert!(resolve_range(&part, part.data_size + 1, None).is_err());
    }
}
